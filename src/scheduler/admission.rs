use chrono::{NaiveDate, NaiveDateTime, Timelike};
use ulid::Ulid;

use crate::model::*;

use super::SchedulerError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Collapse a timestamp pair into a same-date time-of-day span.
///
/// An end falling exactly on the next midnight maps to minute 1440, so a
/// window closing at 24:00 admits a booking ending there. Anything else that
/// crosses a date boundary cannot sit inside a time-of-day window.
pub(crate) fn tod_span_of(
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<(NaiveDate, TodSpan), SchedulerError> {
    if start >= end {
        return Err(SchedulerError::InvalidRequest("start must precede end"));
    }
    if start.time().second() != 0 || end.time().second() != 0 {
        return Err(SchedulerError::InvalidRequest("sub-minute precision not supported"));
    }
    let date = start.date();
    let start_min = (start.time().num_seconds_from_midnight() / 60) as Minute;
    let end_min = if end.date() == date {
        (end.time().num_seconds_from_midnight() / 60) as Minute
    } else if date.succ_opt() == Some(end.date()) && end.time().num_seconds_from_midnight() == 0 {
        MINUTES_PER_DAY
    } else {
        return Err(SchedulerError::OutsideAvailability);
    };
    Ok((date, TodSpan::new(start_min, end_min)))
}

/// A free-form request must sit entirely inside one window for that weekday.
pub(crate) fn check_within_availability(
    windows: &[AvailabilityWindow],
    weekday: u8,
    span: &TodSpan,
) -> Result<(), SchedulerError> {
    if windows
        .iter()
        .any(|w| w.weekday == weekday && w.hours.contains_span(span))
    {
        Ok(())
    } else {
        Err(SchedulerError::OutsideAvailability)
    }
}

/// Confirmed bookings occupying time on `date`, as (id, span) pairs.
/// Slot bookings derive their span from the current slot calendar; orphaned
/// ones (slot no longer materialized) occupy nothing.
pub(crate) fn occupied_spans_on(
    rs: &ResourceState,
    date: NaiveDate,
) -> impl Iterator<Item = (Ulid, TodSpan)> + '_ {
    let weekday = weekday_of(date);
    rs.bookings_on(date).iter().filter_map(move |b| {
        if !b.is_confirmed() {
            return None;
        }
        match b.kind {
            BookingKind::Interval { start, end } => {
                let (_, span) = tod_span_of(start, end).ok()?;
                Some((b.id, span))
            }
            BookingKind::Slot { start, .. } => {
                let slot = rs.slot(SlotKey { weekday, start })?;
                Some((b.id, slot.span))
            }
        }
    })
}

/// Count confirmed bookings holding the (start, date) slot unit.
pub(crate) fn confirmed_slot_count(rs: &ResourceState, start: Minute, date: NaiveDate) -> u32 {
    rs.bookings_on(date)
        .iter()
        .filter(|b| b.is_confirmed() && matches!(b.kind, BookingKind::Slot { start: s, .. } if s == start))
        .count() as u32
}

/// Half-open overlap test against every confirmed booking on the date.
/// Boundary-touching spans (end == start) never conflict.
pub(crate) fn check_interval_free(
    rs: &ResourceState,
    date: NaiveDate,
    span: &TodSpan,
) -> Result<(), SchedulerError> {
    for (id, occupied) in occupied_spans_on(rs, date) {
        if occupied.overlaps(span) {
            return Err(SchedulerError::SlotConflict(id));
        }
    }
    Ok(())
}

/// Duplicate-request detection: the same user already confirmed for the same
/// unit. Booking again is a no-op success returning the existing id.
pub(crate) fn find_duplicate(rs: &ResourceState, user_id: Ulid, kind: &BookingKind) -> Option<Ulid> {
    let date = match kind {
        BookingKind::Slot { date, .. } => *date,
        BookingKind::Interval { start, .. } => start.date(),
    };
    rs.bookings_on(date)
        .iter()
        .find(|b| b.is_confirmed() && b.user_id == user_id && b.kind == *kind)
        .map(|b| b.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, d).unwrap()
    }

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        date(d).and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn tod_span_same_date() {
        let (d, span) = tod_span_of(at(3, 14, 0), at(3, 15, 30)).unwrap();
        assert_eq!(d, date(3));
        assert_eq!(span, TodSpan::new(840, 930));
    }

    #[test]
    fn tod_span_midnight_end() {
        let (_, span) = tod_span_of(at(3, 23, 0), at(4, 0, 0)).unwrap();
        assert_eq!(span, TodSpan::new(1380, 1440));
    }

    #[test]
    fn tod_span_rejects_cross_date() {
        assert!(matches!(
            tod_span_of(at(3, 23, 0), at(4, 1, 0)),
            Err(SchedulerError::OutsideAvailability)
        ));
    }

    #[test]
    fn tod_span_rejects_inverted() {
        assert!(matches!(
            tod_span_of(at(3, 15, 0), at(3, 14, 0)),
            Err(SchedulerError::InvalidRequest(_))
        ));
        assert!(matches!(
            tod_span_of(at(3, 15, 0), at(3, 15, 0)),
            Err(SchedulerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn within_availability_checks_weekday_and_containment() {
        let windows = vec![AvailabilityWindow {
            weekday: 1,
            hours: TodSpan::new(420, 1260), // 07:00-21:00
            interval: 60,
        }];
        assert!(check_within_availability(&windows, 1, &TodSpan::new(840, 900)).is_ok());
        assert!(check_within_availability(&windows, 2, &TodSpan::new(840, 900)).is_err());
        assert!(check_within_availability(&windows, 1, &TodSpan::new(400, 500)).is_err());
        // Flush against both edges is inside.
        assert!(check_within_availability(&windows, 1, &TodSpan::new(420, 1260)).is_ok());
    }

    fn free_form_resource_with(bookings: Vec<Booking>) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), Ulid::new(), "Court".into(), None, None, None);
        for b in bookings {
            rs.insert_booking(b);
        }
        rs
    }

    fn interval_booking(d: u32, sh: u32, eh: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            kind: BookingKind::Interval { start: at(d, sh, 0), end: at(d, eh, 0) },
            status: BookingStatus::Confirmed,
            created_at: 0,
        }
    }

    #[test]
    fn interval_conflict_detected() {
        let rs = free_form_resource_with(vec![interval_booking(3, 14, 15)]);
        // [13:30, 14:30) overlaps [14:00, 15:00)
        assert!(matches!(
            check_interval_free(&rs, date(3), &TodSpan::new(810, 870)),
            Err(SchedulerError::SlotConflict(_))
        ));
    }

    #[test]
    fn boundary_touch_is_not_conflict() {
        let rs = free_form_resource_with(vec![interval_booking(3, 14, 15)]);
        assert!(check_interval_free(&rs, date(3), &TodSpan::new(900, 960)).is_ok()); // 15:00-16:00
        assert!(check_interval_free(&rs, date(3), &TodSpan::new(780, 840)).is_ok()); // 13:00-14:00
    }

    #[test]
    fn cancelled_bookings_do_not_block() {
        let mut b = interval_booking(3, 14, 15);
        b.status = BookingStatus::Cancelled;
        let rs = free_form_resource_with(vec![b]);
        assert!(check_interval_free(&rs, date(3), &TodSpan::new(840, 900)).is_ok());
    }

    #[test]
    fn other_dates_do_not_block() {
        let rs = free_form_resource_with(vec![interval_booking(4, 14, 15)]);
        assert!(check_interval_free(&rs, date(3), &TodSpan::new(840, 900)).is_ok());
    }

    #[test]
    fn slot_count_ignores_cancelled_and_other_slots() {
        let mut rs = ResourceState::new(Ulid::new(), Ulid::new(), "Gym".into(), None, None, Some(3));
        let mk = |start: Minute, status| Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            kind: BookingKind::Slot { date: date(3), start },
            status,
            created_at: 0,
        };
        rs.insert_booking(mk(540, BookingStatus::Confirmed));
        rs.insert_booking(mk(540, BookingStatus::Confirmed));
        rs.insert_booking(mk(540, BookingStatus::Cancelled));
        rs.insert_booking(mk(570, BookingStatus::Confirmed));
        assert_eq!(confirmed_slot_count(&rs, 540, date(3)), 2);
        assert_eq!(confirmed_slot_count(&rs, 570, date(3)), 1);
        assert_eq!(confirmed_slot_count(&rs, 540, date(10)), 0);
    }

    #[test]
    fn duplicate_detection_matches_exact_unit() {
        let user = Ulid::new();
        let mut rs = ResourceState::new(Ulid::new(), Ulid::new(), "Gym".into(), None, None, Some(2));
        let existing = Booking {
            id: Ulid::new(),
            user_id: user,
            kind: BookingKind::Slot { date: date(3), start: 540 },
            status: BookingStatus::Confirmed,
            created_at: 0,
        };
        let existing_id = existing.id;
        rs.insert_booking(existing);

        let same = BookingKind::Slot { date: date(3), start: 540 };
        let other_slot = BookingKind::Slot { date: date(3), start: 570 };
        assert_eq!(find_duplicate(&rs, user, &same), Some(existing_id));
        assert_eq!(find_duplicate(&rs, user, &other_slot), None);
        assert_eq!(find_duplicate(&rs, Ulid::new(), &same), None);
    }
}
