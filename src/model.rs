use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only absolute-time scalar (creation stamps).
pub type Ms = i64;

/// Minutes since midnight, 0..=1440.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 1440;

/// Half-open time-of-day range `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodSpan {
    pub start: Minute,
    pub end: Minute,
}

impl TodSpan {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "TodSpan start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TodSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &TodSpan) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Format minutes-since-midnight as "HH:MM" (slot labels, wire fields).
pub fn format_hhmm(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Parse "HH:MM" into minutes since midnight. "24:00" is a valid end bound.
pub fn parse_hhmm(s: &str) -> Option<Minute> {
    let (h, m) = s.split_once(':')?;
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if m >= 60 {
        return None;
    }
    let total = h.checked_mul(60)?.checked_add(m)?;
    (total <= MINUTES_PER_DAY).then_some(total)
}

/// Calendar weekday, 0 = Sunday .. 6 = Saturday.
pub fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// One recurring weekly open-hours rule for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    /// 0 = Sunday .. 6 = Saturday.
    pub weekday: u8,
    pub hours: TodSpan,
    /// Slot width in minutes; must evenly step the window (trailing remainder dropped).
    pub interval: Minute,
}

/// A materialized bookable unit, derived from an AvailabilityWindow.
/// Identified by (resource, weekday, span.start) — never persisted, always
/// recomputed from the window set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub weekday: u8,
    pub span: TodSpan,
    pub capacity: u32,
    /// "HH:MM" of span.start.
    pub label: String,
}

/// Natural key of a materialized slot within one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotKey {
    pub weekday: u8,
    pub start: Minute,
}

/// What a booking commits: a slot on a concrete date, or a raw interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    Slot { date: NaiveDate, start: Minute },
    Interval { start: NaiveDateTime, end: NaiveDateTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

/// One unit of committed capacity. Cancellation flips status; bookings are
/// never removed (audit history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub kind: BookingKind,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }

    /// Ordering key: (calendar date, start minute-of-day).
    pub fn sort_key(&self) -> (NaiveDate, Minute) {
        match self.kind {
            BookingKind::Slot { date, start } => (date, start),
            BookingKind::Interval { start, .. } => {
                (start.date(), (start.time().num_seconds_from_midnight() / 60) as Minute)
            }
        }
    }
}

/// Caller identity for authorization checks (supplied by the surrounding
/// application; the scheduler performs no authentication).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Resident,
    Manager { building_id: Ulid },
}

#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn manages(&self, building_id: Ulid) -> bool {
        matches!(self.role, Role::Manager { building_id: b } if b == building_id)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub building_id: Ulid,
    pub name: String,
    /// Resource type label, e.g. "Gym".
    pub kind: Option<String>,
    pub location: Option<String>,
    pub active: bool,
    /// Per-slot capacity; None = free-form single-occupancy mode.
    pub capacity: Option<u32>,
    pub windows: Vec<AvailabilityWindow>,
    /// Derived from `windows`, sorted by (weekday, span.start).
    pub slots: Vec<TimeSlot>,
    /// All bookings incl. cancelled, sorted by `Booking::sort_key`.
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        building_id: Ulid,
        name: String,
        kind: Option<String>,
        location: Option<String>,
        capacity: Option<u32>,
    ) -> Self {
        Self {
            id,
            building_id,
            name,
            kind,
            location,
            active: true,
            capacity,
            windows: Vec::new(),
            slots: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn is_free_form(&self) -> bool {
        self.capacity.is_none()
    }

    /// Insert a booking maintaining sort order by (date, start minute).
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.sort_key(), Booking::sort_key)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings on a concrete calendar date, by binary search on the sorted list.
    pub fn bookings_on(&self, date: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.sort_key().0 < date);
        let hi = self.bookings.partition_point(|b| b.sort_key().0 <= date);
        &self.bookings[lo..hi]
    }

    /// Materialized slot for a natural key, if any.
    pub fn slot(&self, key: SlotKey) -> Option<&TimeSlot> {
        self.slots
            .binary_search_by_key(&(key.weekday, key.start), |s| (s.weekday, s.span.start))
            .ok()
            .map(|i| &self.slots[i])
    }

    /// Slots for one weekday (contiguous in the sorted slot list).
    pub fn slots_for(&self, weekday: u8) -> &[TimeSlot] {
        let lo = self.slots.partition_point(|s| s.weekday < weekday);
        let hi = self.slots.partition_point(|s| s.weekday <= weekday);
        &self.slots[lo..hi]
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        building_id: Ulid,
        name: String,
        kind: Option<String>,
        location: Option<String>,
        capacity: Option<u32>,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        kind: Option<String>,
        location: Option<String>,
        capacity: Option<u32>,
    },
    ResourceActiveSet {
        id: Ulid,
        active: bool,
    },
    ResourceDeleted {
        id: Ulid,
    },
    /// Full replacement of the window set; slots are re-derived on apply.
    WindowsReplaced {
        resource_id: Ulid,
        windows: Vec<AvailabilityWindow>,
    },
    SlotBooked {
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        date: NaiveDate,
        start: Minute,
        created_at: Ms,
    },
    IntervalBooked {
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        start: NaiveDateTime,
        end: NaiveDateTime,
        created_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub building_id: Ulid,
    pub name: String,
    pub kind: Option<String>,
    pub location: Option<String>,
    pub active: bool,
    pub capacity: Option<u32>,
    /// Weekdays with at least one availability window.
    pub weekdays: Vec<u8>,
}

/// Per-date occupancy of one materialized slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub weekday: u8,
    pub start: Minute,
    pub end: Minute,
    pub label: String,
    pub capacity: u32,
    pub booked: u32,
}

/// A booking joined with its resource's metadata (user/building views).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub user_id: Ulid,
    pub resource_id: Ulid,
    pub resource_name: String,
    pub resource_kind: Option<String>,
    pub location: Option<String>,
    pub building_id: Ulid,
    pub kind: BookingKind,
    pub status: BookingStatus,
    /// True when a confirmed slot booking no longer resolves to a
    /// materialized slot (its window was removed or reshaped).
    pub orphaned: bool,
    pub created_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn tod_span_basics() {
        let s = TodSpan::new(540, 600);
        assert_eq!(s.duration_min(), 60);
        assert!(s.contains_span(&TodSpan::new(540, 570)));
        assert!(!s.contains_span(&TodSpan::new(530, 570)));
    }

    #[test]
    fn tod_span_overlap() {
        let a = TodSpan::new(540, 600);
        let b = TodSpan::new(570, 630);
        let c = TodSpan::new(600, 660);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn hhmm_roundtrip() {
        assert_eq!(parse_hhmm("09:30"), Some(570));
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("24:00"), Some(1440));
        assert_eq!(parse_hhmm("24:01"), None);
        assert_eq!(parse_hhmm("10:60"), None);
        assert_eq!(parse_hhmm("junk"), None);
        assert_eq!(format_hhmm(570), "09:30");
        assert_eq!(format_hhmm(0), "00:00");
    }

    #[test]
    fn weekday_semantics() {
        // 2026-08-02 is a Sunday.
        assert_eq!(weekday_of(date(2026, 8, 2)), 0);
        assert_eq!(weekday_of(date(2026, 8, 3)), 1); // Monday
        assert_eq!(weekday_of(date(2026, 8, 8)), 6); // Saturday
    }

    fn slot_booking(d: NaiveDate, start: Minute) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            kind: BookingKind::Slot { date: d, start },
            status: BookingStatus::Confirmed,
            created_at: 0,
        }
    }

    fn resource() -> ResourceState {
        ResourceState::new(Ulid::new(), Ulid::new(), "Gym".into(), None, None, Some(2))
    }

    #[test]
    fn booking_insert_keeps_order() {
        let mut rs = resource();
        rs.insert_booking(slot_booking(date(2026, 8, 10), 600));
        rs.insert_booking(slot_booking(date(2026, 8, 3), 540));
        rs.insert_booking(slot_booking(date(2026, 8, 10), 540));
        let keys: Vec<_> = rs.bookings.iter().map(Booking::sort_key).collect();
        assert_eq!(
            keys,
            vec![
                (date(2026, 8, 3), 540),
                (date(2026, 8, 10), 540),
                (date(2026, 8, 10), 600),
            ]
        );
    }

    #[test]
    fn bookings_on_filters_by_date() {
        let mut rs = resource();
        rs.insert_booking(slot_booking(date(2026, 8, 3), 540));
        rs.insert_booking(slot_booking(date(2026, 8, 10), 540));
        rs.insert_booking(slot_booking(date(2026, 8, 10), 600));
        rs.insert_booking(slot_booking(date(2026, 8, 17), 540));

        assert_eq!(rs.bookings_on(date(2026, 8, 10)).len(), 2);
        assert_eq!(rs.bookings_on(date(2026, 8, 3)).len(), 1);
        assert!(rs.bookings_on(date(2026, 8, 4)).is_empty());
    }

    #[test]
    fn interval_booking_sort_key() {
        let b = Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            kind: BookingKind::Interval {
                start: date(2026, 8, 10).and_hms_opt(14, 30, 0).unwrap(),
                end: date(2026, 8, 10).and_hms_opt(15, 0, 0).unwrap(),
            },
            status: BookingStatus::Confirmed,
            created_at: 0,
        };
        assert_eq!(b.sort_key(), (date(2026, 8, 10), 870));
    }

    #[test]
    fn slot_lookup_by_key() {
        let mut rs = resource();
        rs.slots = vec![
            TimeSlot { weekday: 1, span: TodSpan::new(540, 570), capacity: 2, label: "09:00".into() },
            TimeSlot { weekday: 1, span: TodSpan::new(570, 600), capacity: 2, label: "09:30".into() },
            TimeSlot { weekday: 3, span: TodSpan::new(540, 570), capacity: 2, label: "09:00".into() },
        ];
        assert!(rs.slot(SlotKey { weekday: 1, start: 570 }).is_some());
        assert!(rs.slot(SlotKey { weekday: 2, start: 570 }).is_none());
        assert_eq!(rs.slots_for(1).len(), 2);
        assert_eq!(rs.slots_for(3).len(), 1);
        assert!(rs.slots_for(5).is_empty());
    }

    #[test]
    fn actor_manager_scope() {
        let building = Ulid::new();
        let mgr = Actor { user_id: Ulid::new(), role: Role::Manager { building_id: building } };
        let res = Actor { user_id: Ulid::new(), role: Role::Resident };
        assert!(mgr.manages(building));
        assert!(!mgr.manages(Ulid::new()));
        assert!(!res.manages(building));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotBooked {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            user_id: Ulid::new(),
            date: date(2026, 8, 3),
            start: 540,
            created_at: 1_700_000_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
