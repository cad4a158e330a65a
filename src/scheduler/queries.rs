use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::admission::{confirmed_slot_count, occupied_spans_on};
use super::{Scheduler, SchedulerError, SharedResourceState};

/// Filter for the booking list projection — exactly one axis at a time.
#[derive(Debug, Clone, Copy)]
pub enum BookingFilter {
    User(Ulid),
    Building(Ulid),
}

impl Scheduler {
    /// Per-date occupancy of every slot on the date's weekday.
    ///
    /// Fixed-slot resources count confirmed bookings per slot unit;
    /// free-form resources mark a slot taken when any confirmed interval
    /// overlaps it. Read-only projection — a slot shown free can still lose
    /// to a concurrent booking, so admission never trusts this.
    pub async fn list_open_slots(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotStatus>, SchedulerError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(SchedulerError::NotFound(resource_id))?;
        let guard = rs.read().await;

        let weekday = weekday_of(date);
        let statuses = guard
            .slots_for(weekday)
            .iter()
            .map(|slot| {
                let booked = if guard.is_free_form() {
                    occupied_spans_on(&guard, date)
                        .filter(|(_, span)| span.overlaps(&slot.span))
                        .count() as u32
                } else {
                    confirmed_slot_count(&guard, slot.span.start, date)
                };
                SlotStatus {
                    weekday,
                    start: slot.span.start,
                    end: slot.span.end,
                    label: slot.label.clone(),
                    capacity: slot.capacity,
                    booked,
                }
            })
            .collect();
        Ok(statuses)
    }

    /// Bookings joined with resource metadata, for the user and manager
    /// views. Unknown ids yield empty lists — an id without bookings is
    /// indistinguishable from one that never existed.
    pub async fn list_bookings(&self, filter: BookingFilter) -> Vec<BookingRecord> {
        let resources: Vec<SharedResourceState> = match filter {
            BookingFilter::User(_) => self.state.iter().map(|e| e.value().clone()).collect(),
            BookingFilter::Building(building_id) => {
                let ids = self
                    .by_building
                    .get(&building_id)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();
                ids.iter().filter_map(|id| self.get_resource(id)).collect()
            }
        };

        let mut records = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            for b in &guard.bookings {
                if let BookingFilter::User(user_id) = filter
                    && b.user_id != user_id
                {
                    continue;
                }
                records.push(booking_record(&guard, b));
            }
        }
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    pub fn list_resources(&self, building_id: Option<Ulid>) -> Vec<ResourceInfo> {
        let mut infos: Vec<ResourceInfo> = self
            .state
            .iter()
            .filter_map(|entry| {
                let rs = entry.value().clone();
                let guard = rs.try_read().expect("list_resources: uncontended read");
                if building_id.is_some_and(|b| b != guard.building_id) {
                    return None;
                }
                let mut weekdays: Vec<u8> = guard.windows.iter().map(|w| w.weekday).collect();
                weekdays.sort_unstable();
                weekdays.dedup();
                Some(ResourceInfo {
                    id: guard.id,
                    building_id: guard.building_id,
                    name: guard.name.clone(),
                    kind: guard.kind.clone(),
                    location: guard.location.clone(),
                    active: guard.active,
                    capacity: guard.capacity,
                    weekdays,
                })
            })
            .collect();
        infos.sort_by_key(|r| r.id);
        infos
    }
}

fn booking_record(rs: &ResourceState, b: &Booking) -> BookingRecord {
    let orphaned = b.is_confirmed()
        && matches!(b.kind, BookingKind::Slot { date, start }
            if rs.slot(SlotKey { weekday: weekday_of(date), start }).is_none());
    BookingRecord {
        id: b.id,
        user_id: b.user_id,
        resource_id: rs.id,
        resource_name: rs.name.clone(),
        resource_kind: rs.kind.clone(),
        location: rs.location.clone(),
        building_id: rs.building_id,
        kind: b.kind,
        status: b.status,
        orphaned,
        created_at: b.created_at,
    }
}
