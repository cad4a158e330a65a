use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::{
    check_interval_free, check_within_availability, confirmed_slot_count, find_duplicate, now_ms,
    tod_span_of,
};
use super::materialize::{overlap_warnings, validate_window, WindowWarning};
use super::{Scheduler, SchedulerError, WalCommand};

fn validate_resource_fields(
    name: &str,
    kind: &Option<String>,
    location: &Option<String>,
    capacity: Option<u32>,
) -> Result<(), SchedulerError> {
    if name.is_empty() {
        return Err(SchedulerError::InvalidRequest("resource name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SchedulerError::LimitExceeded("resource name too long"));
    }
    if kind.as_ref().is_some_and(|k| k.len() > MAX_LABEL_LEN) {
        return Err(SchedulerError::LimitExceeded("type label too long"));
    }
    if location.as_ref().is_some_and(|l| l.len() > MAX_LABEL_LEN) {
        return Err(SchedulerError::LimitExceeded("location too long"));
    }
    match capacity {
        Some(0) => Err(SchedulerError::InvalidRequest("capacity must be positive")),
        Some(c) if c > MAX_SLOT_CAPACITY => Err(SchedulerError::LimitExceeded("capacity too large")),
        _ => Ok(()),
    }
}

impl Scheduler {
    pub async fn create_resource(
        &self,
        id: Ulid,
        building_id: Ulid,
        name: String,
        kind: Option<String>,
        location: Option<String>,
        capacity: Option<u32>,
    ) -> Result<(), SchedulerError> {
        if self.state.len() >= MAX_RESOURCES {
            return Err(SchedulerError::LimitExceeded("too many resources"));
        }
        validate_resource_fields(&name, &kind, &location, capacity)?;
        if self.state.contains_key(&id) {
            return Err(SchedulerError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            building_id,
            name: name.clone(),
            kind: kind.clone(),
            location: location.clone(),
            capacity,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, building_id, name, kind, location, capacity);
        self.state
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(rs)));
        self.by_building.entry(building_id).or_default().push(id);
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        kind: Option<String>,
        location: Option<String>,
        capacity: Option<u32>,
    ) -> Result<(), SchedulerError> {
        validate_resource_fields(&name, &kind, &location, capacity)?;
        let rs = self.get_resource(&id).ok_or(SchedulerError::NotFound(id))?;
        let mut guard = rs.write().await;

        let event = Event::ResourceUpdated { id, name, kind, location, capacity };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Deactivation stops new bookings; history stays queryable.
    pub async fn set_resource_active(&self, id: Ulid, active: bool) -> Result<(), SchedulerError> {
        let rs = self.get_resource(&id).ok_or(SchedulerError::NotFound(id))?;
        let mut guard = rs.write().await;

        let event = Event::ResourceActiveSet { id, active };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), SchedulerError> {
        if !self.state.contains_key(&id) {
            return Err(SchedulerError::NotFound(id));
        }
        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        self.drop_resource_entry(&id);
        Ok(())
    }

    /// Replace the full window set and re-derive the slot calendar.
    ///
    /// Regeneration, not patching: the new slots are published atomically
    /// under the resource write lock. Confirmed bookings whose slot vanished
    /// become orphaned — flagged in the returned warnings and in booking
    /// projections, never deleted.
    pub async fn replace_windows(
        &self,
        resource_id: Ulid,
        windows: Vec<AvailabilityWindow>,
    ) -> Result<Vec<WindowWarning>, SchedulerError> {
        if windows.len() > MAX_WINDOWS_PER_RESOURCE {
            return Err(SchedulerError::LimitExceeded("too many windows"));
        }
        for w in &windows {
            validate_window(w)?;
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(SchedulerError::NotFound(resource_id))?;
        let mut guard = rs.write().await;

        let mut warnings = overlap_warnings(&windows);

        let event = Event::WindowsReplaced { resource_id, windows };
        self.persist_and_apply(&mut guard, &event).await?;

        let orphaned = guard
            .bookings
            .iter()
            .filter(|b| {
                b.is_confirmed()
                    && matches!(b.kind, BookingKind::Slot { date, start }
                        if guard.slot(SlotKey { weekday: weekday_of(date), start }).is_none())
            })
            .count();
        if orphaned > 0 {
            tracing::warn!(
                resource = %resource_id,
                orphaned,
                "window edit orphaned confirmed bookings"
            );
            warnings.push(WindowWarning::OrphanedBookings { count: orphaned });
        }

        Ok(warnings)
    }

    /// Fixed-slot admission: claim one unit of (slot, date) capacity.
    ///
    /// The whole check-then-append-then-apply sequence runs under the
    /// resource write lock, so concurrent requests for the last unit
    /// serialize and exactly one wins.
    pub async fn book_slot(
        &self,
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        key: SlotKey,
        date: NaiveDate,
    ) -> Result<Ulid, SchedulerError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(SchedulerError::NotFound(resource_id))?;
        let mut guard = rs.write().await;

        if !guard.active {
            return Err(SchedulerError::ResourceInactive(resource_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(SchedulerError::LimitExceeded("too many bookings on resource"));
        }
        let date_weekday = weekday_of(date);
        if key.weekday != date_weekday {
            return Err(SchedulerError::WeekdayMismatch {
                key_weekday: key.weekday,
                date_weekday,
            });
        }
        let slot = guard
            .slot(key)
            .ok_or(SchedulerError::UnknownSlot { weekday: key.weekday, start: key.start })?;
        let capacity = slot.capacity;

        let kind = BookingKind::Slot { date, start: key.start };
        if let Some(existing) = find_duplicate(&guard, user_id, &kind) {
            return Ok(existing);
        }
        if confirmed_slot_count(&guard, key.start, date) >= capacity {
            return Err(SchedulerError::SlotFull { capacity });
        }

        let event = Event::SlotBooked {
            id,
            resource_id,
            user_id,
            date,
            start: key.start,
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(id)
    }

    /// Free-form admission: claim an arbitrary interval on a resource
    /// without discrete slot capacity. Same lock discipline as `book_slot`.
    pub async fn book_interval(
        &self,
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Ulid, SchedulerError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(SchedulerError::NotFound(resource_id))?;
        let mut guard = rs.write().await;

        if !guard.active {
            return Err(SchedulerError::ResourceInactive(resource_id));
        }
        if !guard.is_free_form() {
            return Err(SchedulerError::InvalidRequest(
                "resource takes slot bookings, not intervals",
            ));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(SchedulerError::LimitExceeded("too many bookings on resource"));
        }

        let (date, span) = tod_span_of(start, end)?;
        check_within_availability(&guard.windows, weekday_of(date), &span)?;

        let kind = BookingKind::Interval { start, end };
        if let Some(existing) = find_duplicate(&guard, user_id, &kind) {
            return Ok(existing);
        }
        check_interval_free(&guard, date, &span)?;

        let event = Event::IntervalBooked {
            id,
            resource_id,
            user_id,
            start,
            end,
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(id)
    }

    /// Cancel by the booking's owner or a manager of the resource's
    /// building. Already-cancelled bookings are a no-op success.
    pub async fn cancel_booking(&self, booking_id: Ulid, actor: Actor) -> Result<(), SchedulerError> {
        let mut guard = self.resolve_booking_write(&booking_id).await?;

        let booking = guard
            .booking(booking_id)
            .ok_or(SchedulerError::NotFound(booking_id))?;
        if booking.status == BookingStatus::Cancelled {
            return Ok(());
        }
        if booking.user_id != actor.user_id && !actor.manages(guard.building_id) {
            return Err(SchedulerError::Forbidden);
        }

        let event = Event::BookingCancelled { id: booking_id, resource_id: guard.id };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate current state. Cancelled bookings survive compaction as a
    /// book + cancel pair (audit history).
    pub async fn compact_wal(&self) -> Result<(), SchedulerError> {
        let mut events = Vec::new();

        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.try_read().expect("compact: uncontended read");

            events.push(Event::ResourceCreated {
                id: guard.id,
                building_id: guard.building_id,
                name: guard.name.clone(),
                kind: guard.kind.clone(),
                location: guard.location.clone(),
                capacity: guard.capacity,
            });
            if !guard.active {
                events.push(Event::ResourceActiveSet { id: guard.id, active: false });
            }
            if !guard.windows.is_empty() {
                events.push(Event::WindowsReplaced {
                    resource_id: guard.id,
                    windows: guard.windows.clone(),
                });
            }
            for b in &guard.bookings {
                match b.kind {
                    BookingKind::Slot { date, start } => events.push(Event::SlotBooked {
                        id: b.id,
                        resource_id: guard.id,
                        user_id: b.user_id,
                        date,
                        start,
                        created_at: b.created_at,
                    }),
                    BookingKind::Interval { start, end } => events.push(Event::IntervalBooked {
                        id: b.id,
                        resource_id: guard.id,
                        user_id: b.user_id,
                        start,
                        end,
                        created_at: b.created_at,
                    }),
                }
                if b.status == BookingStatus::Cancelled {
                    events.push(Event::BookingCancelled { id: b.id, resource_id: guard.id });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| SchedulerError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulerError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| SchedulerError::Storage(e.to_string()))
    }
}
