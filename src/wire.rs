//! Newline-delimited JSON protocol: one request object per line, one
//! response object per line. Every operation has a fixed contract — field
//! shape is enforced by deserialization before anything reaches the
//! scheduler.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::scheduler::{BookingFilter, Scheduler, SchedulerError, WindowWarning};

const MAX_LINE_LEN: usize = 64 * 1024;

/// One availability window as it travels on the wire ("HH:MM" bounds).
#[derive(Debug, Clone, Deserialize)]
pub struct WindowSpec {
    pub weekday: u8,
    pub start: String,
    pub end: String,
    pub interval_minutes: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleSpec {
    Resident,
    Manager,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateResource {
        building_id: Ulid,
        name: String,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        capacity: Option<u32>,
    },
    UpdateResource {
        resource_id: Ulid,
        name: String,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        capacity: Option<u32>,
    },
    SetResourceActive {
        resource_id: Ulid,
        active: bool,
    },
    DeleteResource {
        resource_id: Ulid,
    },
    ReplaceWindows {
        resource_id: Ulid,
        windows: Vec<WindowSpec>,
    },
    ListResources {
        #[serde(default)]
        building_id: Option<Ulid>,
    },
    ListOpenSlots {
        resource_id: Ulid,
        date: NaiveDate,
    },
    BookSlot {
        resource_id: Ulid,
        user_id: Ulid,
        date: NaiveDate,
        /// "HH:MM" start of the materialized slot.
        start: String,
        /// Defaults to the date's weekday; a stale client may disagree.
        #[serde(default)]
        weekday: Option<u8>,
    },
    BookInterval {
        resource_id: Ulid,
        user_id: Ulid,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    CancelBooking {
        booking_id: Ulid,
        user_id: Ulid,
        role: RoleSpec,
        /// Required when role is manager, forbidden otherwise.
        #[serde(default)]
        building_id: Option<Ulid>,
    },
    ListBookings {
        #[serde(default)]
        user_id: Option<Ulid>,
        #[serde(default)]
        building_id: Option<Ulid>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotRow {
    pub weekday: u8,
    pub start: String,
    pub end: String,
    pub label: String,
    pub capacity: u32,
    pub booked: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Created { resource_id: Ulid },
    Updated,
    ActiveSet,
    Deleted,
    WindowsReplaced { warnings: Vec<WindowWarning> },
    Resources { resources: Vec<ResourceInfo> },
    Slots { date: NaiveDate, slots: Vec<SlotRow> },
    Booked { booking_id: Ulid },
    Cancelled,
    Bookings { bookings: Vec<BookingRecord> },
    Error { code: &'static str, message: String, retryable: bool },
}

fn bad_request(message: impl Into<String>) -> Response {
    Response::Error { code: "invalid_request", message: message.into(), retryable: false }
}

/// Map a scheduler error onto its wire code. Admission rejections are
/// expected outcomes: counted, surfaced at debug, never logged as faults.
fn error_response(e: SchedulerError) -> Response {
    let code = match &e {
        SchedulerError::NotFound(_) | SchedulerError::UnknownSlot { .. } => "not_found",
        SchedulerError::AlreadyExists(_) => "already_exists",
        SchedulerError::InvalidWindow(_) => "invalid_window",
        SchedulerError::OutsideAvailability => "outside_availability",
        SchedulerError::SlotFull { .. } => "slot_full",
        SchedulerError::SlotConflict(_) => "slot_conflict",
        SchedulerError::WeekdayMismatch { .. } => "weekday_mismatch",
        SchedulerError::ResourceInactive(_) => "resource_inactive",
        SchedulerError::Forbidden => "forbidden",
        SchedulerError::InvalidRequest(_) => "invalid_request",
        SchedulerError::LimitExceeded(_) => "limit_exceeded",
        SchedulerError::Storage(_) => "storage_unavailable",
    };
    let retryable = matches!(e, SchedulerError::Storage(_));
    if e.is_rejection() {
        metrics::counter!(observability::ADMISSION_REJECTIONS_TOTAL, "reason" => code).increment(1);
        debug!("admission rejected: {e}");
    } else if retryable {
        tracing::error!("storage failure: {e}");
    } else {
        debug!("request failed: {e}");
    }
    Response::Error { code, message: e.to_string(), retryable }
}

fn parse_window(spec: &WindowSpec) -> Result<AvailabilityWindow, Response> {
    let start = parse_hhmm(&spec.start)
        .ok_or_else(|| bad_request(format!("bad start time: {}", spec.start)))?;
    let end =
        parse_hhmm(&spec.end).ok_or_else(|| bad_request(format!("bad end time: {}", spec.end)))?;
    // Constructed raw: an inverted range is the scheduler's InvalidWindow to report.
    Ok(AvailabilityWindow {
        weekday: spec.weekday,
        hours: TodSpan { start, end },
        interval: spec.interval_minutes,
    })
}

fn slot_row(s: &SlotStatus) -> SlotRow {
    SlotRow {
        weekday: s.weekday,
        start: format_hhmm(s.start),
        end: format_hhmm(s.end),
        label: s.label.clone(),
        capacity: s.capacity,
        booked: s.booked,
    }
}

pub async fn handle(scheduler: &Scheduler, req: Request) -> Response {
    match req {
        Request::CreateResource { building_id, name, kind, location, capacity } => {
            let id = Ulid::new();
            match scheduler.create_resource(id, building_id, name, kind, location, capacity).await {
                Ok(()) => Response::Created { resource_id: id },
                Err(e) => error_response(e),
            }
        }
        Request::UpdateResource { resource_id, name, kind, location, capacity } => {
            match scheduler.update_resource(resource_id, name, kind, location, capacity).await {
                Ok(()) => Response::Updated,
                Err(e) => error_response(e),
            }
        }
        Request::SetResourceActive { resource_id, active } => {
            match scheduler.set_resource_active(resource_id, active).await {
                Ok(()) => Response::ActiveSet,
                Err(e) => error_response(e),
            }
        }
        Request::DeleteResource { resource_id } => {
            match scheduler.delete_resource(resource_id).await {
                Ok(()) => Response::Deleted,
                Err(e) => error_response(e),
            }
        }
        Request::ReplaceWindows { resource_id, windows } => {
            let mut parsed = Vec::with_capacity(windows.len());
            for spec in &windows {
                match parse_window(spec) {
                    Ok(w) => parsed.push(w),
                    Err(resp) => return resp,
                }
            }
            match scheduler.replace_windows(resource_id, parsed).await {
                Ok(warnings) => Response::WindowsReplaced { warnings },
                Err(e) => error_response(e),
            }
        }
        Request::ListResources { building_id } => {
            Response::Resources { resources: scheduler.list_resources(building_id) }
        }
        Request::ListOpenSlots { resource_id, date } => {
            match scheduler.list_open_slots(resource_id, date).await {
                Ok(slots) => Response::Slots { date, slots: slots.iter().map(slot_row).collect() },
                Err(e) => error_response(e),
            }
        }
        Request::BookSlot { resource_id, user_id, date, start, weekday } => {
            let Some(start) = parse_hhmm(&start) else {
                return bad_request(format!("bad slot start: {start}"));
            };
            let key = SlotKey { weekday: weekday.unwrap_or_else(|| weekday_of(date)), start };
            match scheduler.book_slot(Ulid::new(), resource_id, user_id, key, date).await {
                Ok(booking_id) => Response::Booked { booking_id },
                Err(e) => error_response(e),
            }
        }
        Request::BookInterval { resource_id, user_id, start, end } => {
            match scheduler.book_interval(Ulid::new(), resource_id, user_id, start, end).await {
                Ok(booking_id) => Response::Booked { booking_id },
                Err(e) => error_response(e),
            }
        }
        Request::CancelBooking { booking_id, user_id, role, building_id } => {
            let role = match (role, building_id) {
                (RoleSpec::Resident, None) => Role::Resident,
                (RoleSpec::Resident, Some(_)) => {
                    return bad_request("building_id is only valid for managers");
                }
                (RoleSpec::Manager, Some(building_id)) => Role::Manager { building_id },
                (RoleSpec::Manager, None) => {
                    return bad_request("manager cancellation requires building_id");
                }
            };
            match scheduler.cancel_booking(booking_id, Actor { user_id, role }).await {
                Ok(()) => Response::Cancelled,
                Err(e) => error_response(e),
            }
        }
        Request::ListBookings { user_id, building_id } => {
            let filter = match (user_id, building_id) {
                (Some(u), None) => BookingFilter::User(u),
                (None, Some(b)) => BookingFilter::Building(b),
                _ => return bad_request("provide exactly one of user_id, building_id"),
            };
            Response::Bookings { bookings: scheduler.list_bookings(filter).await }
        }
    }
}

/// Serve one client: read a line, dispatch, answer with a line. Malformed
/// JSON gets an error response instead of a dropped connection.
pub async fn process_connection(
    socket: TcpStream,
    scheduler: Arc<Scheduler>,
) -> std::io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let line = line.map_err(std::io::Error::other)?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                let op = observability::op_label(&req);
                let started = std::time::Instant::now();
                let response = handle(&scheduler, req).await;
                metrics::histogram!(observability::OP_DURATION_SECONDS, "op" => op)
                    .record(started.elapsed().as_secs_f64());
                let status: &'static str = match &response {
                    Response::Error { code, .. } => *code,
                    _ => "ok",
                };
                metrics::counter!(observability::OPS_TOTAL, "op" => op, "status" => status)
                    .increment(1);
                response
            }
            Err(e) => bad_request(format!("malformed request: {e}")),
        };

        let payload = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        framed.send(payload).await.map_err(std::io::Error::other)?;
    }

    Ok(())
}
