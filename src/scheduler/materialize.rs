use serde::Serialize;

use crate::model::*;

use super::SchedulerError;

// ── Slot Materializer ─────────────────────────────────────────────

/// Validate one window at definition time. Anything rejected here can never
/// reach admission.
pub fn validate_window(w: &AvailabilityWindow) -> Result<(), SchedulerError> {
    if w.weekday > 6 {
        return Err(SchedulerError::InvalidWindow("weekday must be 0..=6"));
    }
    if w.hours.start >= w.hours.end {
        return Err(SchedulerError::InvalidWindow("start must precede end"));
    }
    if w.hours.end > MINUTES_PER_DAY {
        return Err(SchedulerError::InvalidWindow("end past midnight"));
    }
    if w.interval == 0 {
        return Err(SchedulerError::InvalidWindow("interval must be positive"));
    }
    if w.interval > w.hours.duration_min() {
        return Err(SchedulerError::InvalidWindow("interval wider than window"));
    }
    Ok(())
}

/// Expand a resource's window set into its slot calendar.
///
/// Each window is walked in `interval`-minute steps while the next step still
/// fits; a trailing partial step is dropped, not rounded. Slot capacity is the
/// resource capacity, or 1 for free-form resources. Output is sorted by
/// (weekday, start) and deduplicated on that natural key (overlapping windows
/// may produce the same key; the first wins). Pure and deterministic, so
/// re-materialization on every window edit is safe.
pub fn materialize(windows: &[AvailabilityWindow], capacity: Option<u32>) -> Vec<TimeSlot> {
    let cap = capacity.unwrap_or(1);
    let mut slots: Vec<TimeSlot> = Vec::new();
    for w in windows {
        let mut start = w.hours.start;
        while start + w.interval <= w.hours.end {
            slots.push(TimeSlot {
                weekday: w.weekday,
                span: TodSpan::new(start, start + w.interval),
                capacity: cap,
                label: format_hhmm(start),
            });
            start += w.interval;
        }
    }
    slots.sort_by_key(|s| (s.weekday, s.span.start));
    slots.dedup_by_key(|s| (s.weekday, s.span.start));
    slots
}

/// Configuration findings reported back to the manager on window edits.
/// Overlaps are legal but ambiguous (capacities stay per-slot, never merged),
/// so they are surfaced instead of resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum WindowWarning {
    OverlappingWindows { weekday: u8, first: TodSpan, second: TodSpan },
    /// Confirmed bookings whose slot no longer exists after the edit.
    OrphanedBookings { count: usize },
}

/// Report same-weekday window pairs that overlap in time-of-day.
pub fn overlap_warnings(windows: &[AvailabilityWindow]) -> Vec<WindowWarning> {
    let mut warnings = Vec::new();
    for (i, a) in windows.iter().enumerate() {
        for b in &windows[i + 1..] {
            if a.weekday == b.weekday && a.hours.overlaps(&b.hours) {
                warnings.push(WindowWarning::OverlappingWindows {
                    weekday: a.weekday,
                    first: a.hours,
                    second: b.hours,
                });
            }
        }
    }
    warnings
}
