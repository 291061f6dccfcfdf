//! Step event stream.
//!
//! Every step status transition is emitted as a `StepEvent` and fanned out
//! to registered reporters. Events for one step are totally ordered because
//! only the step's own worker emits them; ordering across steps is not
//! guaranteed.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::types::StatusKind;

/// Generate an ISO 8601 timestamp for the current instant.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_epoch(secs)
}

/// Render an epoch second count as UTC.
///
/// The date part uses the era-based civil-calendar decomposition: the
/// epoch is shifted to 0000-03-01 so every 400-year era is a fixed
/// 146097 days and leap days fall at the end of the shifted year, which
/// makes year, day-of-year, and month all direct divisions.
fn format_epoch(secs: u64) -> String {
    let rem = secs % 86_400;
    let (hours, minutes, seconds) = (rem / 3_600, rem % 3_600 / 60, rem % 60);

    let z = (secs / 86_400) as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let day_of_era = z.rem_euclid(146_097);
    let year_of_era =
        (day_of_era - day_of_era / 1_460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year =
        day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let shifted_month = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * shifted_month + 2) / 5 + 1;
    let month = if shifted_month < 10 {
        shifted_month + 3
    } else {
        shifted_month - 9
    };
    let year = year_of_era + era * 400 + i64::from(month <= 2);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

/// Generate a unique run ID for one invocation.
///
/// Wall-clock seconds identify the run across processes; the sequence
/// counter keeps IDs distinct within one.
pub fn generate_run_id() -> String {
    static SEQUENCE: AtomicU32 = AtomicU32::new(0);
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("run-{:x}-{:x}", secs, sequence)
}

/// One step status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub ts: String,
    pub step_id: String,
    pub from: StatusKind,
    pub to: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Change-set summaries, parameter diffs, provider tail lines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Consumes step events; the log-rendering side of the fence.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &StepEvent);
}

/// Fan-out bus for step events.
#[derive(Default)]
pub struct EventBus {
    reporters: Mutex<Vec<Box<dyn Reporter>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, reporter: Box<dyn Reporter>) {
        self.reporters.lock().expect("reporter lock").push(reporter);
    }

    pub fn emit(
        &self,
        step_id: &str,
        from: StatusKind,
        to: StatusKind,
        reason: Option<&str>,
        detail: Option<serde_json::Value>,
    ) {
        let event = StepEvent {
            ts: now_iso8601(),
            step_id: step_id.to_string(),
            from,
            to,
            reason: reason.map(str::to_string),
            detail,
        };
        for reporter in self.reporters.lock().expect("reporter lock").iter() {
            reporter.report(&event);
        }
    }
}

/// Prints one status line per transition.
pub struct ConsoleReporter {
    /// Also print non-terminal transitions
    pub verbose: bool,
}

impl Reporter for ConsoleReporter {
    fn report(&self, event: &StepEvent) {
        if !self.verbose && !event.to.is_terminal() && event.to != StatusKind::Submitted {
            return;
        }
        let reason = event
            .reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        println!("{}: {}{}", event.step_id, event.to, reason);
    }
}

/// Appends events as JSON lines, one file per invocation.
pub struct JsonlReporter {
    path: PathBuf,
}

impl JsonlReporter {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

impl Reporter for JsonlReporter {
    fn report(&self, event: &StepEvent) {
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            let _ = writeln!(file, "{}", json);
        }
    }
}

/// Captures events in memory; test support.
#[derive(Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<StepEvent>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, event: &StepEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_events_now_iso8601_shape() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.contains('T'));
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn test_events_format_epoch_origin() {
        assert_eq!(format_epoch(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_epoch(86_399), "1970-01-01T23:59:59Z");
    }

    #[test]
    fn test_events_format_epoch_leap_day() {
        // 2000 is a leap year (divisible by 400)
        assert_eq!(format_epoch(951_782_400), "2000-02-29T00:00:00Z");
    }

    #[test]
    fn test_events_format_epoch_century_non_leap() {
        // 2100 is not a leap year: the day after Feb 28 is Mar 1
        assert_eq!(format_epoch(4_107_456_000), "2100-02-28T00:00:00Z");
        assert_eq!(format_epoch(4_107_542_400), "2100-03-01T00:00:00Z");
    }

    #[test]
    fn test_events_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("run-"));
        // the sequence counter keeps same-second IDs distinct
        assert_ne!(generate_run_id(), generate_run_id());
    }

    #[test]
    fn test_events_bus_fan_out() {
        struct Shared(Arc<CollectingReporter>);
        impl Reporter for Shared {
            fn report(&self, event: &StepEvent) {
                self.0.report(event);
            }
        }

        let bus = EventBus::new();
        let collector = Arc::new(CollectingReporter::new());
        bus.subscribe(Box::new(Shared(collector.clone())));
        bus.subscribe(Box::new(Shared(collector.clone())));

        bus.emit(
            "vpc",
            StatusKind::Pending,
            StatusKind::Submitted,
            Some("creating new stack"),
            None,
        );

        let events = collector.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step_id, "vpc");
        assert_eq!(events[0].from, StatusKind::Pending);
        assert_eq!(events[0].to, StatusKind::Submitted);
        assert_eq!(events[0].reason.as_deref(), Some("creating new stack"));
    }

    #[test]
    fn test_events_jsonl_reporter_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("events.jsonl");
        let reporter = JsonlReporter::new(&path);
        for i in 0..3 {
            reporter.report(&StepEvent {
                ts: now_iso8601(),
                step_id: format!("s{}", i),
                from: StatusKind::Pending,
                to: StatusKind::Complete,
                reason: None,
                detail: None,
            });
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: StepEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.step_id, "s0");
        assert_eq!(parsed.to, StatusKind::Complete);
    }

    #[test]
    fn test_events_serde_skips_empty_fields() {
        let event = StepEvent {
            ts: "2026-01-01T00:00:00Z".to_string(),
            step_id: "vpc".to_string(),
            from: StatusKind::Pending,
            to: StatusKind::Complete,
            reason: None,
            detail: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("reason"));
        assert!(!json.contains("detail"));
        assert!(json.contains("\"to\":\"complete\""));
    }
}
