//! Translation of builder output into conversion-wide progress.
//!
//! Builder progress lines come in a few known shapes. Each shape is a rule in
//! [`PROGRESS_RULES`]; the first rule that matches a line wins. Lines that
//! match nothing yield no progress (they are still forwarded as log text).
//!
//! Some build phases print nothing structured at all, so the real build also
//! runs a [`PulseTicker`] that nudges the percent forward while the builder is
//! quiet.

use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::events::{EventSink, Stage};

/// Percent at which the image population phase starts.
pub const CREATE_BASE_PERCENT: u8 = 65;

/// Percent at which cylinder group initialization starts.
pub const CYLINDER_BASE_PERCENT: u8 = 60;

/// Pulse cadence while the builder is quiet.
pub const PULSE_INTERVAL: Duration = Duration::from_millis(500);

/// Percent added per pulse tick.
pub const PULSE_STEP: u8 = 2;

/// Ceiling for synthetic progress.
pub const PULSE_CAP: u8 = 95;

const TICK_POLL: Duration = Duration::from_millis(20);

/// A structured line newer than this suppresses the pulse.
const PULSE_QUIET_WINDOW: Duration = Duration::from_secs(2);

/// A progress value decoded from one builder line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub detail: String,
    pub percent: u8,
}

enum Mapping {
    /// `base + captured_percent * scale`, truncated.
    Scaled { base: u8, scale: f64 },
    Fixed(u8),
}

struct ProgressRule {
    pattern: &'static LazyLock<Regex>,
    mapping: Mapping,
    detail: &'static str,
}

static ADDING_FILES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)adding files to image\.*\s*(\d{1,3})\s*%").expect("valid regex")
});
static WRITING_CYLINDERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)writing cylinder groups\.*\s*(\d{1,3})\s*%").expect("valid regex")
});
static POPULATING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)populating").expect("valid regex"));
static CYLINDER_GROUPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)cylinder groups:").expect("valid regex"));

static PROGRESS_RULES: [ProgressRule; 4] = [
    ProgressRule {
        pattern: &ADDING_FILES,
        mapping: Mapping::Scaled {
            base: CREATE_BASE_PERCENT,
            scale: 0.33,
        },
        detail: "Adding files to image",
    },
    ProgressRule {
        pattern: &WRITING_CYLINDERS,
        mapping: Mapping::Scaled {
            base: CYLINDER_BASE_PERCENT,
            scale: 0.05,
        },
        detail: "Writing cylinder groups",
    },
    ProgressRule {
        pattern: &POPULATING,
        mapping: Mapping::Fixed(CREATE_BASE_PERCENT),
        detail: "Populating image",
    },
    ProgressRule {
        pattern: &CYLINDER_GROUPS,
        mapping: Mapping::Fixed(CYLINDER_BASE_PERCENT),
        detail: "Initializing cylinder groups",
    },
];

/// Map one raw builder line to a progress update, if it carries one.
pub fn translate(line: &str) -> Option<ProgressUpdate> {
    for rule in PROGRESS_RULES.iter() {
        let Some(caps) = rule.pattern.captures(line) else {
            continue;
        };
        let (percent, detail) = match rule.mapping {
            Mapping::Scaled { base, scale } => {
                let Some(raw) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) else {
                    continue;
                };
                let raw = raw.min(100);
                let mapped = (f64::from(base) + f64::from(raw) * scale) as u32;
                (mapped.min(100) as u8, format!("{} ({}%)", rule.detail, raw))
            }
            Mapping::Fixed(percent) => (percent, rule.detail.to_string()),
        };
        return Some(ProgressUpdate {
            stage: Stage::Creating,
            detail,
            percent,
        });
    }
    None
}

/// Shared timestamp of the last structured progress line.
#[derive(Debug, Clone)]
pub struct StructuredClock {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl StructuredClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }

    /// Record that a structured line was just seen.
    pub fn mark(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::SeqCst);
    }

    fn seen_within(&self, window: Duration) -> bool {
        let last = self.last_ms.load(Ordering::SeqCst);
        if last == u64::MAX {
            return false;
        }
        let now = self.origin.elapsed().as_millis() as u64;
        now.saturating_sub(last) < window.as_millis() as u64
    }
}

impl Default for StructuredClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Background ticker emitting synthetic `Creating` progress.
///
/// Starts at [`CREATE_BASE_PERCENT`], adds [`PULSE_STEP`] per tick and stops
/// at [`PULSE_CAP`]. Ticks are skipped while structured lines keep arriving.
/// Stops when [`PulseTicker::stop`] is called, the ticker is dropped, or the
/// cancel token fires.
pub struct PulseTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PulseTicker {
    pub fn start(events: EventSink, clock: StructuredClock, cancel: CancelToken) -> Self {
        Self::start_with_interval(events, clock, cancel, PULSE_INTERVAL)
    }

    pub fn start_with_interval(
        events: EventSink,
        clock: StructuredClock,
        cancel: CancelToken,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut percent = CREATE_BASE_PERCENT;
            loop {
                if !wait_tick(interval, &stop_flag, &cancel) {
                    break;
                }
                if clock.seen_within(PULSE_QUIET_WINDOW) {
                    continue;
                }
                events.progress(Stage::Creating, "Building image", percent);
                percent = percent.saturating_add(PULSE_STEP).min(PULSE_CAP);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the ticker and wait for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Sleep one tick. Returns `false` once the ticker should exit.
fn wait_tick(interval: Duration, stop: &AtomicBool, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(TICK_POLL.min(deadline - now));
    }
}

impl Drop for PulseTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConversionEvent;
    use std::sync::mpsc;

    #[test]
    fn test_adding_files_mapping() {
        let update = translate("Adding files to image...  50% (10/20 files)").unwrap();
        assert_eq!(update.stage, Stage::Creating);
        assert_eq!(update.percent, 81);
    }

    #[test]
    fn test_adding_files_bounds() {
        assert_eq!(translate("Adding files to image... 0%").unwrap().percent, 65);
        assert_eq!(translate("adding FILES to image... 100%").unwrap().percent, 98);
    }

    #[test]
    fn test_cylinder_groups_percent() {
        assert_eq!(translate("Writing cylinder groups... 0%").unwrap().percent, 60);
        assert_eq!(translate("Writing cylinder groups... 100%").unwrap().percent, 65);
        assert_eq!(translate("Writing cylinder groups... 40%").unwrap().percent, 62);
    }

    #[test]
    fn test_fixed_phase_keywords() {
        assert_eq!(translate("Populating directory tree").unwrap().percent, 65);
        assert_eq!(translate("cylinder groups: 112 of 32 MB").unwrap().percent, 60);
    }

    #[test]
    fn test_first_rule_wins() {
        // Matches both the percent rule and the "Populating" keyword.
        let update = translate("Populating: Adding files to image... 10%").unwrap();
        assert_eq!(update.percent, 68);
    }

    #[test]
    fn test_unrecognized_line() {
        assert!(translate("Superblock backups at 160, 376512").is_none());
        assert!(translate("").is_none());
    }

    #[test]
    fn test_pulse_emits_capped_progress() {
        let (tx, rx) = mpsc::channel();
        let ticker = PulseTicker::start_with_interval(
            EventSink::new(tx),
            StructuredClock::new(),
            CancelToken::new(),
            Duration::from_millis(5),
        );
        std::thread::sleep(Duration::from_millis(400));
        ticker.stop();

        let percents: Vec<u8> = rx
            .try_iter()
            .filter_map(|event| match event {
                ConversionEvent::Progress(p) => Some(p.percent),
                ConversionEvent::Log(_) => None,
            })
            .collect();
        assert!(!percents.is_empty());
        assert_eq!(percents[0], CREATE_BASE_PERCENT);
        assert!(percents.iter().all(|p| *p <= PULSE_CAP));
        assert!(percents.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_pulse_quiet_while_structured_lines_arrive() {
        let (tx, rx) = mpsc::channel();
        let clock = StructuredClock::new();
        clock.mark();
        let ticker = PulseTicker::start_with_interval(
            EventSink::new(tx),
            clock,
            CancelToken::new(),
            Duration::from_millis(5),
        );
        std::thread::sleep(Duration::from_millis(100));
        ticker.stop();
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_pulse_stops_on_cancel() {
        let cancel = CancelToken::new();
        let ticker = PulseTicker::start_with_interval(
            EventSink::discard(),
            StructuredClock::new(),
            cancel.clone(),
            Duration::from_secs(60),
        );
        cancel.cancel();
        let start = Instant::now();
        ticker.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
