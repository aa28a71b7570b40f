//! Ordered progress/log event stream delivered to the caller.
//!
//! A conversion reports through a single `mpsc` channel of tagged events so
//! that progress and raw builder output keep their relative order. Percent
//! values are not strictly monotonic: the synthetic pulse and structured
//! builder lines may both report during the same phase.

use std::fmt;
use std::sync::mpsc::Sender;
use tracing::debug;

/// Pipeline stage reported with each progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Scanning,
    Optimizing,
    Creating,
    Finalizing,
    Complete,
    Cancelled,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scanning => "Scanning",
            Stage::Optimizing => "Optimizing",
            Stage::Creating => "Creating",
            Stage::Finalizing => "Finalizing",
            Stage::Complete => "Complete",
            Stage::Cancelled => "Cancelled",
            Stage::Error => "Error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionProgress {
    pub stage: Stage,
    pub detail: String,
    /// Conversion-wide percent in `0..=100`.
    pub percent: u8,
    pub is_error: bool,
}

impl ConversionProgress {
    pub fn new(stage: Stage, detail: impl Into<String>, percent: u8) -> Self {
        Self {
            stage,
            detail: detail.into(),
            percent: percent.min(100),
            is_error: stage == Stage::Error,
        }
    }
}

/// Tagged event delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionEvent {
    Progress(ConversionProgress),
    /// Raw builder output or pipeline narration.
    Log(String),
}

/// Sending half of the event stream.
///
/// A dropped receiver is ignored; reporting never fails a conversion.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<ConversionEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<ConversionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn progress(&self, stage: Stage, detail: impl Into<String>, percent: u8) {
        self.send(ConversionEvent::Progress(ConversionProgress::new(
            stage, detail, percent,
        )));
    }

    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(target: "ffpkg_builder::builder_output", "{}", line);
        self.send(ConversionEvent::Log(line));
    }

    fn send(&self, event: ConversionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
