//! Progress reporting trait and events for ingestion.

use std::fmt;

/// Pipeline stages, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Validating,
    Extracting,
    Parsing,
    Sanitizing,
    Persisting,
}

impl IngestStage {
    pub const ALL: [IngestStage; 5] = [
        IngestStage::Validating,
        IngestStage::Extracting,
        IngestStage::Parsing,
        IngestStage::Sanitizing,
        IngestStage::Persisting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Validating => "validating",
            IngestStage::Extracting => "extracting",
            IngestStage::Parsing => "parsing",
            IngestStage::Sanitizing => "sanitizing",
            IngestStage::Persisting => "persisting",
        }
    }

    /// One-based position, for progress bars.
    pub fn position(&self) -> u64 {
        IngestStage::ALL
            .iter()
            .position(|s| s == self)
            .map_or(0, |i| i as u64 + 1)
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted as an ingestion moves through its stages.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: IngestStage,
    pub current: u64,
    pub total: u64,
    pub message: Option<String>,
}

/// Trait for receiving progress updates. Implement this to drive progress
/// bars or status displays.
pub trait ProgressHandler: Send {
    fn on_progress(&self, event: ProgressEvent);
}

/// A no-op progress handler for when progress reporting is not needed.
pub struct NoopProgress;

impl ProgressHandler for NoopProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Helper to emit a stage event if a handler is provided.
pub fn emit_progress(handler: Option<&dyn ProgressHandler>, stage: IngestStage, message: Option<&str>) {
    if let Some(h) = handler {
        h.on_progress(ProgressEvent {
            stage,
            current: stage.position(),
            total: IngestStage::ALL.len() as u64,
            message: message.map(|s| s.to_string()),
        });
    }
}
