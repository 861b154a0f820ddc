use crate::error::AnalysisError;
use crate::models::{StageReport, StageStatus};

/// Result class of one orchestrator stage
#[derive(Debug)]
pub enum StageOutcome<T> {
    Complete(T),
    /// Usable but partial result
    Degraded { value: T, note: String },
    Fatal(AnalysisError),
}

impl<T> StageOutcome<T> {
    /// Complete when there are no notes, degraded otherwise
    pub fn from_notes(value: T, notes: Vec<String>) -> Self {
        if notes.is_empty() {
            StageOutcome::Complete(value)
        } else {
            StageOutcome::Degraded {
                value,
                note: notes.join("; "),
            }
        }
    }

    pub fn degraded(value: T, note: impl Into<String>) -> Self {
        StageOutcome::Degraded {
            value,
            note: note.into(),
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Complete(_) => StageStatus::Complete,
            StageOutcome::Degraded { .. } => StageStatus::Degraded,
            StageOutcome::Fatal(_) => StageStatus::Fatal,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StageOutcome::Complete(_))
    }
}

/// Collects stage reports and notes while a report is assembled
#[derive(Debug, Default)]
pub(crate) struct StageLog {
    pub stages: Vec<StageReport>,
    pub notes: Vec<String>,
}

impl StageLog {
    /// Record the outcome of a stage and unwrap its value.
    ///
    /// A fatal outcome is handed back to the caller.
    pub fn settle<T>(&mut self, stage: &str, outcome: StageOutcome<T>) -> Result<T, AnalysisError> {
        let status = outcome.status();
        match outcome {
            StageOutcome::Complete(value) => {
                self.push(stage, status, None);
                Ok(value)
            }
            StageOutcome::Degraded { value, note } => {
                self.push(stage, status, Some(note));
                Ok(value)
            }
            StageOutcome::Fatal(err) => {
                self.push(stage, status, Some(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn push(&mut self, stage: &str, status: StageStatus, note: Option<String>) {
        if let Some(note) = &note {
            self.notes.push(format!("{stage}: {note}"));
        }
        self.stages.push(StageReport {
            stage: stage.to_string(),
            status,
            note,
        });
    }
}
