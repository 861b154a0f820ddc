use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::analysis::CostOptions;

/// Persisted entries for one site between two instants, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Shortest billing window a caller may ask for
pub const MIN_EXPLICIT_WINDOW_DAYS: f64 = 1.0 / 24.0;

impl WindowQuery {
    /// Whole days touched by the window, at least one
    pub fn billable_days(&self) -> f64 {
        let secs = (self.end - self.start).num_seconds().max(0);
        (secs as f64 / 86_400.0).ceil().max(1.0)
    }
}

/// Billing window length in days, plus a note when the request value was adjusted.
///
/// An explicit value wins and may be fractional down to one hour. A window
/// derived from the data is rounded up to whole days. Without either the
/// default applies.
pub fn resolve_window_days(
    explicit: Option<f64>,
    data_window: Option<WindowQuery>,
    default_days: f64,
) -> (f64, Option<String>) {
    let mut note = None;
    match explicit {
        Some(days) if days.is_finite() && days >= MIN_EXPLICIT_WINDOW_DAYS => return (days, None),
        Some(days) if days.is_finite() && days > 0.0 => {
            return (
                MIN_EXPLICIT_WINDOW_DAYS,
                Some(format!(
                    "windowDays {days} is below one hour; billed as {MIN_EXPLICIT_WINDOW_DAYS:.4} days"
                )),
            );
        }
        Some(days) => note = Some(format!("windowDays {days} is not a positive number; ignored")),
        None => {}
    }

    let days = data_window
        .map(|window| window.billable_days())
        .unwrap_or(default_days);
    (days, note)
}

/// Where to find the traffic to analyse; tried in field order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataReference {
    #[serde(default)]
    pub aggregates_path: Option<PathBuf>,
    #[serde(default)]
    pub query: Option<WindowQuery>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzeOptions {
    pub cost: CostOptions,
    pub use_external_classifier: bool,
    pub disambiguate: bool,
    /// Run the tool-augmented disambiguation pass; falls back to settings
    pub use_tools: Option<bool>,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            cost: CostOptions::default(),
            use_external_classifier: true,
            disambiguate: true,
            use_tools: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub site_id: String,
    pub provider: String,
    pub data: DataReference,
    /// Billing window length; derived from the data when absent
    #[serde(default)]
    pub window_days: Option<f64>,
    #[serde(default)]
    pub options: AnalyzeOptions,
}
