pub mod classification;
pub mod log_entry;
pub mod report;

pub use classification::{
    clamp_confidence, CachedClassification, Classification, DeferReason, Provenance, Resolution,
    UaClassification, DEFAULT_CONFIDENCE,
};
pub use log_entry::{path_group, status_class, LogEntry, PathGroup};
pub use report::{
    report_id, AnalysisReport, BotTypeRollup, ClassificationSummary, InputSource, InputSummary,
    StageReport, StageStatus, TopBot,
};
