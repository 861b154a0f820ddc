//! Log analysis: aggregation, anomaly scoring and cost estimation

pub mod aggregator;
pub mod anomaly;
pub mod cost;
pub mod ledger;
pub mod log_reader;
pub mod models;
pub mod pricing;

pub use aggregator::{aggregate, aggregate_stream, Aggregator};
pub use anomaly::{AnomalyDetector, AnomalyRecord, AnomalyThresholds, AnomalyType, SeriesStats};
pub use cost::{calculate_cost, CostBreakdownItem, CostEstimate, CostInput, CostOptions};
pub use ledger::{ByteBreakdown, UaByteLedger, UaUsage};
pub use log_reader::{open_log_file, LogFileStream};
pub use models::{AggregationResult, MinuteCounter, PathGroupRollup, StatusTally, Tally, Totals};
pub use pricing::{NetlifyPlan, PriceTable, Provider};
