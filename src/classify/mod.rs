//! User-agent classification tiers

pub mod classifier;
pub mod external;
pub mod heuristics;
pub mod signatures;

pub use classifier::{ClassificationRun, UaClassifier};
pub use external::{BulkClassifier, HttpBulkClassifier};
pub use signatures::{SignatureSet, SignatureSpec};
