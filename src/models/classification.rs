//! User-agent classification values and their provenance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Confidence assigned to anything no tier could resolve
pub const DEFAULT_CONFIDENCE: f64 = 0.4;

/// Bot/human verdict for a single user agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UaClassification {
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    pub confidence: f64,
}

impl UaClassification {
    pub fn bot(bot_type: impl Into<String>, bot_name: impl Into<String>, confidence: f64) -> Self {
        Self {
            is_bot: true,
            bot_type: Some(bot_type.into()),
            bot_name: Some(bot_name.into()),
            confidence: clamp_confidence(confidence),
        }
    }

    /// Weak "probably human" verdict for unresolved agents
    pub fn unresolved_default() -> Self {
        Self {
            is_bot: false,
            bot_type: None,
            bot_name: None,
            confidence: DEFAULT_CONFIDENCE,
        }
    }

    /// Verdict for blank user-agent strings
    pub fn empty_ua() -> Self {
        Self::bot("unknown", "empty_ua", 0.9)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Which resolution tier produced a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Cache,
    EmptyUa,
    Heuristic,
    Signature,
    Headless,
    External,
    Disambiguation,
    Default,
}

impl Provenance {
    /// Override precedence when two tiers produced a verdict for the same agent.
    /// A refined value replaces a base value of equal or lower precedence.
    pub fn precedence(self) -> u8 {
        match self {
            Provenance::Default => 0,
            Provenance::External => 1,
            Provenance::Cache
            | Provenance::EmptyUa
            | Provenance::Heuristic
            | Provenance::Signature
            | Provenance::Headless => 2,
            Provenance::Disambiguation => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Cache => "cache",
            Provenance::EmptyUa => "empty_ua",
            Provenance::Heuristic => "heuristic",
            Provenance::Signature => "signature",
            Provenance::Headless => "headless",
            Provenance::External => "external",
            Provenance::Disambiguation => "disambiguation",
            Provenance::Default => "default",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "cache" => Provenance::Cache,
            "empty_ua" => Provenance::EmptyUa,
            "heuristic" => Provenance::Heuristic,
            "signature" => Provenance::Signature,
            "headless" => Provenance::Headless,
            "external" => Provenance::External,
            "disambiguation" => Provenance::Disambiguation,
            "default" => Provenance::Default,
            _ => return None,
        })
    }
}

/// A verdict tagged with the tier that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(flatten)]
    pub verdict: UaClassification,
    pub provenance: Provenance,
}

impl Classification {
    pub fn new(verdict: UaClassification, provenance: Provenance) -> Self {
        Self {
            verdict,
            provenance,
        }
    }

    /// Pick between a base and a refined classification for the same agent
    pub fn merge(base: Classification, refined: Classification) -> Classification {
        if refined.provenance.precedence() >= base.provenance.precedence() {
            refined
        } else {
            base
        }
    }

    /// Gate this classification against the disambiguation threshold
    pub fn resolution(&self, threshold: f64) -> Resolution {
        if self.provenance == Provenance::Default {
            Resolution::Unresolved
        } else if self.verdict.confidence < threshold {
            Resolution::Deferred {
                classification: self.clone(),
                reason: DeferReason::LowConfidence,
            }
        } else {
            Resolution::Resolved(self.clone())
        }
    }
}

/// Why a verdict needs more evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    LowConfidence,
    NeedsWeb,
    Anomalous,
}

/// Three-state outcome of resolving one user agent
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Classification),
    Unresolved,
    Deferred {
        classification: Classification,
        reason: DeferReason,
    },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    pub fn classification(&self) -> Option<&Classification> {
        match self {
            Resolution::Resolved(c) => Some(c),
            Resolution::Deferred { classification, .. } => Some(classification),
            Resolution::Unresolved => None,
        }
    }
}

/// Classification as held by the classification cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedClassification {
    #[serde(flatten)]
    pub verdict: UaClassification,
    pub source: Provenance,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(confidence: f64, provenance: Provenance) -> Classification {
        Classification::new(
            UaClassification::bot("crawler", "x", confidence),
            provenance,
        )
    }

    #[test]
    fn test_refined_overrides_base() {
        let base = classification(0.4, Provenance::Default);
        let refined = classification(0.8, Provenance::Disambiguation);
        let merged = Classification::merge(base, refined.clone());
        assert_eq!(merged, refined);

        let signature = classification(0.99, Provenance::Signature);
        let merged = Classification::merge(signature, classification(0.5, Provenance::Disambiguation));
        assert_eq!(merged.provenance, Provenance::Disambiguation);
    }

    #[test]
    fn test_default_never_overrides_resolved() {
        let base = classification(0.9, Provenance::Heuristic);
        let merged = Classification::merge(base.clone(), classification(0.4, Provenance::Default));
        assert_eq!(merged, base);
    }

    #[test]
    fn test_resolution_gate() {
        assert_eq!(
            classification(0.4, Provenance::Default).resolution(0.65),
            Resolution::Unresolved
        );
        assert!(matches!(
            classification(0.5, Provenance::External).resolution(0.65),
            Resolution::Deferred {
                reason: DeferReason::LowConfidence,
                ..
            }
        ));
        assert!(classification(0.9, Provenance::Signature)
            .resolution(0.65)
            .is_resolved());
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(UaClassification::bot("a", "b", 1.7).confidence, 1.0);
        assert_eq!(UaClassification::bot("a", "b", f64::NAN).confidence, 0.0);
    }
}
