//! Compiled bot signatures
//!
//! A signature file is a JSON array of entries (or an object with a
//! `signatures` array). Patterns are literal unless `isRegex` is set and
//! always match case-insensitively.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{AnalysisError, AnalysisResult};
use crate::models::UaClassification;

pub const DEFAULT_SIGNATURE_CONFIDENCE: f64 = 0.85;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub pattern: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub is_regex: bool,
}

impl SignatureSpec {
    fn literal(name: &str, pattern: &str, category: &str, confidence: f64) -> Self {
        Self {
            name: Some(name.to_string()),
            pattern: pattern.to_string(),
            category: Some(category.to_string()),
            confidence: Some(confidence),
            is_regex: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SignatureFile {
    List(Vec<SignatureSpec>),
    Wrapped { signatures: Vec<SignatureSpec> },
}

#[derive(Debug, Clone)]
struct CompiledSignature {
    spec: SignatureSpec,
    regex: Regex,
}

/// Ordered signature list; the first match wins
#[derive(Debug, Clone)]
pub struct SignatureSet {
    signatures: Vec<CompiledSignature>,
    builtin: bool,
}

impl SignatureSet {
    pub fn builtin() -> Self {
        let specs = vec![
            SignatureSpec::literal("Googlebot", "Googlebot", "search_engine", 0.99),
            SignatureSpec::literal("Bingbot", "bingbot", "search_engine", 0.99),
            SignatureSpec::literal("GPTBot", "GPTBot", "ai_training", 0.99),
            SignatureSpec::literal("AhrefsBot", "AhrefsBot", "seo", 0.95),
            SignatureSpec::literal("curl", "curl/", "tool", 0.9),
            SignatureSpec::literal("python-requests", "python-requests", "tool", 0.9),
        ];
        let signatures = specs
            .into_iter()
            .filter_map(|spec| compile_one(spec).ok())
            .collect();
        Self {
            signatures,
            builtin: true,
        }
    }

    pub fn compile(specs: Vec<SignatureSpec>) -> AnalysisResult<Self> {
        let signatures = specs
            .into_iter()
            .map(compile_one)
            .collect::<AnalysisResult<Vec<_>>>()?;
        Ok(Self {
            signatures,
            builtin: false,
        })
    }

    /// Load signatures from a file, falling back to the built-in set.
    ///
    /// The returned note is set whenever the fallback was taken because a
    /// configured source could not be used.
    pub async fn load(path: Option<&Path>) -> (Self, Option<String>) {
        let Some(path) = path else {
            return (Self::builtin(), None);
        };

        match Self::read(path).await {
            Ok(set) if !set.is_empty() => {
                info!("Loaded {} signatures from {}", set.len(), path.display());
                (set, None)
            }
            Ok(_) => {
                let note = format!(
                    "signature file {} is empty; using built-in signatures",
                    path.display()
                );
                warn!("{}", note);
                (Self::builtin(), Some(note))
            }
            Err(e) => {
                let note = format!("{e}; using built-in signatures");
                warn!("{}", note);
                (Self::builtin(), Some(note))
            }
        }
    }

    async fn read(path: &Path) -> AnalysisResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AnalysisError::Classification(format!(
                "signature file {} unreadable: {e}",
                path.display()
            ))
        })?;
        let file: SignatureFile = serde_json::from_str(&raw).map_err(|e| {
            AnalysisError::Classification(format!(
                "signature file {} invalid: {e}",
                path.display()
            ))
        })?;
        let specs = match file {
            SignatureFile::List(specs) => specs,
            SignatureFile::Wrapped { signatures } => signatures,
        };
        Self::compile(specs)
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn classify(&self, user_agent: &str) -> Option<UaClassification> {
        let hit = self
            .signatures
            .iter()
            .find(|s| s.regex.is_match(user_agent))?;
        let spec = &hit.spec;
        Some(UaClassification {
            is_bot: true,
            bot_type: spec.category.clone(),
            bot_name: spec.name.clone().or_else(|| Some(spec.pattern.clone())),
            confidence: crate::models::clamp_confidence(
                spec.confidence.unwrap_or(DEFAULT_SIGNATURE_CONFIDENCE),
            ),
        })
    }
}

fn compile_one(spec: SignatureSpec) -> AnalysisResult<CompiledSignature> {
    let source = if spec.is_regex {
        spec.pattern.clone()
    } else {
        regex::escape(&spec.pattern)
    };
    let regex = RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| {
            AnalysisError::Classification(format!("bad signature pattern {:?}: {e}", spec.pattern))
        })?;
    Ok(CompiledSignature { spec, regex })
}
