//! Disambiguation of user agents the deterministic tiers could not settle
//!
//! Stage 1 sends feature vectors to a verdict model without tools. Agents
//! whose stage-1 verdict still needs evidence go to stage 2, where the model
//! may search the web and look up anomalies. The last verdict produced wins
//! and is written to the classification cache.

pub mod features;
pub mod model;
pub mod tools;

pub use features::{FeatureExtractor, UaFeatures};
pub use model::{HttpVerdictModel, Verdict, VerdictModel};
pub use tools::{HttpWebSearch, ToolBox, WebSearch};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::AnomalyRecord;
use crate::config::DisambiguationSettings;
use crate::models::{Classification, DeferReason, Provenance};
use crate::storage::{ClassificationCache, ClassificationUpdate};

pub const STAGE1_BATCH: (usize, usize) = (10, 100);
pub const STAGE2_BATCH: (usize, usize) = (1, 50);
/// Stage-1 verdicts below this confidence go to stage 2
pub const STAGE2_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Default)]
pub struct DisambiguationRun {
    /// Final verdict per agent, tagged `Disambiguation`
    pub refined: HashMap<String, Classification>,
    /// Why each stage-2 candidate was selected
    pub stage2_candidates: BTreeMap<String, DeferReason>,
    pub notes: Vec<String>,
}

pub struct Sherlock {
    model: Arc<dyn VerdictModel>,
    web_search: Option<Arc<dyn WebSearch>>,
    cache: Option<Arc<dyn ClassificationCache>>,
    settings: DisambiguationSettings,
}

impl Sherlock {
    pub fn new(model: Arc<dyn VerdictModel>, settings: DisambiguationSettings) -> Self {
        Self {
            model,
            web_search: None,
            cache: None,
            settings,
        }
    }

    pub fn with_web_search(mut self, web_search: Arc<dyn WebSearch>) -> Self {
        self.web_search = Some(web_search);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ClassificationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn settings(&self) -> &DisambiguationSettings {
        &self.settings
    }

    /// Resolve the given agents; failures leave agents out of `refined`
    pub async fn disambiguate(
        &self,
        features: &[UaFeatures],
        anomalies: Arc<Vec<AnomalyRecord>>,
        use_tools: bool,
    ) -> DisambiguationRun {
        let mut run = DisambiguationRun::default();
        if features.is_empty() {
            return run;
        }

        let mut verdicts = self.stage_one(features, &mut run).await;

        let candidates = select_candidates(features, &verdicts, self.settings.max_candidates);
        info!(
            "Disambiguation: {} stage-1 verdicts, {} stage-2 candidates",
            verdicts.len(),
            candidates.len()
        );
        for (features, reason) in &candidates {
            run.stage2_candidates
                .insert(features.user_agent.clone(), *reason);
        }

        if use_tools && !candidates.is_empty() {
            let batch: Vec<UaFeatures> = candidates.into_iter().map(|(f, _)| f.clone()).collect();
            for (ua, verdict) in self.stage_two(&batch, anomalies, &mut run).await {
                verdicts.insert(ua, verdict);
            }
        }

        run.refined = verdicts
            .into_iter()
            .map(|(ua, v)| (ua, Classification::new(v.classification, Provenance::Disambiguation)))
            .collect();

        self.persist(&mut run).await;
        run
    }

    async fn stage_one(
        &self,
        features: &[UaFeatures],
        run: &mut DisambiguationRun,
    ) -> HashMap<String, Verdict> {
        let batch_size = self
            .settings
            .stage1_batch_size
            .clamp(STAGE1_BATCH.0, STAGE1_BATCH.1);
        let mut verdicts = HashMap::new();
        for batch in features.chunks(batch_size) {
            match self.model.assess(batch).await {
                Ok(answers) => keep_answers(batch, answers, &mut verdicts),
                Err(e) => {
                    let note = format!("disambiguation stage 1 batch of {} failed: {e}", batch.len());
                    warn!("{}", note);
                    run.notes.push(note);
                }
            }
        }
        verdicts
    }

    async fn stage_two(
        &self,
        candidates: &[UaFeatures],
        anomalies: Arc<Vec<AnomalyRecord>>,
        run: &mut DisambiguationRun,
    ) -> HashMap<String, Verdict> {
        let batch_size = self
            .settings
            .stage2_batch_size
            .clamp(STAGE2_BATCH.0, STAGE2_BATCH.1);
        let mut verdicts = HashMap::new();
        for batch in candidates.chunks(batch_size) {
            let tools = ToolBox::new(
                self.web_search.clone(),
                Arc::clone(&anomalies),
                self.settings.tool_call_budget,
            );
            match self.model.investigate(batch, &tools).await {
                Ok(answers) => keep_answers(batch, answers, &mut verdicts),
                Err(e) => {
                    let note = format!(
                        "disambiguation stage 2 batch of {} failed, keeping stage-1 verdicts: {e}",
                        batch.len()
                    );
                    warn!("{}", note);
                    run.notes.push(note);
                }
            }
        }
        verdicts
    }

    async fn persist(&self, run: &mut DisambiguationRun) {
        let Some(cache) = &self.cache else {
            return;
        };
        if run.refined.is_empty() {
            return;
        }

        let updates: HashMap<String, ClassificationUpdate> = run
            .refined
            .iter()
            .map(|(ua, c)| {
                (
                    ua.clone(),
                    ClassificationUpdate {
                        verdict: c.verdict.clone(),
                        source: Provenance::Disambiguation,
                    },
                )
            })
            .collect();
        if let Err(e) = cache.upsert_many(&updates).await {
            let note = format!("failed to cache {} disambiguated verdicts: {e}", updates.len());
            warn!("{}", note);
            run.notes.push(note);
        }
    }
}

/// Keep only answers for agents in the batch, with clamped confidence
fn keep_answers(batch: &[UaFeatures], answers: Vec<Verdict>, into: &mut HashMap<String, Verdict>) {
    for mut verdict in answers {
        if !batch.iter().any(|f| f.user_agent == verdict.user_agent) {
            continue;
        }
        let confidence = verdict.classification.confidence;
        verdict.classification = verdict.classification.with_confidence(confidence);
        into.insert(verdict.user_agent.clone(), verdict);
    }
}

/// Stage-2 candidates in suspicion order, capped.
///
/// An agent with no stage-1 verdict qualifies as low confidence.
fn select_candidates<'a>(
    features: &'a [UaFeatures],
    verdicts: &HashMap<String, Verdict>,
    cap: usize,
) -> Vec<(&'a UaFeatures, DeferReason)> {
    let mut candidates: Vec<(&UaFeatures, DeferReason)> = features
        .iter()
        .filter_map(|f| {
            let reason = match verdicts.get(&f.user_agent) {
                Some(v) if v.needs_web => DeferReason::NeedsWeb,
                Some(v) if v.classification.confidence < STAGE2_CONFIDENCE => {
                    DeferReason::LowConfidence
                }
                None => DeferReason::LowConfidence,
                Some(_) if f.has_anomaly => DeferReason::Anomalous,
                Some(_) => return None,
            };
            Some((f, reason))
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.0.suspicion_score
            .cmp(&a.0.suspicion_score)
            .then_with(|| a.0.user_agent.cmp(&b.0.user_agent))
    });
    candidates.truncate(cap);
    candidates
}
