//! Tiered user-agent classification
//!
//! Resolution order, first match wins: cache, quick tokens, signatures,
//! headless regex, external bulk classifier, weak default.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classify::external::BulkClassifier;
use crate::classify::heuristics::{headless_match, quick_match};
use crate::classify::signatures::SignatureSet;
use crate::models::{Classification, Provenance, UaClassification};
use crate::storage::{ClassificationCache, ClassificationUpdate};

pub const MIN_EXTERNAL_BATCH: usize = 50;
pub const MAX_EXTERNAL_BATCH: usize = 500;

/// Outcome of classifying one set of user agents
#[derive(Debug, Clone, Default)]
pub struct ClassificationRun {
    pub results: HashMap<String, Classification>,
    /// Degradations hit along the way (cache down, external batch failed, ...)
    pub notes: Vec<String>,
    pub tier_counts: BTreeMap<Provenance, usize>,
}

impl ClassificationRun {
    fn record(&mut self, user_agent: String, classification: Classification) {
        *self.tier_counts.entry(classification.provenance).or_default() += 1;
        self.results.insert(user_agent, classification);
    }
}

pub struct UaClassifier {
    cache: Option<Arc<dyn ClassificationCache>>,
    signatures: SignatureSet,
    external: Option<Arc<dyn BulkClassifier>>,
    batch_size: usize,
}

impl UaClassifier {
    pub fn new(signatures: SignatureSet) -> Self {
        Self {
            cache: None,
            signatures,
            external: None,
            batch_size: 200,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ClassificationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_external(mut self, external: Arc<dyn BulkClassifier>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    /// Classify every distinct agent; never fails, degradations become notes
    pub async fn classify<I, S>(&self, user_agents: I, use_external: bool) -> ClassificationRun
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let distinct: BTreeSet<String> = user_agents
            .into_iter()
            .map(|ua| ua.as_ref().to_string())
            .collect();

        let mut run = ClassificationRun::default();
        let mut pending = Vec::new();
        for ua in distinct {
            if ua.trim().is_empty() {
                run.record(
                    ua,
                    Classification::new(UaClassification::empty_ua(), Provenance::EmptyUa),
                );
            } else {
                pending.push(ua);
            }
        }

        let pending = self.resolve_cached(pending, &mut run).await;
        let pending = self.resolve_local(pending, &mut run);
        let pending = if use_external {
            self.resolve_external(pending, &mut run).await
        } else {
            pending
        };

        for ua in pending {
            run.record(
                ua,
                Classification::new(UaClassification::unresolved_default(), Provenance::Default),
            );
        }

        self.write_back(&mut run).await;

        info!(
            "Classified {} user agents: {:?}",
            run.results.len(),
            run.tier_counts
        );
        run
    }

    async fn resolve_cached(&self, pending: Vec<String>, run: &mut ClassificationRun) -> Vec<String> {
        let Some(cache) = &self.cache else {
            return pending;
        };
        if pending.is_empty() {
            return pending;
        }

        match cache.get_many(&pending).await {
            Ok(mut hits) => pending
                .into_iter()
                .filter(|ua| match hits.remove(ua) {
                    Some(cached) => {
                        run.record(
                            ua.clone(),
                            Classification::new(cached.verdict, Provenance::Cache),
                        );
                        false
                    }
                    None => true,
                })
                .collect(),
            Err(e) => {
                let note = format!("classification cache unavailable, classifying without it: {e}");
                warn!("{}", note);
                run.notes.push(note);
                pending
            }
        }
    }

    fn resolve_local(&self, pending: Vec<String>, run: &mut ClassificationRun) -> Vec<String> {
        let mut unresolved = Vec::new();
        for ua in pending {
            let hit = quick_match(&ua)
                .map(|v| (v, Provenance::Heuristic))
                .or_else(|| self.signatures.classify(&ua).map(|v| (v, Provenance::Signature)))
                .or_else(|| headless_match(&ua).map(|v| (v, Provenance::Headless)));
            match hit {
                Some((verdict, provenance)) => {
                    run.record(ua, Classification::new(verdict, provenance))
                }
                None => unresolved.push(ua),
            }
        }
        unresolved
    }

    async fn resolve_external(
        &self,
        pending: Vec<String>,
        run: &mut ClassificationRun,
    ) -> Vec<String> {
        let Some(external) = &self.external else {
            return pending;
        };
        if pending.is_empty() {
            return pending;
        }

        let batch_size = self.batch_size.clamp(MIN_EXTERNAL_BATCH, MAX_EXTERNAL_BATCH);
        let mut unresolved = Vec::new();
        for batch in pending.chunks(batch_size) {
            debug!("Dispatching {} agents to external classifier", batch.len());
            match external.classify_batch(batch).await {
                Ok(mut verdicts) => {
                    for ua in batch {
                        match verdicts.remove(ua) {
                            Some(verdict) => run.record(
                                ua.clone(),
                                Classification::new(verdict, Provenance::External),
                            ),
                            None => unresolved.push(ua.clone()),
                        }
                    }
                }
                Err(e) => {
                    let note = format!(
                        "external classifier batch of {} agents failed: {e}",
                        batch.len()
                    );
                    warn!("{}", note);
                    run.notes.push(note);
                    unresolved.extend(batch.iter().cloned());
                }
            }
        }
        unresolved
    }

    /// Persist every verdict produced by a resolving tier this run
    async fn write_back(&self, run: &mut ClassificationRun) {
        let Some(cache) = &self.cache else {
            return;
        };

        let updates: HashMap<String, ClassificationUpdate> = run
            .results
            .iter()
            .filter(|(_, c)| {
                !matches!(
                    c.provenance,
                    Provenance::Cache | Provenance::Default | Provenance::EmptyUa
                )
            })
            .map(|(ua, c)| {
                (
                    ua.clone(),
                    ClassificationUpdate {
                        verdict: c.verdict.clone(),
                        source: c.provenance,
                    },
                )
            })
            .collect();

        if let Err(e) = cache.upsert_many(&updates).await {
            let note = format!("failed to write {} classifications to cache: {e}", updates.len());
            warn!("{}", note);
            run.notes.push(note);
        }
    }
}
