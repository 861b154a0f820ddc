//! Drives one analysis from input resolution to a persisted report
//!
//! Stages run in order: input, classification, anomalies, usage,
//! disambiguation, cost, persistence. Each stage is fault-isolated; only
//! the absence of any input is fatal.

mod input;
pub mod outcome;
pub mod request;

pub use outcome::StageOutcome;
pub use request::{
    resolve_window_days, AnalyzeOptions, AnalyzeRequest, DataReference, WindowQuery,
    MIN_EXPLICIT_WINDOW_DAYS,
};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::{
    calculate_cost, AnomalyDetector, AnomalyRecord, ByteBreakdown, CostEstimate, CostInput,
    PriceTable, UaByteLedger, UaUsage,
};
use crate::classify::{HttpBulkClassifier, SignatureSet, UaClassifier};
use crate::config::AnalysisSettings;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{
    report_id, AnalysisReport, Classification, ClassificationSummary, InputSummary, StageReport,
    StageStatus,
};
use crate::orchestrator::input::{resolve_input, usage_pass};
use crate::orchestrator::outcome::StageLog;
use crate::sherlock::{FeatureExtractor, HttpVerdictModel, HttpWebSearch, Sherlock};
use crate::storage::{ClassificationCache, EntryStore, ReportSink};

pub struct Orchestrator {
    classifier: UaClassifier,
    detector: AnomalyDetector,
    sherlock: Option<Sherlock>,
    price_table: PriceTable,
    entries: Option<Arc<dyn EntryStore>>,
    reports: Option<Arc<dyn ReportSink>>,
    confidence_threshold: f64,
    default_window_days: f64,
    tools_by_default: bool,
    /// Degradations found while loading signatures
    classification_notes: Vec<String>,
    /// Degradations found while loading the price table
    cost_notes: Vec<String>,
}

impl Orchestrator {
    pub fn new(classifier: UaClassifier, price_table: PriceTable) -> Self {
        let defaults = AnalysisSettings::default();
        Self {
            classifier,
            detector: AnomalyDetector::default(),
            sherlock: None,
            price_table,
            entries: None,
            reports: None,
            confidence_threshold: defaults.disambiguation.confidence_threshold,
            default_window_days: defaults.default_window_days,
            tools_by_default: defaults.disambiguation.tools_enabled,
            classification_notes: Vec::new(),
            cost_notes: Vec::new(),
        }
    }

    pub fn with_detector(mut self, detector: AnomalyDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_sherlock(mut self, sherlock: Sherlock) -> Self {
        self.tools_by_default = sherlock.settings().tools_enabled;
        self.confidence_threshold = sherlock.settings().confidence_threshold;
        self.sherlock = Some(sherlock);
        self
    }

    pub fn with_entry_store(mut self, entries: Arc<dyn EntryStore>) -> Self {
        self.entries = Some(entries);
        self
    }

    pub fn with_report_sink(mut self, reports: Arc<dyn ReportSink>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_default_window_days(mut self, days: f64) -> Self {
        self.default_window_days = days;
        self
    }

    /// Build every collaborator from settings.
    ///
    /// A missing or invalid signature file or price table degrades to the
    /// built-in defaults and is reported on every analysis.
    pub async fn from_settings(
        settings: &AnalysisSettings,
        cache: Option<Arc<dyn ClassificationCache>>,
    ) -> AnalysisResult<Self> {
        let (signatures, signature_note) =
            SignatureSet::load(settings.signatures_path.as_deref()).await;

        let mut classifier =
            UaClassifier::new(signatures).with_batch_size(settings.classifier.batch_size);
        if let Some(endpoint) = &settings.classifier.external {
            classifier = classifier.with_external(Arc::new(HttpBulkClassifier::new(endpoint)?));
        }
        if let Some(cache) = &cache {
            classifier = classifier.with_cache(Arc::clone(cache));
        }

        let (price_table, price_note) = match &settings.price_table_path {
            Some(path) => match PriceTable::load(path).await {
                Ok(table) => (table, None),
                Err(e) => {
                    let note = format!("{e:#}; using built-in price table");
                    warn!("{}", note);
                    (PriceTable::builtin(), Some(note))
                }
            },
            None => (PriceTable::builtin(), None),
        };

        let mut orchestrator = Self::new(classifier, price_table)
            .with_detector(AnomalyDetector::new(settings.thresholds.clone()))
            .with_default_window_days(settings.default_window_days)
            .with_confidence_threshold(settings.disambiguation.confidence_threshold);
        orchestrator.classification_notes.extend(signature_note);
        orchestrator.cost_notes.extend(price_note);

        let disambiguation = &settings.disambiguation;
        if let Some(endpoint) = &disambiguation.verdict_model {
            let mut sherlock = Sherlock::new(
                Arc::new(HttpVerdictModel::new(endpoint)?),
                disambiguation.clone(),
            );
            if let Some(search) = &disambiguation.web_search {
                sherlock = sherlock.with_web_search(Arc::new(HttpWebSearch::new(search)?));
            }
            if let Some(cache) = cache {
                sherlock = sherlock.with_cache(cache);
            }
            orchestrator = orchestrator.with_sherlock(sherlock);
        }

        Ok(orchestrator)
    }

    pub fn price_table(&self) -> &PriceTable {
        &self.price_table
    }

    /// Run one analysis.
    ///
    /// Fails only when no input source yields data.
    pub async fn analyze(&self, request: &AnalyzeRequest) -> AnalysisResult<AnalysisReport> {
        let mut log = StageLog::default();
        let site_id = request.site_id.as_str();
        let entries = self.entries.as_deref();

        // Input
        let input = log.settle("input", resolve_input(site_id, &request.data, entries).await)?;
        let aggregation = &input.aggregation;

        // Classification
        let use_external = request.options.use_external_classifier;
        let run = self
            .classifier
            .classify(&aggregation.unique_user_agents, use_external)
            .await;
        let mut notes = self.classification_notes.clone();
        notes.extend(run.notes);
        let base = log.settle("classification", StageOutcome::from_notes(run.results, notes))?;

        // Anomalies
        let by_ip_status =
            (!aggregation.by_ip_status.is_empty()).then_some(&aggregation.by_ip_status);
        let anomalies = log.settle(
            "anomalies",
            match self.detector.detect(&aggregation.by_ip_minute, by_ip_status) {
                Ok(records) => StageOutcome::Complete(records),
                Err(e) => StageOutcome::degraded(Vec::new(), e.to_string()),
            },
        )?;
        let anomalies = Arc::new(anomalies);

        // Usage pass over raw entries, feeding the ledger and the feature extractor
        let targets = self.disambiguation_targets(&base, request);
        let mut ledger = UaByteLedger::new();
        let mut extractor = FeatureExtractor::new(targets);
        let usage_ok = log.settle(
            "usage",
            match &input.raw {
                Some(raw) => {
                    match usage_pass(raw, site_id, entries, &mut ledger, &mut extractor).await {
                        Ok(seen) => {
                            info!("Usage pass replayed {} entries", seen);
                            StageOutcome::Complete(true)
                        }
                        Err(e) => {
                            ledger = UaByteLedger::new();
                            StageOutcome::degraded(
                                false,
                                format!("usage pass failed, byte split falls back to aggregates: {e:#}"),
                            )
                        }
                    }
                }
                None => StageOutcome::degraded(
                    false,
                    "raw entries unavailable; bot/human byte split is unattributed",
                ),
            },
        )?;

        // Disambiguation
        let merged = self
            .disambiguate(&mut log, base, extractor, Arc::clone(&anomalies), request)
            .await?;

        let bytes = if usage_ok {
            ledger.breakdown(&merged)
        } else {
            ByteBreakdown::from_aggregation(aggregation)
        };

        // Window and cost
        let data_window = input.query.or_else(|| {
            let totals = &aggregation.totals;
            totals
                .start_time
                .zip(totals.end_time)
                .map(|(start, end)| WindowQuery { start, end })
        });
        let (window_start, window_end) = data_window
            .map(|w| (w.start, w.end))
            .unwrap_or((DateTime::<Utc>::UNIX_EPOCH, DateTime::<Utc>::UNIX_EPOCH));
        let (window_days, window_note) =
            resolve_window_days(request.window_days, data_window, self.default_window_days);

        let cost = log.settle("cost", self.price(request, &bytes, window_days, window_note))?;

        let usage: HashMap<String, UaUsage> = if usage_ok {
            ledger.usage().clone()
        } else {
            HashMap::new()
        };

        let mut report = AnalysisReport {
            report_id: report_id(
                site_id,
                &request.provider,
                window_start,
                window_end,
                &self.price_table.version,
            ),
            site_id: site_id.to_string(),
            provider: request.provider.clone(),
            window_start,
            window_end,
            window_days,
            price_table_version: self.price_table.version.clone(),
            generated_at: Utc::now(),
            input: InputSummary {
                source: input.source,
                raw_entries_available: usage_ok,
                entries_processed: aggregation.totals.total_requests,
                skipped_lines: input.skipped_lines,
            },
            totals: aggregation.totals,
            classification: ClassificationSummary::build(&merged, &usage),
            bytes,
            cost,
            anomalies: anomalies.as_ref().clone(),
            stages: Vec::new(),
            notes: Vec::new(),
        };

        self.persist(&mut log, &mut report).await;
        info!(
            "Report {} for site {} assembled ({} anomalies, total cost {:.2} {})",
            report.report_id,
            report.site_id,
            report.anomalies.len(),
            report.cost.total_cost,
            report.cost.currency
        );
        Ok(report)
    }

    /// Agents whose base classification is unresolved or deferred
    fn disambiguation_targets(
        &self,
        base: &HashMap<String, Classification>,
        request: &AnalyzeRequest,
    ) -> Vec<String> {
        if self.sherlock.is_none() || !request.options.disambiguate {
            return Vec::new();
        }
        base.iter()
            .filter(|(_, c)| !c.resolution(self.confidence_threshold).is_resolved())
            .map(|(ua, _)| ua.clone())
            .collect()
    }

    async fn disambiguate(
        &self,
        log: &mut StageLog,
        mut base: HashMap<String, Classification>,
        extractor: FeatureExtractor,
        anomalies: Arc<Vec<AnomalyRecord>>,
        request: &AnalyzeRequest,
    ) -> AnalysisResult<HashMap<String, Classification>> {
        let Some(sherlock) = &self.sherlock else {
            log.push("disambiguation", StageStatus::Complete, None);
            return Ok(base);
        };
        if extractor.is_empty() {
            log.push("disambiguation", StageStatus::Complete, None);
            return Ok(base);
        }

        let features = extractor.finish(&anomalies);
        let use_tools = request.options.use_tools.unwrap_or(self.tools_by_default);
        let run = sherlock.disambiguate(&features, anomalies, use_tools).await;

        for (ua, refined) in run.refined {
            let merged = match base.remove(&ua) {
                Some(existing) => Classification::merge(existing, refined),
                None => refined,
            };
            base.insert(ua, merged);
        }

        log.settle("disambiguation", StageOutcome::from_notes(base, run.notes))
    }

    fn price(
        &self,
        request: &AnalyzeRequest,
        bytes: &ByteBreakdown,
        window_days: f64,
        window_note: Option<String>,
    ) -> StageOutcome<CostEstimate> {
        let categories = bytes.cost_categories();
        let estimate = calculate_cost(
            &CostInput {
                provider: &request.provider,
                total_bytes: bytes.total_bytes,
                breakdown: &categories,
                window_days: Some(window_days),
                options: &request.options.cost,
            },
            &self.price_table,
        );

        let mut notes = self.cost_notes.clone();
        notes.extend(window_note);
        if !estimate.pricing_resolved {
            let err = AnalysisError::CostCompute(format!(
                "provider '{}' is not priced by table {}",
                request.provider, self.price_table.version
            ));
            warn!("{}", err);
            notes.push(err.to_string());
        }
        StageOutcome::from_notes(estimate, notes)
    }

    /// Upsert the report; a failure is recorded on the returned report only
    async fn persist(&self, log: &mut StageLog, report: &mut AnalysisReport) {
        let Some(reports) = &self.reports else {
            report.stages = std::mem::take(&mut log.stages);
            report.notes = std::mem::take(&mut log.notes);
            return;
        };

        let mut stored = log.stages.clone();
        stored.push(StageReport {
            stage: "persistence".to_string(),
            status: StageStatus::Complete,
            note: None,
        });
        report.stages = stored;
        report.notes = log.notes.clone();

        if let Err(e) = reports.upsert_report(report).await {
            let err = AnalysisError::Persistence(e.to_string());
            warn!("{}", err);
            log.push("persistence", StageStatus::Degraded, Some(err.to_string()));
            report.stages = std::mem::take(&mut log.stages);
            report.notes = std::mem::take(&mut log.notes);
        }
    }
}
