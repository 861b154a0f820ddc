//! Verdict models consulted by the disambiguation stage

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::external::JsonEndpoint;
use crate::config::EndpointSettings;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::UaClassification;
use crate::sherlock::features::UaFeatures;
use crate::sherlock::tools::{ToolBox, ToolCall, ToolOutput};

/// One model answer for one user agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub user_agent: String,
    #[serde(flatten)]
    pub classification: UaClassification,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, alias = "needs_web")]
    pub needs_web: bool,
}

#[async_trait]
pub trait VerdictModel: Send + Sync {
    /// Stage 1: judge from feature vectors alone
    async fn assess(&self, batch: &[UaFeatures]) -> AnalysisResult<Vec<Verdict>>;

    /// Stage 2: judge with access to the given tools
    async fn investigate(&self, batch: &[UaFeatures], tools: &ToolBox)
        -> AnalysisResult<Vec<Verdict>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerdictRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    stage: &'static str,
    user_agents: &'a [UaFeatures],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<&'static str>,
    #[serde(skip_serializing_if = "<[ToolOutput]>::is_empty")]
    tool_results: &'a [ToolOutput],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerdictResponse {
    #[serde(default)]
    verdicts: Option<Vec<Verdict>>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

/// Verdict model behind a JSON endpoint.
///
/// During stage 2 the endpoint may answer with `toolCalls` instead of
/// verdicts; the calls are executed and their outputs sent back until the
/// endpoint produces verdicts or the tool budget runs out.
pub struct HttpVerdictModel {
    endpoint: JsonEndpoint,
}

impl HttpVerdictModel {
    pub fn new(settings: &EndpointSettings) -> AnalysisResult<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new(settings)?,
        })
    }
}

#[async_trait]
impl VerdictModel for HttpVerdictModel {
    async fn assess(&self, batch: &[UaFeatures]) -> AnalysisResult<Vec<Verdict>> {
        let request = VerdictRequest {
            model: self.endpoint.model.as_deref(),
            stage: "assess",
            user_agents: batch,
            tools: Vec::new(),
            tool_results: &[],
        };
        let response: VerdictResponse = self.endpoint.post(&request).await?;
        response.verdicts.ok_or_else(|| {
            AnalysisError::ExternalTool("verdict response carried no verdicts".to_string())
        })
    }

    async fn investigate(
        &self,
        batch: &[UaFeatures],
        tools: &ToolBox,
    ) -> AnalysisResult<Vec<Verdict>> {
        let mut tool_results: Vec<ToolOutput> = Vec::new();

        loop {
            let request = VerdictRequest {
                model: self.endpoint.model.as_deref(),
                stage: "investigate",
                user_agents: batch,
                tools: if tools.remaining() > 0 {
                    tools.available()
                } else {
                    Vec::new()
                },
                tool_results: &tool_results,
            };
            let response: VerdictResponse = self.endpoint.post(&request).await?;

            if response.tool_calls.is_empty() {
                return response.verdicts.ok_or_else(|| {
                    AnalysisError::ExternalTool(
                        "investigation response carried no verdicts".to_string(),
                    )
                });
            }
            if tools.remaining() == 0 {
                return Err(AnalysisError::ExternalTool(format!(
                    "model kept requesting tools after {} calls",
                    tools.calls_made()
                )));
            }

            debug!("Verdict model requested {} tool calls", response.tool_calls.len());
            for call in &response.tool_calls {
                tool_results.push(tools.call(call).await);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::anomaly::AnomalyEvidence;
    use crate::analysis::{AnomalyRecord, AnomalyType};
    use crate::classify::external::{local_endpoint, serve_locally};
    use crate::sherlock::tools::ANOMALY_LOOKUP;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::Arc;

    async fn model_for(router: Router) -> HttpVerdictModel {
        let base = serve_locally(router).await;
        HttpVerdictModel::new(&local_endpoint(&base, "/verdicts")).unwrap()
    }

    fn batch() -> Vec<UaFeatures> {
        vec![UaFeatures {
            user_agent: "odd-fetcher/1".to_string(),
            suspicion_score: 40,
            has_anomaly: true,
            sample_ips: vec!["9.9.9.9".to_string()],
            ..Default::default()
        }]
    }

    fn toolbox(budget: usize) -> ToolBox {
        let anomalies = Arc::new(vec![AnomalyRecord {
            kind: AnomalyType::SteadyScrape,
            ip: "9.9.9.9".to_string(),
            evidence: AnomalyEvidence::default(),
            samples: Vec::new(),
        }]);
        ToolBox::new(None, anomalies, budget)
    }

    #[tokio::test]
    async fn test_assess_round_trip() {
        let router = Router::new().route(
            "/verdicts",
            post(|Json(body): Json<Value>| async move {
                let ua = body["userAgents"][0]["userAgent"].clone();
                Json(json!({
                    "stage": body["stage"],
                    "verdicts": [{
                        "userAgent": ua, "isBot": true, "botType": "scraper",
                        "confidence": 0.7, "reasoning": body["stage"], "needs_web": true
                    }]
                }))
            }),
        );
        let model = model_for(router).await;

        let verdicts = model.assess(&batch()).await.unwrap();

        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].user_agent, "odd-fetcher/1");
        assert_eq!(verdicts[0].reasoning, "assess");
        assert!(verdicts[0].needs_web);
        assert_eq!(verdicts[0].classification.bot_type.as_deref(), Some("scraper"));
    }

    #[tokio::test]
    async fn test_assess_without_verdicts_is_an_error() {
        let router = Router::new().route("/verdicts", post(|| async { Json(json!({})) }));
        let model = model_for(router).await;

        let err = model.assess(&batch()).await.unwrap_err();

        assert!(err.to_string().contains("carried no verdicts"), "{err}");
    }

    #[tokio::test]
    async fn test_investigate_runs_requested_tools() {
        let router = Router::new().route(
            "/verdicts",
            post(|Json(body): Json<Value>| async move {
                let Some(results) = body["toolResults"].as_array() else {
                    assert_eq!(body["tools"], json!([ANOMALY_LOOKUP]));
                    return Json(json!({
                        "toolCalls": [{
                            "id": "call-1", "name": ANOMALY_LOOKUP,
                            "arguments": { "ip": "9.9.9.9" }
                        }]
                    }));
                };
                let found = results[0]["output"]["anomalies"][0]["type"].clone();
                Json(json!({
                    "verdicts": [{
                        "userAgent": "odd-fetcher/1", "isBot": true, "botType": "scraper",
                        "confidence": 0.9, "reasoning": found
                    }]
                }))
            }),
        );
        let model = model_for(router).await;
        let tools = toolbox(3);

        let verdicts = model.investigate(&batch(), &tools).await.unwrap();

        assert_eq!(tools.calls_made(), 1);
        assert_eq!(verdicts[0].reasoning, "STEADY_SCRAPE");
        assert_eq!(verdicts[0].classification.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_investigate_stops_when_budget_runs_out() {
        let router = Router::new().route(
            "/verdicts",
            post(|| async {
                Json(json!({
                    "toolCalls": [{ "name": ANOMALY_LOOKUP, "arguments": { "ip": "9.9.9.9" } }]
                }))
            }),
        );
        let model = model_for(router).await;
        let tools = toolbox(1);

        let err = model.investigate(&batch(), &tools).await.unwrap_err();

        assert!(err.to_string().contains("kept requesting tools after 1 calls"), "{err}");
        assert_eq!(tools.remaining(), 0);
    }

    #[tokio::test]
    async fn test_malformed_verdicts_are_rejected() {
        let router = Router::new().route(
            "/verdicts",
            post(|| async { Json(json!({ "verdicts": [{ "reasoning": "no agent" }] })) }),
        );
        let model = model_for(router).await;

        let err = model.assess(&batch()).await.unwrap_err();

        assert!(matches!(err, AnalysisError::ExternalTool(_)));
    }
}
