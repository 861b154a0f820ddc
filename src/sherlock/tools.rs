//! Tools the stage-2 verdict model may call

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::analysis::AnomalyRecord;
use crate::classify::external::JsonEndpoint;
use crate::config::EndpointSettings;
use crate::error::AnalysisResult;

pub const WEB_SEARCH: &str = "web_search";
pub const ANOMALY_LOOKUP: &str = "anomaly_lookup";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> AnalysisResult<Vec<SearchHit>>;
}

pub struct HttpWebSearch {
    endpoint: JsonEndpoint,
}

impl HttpWebSearch {
    pub fn new(settings: &EndpointSettings) -> AnalysisResult<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new(settings)?,
        })
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

#[async_trait]
impl WebSearch for HttpWebSearch {
    async fn search(&self, query: &str) -> AnalysisResult<Vec<SearchHit>> {
        let response: SearchResponse = self.endpoint.post(&json!({ "query": query })).await?;
        Ok(response.results)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutput {
    fn ok(call: &ToolCall, output: Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            output,
            error: None,
        }
    }

    fn failed(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Tools for one stage-2 batch, bounded by a call budget.
///
/// Tool failures are reported back to the model, never raised.
pub struct ToolBox {
    web_search: Option<Arc<dyn WebSearch>>,
    anomalies: Arc<Vec<AnomalyRecord>>,
    budget: usize,
    used: AtomicUsize,
}

impl ToolBox {
    pub fn new(
        web_search: Option<Arc<dyn WebSearch>>,
        anomalies: Arc<Vec<AnomalyRecord>>,
        budget: usize,
    ) -> Self {
        Self {
            web_search,
            anomalies,
            budget,
            used: AtomicUsize::new(0),
        }
    }

    pub fn calls_made(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.calls_made())
    }

    /// Names of the tools available to the model
    pub fn available(&self) -> Vec<&'static str> {
        let mut tools = vec![ANOMALY_LOOKUP];
        if self.web_search.is_some() {
            tools.insert(0, WEB_SEARCH);
        }
        tools
    }

    pub async fn call(&self, call: &ToolCall) -> ToolOutput {
        if self.used.fetch_add(1, Ordering::SeqCst) >= self.budget {
            return ToolOutput::failed(call, "tool call budget exhausted");
        }
        debug!("Tool call {} ({})", call.name, call.arguments);

        match call.name.as_str() {
            WEB_SEARCH => self.web_search(call).await,
            ANOMALY_LOOKUP => self.anomaly_lookup(call),
            other => ToolOutput::failed(call, format!("unknown tool '{other}'")),
        }
    }

    async fn web_search(&self, call: &ToolCall) -> ToolOutput {
        let Some(search) = &self.web_search else {
            return ToolOutput::failed(call, "web search is not configured");
        };
        let Some(query) = call.arguments.get("query").and_then(Value::as_str) else {
            return ToolOutput::failed(call, "missing 'query' argument");
        };
        match search.search(query).await {
            Ok(hits) => ToolOutput::ok(call, json!({ "results": hits })),
            Err(e) => ToolOutput::failed(call, e.to_string()),
        }
    }

    fn anomaly_lookup(&self, call: &ToolCall) -> ToolOutput {
        let ips: Vec<&str> = match call.arguments.get("ips").and_then(Value::as_array) {
            Some(list) => list.iter().filter_map(Value::as_str).collect(),
            None => call
                .arguments
                .get("ip")
                .and_then(Value::as_str)
                .into_iter()
                .collect(),
        };
        if ips.is_empty() {
            return ToolOutput::failed(call, "missing 'ip' or 'ips' argument");
        }

        let matches: Vec<&AnomalyRecord> = self
            .anomalies
            .iter()
            .filter(|r| ips.contains(&r.ip.as_str()))
            .collect();
        ToolOutput::ok(call, json!({ "anomalies": matches }))
    }
}
