//! Bulk classification by an external service

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::EndpointSettings;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::UaClassification;

/// Classifies a batch of user agents in one call.
///
/// Agents the service does not answer for are simply absent from the result.
#[async_trait]
pub trait BulkClassifier: Send + Sync {
    async fn classify_batch(
        &self,
        user_agents: &[String],
    ) -> AnalysisResult<HashMap<String, UaClassification>>;
}

/// JSON-over-HTTP endpoint shared by the external capabilities
#[derive(Debug, Clone)]
pub(crate) struct JsonEndpoint {
    client: Client,
    url: String,
    api_key: Option<String>,
    pub model: Option<String>,
}

impl JsonEndpoint {
    pub fn new(settings: &EndpointSettings) -> AnalysisResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: settings.url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        })
    }

    pub async fn post<B, R>(&self, body: &B) -> AnalysisResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            AnalysisError::ExternalTool(format!("malformed response from {}: {e}", self.url))
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    user_agents: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkResponse {
    results: Vec<BulkResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkResult {
    user_agent: String,
    #[serde(flatten)]
    verdict: UaClassification,
}

pub struct HttpBulkClassifier {
    endpoint: JsonEndpoint,
}

impl HttpBulkClassifier {
    pub fn new(settings: &EndpointSettings) -> AnalysisResult<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new(settings)?,
        })
    }
}

#[async_trait]
impl BulkClassifier for HttpBulkClassifier {
    async fn classify_batch(
        &self,
        user_agents: &[String],
    ) -> AnalysisResult<HashMap<String, UaClassification>> {
        let request = BulkRequest {
            model: self.endpoint.model.as_deref(),
            user_agents,
        };
        let response: BulkResponse = self.endpoint.post(&request).await?;

        Ok(response
            .results
            .into_iter()
            .filter(|r| user_agents.contains(&r.user_agent))
            .map(|r| {
                let confidence = r.verdict.confidence;
                (r.user_agent, r.verdict.with_confidence(confidence))
            })
            .collect())
    }
}

/// Serves `router` on an ephemeral local port and returns its base URL
#[cfg(test)]
pub(crate) async fn serve_locally(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[cfg(test)]
pub(crate) fn local_endpoint(base: &str, path: &str) -> EndpointSettings {
    EndpointSettings {
        url: format!("{base}{path}"),
        api_key: Some("secret-key".to_string()),
        model: Some("classifier-small".to_string()),
        timeout_secs: 5,
    }
}
