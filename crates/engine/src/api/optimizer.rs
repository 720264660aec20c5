//! JSON client for an external optimizer service

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::{build_client, check_status, transport_error};
use crate::config::ParamGrid;
use crate::error::CollaboratorError;
use crate::optimizer::{
    EvaluationRequest, Optimizer, OptimizerResults, OptimizerRunRequest, RefinementRequest,
    RunStatus,
};
use crate::types::Metrics;

const RATE_LIMITED: &[StatusCode] = &[StatusCode::TOO_MANY_REQUESTS];

#[derive(Clone)]
pub struct HttpOptimizer {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct RefineResponse {
    #[serde(default)]
    grid: Option<ParamGrid>,
}

impl HttpOptimizer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CollaboratorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Optimizer GET");
        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let response = check_status(response, "optimizer", RATE_LIMITED).await?;
        response.json().await.map_err(transport_error)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CollaboratorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Optimizer POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, "optimizer", RATE_LIMITED).await?;
        response.json().await.map_err(transport_error)
    }
}

#[async_trait]
impl Optimizer for HttpOptimizer {
    async fn start(&self, request: &OptimizerRunRequest) -> Result<String, CollaboratorError> {
        let started: StartResponse = self.post("/sessions", request).await?;
        Ok(started.session_id)
    }

    async fn status(&self, run_id: &str) -> Result<RunStatus, CollaboratorError> {
        self.get(&format!("/sessions/{run_id}")).await
    }

    async fn results(&self, run_id: &str) -> Result<OptimizerResults, CollaboratorError> {
        self.get(&format!("/sessions/{run_id}/results")).await
    }

    async fn refine(
        &self,
        request: &RefinementRequest,
    ) -> Result<Option<ParamGrid>, CollaboratorError> {
        let refined: RefineResponse = self.post("/refine", request).await?;
        Ok(refined.grid.filter(|grid| !grid.is_empty()))
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Metrics, CollaboratorError> {
        self.post("/evaluate", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::RunState;
    use rust_decimal_macros::dec;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = HttpOptimizer::new("http://localhost:8700/");
        assert_eq!(client.base_url, "http://localhost:8700");
    }

    #[test]
    fn test_wire_shapes() {
        let status: RunStatus =
            serde_json::from_str(r#"{"state":"running","progress":42.5}"#).unwrap();
        assert_eq!(status.state, RunState::Running);
        assert!(status.error.is_none());

        let refined: RefineResponse = serde_json::from_str(r#"{"grid":null}"#).unwrap();
        assert!(refined.grid.is_none());

        let results: OptimizerResults = serde_json::from_str(
            r#"{
                "evaluated": 24,
                "total_combos": 24,
                "ranked": [{
                    "params": {"period": 14},
                    "metrics": {"total_trades": 31, "max_drawdown": "0.08", "extra": 1},
                    "score": "1.25"
                }]
            }"#,
        )
        .unwrap();
        let best = results.select_candidate().unwrap();
        assert_eq!(best.score, dec!(1.25));
        assert_eq!(best.metrics.total_trades, 31);
        assert_eq!(best.metrics.max_drawdown, dec!(0.08));
        assert!(best.penalties.is_empty());
    }
}
