use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Config;

/// The settlement chain as seen by the validator: farm enumeration,
/// returns retrieval, decision submission, and registration state.
#[async_trait]
pub trait Chain: Send + Sync {
    /// Farm ids currently eligible for scoring.
    async fn active_farms(&self) -> Result<Vec<String>>;

    /// The returns series for one farm.
    async fn fetch_returns(&self, farm_id: &str) -> Result<Vec<f64>>;

    /// Submit an agreed score; returns the transaction hash.
    async fn submit_decision(&self, request_id: &str, score: f64) -> Result<String>;

    /// Whether an address is registered as a validator.
    async fn is_registered(&self, address: &str) -> Result<bool>;

    /// Latest block number.
    async fn latest_block(&self) -> Result<u64>;
}

/// HTTP client against the settlement node's RPC gateway.
pub struct RpcChain {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct FarmsResponse {
    farms: Vec<String>,
}

#[derive(Deserialize)]
struct ReturnsResponse {
    returns: Vec<f64>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    tx_hash: String,
}

#[derive(Deserialize)]
struct RegisteredResponse {
    registered: bool,
}

#[derive(Deserialize)]
struct BlockResponse {
    number: u64,
}

impl RpcChain {
    pub fn new(cfg: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.rpc_url.trim_end_matches('/').to_string(),
            token: cfg.auth_token.clone(),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.token))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .auth(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("failed to reach chain gateway at {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("chain gateway returned HTTP {status} for {path}");
        }
        resp.json().await.context("failed to parse chain response")
    }
}

#[async_trait]
impl Chain for RpcChain {
    async fn active_farms(&self) -> Result<Vec<String>> {
        let resp: FarmsResponse = self.get_json("/api/farms/active").await?;
        Ok(resp.farms)
    }

    async fn fetch_returns(&self, farm_id: &str) -> Result<Vec<f64>> {
        let resp: ReturnsResponse = self
            .get_json(&format!("/api/farms/{farm_id}/returns"))
            .await?;
        Ok(resp.returns)
    }

    async fn submit_decision(&self, request_id: &str, score: f64) -> Result<String> {
        let url = format!("{}/api/scores", self.base_url);
        let body = serde_json::json!({
            "request_id": request_id,
            "score": score,
        });
        let resp = self
            .auth(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .context("failed to submit decision")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("score submission rejected: HTTP {status}");
        }
        let submitted: SubmitResponse = resp.json().await.context("failed to parse submit response")?;
        Ok(submitted.tx_hash)
    }

    async fn is_registered(&self, address: &str) -> Result<bool> {
        let resp: RegisteredResponse = self
            .get_json(&format!("/api/validators/{address}/registered"))
            .await?;
        Ok(resp.registered)
    }

    async fn latest_block(&self) -> Result<u64> {
        let resp: BlockResponse = self.get_json("/api/blocks/latest").await?;
        Ok(resp.number)
    }
}
