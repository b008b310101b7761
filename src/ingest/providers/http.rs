use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;

use crate::config::ProviderConfig;
use crate::error::IngestError;
use crate::ingest::connector::ProviderClient;
use crate::ingest::types::{FetchRequest, RawResponse};

/// Generic REST provider: `GET {base_url}/{data_type}/{entity}?{params}`.
pub struct HttpProviderClient {
    base_url: String,
    api_key: Option<(String, String)>,
    client: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("market-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            client,
        })
    }

    pub fn with_api_key(mut self, header: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_key = Some((header.into(), key.into()));
        self
    }

    /// Build from provider config; the API key is read from `api_key_env`.
    pub fn from_config(name: &str, cfg: &ProviderConfig) -> Result<Self, IngestError> {
        let base = cfg
            .base_url
            .as_deref()
            .ok_or_else(|| IngestError::Config(format!("provider {name}: base_url missing")))?;
        let mut client = Self::new(base, cfg.call_timeout())?;
        if let Some(var) = &cfg.api_key_env {
            match std::env::var(var) {
                Ok(key) if !key.is_empty() => {
                    let header = cfg.api_key_header.as_deref().unwrap_or("X-Api-Key");
                    client = client.with_api_key(header, key);
                }
                _ => tracing::warn!(provider = name, env = %var, "API key env var not set"),
            }
        }
        Ok(client)
    }

    pub fn url_for(&self, req: &FetchRequest) -> String {
        format!("{}/{}/{}", self.base_url, req.data_type, req.entity_key)
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn fetch(&self, req: &FetchRequest) -> Result<RawResponse, IngestError> {
        let mut rb = self.client.get(self.url_for(req)).query(&req.params);
        if let Some((header, key)) = &self.api_key {
            rb = rb.header(header.as_str(), key.as_str());
        }

        let resp = rb.send().await.map_err(|e| {
            tracing::warn!(error = ?e, provider = %req.provider_id, "provider http error");
            IngestError::Network(e.to_string())
        })?;
        let status = resp.status().as_u16();
        let retry_after_secs = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp
            .text()
            .await
            .map_err(|e| IngestError::Network(format!("reading body: {e}")))?;

        Ok(RawResponse {
            status_code: status,
            body,
            received_at: Utc::now(),
            provider_id: req.provider_id.clone(),
            retry_after_secs,
        })
    }
}
