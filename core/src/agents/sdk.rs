//! Gemini adapter.
//!
//! One-shot calls use the synchronous `reqwest::blocking` client on the
//! blocking pool. Streamed bodies are read with the async client, so dropping
//! the stream closes the connection even while the backend is stalled.

use async_trait::async_trait;
use reqwest::blocking::Client;
use serde_json::Value;

use super::config::{ProviderConfig, ProxySettings};
use super::orchestrator::{shape_error, HttpAdapter, ProviderAdapter, CONNECT_TIMEOUT, REQUEST_TIMEOUT, USER_AGENT};
use super::providers::ProviderSeed;
use super::wire::WireFormat;
use super::FragmentStream;
use crate::errors::{NovelGenError, Result};
use crate::workers::run_blocking;

/// Everything a worker needs to issue one blocking request.
#[derive(Debug, Clone)]
struct Call {
    config: ProviderConfig,
    proxy: Option<ProxySettings>,
    prompt: String,
}

impl Call {
    fn client(&self) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT);
        builder = match &self.proxy {
            Some(proxy) => builder.proxy(
                reqwest::Proxy::all(proxy.url())
                    .map_err(|e| NovelGenError::Configuration(format!("invalid proxy: {e}")))?,
            ),
            None => builder.no_proxy(),
        };
        builder
            .build()
            .map_err(|e| NovelGenError::Configuration(format!("failed to construct HTTP client: {e}")))
    }

    // runs on the blocking pool; the blocking client must not be built or
    // dropped on an async worker thread
    fn complete(self) -> Result<String> {
        let provider = self.config.provider_id.as_str();
        let wire = WireFormat::Gemini;
        let mut request = self
            .client()?
            .post(wire.url(&self.config, false))
            .json(&wire.body(&self.config, &self.prompt, false));
        for (name, value) in wire.headers(&self.config) {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .map_err(|e| NovelGenError::transport(provider, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(NovelGenError::provider(provider, Some(status.as_u16()), body));
        }
        let status = status.as_u16();
        let body: Value = response
            .json()
            .map_err(|e| NovelGenError::provider(provider, Some(status), format!("invalid JSON body: {e}")))?;
        wire.extract_text(&body)
            .ok_or_else(|| shape_error(provider, status, &body))
    }
}

pub struct GeminiAdapter {
    streaming: HttpAdapter,
    proxy: Option<ProxySettings>,
}

impl GeminiAdapter {
    pub fn new(seed: &ProviderSeed, config: ProviderConfig, proxy: Option<ProxySettings>) -> Result<Self> {
        Ok(Self {
            streaming: HttpAdapter::new(seed, config, proxy.as_ref())?,
            proxy,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn config(&self) -> &ProviderConfig {
        self.streaming.config()
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let call = Call {
            config: self.config().clone(),
            proxy: self.proxy.clone(),
            prompt: prompt.to_string(),
        };
        run_blocking(self.provider_id(), move || call.complete()).await
    }

    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream> {
        self.streaming.generate_stream(prompt).await
    }
}
