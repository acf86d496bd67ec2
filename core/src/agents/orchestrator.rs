use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;

use super::config::{resolve_provider_config, ConfigResolver, InstanceConfig, ProviderConfig, ProxySettings};
use super::providers::{find_seed, ProviderSeed, Transport};
use super::sdk::GeminiAdapter;
use super::wire::{decode_stream, WireFormat};
use super::FragmentStream;
use crate::errors::{NovelGenError, Result};
use crate::logging::preview;

pub const USER_AGENT: &str = "novelgen-core/0.1";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(300);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One backend behind a uniform generate/stream surface.
///
/// Adapters are immutable once built and shared as `Arc`, so a stream keeps
/// working after the caller switches to another adapter.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    fn provider_id(&self) -> &str {
        &self.config().provider_id
    }

    /// Whether the backend can stream a reasoning trace ahead of the answer.
    /// The trace is part of the stream by default; the `include_reasoning`
    /// option turns it off.
    fn supports_reasoning_trace(&self) -> bool {
        false
    }

    async fn generate(&self, prompt: &str) -> Result<String>;

    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream>;
}

/// Reasoning deltas are streamed whenever the backend has them, unless the
/// caller sets `include_reasoning` to false.
pub(crate) fn wants_reasoning(adapter_supports: bool, config: &ProviderConfig) -> bool {
    adapter_supports && config.option_flag("include_reasoning", true)
}

pub(crate) fn shape_error(provider: &str, status: u16, body: &Value) -> NovelGenError {
    NovelGenError::provider(
        provider,
        Some(status),
        format!("unexpected response shape: {}", preview(&body.to_string(), 500)),
    )
}

pub struct HttpAdapter {
    config: ProviderConfig,
    wire: WireFormat,
    reasoning_trace: bool,
    client: Client,
}

impl HttpAdapter {
    pub fn new(seed: &ProviderSeed, config: ProviderConfig, proxy: Option<&ProxySettings>) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT);
        // the resolver is the only proxy source; environment proxies are ignored
        builder = match proxy {
            Some(proxy) => builder.proxy(
                reqwest::Proxy::all(proxy.url())
                    .map_err(|e| NovelGenError::Configuration(format!("invalid proxy: {e}")))?,
            ),
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| NovelGenError::Configuration(format!("failed to construct HTTP client: {e}")))?;
        Ok(Self {
            config,
            wire: seed.wire,
            reasoning_trace: seed.reasoning_trace,
            client,
        })
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<Response> {
        let provider = self.config.provider_id.as_str();
        let mut request = self
            .client
            .post(self.wire.url(&self.config, stream))
            .timeout(if stream { STREAM_TIMEOUT } else { REQUEST_TIMEOUT })
            .json(&self.wire.body(&self.config, prompt, stream));
        for (name, value) in self.wire.headers(&self.config) {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| NovelGenError::transport(provider, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NovelGenError::provider(provider, Some(status.as_u16()), body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn supports_reasoning_trace(&self) -> bool {
        self.reasoning_trace
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let provider = self.provider_id();
        let response = self.send(prompt, false).await?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| NovelGenError::provider(provider, Some(status), format!("invalid JSON body: {e}")))?;
        self.wire
            .extract_text(&body)
            .ok_or_else(|| shape_error(provider, status, &body))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream> {
        let response = self.send(prompt, true).await?;
        Ok(decode_stream(
            self.provider_id(),
            self.wire,
            wants_reasoning(self.reasoning_trace, &self.config),
            response.bytes_stream(),
        ))
    }
}

/// Build the adapter for a built-in provider id.
pub fn build_adapter(
    provider: &str,
    instance: &InstanceConfig,
    resolver: &ConfigResolver,
) -> Result<Arc<dyn ProviderAdapter>> {
    let seed = find_seed(provider)
        .ok_or_else(|| NovelGenError::UnsupportedProvider(provider.to_string()))?;
    let config = resolve_provider_config(seed, instance, resolver)?;
    let proxy = resolver.proxy();
    let adapter: Arc<dyn ProviderAdapter> = match seed.transport {
        Transport::Http => Arc::new(HttpAdapter::new(seed, config, proxy.as_ref())?),
        Transport::Blocking => Arc::new(GeminiAdapter::new(seed, config, proxy)?),
    };
    log::info!(
        target: "novelgen::ai",
        "adapter ready: {} ({})",
        adapter.provider_id(),
        adapter.config().model_name
    );
    Ok(adapter)
}
