//! Built-in provider catalogue.

use super::wire::WireFormat;

/// How an adapter talks to its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Async `reqwest::Client` owned by the adapter.
    Http,
    /// One-shot calls on a synchronous client driven from the blocking pool;
    /// streams still read through the async client.
    Blocking,
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderSeed {
    pub id: &'static str,
    pub display: &'static str,
    pub wire: WireFormat,
    pub transport: Transport,
    pub default_endpoint: Option<&'static str>,
    pub default_model: Option<&'static str>,
    pub requires_api_key: bool,
    pub reasoning_trace: bool,
}

pub const CUSTOM_OPENAI: &str = "custom_openai";

pub const PROVIDER_SEEDS: &[ProviderSeed] = &[
    ProviderSeed {
        id: "gpt",
        display: "OpenAI GPT",
        wire: WireFormat::OpenAi { strict_prefix: true },
        transport: Transport::Http,
        default_endpoint: Some("https://api.openai.com/v1/chat/completions"),
        default_model: Some("gpt-4-turbo"),
        requires_api_key: true,
        reasoning_trace: false,
    },
    ProviderSeed {
        id: "claude",
        display: "Anthropic Claude",
        wire: WireFormat::Anthropic,
        transport: Transport::Http,
        default_endpoint: Some("https://api.anthropic.com/v1/messages"),
        default_model: Some("claude-3-opus-20240229"),
        requires_api_key: true,
        reasoning_trace: false,
    },
    ProviderSeed {
        id: "gemini",
        display: "Google Gemini",
        wire: WireFormat::Gemini,
        transport: Transport::Blocking,
        default_endpoint: Some("https://generativelanguage.googleapis.com/v1beta"),
        default_model: Some("gemini-1.5-flash"),
        requires_api_key: true,
        reasoning_trace: false,
    },
    ProviderSeed {
        id: CUSTOM_OPENAI,
        display: "自定义OpenAI模型",
        wire: WireFormat::OpenAi { strict_prefix: false },
        transport: Transport::Http,
        default_endpoint: None,
        default_model: None,
        requires_api_key: true,
        reasoning_trace: false,
    },
    ProviderSeed {
        id: "modelscope",
        display: "ModelScope",
        wire: WireFormat::OpenAi { strict_prefix: true },
        transport: Transport::Http,
        default_endpoint: Some("https://api-inference.modelscope.cn/v1/chat/completions"),
        default_model: Some("deepseek-ai/DeepSeek-R1"),
        requires_api_key: true,
        reasoning_trace: true,
    },
    ProviderSeed {
        id: "ollama",
        display: "Ollama",
        wire: WireFormat::Ollama,
        transport: Transport::Http,
        default_endpoint: Some("http://localhost:11434/api/chat"),
        default_model: Some("llama3"),
        requires_api_key: false,
        reasoning_trace: false,
    },
    ProviderSeed {
        id: "siliconflow",
        display: "SiliconFlow",
        wire: WireFormat::OpenAi { strict_prefix: true },
        transport: Transport::Http,
        default_endpoint: Some("https://api.siliconflow.cn/v1/chat/completions"),
        default_model: Some("deepseek-ai/DeepSeek-V2"),
        requires_api_key: true,
        reasoning_trace: false,
    },
];

/// Case-insensitive lookup by provider id.
pub fn find_seed(id: &str) -> Option<&'static ProviderSeed> {
    PROVIDER_SEEDS
        .iter()
        .find(|seed| seed.id.eq_ignore_ascii_case(id.trim()))
}

pub fn provider_ids() -> impl Iterator<Item = &'static str> {
    PROVIDER_SEEDS.iter().map(|seed| seed.id)
}
