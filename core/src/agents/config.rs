use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::Level;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::providers::{ProviderSeed, CUSTOM_OPENAI};
use crate::errors::{NovelGenError, Result};
use crate::logging::log_event;

const API_KEYS: &str = "api_keys";
const MODELS: &str = "models";
const GENERAL: &str = "general";
const PROXY: &str = "proxy";
const CUSTOM_MODELS: &str = "custom_openai_models";

const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
const DEFAULT_PROXY_PORT: u16 = 10808;

/// Read-only view over the sectioned configuration document.
///
/// Section and key names are matched case-insensitively. Values are kept as
/// JSON; scalar lookups stringify numbers and booleans.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    root: Map<String, Value>,
    source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
}

impl ProxySettings {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// One named OpenAI-compatible deployment from `custom_openai_models`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomProfile {
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default, alias = "api_url", alias = "base_url")]
    pub endpoint: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lowercase_keys(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect()
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON document of sections. A missing file is an empty
    /// configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!(target: "novelgen::config", "no configuration at {}", path.display());
            return Ok(Self {
                source: Some(path.to_path_buf()),
                ..Self::default()
            });
        }
        let raw = fs::read_to_string(path).map_err(|e| {
            NovelGenError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            NovelGenError::Configuration(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        let mut resolver = Self::from_value(value)?;
        resolver.source = Some(path.to_path_buf());
        Ok(resolver)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(root) = value else {
            return Err(NovelGenError::Configuration(
                "configuration root must be a JSON object".into(),
            ));
        };
        let root = root
            .into_iter()
            .map(|(section, body)| {
                let body = match body {
                    Value::Object(map) => Value::Object(lowercase_keys(map)),
                    other => other,
                };
                (section.to_lowercase(), body)
            })
            .collect();
        Ok(Self { root, source: None })
    }

    /// Builder used before the resolver is shared.
    pub fn with_value(mut self, section: &str, key: &str, value: impl Into<Value>) -> Self {
        let entry = self
            .root
            .entry(section.to_lowercase())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_lowercase(), value.into());
        }
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.root.contains_key(&section.to_lowercase())
    }

    pub fn get_value(&self, section: &str, key: &str) -> Option<&Value> {
        self.root
            .get(&section.to_lowercase())?
            .as_object()?
            .get(&key.to_lowercase())
    }

    /// Scalar value as text; empty strings count as unset.
    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.get_value(section, key).and_then(scalar_text)
    }

    pub fn api_key(&self, provider: &str) -> Option<String> {
        self.get(API_KEYS, &format!("{provider}_api_key"))
    }

    pub fn model_name(&self, provider: &str) -> Option<String> {
        self.get(MODELS, &format!("{provider}_model"))
    }

    pub fn default_provider(&self) -> Option<String> {
        self.get(GENERAL, "default_model_name")
    }

    pub fn prompts_path(&self) -> Option<PathBuf> {
        self.get(GENERAL, "prompts_path").map(PathBuf::from)
    }

    /// `None` when the section is absent or disabled.
    pub fn proxy(&self) -> Option<ProxySettings> {
        if !self.has_section(PROXY) {
            return None;
        }
        let enabled = self
            .get_value(PROXY, "enabled")
            .and_then(parse_flag)
            .unwrap_or(true);
        if !enabled {
            return None;
        }
        let host = self
            .get(PROXY, "host")
            .unwrap_or_else(|| DEFAULT_PROXY_HOST.to_string());
        let port = self
            .get(PROXY, "port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PROXY_PORT);
        Some(ProxySettings { host, port })
    }

    /// Profiles stored either as an array or as `{ "models": [...] }`, where
    /// the inner list may also be a JSON-encoded string.
    pub fn custom_profiles(&self) -> Vec<CustomProfile> {
        let Some(section) = self.root.get(CUSTOM_MODELS) else {
            return Vec::new();
        };
        let list = match section {
            Value::Array(items) => items.clone(),
            Value::Object(map) => match map.get("models") {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::String(encoded)) => match serde_json::from_str::<Vec<Value>>(encoded) {
                    Ok(items) => items,
                    Err(err) => {
                        warn_profiles(&format!("models is not a JSON list: {err}"));
                        return Vec::new();
                    }
                },
                _ => return Vec::new(),
            },
            _ => return Vec::new(),
        };
        list.into_iter()
            .filter_map(|item| match serde_json::from_value::<CustomProfile>(item) {
                Ok(profile) => Some(profile),
                Err(err) => {
                    warn_profiles(&format!("skipping malformed profile: {err}"));
                    None
                }
            })
            .collect()
    }

    pub fn custom_profile(&self, name: &str) -> Option<CustomProfile> {
        self.custom_profiles()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }
}

fn warn_profiles(detail: &str) {
    log_event(
        Level::Warn,
        Some("CFG-1002"),
        "novelgen::config",
        "custom model profiles could not be read",
        Some(detail),
        None,
    );
}

/// Per-call configuration fragment; wins over everything the resolver holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceConfig {
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub model_name: Option<String>,
    pub endpoint: Option<String>,
    pub options: Map<String, Value>,
}

impl InstanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model_name(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Fill unset fields from a custom profile.
    pub fn or_profile(mut self, profile: &CustomProfile) -> Self {
        self.name = self.name.or_else(|| Some(profile.name.clone()));
        self.api_key = self.api_key.or_else(|| profile.api_key.clone());
        self.model_name = self.model_name.or_else(|| profile.model_name.clone());
        self.endpoint = self.endpoint.or_else(|| profile.endpoint.clone());
        for (key, value) in &profile.extra {
            self.options.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }
}

/// Fully resolved connection parameters of one adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub name: String,
    pub api_key: Option<String>,
    pub model_name: String,
    pub endpoint_url: String,
    pub options: Map<String, Value>,
}

impl ProviderConfig {
    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(Value::as_f64)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }

    /// Boolean option; `default` when unset or unreadable.
    pub fn option_flag(&self, key: &str, default: bool) -> bool {
        self.options.get(key).and_then(parse_flag).unwrap_or(default)
    }
}

fn filled(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// First non-empty value of: the per-call fragment, then each resolver
/// lookup in order, then the built-in default.
pub fn resolve_setting<I>(instance: Option<&str>, resolver_tiers: I, default: Option<&str>) -> Option<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    filled(instance)
        .or_else(|| {
            resolver_tiers
                .into_iter()
                .find_map(|tier| filled(tier.as_deref()))
        })
        .or_else(|| filled(default))
}

/// Resolve every parameter an adapter needs, or fail naming what is missing.
pub fn resolve_provider_config(
    seed: &ProviderSeed,
    instance: &InstanceConfig,
    resolver: &ConfigResolver,
) -> Result<ProviderConfig> {
    let generic = seed.id == CUSTOM_OPENAI;
    let name = resolve_setting(
        instance.name.as_deref(),
        [generic
            .then(|| resolver.get(seed.id, "default_name"))
            .flatten()],
        Some(seed.display),
    )
    .unwrap_or_else(|| seed.id.to_string());

    // custom deployments are keyed by profile name first, then generically
    let key_tiers: Vec<&str> = if generic && name != seed.display {
        vec![name.as_str(), seed.id]
    } else {
        vec![seed.id]
    };

    let api_key = resolve_setting(
        instance.api_key.as_deref(),
        key_tiers.iter().map(|k| resolver.api_key(k)),
        None,
    );
    let model_name = resolve_setting(
        instance.model_name.as_deref(),
        key_tiers
            .iter()
            .map(|k| resolver.model_name(k))
            .chain([resolver.get(seed.id, "default_model_name")]),
        seed.default_model,
    );
    let endpoint_url = resolve_setting(
        instance.endpoint.as_deref(),
        key_tiers.iter().flat_map(|section| {
            [resolver.get(section, "api_url"), resolver.get(section, "base_url")]
        }),
        seed.default_endpoint,
    );

    let missing = |what: &str| {
        NovelGenError::Configuration(format!("{what} is not configured for provider {name}"))
    };
    if seed.requires_api_key && api_key.is_none() {
        return Err(missing("API key"));
    }
    let model_name = model_name.ok_or_else(|| missing("model name"))?;
    let endpoint_url = endpoint_url.ok_or_else(|| missing("endpoint URL"))?;

    Ok(ProviderConfig {
        provider_id: seed.id.to_string(),
        name,
        api_key,
        model_name,
        endpoint_url,
        options: instance.options.clone(),
    })
}
