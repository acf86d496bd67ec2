//! Generation orchestrator that owns the active provider adapter, the prompt
//! assembler and the project store.
//!
//! Callers select a provider once, then ask for outlines or chapters without
//! caring which backend fulfils them. A failed selection never disturbs the
//! adapter that was already active.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use log::Level;
use serde_json::{Map, Value};

use crate::agents::config::{ConfigResolver, InstanceConfig};
use crate::agents::orchestrator::{build_adapter, ProviderAdapter};
use crate::agents::providers::{find_seed, CUSTOM_OPENAI};
use crate::agents::FragmentStream;
use crate::errors::{NovelGenError, Result};
use crate::logging::{log_event, preview};
use crate::novel::{NovelData, Outline};
use crate::prompts::outline::{merge_outline, parse_outline_reply, OutlineRequest};
use crate::prompts::templates::TemplateRegistry;
use crate::prompts::PromptAssembler;
use crate::store::NovelDataStore;

/// Called once per streamed fragment, in order.
pub type FragmentObserver = Box<dyn FnMut(&str) + Send>;

pub struct ModelManager {
    resolver: Arc<ConfigResolver>,
    prompts: PromptAssembler,
    store: NovelDataStore,
    active: Option<Arc<dyn ProviderAdapter>>,
}

impl ModelManager {
    /// Build a manager and try to activate `general.default_model_name`.
    /// A failing default is logged and leaves the manager unconfigured.
    pub fn new(resolver: Arc<ConfigResolver>) -> Self {
        let templates = resolver
            .prompts_path()
            .map(TemplateRegistry::load)
            .unwrap_or_default();
        let mut manager = Self::with_prompts(resolver, PromptAssembler::new(templates));
        manager.initialize_default_model();
        manager
    }

    /// Build an unconfigured manager around an existing assembler.
    pub fn with_prompts(resolver: Arc<ConfigResolver>, prompts: PromptAssembler) -> Self {
        Self {
            resolver,
            prompts,
            store: NovelDataStore::new(),
            active: None,
        }
    }

    fn initialize_default_model(&mut self) {
        let Some(default) = self.resolver.default_provider() else {
            return;
        };
        if let Err(err) = self.select_model(&default, None, None, Map::new()) {
            log_event(
                Level::Warn,
                Some(err.code()),
                "novelgen::ai",
                "default provider could not be initialised",
                Some("select a provider explicitly before generating"),
                Some(serde_json::json!({ "provider": default, "error": err.to_string() })),
            );
        }
    }

    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.resolver
    }

    pub fn prompts(&self) -> &PromptAssembler {
        &self.prompts
    }

    pub fn prompts_mut(&mut self) -> &mut PromptAssembler {
        &mut self.prompts
    }

    pub fn store(&self) -> &NovelDataStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut NovelDataStore {
        &mut self.store
    }

    /// Activate a built-in provider, or a custom profile of that name.
    ///
    /// Explicit arguments win over profile values, which win over the
    /// resolver. On failure the previously active adapter stays in place.
    pub fn select_model(
        &mut self,
        name: &str,
        api_key: Option<&str>,
        endpoint: Option<&str>,
        options: Map<String, Value>,
    ) -> Result<()> {
        let instance = InstanceConfig {
            name: None,
            api_key: api_key.map(str::to_string),
            model_name: options
                .get("model_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            endpoint: endpoint.map(str::to_string),
            options,
        };

        let built = if find_seed(name).is_some() {
            build_adapter(name, &instance, &self.resolver)
        } else if let Some(profile) = self.resolver.custom_profile(name) {
            build_adapter(CUSTOM_OPENAI, &instance.or_profile(&profile), &self.resolver)
        } else {
            Err(NovelGenError::UnsupportedProvider(name.to_string()))
        };

        match built {
            Ok(adapter) => {
                self.active = Some(adapter);
                Ok(())
            }
            Err(err) => {
                log_event(
                    Level::Warn,
                    Some(err.code()),
                    "novelgen::ai",
                    "provider selection failed",
                    Some(err.explain()),
                    Some(serde_json::json!({ "provider": name, "error": err.to_string() })),
                );
                Err(err)
            }
        }
    }

    /// Install an already-built adapter.
    pub fn set_adapter(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.active = Some(adapter);
    }

    pub fn active_adapter(&self) -> Option<Arc<dyn ProviderAdapter>> {
        self.active.clone()
    }

    pub fn active_provider(&self) -> Option<&str> {
        self.active.as_deref().map(|adapter| adapter.provider_id())
    }

    pub fn is_ready(&self) -> bool {
        self.active.is_some()
    }

    fn adapter(&self) -> Result<Arc<dyn ProviderAdapter>> {
        self.active.clone().ok_or(NovelGenError::NoActiveProvider)
    }

    async fn complete(&self, adapter: &dyn ProviderAdapter, prompt: &str) -> Result<String> {
        match adapter.generate(prompt).await {
            Ok(text) => {
                log_invocation_success(adapter, &text);
                Ok(text)
            }
            Err(err) => {
                log_invocation_failure(adapter, &err);
                Err(err)
            }
        }
    }

    /// Generate an outline and merge it into the request's existing outline.
    pub async fn generate_outline(&self, request: &OutlineRequest) -> Result<Outline> {
        let adapter = self.adapter()?;
        if let (Some(existing), Some(range)) = (&request.existing_outline, request.range) {
            range.check_against(existing)?;
        }
        let prompt = self.prompts.outline_prompt(request);
        let reply = self.complete(adapter.as_ref(), &prompt).await?;
        let generated = parse_outline_reply(adapter.provider_id(), &reply)?;
        Ok(match &request.existing_outline {
            Some(existing) => merge_outline(existing, generated, request.range),
            None => generated,
        })
    }

    pub async fn optimize_outline(&self, current: &Outline) -> Result<Outline> {
        let adapter = self.adapter()?;
        let prompt = self.prompts.optimize_prompt(current);
        let reply = self.complete(adapter.as_ref(), &prompt).await?;
        parse_outline_reply(adapter.provider_id(), &reply)
    }

    pub async fn generate_chapter(
        &self,
        novel: &NovelData,
        volume_index: usize,
        chapter_index: usize,
    ) -> Result<String> {
        let adapter = self.adapter()?;
        let prompt = self.prompts.chapter_prompt(novel, volume_index, chapter_index)?;
        self.complete(adapter.as_ref(), &prompt).await
    }

    /// Stream a chapter. The observer sees each fragment before the caller
    /// does; if it panics it is dropped and the stream carries on.
    pub async fn generate_chapter_stream(
        &self,
        novel: &NovelData,
        volume_index: usize,
        chapter_index: usize,
        observer: Option<FragmentObserver>,
    ) -> Result<FragmentStream> {
        let adapter = self.adapter()?;
        let prompt = self.prompts.chapter_prompt(novel, volume_index, chapter_index)?;
        let stream = adapter.generate_stream(&prompt).await.map_err(|err| {
            log_invocation_failure(adapter.as_ref(), &err);
            err
        })?;
        let Some(observer) = observer else {
            return Ok(stream);
        };
        Ok(observe(stream, adapter.provider_id().to_string(), observer))
    }

    /// Load a project into the owned store.
    pub fn load_novel_data(&mut self, path: impl AsRef<Path>) -> Option<NovelData> {
        self.store.load_project(path)
    }

    pub fn save_novel_data(&self, novel: &NovelData, path: impl AsRef<Path>) -> bool {
        self.store.save_project(novel, path)
    }
}

fn observe(stream: FragmentStream, provider: String, observer: FragmentObserver) -> FragmentStream {
    let mut observer = Some(observer);
    stream
        .map(move |item| {
            let panicked = match (&item, observer.as_mut()) {
                (Ok(text), Some(callback)) => {
                    catch_unwind(AssertUnwindSafe(|| callback(text.as_str()))).is_err()
                }
                _ => false,
            };
            if panicked {
                log_event(
                    Level::Error,
                    Some("AI-2004"),
                    "novelgen::ai",
                    "fragment observer panicked",
                    Some("the observer was disabled; the stream continues"),
                    Some(serde_json::json!({ "provider": provider })),
                );
                observer = None;
            }
            item
        })
        .boxed()
}

fn log_invocation_success(adapter: &dyn ProviderAdapter, text: &str) {
    log_event(
        Level::Info,
        Some("AI-0200"),
        "novelgen::ai",
        "generation succeeded",
        None,
        Some(serde_json::json!({
            "provider": adapter.provider_id(),
            "model": adapter.config().model_name,
            "preview": preview(text, 200),
        })),
    );
}

fn log_invocation_failure(adapter: &dyn ProviderAdapter, err: &NovelGenError) {
    log_event(
        Level::Warn,
        Some(err.code()),
        "novelgen::ai",
        "generation failed",
        Some(err.explain()),
        Some(serde_json::json!({
            "provider": adapter.provider_id(),
            "model": adapter.config().model_name,
            "status": err.status(),
            "error": err.to_string(),
        })),
    );
}
