//! In-memory owner of the novel aggregate with a read-through cache and JSON
//! file snapshots.
//!
//! File failures never escape this module: loads degrade to `None`, saves to
//! `false`, and both leave a diagnostic in the log.

pub mod cache;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::Level;
use serde_json::{Map, Value};

use crate::logging::log_event;
use crate::novel::{chapter_key, NovelData};

use cache::Cache;

const NOVEL_CACHE_KEY: &str = "novel_data_full";

#[derive(Debug, Clone)]
enum Cached {
    Novel(Box<NovelData>),
    Chapter(String),
}

fn chapter_cache_key(key: &str) -> String {
    format!("chapter_content_{key}")
}

#[derive(Debug)]
pub struct NovelDataStore {
    data: NovelData,
    cache: Option<Cache<Cached>>,
    modified: bool,
    current_file: Option<PathBuf>,
}

impl Default for NovelDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NovelDataStore {
    pub fn new() -> Self {
        Self::with_cache(true)
    }

    pub fn with_cache(enabled: bool) -> Self {
        Self {
            data: NovelData::default(),
            cache: enabled.then(Cache::default),
            modified: false,
            current_file: None,
        }
    }

    /// Replace the whole aggregate.
    pub fn set_outline(&mut self, data: NovelData) {
        self.data = data;
        self.mark_modified();
        if let Some(cache) = self.cache.as_mut() {
            cache.delete(NOVEL_CACHE_KEY);
        }
    }

    /// Read the whole aggregate, served from cache when warm.
    pub fn get_outline(&mut self) -> NovelData {
        let Some(cache) = self.cache.as_mut() else {
            return self.data.clone();
        };
        if let Some(Cached::Novel(novel)) = cache.get(NOVEL_CACHE_KEY) {
            return *novel;
        }
        let snapshot = self.data.clone();
        cache.set(NOVEL_CACHE_KEY, Cached::Novel(Box::new(snapshot.clone())), None);
        snapshot
    }

    pub fn set_chapter_content(
        &mut self,
        volume_index: usize,
        chapter_index: usize,
        content: impl Into<String>,
    ) {
        let key = chapter_key(volume_index, chapter_index);
        self.data.chapters.insert(key.clone(), content.into());
        self.mark_modified();
        if let Some(cache) = self.cache.as_mut() {
            cache.delete(&chapter_cache_key(&key));
            // the full snapshot embeds chapter bodies too
            cache.delete(NOVEL_CACHE_KEY);
        }
    }

    pub fn get_chapter_content(&mut self, volume_index: usize, chapter_index: usize) -> Option<String> {
        let key = chapter_key(volume_index, chapter_index);
        let Some(cache) = self.cache.as_mut() else {
            return self.data.chapters.get(&key).cloned();
        };
        let cache_key = chapter_cache_key(&key);
        if let Some(Cached::Chapter(content)) = cache.get(&cache_key) {
            return Some(content);
        }
        let content = self.data.chapters.get(&key).cloned()?;
        cache.set(cache_key, Cached::Chapter(content.clone()), None);
        Some(content)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.data.metadata.insert(key.into(), value);
        self.mark_modified();
        self.invalidate_snapshot();
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.data.metadata.get(key)
    }

    pub fn set_relationships(&mut self, relationships: Map<String, Value>) {
        self.data.relationships = relationships;
        self.mark_modified();
        self.invalidate_snapshot();
    }

    pub fn get_relationships(&self) -> Map<String, Value> {
        self.data.relationships.clone()
    }

    pub fn get_chapter_summary(&self, volume_index: usize, chapter_index: usize) -> Option<&str> {
        self.data
            .chapter(volume_index, chapter_index)
            .map(|c| c.summary.as_str())
    }

    /// Rough size of the planned novel: `words_per_chapter` per outlined
    /// chapter, or the summary length when no target is set.
    pub fn total_word_count_estimate(&self) -> usize {
        let per_chapter = self.data.words_per_chapter as usize;
        self.data
            .volumes
            .iter()
            .flat_map(|v| v.chapters.iter())
            .map(|c| {
                if per_chapter > 0 {
                    per_chapter
                } else {
                    c.summary.split_whitespace().count()
                }
            })
            .sum()
    }

    /// Write an arbitrary snapshot. The dirty flag is left alone because the
    /// snapshot need not be this store's aggregate.
    pub fn save_project(&self, data: &NovelData, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match write_snapshot(data, path) {
            Ok(_) => true,
            Err(err) => {
                report_failure("NOV-2002", "project save failed", path, &err);
                false
            }
        }
    }

    /// Write the store's own aggregate and clear the dirty flag on success.
    pub fn save(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match write_snapshot(&self.data, path) {
            Ok(abs) => {
                self.modified = false;
                self.current_file = Some(abs);
                true
            }
            Err(err) => {
                report_failure("NOV-2002", "project save failed", path, &err);
                false
            }
        }
    }

    /// Merge a project file over the current aggregate.
    ///
    /// Keys present in the file replace the current values, missing keys keep
    /// them, unknown keys are carried along.
    pub fn load_project(&mut self, path: impl AsRef<Path>) -> Option<NovelData> {
        let path = path.as_ref();
        match self.merge_from_file(path) {
            Ok((merged, abs)) => {
                self.data = merged;
                self.modified = false;
                self.current_file = Some(abs);
                if let Some(cache) = self.cache.as_mut() {
                    cache.clear();
                    cache.set(NOVEL_CACHE_KEY, Cached::Novel(Box::new(self.data.clone())), None);
                }
                Some(self.data.clone())
            }
            Err(err) => {
                report_failure("NOV-2001", "project load failed", path, &err);
                None
            }
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.current_file.as_deref()
    }

    /// Reset to an empty aggregate.
    pub fn clear_data(&mut self) {
        self.data = NovelData::default();
        self.modified = false;
        self.current_file = None;
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    fn invalidate_snapshot(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.delete(NOVEL_CACHE_KEY);
        }
    }

    fn merge_from_file(&self, path: &Path) -> Result<(NovelData, PathBuf)> {
        let abs = absolute(path)?;
        let raw = fs::read_to_string(&abs)
            .with_context(|| format!("failed to read {}", abs.display()))?;
        let loaded: Value = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", abs.display()))?;
        let Value::Object(loaded) = loaded else {
            return Err(anyhow!("{} does not hold a JSON object", abs.display()));
        };
        let Value::Object(mut current) = serde_json::to_value(&self.data)? else {
            return Err(anyhow!("novel aggregate did not serialise to an object"));
        };
        for (key, value) in loaded {
            current.insert(key, value);
        }
        let merged = serde_json::from_value(Value::Object(current))
            .with_context(|| format!("{} does not match the novel schema", abs.display()))?;
        Ok((merged, abs))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("failed to resolve working directory")?
            .join(path))
    }
}

fn write_snapshot(data: &NovelData, path: &Path) -> Result<PathBuf> {
    let abs = absolute(path)?;
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(data)?;
    fs::write(&abs, body).with_context(|| format!("failed to write {}", abs.display()))?;
    Ok(abs)
}

fn report_failure(code: &str, message: &str, path: &Path, err: &anyhow::Error) {
    log_event(
        Level::Error,
        Some(code),
        "novelgen::store",
        message,
        Some("the project file could not be processed"),
        Some(serde_json::json!({
            "path": path.display().to_string(),
            "error": format!("{err:#}"),
        })),
    );
}
