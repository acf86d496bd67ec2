//! Named prompt templates loaded from a JSON file.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use log::Level;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::errors::{NovelGenError, Result};
use crate::logging::log_event;

fn default_category() -> String {
    "general".to_string()
}

fn now_seconds() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "now_seconds")]
    pub created_at: f64,
}

impl PromptTemplate {
    pub fn new(
        name: impl Into<String>,
        content: impl Into<String>,
        category: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            category: category.into(),
            description: description.into(),
            created_at: now_seconds(),
        }
    }
}

/// Partial update applied by [`TemplateRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct TemplateUpdate {
    pub content: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, PromptTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load templates from a JSON array or a JSON object keyed by name.
    ///
    /// A missing file yields an empty registry. Unreadable files and entries
    /// that are not objects are logged and skipped.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut registry = Self::new();
        if !path.exists() {
            return registry;
        }
        let parsed = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))
            .and_then(|raw| {
                serde_json::from_str::<Value>(&raw)
                    .with_context(|| format!("{} is not valid JSON", path.display()))
            });
        let records: Vec<(Option<String>, Value)> = match parsed {
            Ok(Value::Array(items)) => items.into_iter().map(|v| (None, v)).collect(),
            Ok(Value::Object(map)) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            Ok(_) => {
                warn_load(path, &anyhow!("expected a JSON array or object"));
                return registry;
            }
            Err(err) => {
                warn_load(path, &err);
                return registry;
            }
        };
        for (key, record) in records {
            let Value::Object(mut fields) = record else {
                warn_load(path, &anyhow!("skipping template entry that is not an object"));
                continue;
            };
            if let Some(key) = key {
                fields.entry("name").or_insert(Value::String(key));
            }
            match serde_json::from_value::<PromptTemplate>(Value::Object(fields)) {
                Ok(template) => {
                    registry.templates.insert(template.name.clone(), template);
                }
                Err(err) => warn_load(path, &anyhow!(err)),
            }
        }
        registry
    }

    /// Write all templates as a JSON array, sorted by name.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| NovelGenError::Persistence(e.to_string()))?;
        }
        let body = serde_json::to_string_pretty(&self.all())
            .map_err(|e| NovelGenError::Persistence(e.to_string()))?;
        fs::write(path, body).map_err(|e| NovelGenError::Persistence(e.to_string()))
    }

    /// Returns false when a template with the same name already exists.
    pub fn add(&mut self, template: PromptTemplate) -> bool {
        if self.templates.contains_key(&template.name) {
            return false;
        }
        self.templates.insert(template.name.clone(), template);
        true
    }

    /// Returns true when at least one field changed.
    pub fn update(&mut self, name: &str, update: TemplateUpdate) -> bool {
        let Some(template) = self.templates.get_mut(name) else {
            return false;
        };
        let mut changed = false;
        if let Some(content) = update.content {
            template.content = content;
            changed = true;
        }
        if let Some(category) = update.category {
            template.category = category;
            changed = true;
        }
        if let Some(description) = update.description {
            template.description = description;
            changed = true;
        }
        changed
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.templates.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates.get(name)
    }

    pub fn by_category(&self, category: &str) -> Vec<&PromptTemplate> {
        let mut found: Vec<_> = self
            .templates
            .values()
            .filter(|t| t.category == category)
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub fn all(&self) -> Vec<&PromptTemplate> {
        let mut all: Vec<_> = self.templates.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Substitute `{key}` placeholders. A missing argument leaves the template
    /// content unformatted.
    pub fn format(&self, name: &str, args: &BTreeMap<&str, String>) -> Option<String> {
        let template = self.get(name)?;
        match substitute(&template.content, args) {
            Ok(text) => Some(text),
            Err(missing) => {
                log_event(
                    Level::Warn,
                    Some("PRM-1001"),
                    "novelgen::prompts",
                    "template argument missing",
                    Some("returning the template content unformatted"),
                    Some(serde_json::json!({ "template": name, "missing": missing })),
                );
                Some(template.content.clone())
            }
        }
    }
}

/// Replace `{key}` with `args[key]`; `{{` and `}}` are literal braces.
/// Returns the first missing key on failure.
fn substitute(content: &str, args: &BTreeMap<&str, String>) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    key.push(c);
                }
                if !closed {
                    return Err(key);
                }
                match args.get(key.trim()) {
                    Some(value) => out.push_str(value),
                    None => return Err(key),
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn warn_load(path: &Path, err: &anyhow::Error) {
    log_event(
        Level::Warn,
        Some("PRM-1002"),
        "novelgen::prompts",
        "template file could not be fully loaded",
        None,
        Some(serde_json::json!({
            "path": path.display().to_string(),
            "error": format!("{err:#}"),
        })),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn missing_file_is_an_empty_registry() {
        let dir = tempdir().unwrap();
        assert!(TemplateRegistry::load(dir.path().join("none.json")).is_empty());
    }

    #[test]
    fn loads_array_and_object_layouts() {
        let dir = tempdir().unwrap();
        let list = dir.path().join("list.json");
        fs::write(
            &list,
            r#"[{"name": "a", "content": "x", "category": "chapter"}, "junk", {"name": "b", "content": "y"}]"#,
        )
        .unwrap();
        let registry = TemplateRegistry::load(&list);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("b").unwrap().category, "general");
        assert_eq!(registry.by_category("chapter").len(), 1);

        let object = dir.path().join("object.json");
        fs::write(&object, r#"{"keyed": {"content": "z", "created_at": 12.5}}"#).unwrap();
        let registry = TemplateRegistry::load(&object);
        let keyed = registry.get("keyed").unwrap();
        assert_eq!(keyed.content, "z");
        assert_eq!(keyed.created_at, 12.5);
    }

    #[test]
    fn malformed_file_is_empty_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "[{").unwrap();
        assert!(TemplateRegistry::load(&path).is_empty());
    }

    #[test]
    fn add_update_delete() {
        let mut registry = TemplateRegistry::new();
        assert!(registry.add(PromptTemplate::new("t", "hello {name}", "general", "")));
        assert!(!registry.add(PromptTemplate::new("t", "dup", "general", "")));
        assert!(registry.update(
            "t",
            TemplateUpdate {
                description: Some("greeting".into()),
                ..Default::default()
            }
        ));
        assert!(!registry.update("t", TemplateUpdate::default()));
        assert!(!registry.update("nope", TemplateUpdate::default()));
        assert_eq!(registry.get("t").unwrap().description, "greeting");
        assert!(registry.delete("t"));
        assert!(!registry.delete("t"));
    }

    #[test]
    fn format_substitutes_and_falls_back_on_missing_args() {
        let mut registry = TemplateRegistry::new();
        registry.add(PromptTemplate::new("t", "《{title}》{{注}}：{summary}", "chapter", ""));
        let full = registry.format("t", &args(&[("title", "长夜"), ("summary", "出发")]));
        assert_eq!(full.as_deref(), Some("《长夜》{注}：出发"));
        let partial = registry.format("t", &args(&[("title", "长夜")]));
        assert_eq!(partial.as_deref(), Some("《{title}》{{注}}：{summary}"));
        assert_eq!(registry.format("missing", &args(&[])), None);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("templates.json");
        let mut registry = TemplateRegistry::new();
        registry.add(PromptTemplate::new("b", "2", "general", ""));
        registry.add(PromptTemplate::new("a", "1", "outline", "first"));
        registry.save(&path).unwrap();
        let reloaded = TemplateRegistry::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("a"), registry.get("a"));
    }
}
