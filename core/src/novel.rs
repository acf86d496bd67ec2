//! Structured representation of a novel project.
//!
//! The aggregate mirrors the on-disk JSON object one to one. Every record type
//! keeps a flattened `extra` map so keys written by newer versions (or by the
//! model itself) survive a load and resave untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Reads an explicit `null` as the field's default. Model replies and older
/// project files write `null` for unset values.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Key under which chapter bodies are stored in [`NovelData::chapters`].
pub fn chapter_key(volume_index: usize, chapter_index: usize) -> String {
    format!("{volume_index},{chapter_index}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub identity: String,
    #[serde(deserialize_with = "null_default")]
    pub personality: String,
    #[serde(deserialize_with = "null_default")]
    pub background: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outline metadata of one chapter; the body text lives in
/// [`NovelData::chapters`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChapterOutline {
    #[serde(deserialize_with = "null_default")]
    pub title: String,
    #[serde(deserialize_with = "null_default")]
    pub summary: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    #[serde(deserialize_with = "null_default")]
    pub title: String,
    #[serde(deserialize_with = "null_default")]
    pub description: String,
    #[serde(deserialize_with = "null_default")]
    pub chapters: Vec<ChapterOutline>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NovelData {
    #[serde(deserialize_with = "null_default")]
    pub title: String,
    #[serde(deserialize_with = "null_default")]
    pub genre: String,
    #[serde(deserialize_with = "null_default")]
    pub theme: String,
    #[serde(deserialize_with = "null_default")]
    pub style: String,
    #[serde(deserialize_with = "null_default")]
    pub synopsis: String,
    #[serde(deserialize_with = "null_default")]
    pub worldbuilding: String,
    #[serde(deserialize_with = "null_default")]
    pub volume_count: u32,
    #[serde(deserialize_with = "null_default")]
    pub chapters_per_volume: u32,
    #[serde(deserialize_with = "null_default")]
    pub words_per_chapter: u32,
    #[serde(deserialize_with = "null_default")]
    pub new_character_count: u32,
    #[serde(deserialize_with = "null_default")]
    pub selected_characters: Vec<Character>,
    #[serde(deserialize_with = "null_default")]
    pub characters: Vec<Character>,
    #[serde(deserialize_with = "null_default")]
    pub volumes: Vec<Volume>,
    #[serde(deserialize_with = "null_default")]
    pub chapters: BTreeMap<String, String>,
    #[serde(deserialize_with = "null_default")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(deserialize_with = "null_default")]
    pub relationships: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NovelData {
    pub fn chapter(&self, volume_index: usize, chapter_index: usize) -> Option<&ChapterOutline> {
        self.volumes
            .get(volume_index)
            .and_then(|v| v.chapters.get(chapter_index))
    }

    /// Copy the structural parts of a generated outline into this aggregate.
    pub fn apply_outline(&mut self, outline: &Outline) {
        if !outline.title.is_empty() {
            self.title = outline.title.clone();
        }
        self.volumes = outline.volumes.clone();
        self.characters = outline.characters.clone();
        self.volume_count = self.volumes.len() as u32;
    }

    /// Extract the outline portion of the aggregate.
    pub fn outline(&self) -> Outline {
        Outline {
            title: self.title.clone(),
            volumes: self.volumes.clone(),
            characters: self.characters.clone(),
            extra: Map::new(),
        }
    }
}

/// Structured plan produced by an outline round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Outline {
    #[serde(deserialize_with = "null_default")]
    pub title: String,
    #[serde(deserialize_with = "null_default")]
    pub volumes: Vec<Volume>,
    #[serde(deserialize_with = "null_default")]
    pub characters: Vec<Character>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Outline {
    pub fn chapter_count(&self) -> usize {
        self.volumes.iter().map(|v| v.chapters.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let raw = serde_json::json!({
            "title": "长夜",
            "schema_hint": {"v": 2},
            "volumes": [{
                "title": "第一卷",
                "mood": "dark",
                "chapters": [{"title": "第一章", "summary": "主角出发", "pov": "林"}]
            }]
        });
        let novel: NovelData = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(novel.extra.get("schema_hint"), Some(&serde_json::json!({"v": 2})));
        assert_eq!(novel.volumes[0].extra.get("mood"), Some(&Value::from("dark")));
        assert_eq!(novel.chapter(0, 0).unwrap().summary, "主角出发");

        let back = serde_json::to_value(&novel).unwrap();
        assert_eq!(back["schema_hint"], raw["schema_hint"]);
        assert_eq!(back["volumes"][0]["chapters"][0]["pov"], "林");
    }

    #[test]
    fn null_fields_read_as_defaults() {
        let raw = serde_json::json!({
            "title": "长夜",
            "synopsis": null,
            "volume_count": null,
            "characters": null,
            "volumes": [{
                "title": "第一卷",
                "description": null,
                "chapters": [{"title": "第一章", "summary": null}]
            }]
        });
        let novel: NovelData = serde_json::from_value(raw).unwrap();
        assert_eq!(novel.synopsis, "");
        assert_eq!(novel.volume_count, 0);
        assert!(novel.characters.is_empty());
        assert_eq!(novel.volumes[0].description, "");
        assert_eq!(novel.chapter(0, 0).unwrap().summary, "");
    }

    #[test]
    fn apply_outline_replaces_structure_and_counts_volumes() {
        let mut novel = NovelData {
            title: "旧名".into(),
            ..Default::default()
        };
        let outline = Outline {
            title: String::new(),
            volumes: vec![Volume::default(), Volume::default()],
            characters: vec![Character {
                name: "林舟".into(),
                ..Default::default()
            }],
            extra: Map::new(),
        };
        novel.apply_outline(&outline);
        assert_eq!(novel.title, "旧名");
        assert_eq!(novel.volume_count, 2);
        assert_eq!(novel.characters[0].name, "林舟");
    }
}
