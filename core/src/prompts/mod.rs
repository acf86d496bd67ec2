//! Prompt assembly for chapter and outline generation.
//!
//! Chapter prompts are rendered from the JSON form of the novel so the same
//! validation applies to typed [`NovelData`] and to loosely structured data
//! coming straight from a file or a model reply.

pub mod outline;
pub mod templates;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::{NovelGenError, Result};
use crate::novel::{NovelData, Outline};
use outline::OutlineRequest;
use templates::TemplateRegistry;

pub const CHAPTER_TEMPLATE: &str = "chapter_generation";
pub const OUTLINE_TEMPLATE: &str = "outline_generation";
pub const OPTIMIZE_TEMPLATE: &str = "outline_optimization";

const UNTITLED: &str = "未命名小说";

const CHAPTER_REQUIREMENTS: [&str; 5] = [
    "符合章节摘要的描述",
    "与前后章节保持连贯",
    "展现人物性格和发展",
    "符合小说的整体风格和主题",
    "包含丰富的对话、描写和情节发展",
];

/// Everything a chapter prompt needs, resolved from the novel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterParams {
    pub title: String,
    pub theme: String,
    pub worldbuilding: String,
    pub characters_info: String,
    pub volume_title: String,
    pub volume_description: String,
    pub chapter_title: String,
    pub chapter_summary: String,
    pub previous_chapter_summary: Option<String>,
    pub next_chapter_summary: Option<String>,
}

fn text_field<'a>(record: &'a Value, key: &str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

/// One `- name: identity, personality, background` line per character.
pub fn render_characters(characters: &[Value]) -> String {
    characters
        .iter()
        .map(|c| {
            format!(
                "- {}: {}, {}, {}",
                text_field(c, "name"),
                text_field(c, "identity"),
                text_field(c, "personality"),
                text_field(c, "background"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ChapterParams {
    pub fn from_value(novel: &Value, volume_index: usize, chapter_index: usize) -> Result<Self> {
        let title = match text_field(novel, "title") {
            "" => UNTITLED.to_string(),
            t => t.to_string(),
        };
        let characters = novel
            .get("characters")
            .and_then(Value::as_array)
            .map(|c| render_characters(c))
            .unwrap_or_default();

        let volumes = novel
            .get("volumes")
            .and_then(Value::as_array)
            .ok_or_else(|| NovelGenError::Validation("novel has no volume list".into()))?;
        let volume = volumes.get(volume_index).ok_or_else(|| {
            NovelGenError::Validation(format!(
                "volume index {volume_index} out of range ({} volumes)",
                volumes.len()
            ))
        })?;
        if !volume.is_object() {
            return Err(NovelGenError::Validation(format!(
                "volume {volume_index} is not a structured record"
            )));
        }
        let chapters = volume
            .get("chapters")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                NovelGenError::Validation(format!("volume {volume_index} has no chapter list"))
            })?;
        let chapter = chapters.get(chapter_index).ok_or_else(|| {
            NovelGenError::Validation(format!(
                "chapter index {chapter_index} out of range ({} chapters in volume {volume_index})",
                chapters.len()
            ))
        })?;
        if !chapter.is_object() {
            return Err(NovelGenError::Validation(format!(
                "chapter {chapter_index} of volume {volume_index} is not a structured record"
            )));
        }

        let neighbour_summary = |index: usize| {
            chapters
                .get(index)
                .filter(|c| c.is_object())
                .and_then(|c| non_empty(text_field(c, "summary")))
        };
        let previous_chapter_summary = chapter_index
            .checked_sub(1)
            .and_then(|i| neighbour_summary(i));
        let next_chapter_summary = neighbour_summary(chapter_index + 1);

        Ok(Self {
            title,
            theme: text_field(novel, "theme").to_string(),
            worldbuilding: text_field(novel, "worldbuilding").to_string(),
            characters_info: characters,
            volume_title: non_empty(text_field(volume, "title"))
                .unwrap_or_else(|| format!("第{}卷", volume_index + 1)),
            volume_description: text_field(volume, "description").to_string(),
            chapter_title: non_empty(text_field(chapter, "title"))
                .unwrap_or_else(|| format!("第{}章", chapter_index + 1)),
            chapter_summary: text_field(chapter, "summary").to_string(),
            previous_chapter_summary,
            next_chapter_summary,
        })
    }

    pub fn template_args(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("title", self.title.clone()),
            ("theme", self.theme.clone()),
            ("worldbuilding", self.worldbuilding.clone()),
            ("characters_info", self.characters_info.clone()),
            ("volume_title", self.volume_title.clone()),
            ("volume_description", self.volume_description.clone()),
            ("chapter_title", self.chapter_title.clone()),
            ("chapter_summary", self.chapter_summary.clone()),
            (
                "previous_chapter_summary",
                self.previous_chapter_summary.clone().unwrap_or_default(),
            ),
            (
                "next_chapter_summary",
                self.next_chapter_summary.clone().unwrap_or_default(),
            ),
        ])
    }

    /// Built-in chapter instruction layout.
    pub fn render(&self) -> String {
        let mut lines = vec![
            "请为以下小说生成一个完整的章节内容：".to_string(),
            String::new(),
            format!("小说标题：{}", self.title),
            format!("核心主题：{}", self.theme),
            format!("世界观设定：{}", self.worldbuilding),
            String::new(),
            "主要人物：".to_string(),
            self.characters_info.clone(),
            String::new(),
            format!("当前卷：{}", self.volume_title),
            format!("卷简介：{}", self.volume_description),
            format!("当前章节：{}", self.chapter_title),
            format!("章节摘要：{}", self.chapter_summary),
        ];
        if let Some(prev) = &self.previous_chapter_summary {
            lines.push(format!("前一章节摘要：{prev}"));
        }
        if let Some(next) = &self.next_chapter_summary {
            lines.push(format!("后一章节摘要：{next}"));
        }
        lines.push(String::new());
        lines.push("请根据以上信息，创作一个完整、连贯、生动的章节内容。内容应该：".to_string());
        for (i, requirement) in CHAPTER_REQUIREMENTS.iter().enumerate() {
            lines.push(format!("{}. {requirement}", i + 1));
        }
        lines.push(String::new());
        lines.push("请直接返回章节内容，不要包含其他解释或说明。".to_string());
        lines.join("\n")
    }
}

/// Render the built-in chapter prompt for loosely structured novel JSON.
pub fn build_chapter_prompt(novel: &Value, volume_index: usize, chapter_index: usize) -> Result<String> {
    Ok(ChapterParams::from_value(novel, volume_index, chapter_index)?.render())
}

/// Prompt builder backed by an optional template registry.
#[derive(Debug, Clone, Default)]
pub struct PromptAssembler {
    templates: TemplateRegistry,
}

impl PromptAssembler {
    pub fn new(templates: TemplateRegistry) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn templates_mut(&mut self) -> &mut TemplateRegistry {
        &mut self.templates
    }

    pub fn chapter_prompt(
        &self,
        novel: &NovelData,
        volume_index: usize,
        chapter_index: usize,
    ) -> Result<String> {
        let value = serde_json::to_value(novel)
            .map_err(|e| NovelGenError::Validation(format!("novel is not serialisable: {e}")))?;
        self.chapter_prompt_from_value(&value, volume_index, chapter_index)
    }

    pub fn chapter_prompt_from_value(
        &self,
        novel: &Value,
        volume_index: usize,
        chapter_index: usize,
    ) -> Result<String> {
        let params = ChapterParams::from_value(novel, volume_index, chapter_index)?;
        Ok(self
            .templates
            .format(CHAPTER_TEMPLATE, &params.template_args())
            .unwrap_or_else(|| params.render()))
    }

    pub fn outline_prompt(&self, request: &OutlineRequest) -> String {
        self.templates
            .format(OUTLINE_TEMPLATE, &request.template_args())
            .unwrap_or_else(|| outline::build_outline_prompt(request))
    }

    pub fn optimize_prompt(&self, current: &Outline) -> String {
        let args = BTreeMap::from([("outline", outline::outline_json(current))]);
        self.templates
            .format(OPTIMIZE_TEMPLATE, &args)
            .unwrap_or_else(|| outline::build_optimize_prompt(current))
    }
}
