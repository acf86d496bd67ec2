//! Outline generation and optimisation prompts, and parsing of the JSON reply.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::errors::{NovelGenError, Result};
use crate::novel::{Character, NovelData, Outline, Volume};

/// 1-based inclusive span of chapters to (re)generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutlineRange {
    pub start_volume: usize,
    pub start_chapter: usize,
    pub end_volume: usize,
    pub end_chapter: usize,
}

impl OutlineRange {
    pub fn new(
        start_volume: usize,
        start_chapter: usize,
        end_volume: usize,
        end_chapter: usize,
    ) -> Result<Self> {
        if start_volume == 0 || start_chapter == 0 || end_volume == 0 || end_chapter == 0 {
            return Err(NovelGenError::Validation(
                "outline range positions are 1-based".into(),
            ));
        }
        if (end_volume, end_chapter) < (start_volume, start_chapter) {
            return Err(NovelGenError::Validation(format!(
                "outline range ends ({end_volume},{end_chapter}) before it starts ({start_volume},{start_chapter})"
            )));
        }
        Ok(Self {
            start_volume,
            start_chapter,
            end_volume,
            end_chapter,
        })
    }

    /// The range may overwrite existing chapters or continue right after the
    /// last one, but never leave a hole in the outline.
    pub fn check_against(&self, existing: &Outline) -> Result<()> {
        let volume = self.start_volume - 1;
        let volumes = existing.volumes.len();
        let chapters = match existing.volumes.get(volume) {
            Some(v) => v.chapters.len(),
            None if volume == volumes => 0,
            None => {
                return Err(NovelGenError::Validation(format!(
                    "outline range starts at volume {} but the outline has {volumes} volumes",
                    self.start_volume
                )))
            }
        };
        if self.start_chapter - 1 > chapters {
            return Err(NovelGenError::Validation(format!(
                "outline range starts at chapter {} of volume {} which has {chapters} chapters",
                self.start_chapter, self.start_volume
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlineRequest {
    pub title: String,
    pub genre: String,
    pub theme: String,
    pub style: String,
    pub synopsis: String,
    pub volume_count: u32,
    pub chapters_per_volume: u32,
    pub words_per_chapter: u32,
    pub new_character_count: u32,
    pub selected_characters: Vec<Character>,
    pub range: Option<OutlineRange>,
    pub existing_outline: Option<Outline>,
}

impl OutlineRequest {
    /// Planning parameters taken from a novel; the current outline becomes
    /// the merge base when it has any volumes.
    pub fn from_novel(novel: &NovelData) -> Self {
        Self {
            title: novel.title.clone(),
            genre: novel.genre.clone(),
            theme: novel.theme.clone(),
            style: novel.style.clone(),
            synopsis: novel.synopsis.clone(),
            volume_count: novel.volume_count,
            chapters_per_volume: novel.chapters_per_volume,
            words_per_chapter: novel.words_per_chapter,
            new_character_count: novel.new_character_count,
            selected_characters: novel.selected_characters.clone(),
            range: None,
            existing_outline: (!novel.volumes.is_empty()).then(|| novel.outline()),
        }
    }

    pub fn with_range(mut self, range: OutlineRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn template_args(&self) -> BTreeMap<&'static str, String> {
        let range = self
            .range
            .map(|r| describe_range(&r))
            .unwrap_or_default();
        BTreeMap::from([
            ("title", self.title.clone()),
            ("genre", self.genre.clone()),
            ("theme", self.theme.clone()),
            ("style", self.style.clone()),
            ("synopsis", self.synopsis.clone()),
            ("volume_count", self.volume_count.to_string()),
            ("chapters_per_volume", self.chapters_per_volume.to_string()),
            ("words_per_chapter", self.words_per_chapter.to_string()),
            ("new_character_count", self.new_character_count.to_string()),
            (
                "selected_characters",
                character_lines(&self.selected_characters),
            ),
            ("range", range),
            (
                "existing_outline",
                self.existing_outline
                    .as_ref()
                    .map(outline_json)
                    .unwrap_or_default(),
            ),
        ])
    }
}

const REPLY_SHAPE: &str = r#"{
  "title": "小说标题",
  "volumes": [
    {
      "title": "卷标题",
      "description": "卷简介",
      "chapters": [
        {"title": "章节标题", "summary": "章节摘要"}
      ]
    }
  ],
  "characters": [
    {"name": "姓名", "identity": "身份", "personality": "性格", "background": "背景"}
  ]
}"#;

fn character_lines(characters: &[Character]) -> String {
    characters
        .iter()
        .map(|c| {
            format!(
                "- {}: {}, {}, {}",
                c.name, c.identity, c.personality, c.background
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_range(range: &OutlineRange) -> String {
    format!(
        "从第{}卷第{}章到第{}卷第{}章",
        range.start_volume, range.start_chapter, range.end_volume, range.end_chapter
    )
}

pub(crate) fn outline_json(outline: &Outline) -> String {
    serde_json::to_string_pretty(outline).unwrap_or_default()
}

pub fn build_outline_prompt(request: &OutlineRequest) -> String {
    let mut lines = vec![
        "请为以下小说生成详细的大纲：".to_string(),
        String::new(),
        format!("小说标题：{}", request.title),
        format!("小说类型：{}", request.genre),
        format!("核心主题：{}", request.theme),
        format!("写作风格：{}", request.style),
        format!("故事梗概：{}", request.synopsis),
        format!("卷数：{}", request.volume_count),
        format!("每卷章节数：{}", request.chapters_per_volume),
        format!("每章字数：{}", request.words_per_chapter),
        format!("新增人物数量：{}", request.new_character_count),
    ];
    if !request.selected_characters.is_empty() {
        lines.push(String::new());
        lines.push("已有人物：".to_string());
        lines.push(character_lines(&request.selected_characters));
    }
    if let Some(range) = &request.range {
        lines.push(String::new());
        lines.push(format!("本次只需生成{}的大纲，", describe_range(range)));
        lines.push("返回的 volumes 只包含该范围内的卷与章节，按顺序排列。".to_string());
    }
    if let Some(existing) = &request.existing_outline {
        lines.push(String::new());
        lines.push("现有大纲（请保持前后连贯）：".to_string());
        lines.push(outline_json(existing));
    }
    lines.push(String::new());
    lines.push("请严格按照以下 JSON 格式返回，不要包含其他解释或说明：".to_string());
    lines.push(REPLY_SHAPE.to_string());
    lines.join("\n")
}

pub fn build_optimize_prompt(current: &Outline) -> String {
    [
        "请优化以下小说大纲，使情节更加紧凑、人物更加立体、前后更加连贯：".to_string(),
        String::new(),
        outline_json(current),
        String::new(),
        "请保持卷与章节的数量不变，并严格按照相同的 JSON 格式返回，不要包含其他解释或说明。"
            .to_string(),
    ]
    .join("\n")
}

/// Decode the outline object from a model reply. Code fences and text around
/// the outermost object are ignored.
pub fn parse_outline_reply(provider: &str, reply: &str) -> Result<Outline> {
    let unparsable = |reason: String| NovelGenError::Provider {
        provider: provider.to_string(),
        status: None,
        body: format!("{reason}; raw reply: {reply}"),
    };
    let (start, end) = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => return Err(unparsable("reply contains no JSON object".into())),
    };
    let value: Value = serde_json::from_str(&reply[start..=end])
        .map_err(|e| unparsable(format!("outline reply is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(unparsable("outline reply is not a JSON object".into()));
    }
    serde_json::from_value(value).map_err(|e| unparsable(format!("unexpected outline shape: {e}")))
}

/// Combine a generated outline with an existing one.
///
/// Without a range the generated volumes replace the existing ones. With a
/// range, generated volume `i` lands on volume `start_volume + i`, and its
/// chapters overwrite slots starting at `start_chapter` in the first volume
/// and at the first chapter in later ones. Slots past the end are appended,
/// so the result has no empty records. Characters are appended when their
/// name is new.
pub fn merge_outline(existing: &Outline, generated: Outline, range: Option<OutlineRange>) -> Outline {
    let mut merged = existing.clone();
    if !generated.title.is_empty() {
        merged.title = generated.title;
    }

    match range {
        None => merged.volumes = generated.volumes,
        Some(range) => {
            for (offset, volume) in generated.volumes.into_iter().enumerate() {
                let index = range.start_volume - 1 + offset;
                if index >= merged.volumes.len() {
                    merged.volumes.push(volume);
                    continue;
                }
                let first_slot = if offset == 0 {
                    range.start_chapter - 1
                } else {
                    0
                };
                splice_volume(&mut merged.volumes[index], volume, first_slot);
            }
        }
    }

    let mut known: HashSet<String> = merged.characters.iter().map(|c| c.name.clone()).collect();
    for character in generated.characters {
        if known.insert(character.name.clone()) {
            merged.characters.push(character);
        }
    }
    for (key, value) in generated.extra {
        merged.extra.insert(key, value);
    }
    merged
}

fn splice_volume(target: &mut Volume, generated: Volume, first_slot: usize) {
    if !generated.title.is_empty() {
        target.title = generated.title;
    }
    if !generated.description.is_empty() {
        target.description = generated.description;
    }
    for (offset, chapter) in generated.chapters.into_iter().enumerate() {
        match target.chapters.get_mut(first_slot + offset) {
            Some(slot) => *slot = chapter,
            None => target.chapters.push(chapter),
        }
    }
}
