//! 词表、特殊 token 表以及 tokenizer 相关 JSON 文件的反序列化类型

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// vocab.json：{ token: id }
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    token_to_id: HashMap<String, i64>,
    id_to_token: HashMap<i64, String>,
}

impl Vocabulary {
    pub fn new(map: HashMap<String, i64>) -> EngineResult<Self> {
        let mut id_to_token = HashMap::with_capacity(map.len());
        for (token, &id) in &map {
            if id < 0 {
                return Err(EngineError::config(format!(
                    "vocabulary id for {token:?} is negative: {id}"
                )));
            }
            if let Some(previous) = id_to_token.insert(id, token.clone()) {
                return Err(EngineError::config(format!(
                    "vocabulary id {id} is assigned to both {previous:?} and {token:?}"
                )));
            }
        }
        Ok(Self {
            token_to_id: map,
            id_to_token,
        })
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| EngineError::artifact(path, format!("failed to read vocab.json: {e}")))?;
        let map: HashMap<String, i64> = serde_json::from_str(&data)
            .map_err(|e| EngineError::artifact(path, format!("failed to parse vocab.json: {e}")))?;
        Self::new(map).map_err(|e| EngineError::artifact(path, e.to_string()))
    }

    pub fn id(&self, token: &str) -> Option<i64> {
        self.token_to_id.get(token).copied()
    }

    pub fn token(&self, id: i64) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }
}

/// 特殊 token（字面量标记）表
///
/// 标记按长度降序保存，同一起点上更长的标记优先匹配。
#[derive(Debug, Clone, Default)]
pub struct SpecialTokens {
    markers: Vec<(String, i64)>,
    by_id: HashMap<i64, String>,
}

impl SpecialTokens {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut by_content: HashMap<String, i64> = HashMap::new();
        for (content, id) in entries {
            let content = content.into();
            if content.is_empty() {
                continue;
            }
            by_content.insert(content, id);
        }

        let by_id = by_content.iter().map(|(c, &id)| (id, c.clone())).collect();
        let mut markers: Vec<(String, i64)> = by_content.into_iter().collect();
        markers.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self { markers, by_id }
    }

    pub fn id(&self, content: &str) -> Option<i64> {
        self.markers
            .iter()
            .find(|(marker, _)| marker == content)
            .map(|(_, id)| *id)
    }

    pub fn content(&self, id: i64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn contains_id(&self, id: i64) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// 在 `text` 中找最靠左的特殊标记；起点相同时取最长的
    ///
    /// 返回 (起始字节位置, 标记长度, id)
    pub fn find_next(&self, text: &str) -> Option<(usize, usize, i64)> {
        let mut best: Option<(usize, usize, i64)> = None;
        for (marker, id) in &self.markers {
            let Some(pos) = text.find(marker.as_str()) else {
                continue;
            };
            // markers 已按长度降序，所以只有严格更靠左才替换
            if best.map_or(true, |(best_pos, _, _)| pos < best_pos) {
                best = Some((pos, marker.len(), *id));
            }
        }
        best
    }
}

/// special_tokens_map.json 中的单个条目，既可能是字符串也可能是对象
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum TokenRef {
    Plain(String),
    Object { content: String },
}

impl TokenRef {
    pub(crate) fn content(&self) -> &str {
        match self {
            TokenRef::Plain(s) => s,
            TokenRef::Object { content } => content,
        }
    }
}

/// special_tokens_map.json：哪个特殊 token 扮演 bos/eos/pad/unk 角色
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SpecialTokenRoles {
    #[serde(default)]
    pub bos_token: Option<TokenRef>,
    #[serde(default)]
    pub eos_token: Option<TokenRef>,
    #[serde(default)]
    pub pad_token: Option<TokenRef>,
    #[serde(default)]
    pub unk_token: Option<TokenRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AddedToken {
    pub content: String,
}

/// tokenizer_config.json 中用到的字段
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TokenizerConfigFile {
    /// 可能是字符串，也可能是 [{name, template}] 列表
    #[serde(default)]
    pub chat_template: Option<serde_json::Value>,
    #[serde(default)]
    pub added_tokens_decoder: HashMap<String, AddedToken>,
}

impl TokenizerConfigFile {
    pub(crate) fn chat_template(&self) -> Option<String> {
        match self.chat_template.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => items
                .iter()
                .find(|item| item.get("name").and_then(|n| n.as_str()) == Some("default"))
                .or_else(|| items.first())
                .and_then(|item| item.get("template"))
                .and_then(|t| t.as_str())
                .map(str::to_string),
            _ => None,
        }
    }

    /// 把 `added_tokens_decoder` 的 "151646" 键解析成 id
    pub(crate) fn special_entries(&self, origin: &Path) -> EngineResult<Vec<(String, i64)>> {
        self.added_tokens_decoder
            .iter()
            .map(|(key, token)| {
                key.parse::<i64>()
                    .map(|id| (token.content.clone(), id))
                    .map_err(|_| {
                        EngineError::artifact(origin, format!("added token id {key:?} is not an integer"))
                    })
            })
            .collect()
    }
}

pub(crate) fn read_json_file<T>(path: &Path) -> EngineResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    let data = fs::read_to_string(path)
        .map_err(|e| EngineError::artifact(path, format!("failed to read: {e}")))?;
    serde_json::from_str(&data).map_err(|e| EngineError::artifact(path, format!("failed to parse: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_rejects_duplicate_ids() {
        let map = HashMap::from([("a".to_string(), 0), ("b".to_string(), 0)]);
        assert!(Vocabulary::new(map).is_err());
    }

    #[test]
    fn test_find_next_prefers_leftmost() {
        let specials = SpecialTokens::new([("<a>", 1), ("<bb>", 2)]);
        assert_eq!(specials.find_next("x<bb>y<a>"), Some((1, 4, 2)));
    }

    #[test]
    fn test_find_next_prefers_longest_on_same_start() {
        let specials = SpecialTokens::new([("<|im", 7), ("<|im_start|>", 8)]);
        assert_eq!(specials.find_next("hi<|im_start|>"), Some((2, 12, 8)));
    }

    #[test]
    fn test_token_ref_accepts_string_and_object() {
        let roles: SpecialTokenRoles = serde_json::from_str(
            r#"{"eos_token": {"content": "<|im_end|>", "lstrip": false}, "pad_token": "<|endoftext|>"}"#,
        )
        .unwrap();
        assert_eq!(roles.eos_token.unwrap().content(), "<|im_end|>");
        assert_eq!(roles.pad_token.unwrap().content(), "<|endoftext|>");
        assert!(roles.bos_token.is_none());
    }

    #[test]
    fn test_chat_template_list_form() {
        let cfg: TokenizerConfigFile = serde_json::from_str(
            r#"{"chat_template": [{"name": "tool_use", "template": "T"}, {"name": "default", "template": "D"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.chat_template().as_deref(), Some("D"));
    }
}
