//! 字节级 BPE tokenizer（Qwen2 / GPT-2 风格）
//!
//! 不依赖 HuggingFace tokenizers，直接使用 vocab.json + merges.txt：
//! 1. 先按特殊 token 字面量切分（特殊 token 直接输出保留 id，不做 BPE）
//! 2. 普通片段用 GPT 风格正则预切分
//! 3. 每个片段的 UTF-8 字节经过字节→Unicode 映射后做贪心 BPE 合并

pub mod bpe;
pub mod byte_unicode;
pub mod vocab;

use fancy_regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use bpe::{merge_word, MergeRanks};
use byte_unicode::ByteUnicodeCodec;
use vocab::{read_json_file, SpecialTokenRoles, TokenizerConfigFile};

pub use vocab::{SpecialTokens, Vocabulary};

/// 图像占位符的字面量
pub const IMAGE_MARKER: &str = "<image>";

/// GPT 风格预切分：缩写、字母串、数字串、标点串、尾随空白
pub const PRETOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

/// 特殊 token 扮演的角色
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenRoles {
    pub bos: Option<i64>,
    pub eos: Option<i64>,
    pub pad: Option<i64>,
    pub unk: Option<i64>,
    pub image: Option<i64>,
}

/// detokenize 的结果，`degraded` 表示字节序列不是合法 UTF-8，已做有损解码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detokenized {
    pub text: String,
    pub degraded: bool,
}

pub struct BpeTokenizer {
    vocab: Vocabulary,
    merges: MergeRanks,
    specials: SpecialTokens,
    roles: TokenRoles,
    chat_template: Option<String>,
    pattern: Regex,
}

impl BpeTokenizer {
    /// 从内存中的表构建
    ///
    /// `unk` 为 None 时，遇到词表外的符号会返回 `UnknownToken` 错误
    pub fn from_parts(
        vocab: Vocabulary,
        merges: MergeRanks,
        specials: SpecialTokens,
        mut roles: TokenRoles,
    ) -> EngineResult<Self> {
        let pattern = Regex::new(PRETOKENIZE_PATTERN)
            .map_err(|e| EngineError::config(format!("invalid pre-tokenize pattern: {e}")))?;
        if roles.image.is_none() {
            roles.image = specials.id(IMAGE_MARKER);
        }
        Ok(Self {
            vocab,
            merges,
            specials,
            roles,
            chat_template: None,
            pattern,
        })
    }

    /// 从 tokenizer 目录加载
    ///
    /// # Files Required
    /// - `vocab.json` - 词表
    /// - `merges.txt` - 合并规则（按优先级排序）
    /// - `tokenizer_config.json` - chat_template 与 added_tokens_decoder（可选）
    /// - `special_tokens_map.json` - eos/pad 等角色（可选）
    ///
    /// 如果目录下没有 vocab.json，会尝试同级的 `tokenizer/` 目录
    pub fn from_model_dir(model_dir: &Path) -> EngineResult<Self> {
        let dir = resolve_tokenizer_dir(model_dir);

        let vocab_path = dir.join("vocab.json");
        let merges_path = dir.join("merges.txt");
        for required in [&vocab_path, &merges_path] {
            if !required.exists() {
                return Err(EngineError::artifact(required.as_path(), "required tokenizer file not found"));
            }
        }

        let vocab = Vocabulary::from_file(&vocab_path)?;
        let merges = MergeRanks::from_file(&merges_path)?;

        let config_path = dir.join("tokenizer_config.json");
        let config: TokenizerConfigFile = if config_path.exists() {
            read_json_file(&config_path)?
        } else {
            warn!(path = %config_path.display(), "tokenizer_config.json not found, no special tokens loaded");
            TokenizerConfigFile::default()
        };
        let specials = SpecialTokens::new(config.special_entries(&config_path)?);

        let roles_path = dir.join("special_tokens_map.json");
        let role_map: SpecialTokenRoles = if roles_path.exists() {
            read_json_file(&roles_path)?
        } else {
            SpecialTokenRoles::default()
        };

        let lookup = |token: &Option<vocab::TokenRef>| -> Option<i64> {
            let content = token.as_ref()?.content();
            specials.id(content).or_else(|| vocab.id(content))
        };
        let roles = TokenRoles {
            bos: lookup(&role_map.bos_token),
            eos: lookup(&role_map.eos_token),
            pad: lookup(&role_map.pad_token),
            unk: lookup(&role_map.unk_token).or_else(|| vocab.id("<unk>")),
            image: specials.id(IMAGE_MARKER),
        };

        info!(
            dir = %dir.display(),
            vocab = vocab.len(),
            merges = merges.len(),
            specials = specials.len(),
            eos = ?roles.eos,
            image = ?roles.image,
            "BPE tokenizer loaded"
        );

        let mut tokenizer = Self::from_parts(vocab, merges, specials, roles)?;
        tokenizer.chat_template = config.chat_template();
        Ok(tokenizer)
    }

    /// 文本 → token ids
    pub fn tokenize(&self, text: &str) -> EngineResult<Vec<i64>> {
        let mut ids = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            match self.specials.find_next(rest) {
                Some((pos, len, id)) => {
                    self.encode_segment(&rest[..pos], &mut ids)?;
                    ids.push(id);
                    rest = &rest[pos + len..];
                }
                None => {
                    self.encode_segment(rest, &mut ids)?;
                    break;
                }
            }
        }
        Ok(ids)
    }

    fn encode_segment(&self, segment: &str, out: &mut Vec<i64>) -> EngineResult<()> {
        if segment.is_empty() {
            return Ok(());
        }
        let codec = ByteUnicodeCodec::global();
        for piece in self.pattern.find_iter(segment) {
            let piece = piece.map_err(|e| EngineError::runtime(format!("pre-tokenize regex failed: {e}")))?;
            let encoded = codec.encode_bytes(piece.as_str().as_bytes());
            for symbol in merge_word(&encoded, &self.merges) {
                out.push(self.symbol_id(symbol)?);
            }
        }
        Ok(())
    }

    fn symbol_id(&self, symbol: String) -> EngineResult<i64> {
        if let Some(id) = self.vocab.id(&symbol) {
            return Ok(id);
        }
        match self.roles.unk {
            Some(unk) => {
                debug!(symbol = %symbol, unk, "symbol not in vocabulary, using <unk>");
                Ok(unk)
            }
            None => Err(EngineError::UnknownToken { symbol }),
        }
    }

    /// token ids → 原始字节（跳过特殊 token）
    pub fn decode_bytes(&self, ids: &[i64]) -> Vec<u8> {
        let codec = ByteUnicodeCodec::global();
        let mut bytes = Vec::new();
        for &id in ids {
            if self.specials.contains_id(id) {
                continue;
            }
            match self.vocab.token(id) {
                Some(token) => bytes.extend(codec.decode_str(token)),
                None => debug!(id, "token id not in vocabulary, skipped"),
            }
        }
        bytes
    }

    /// token ids → 文本，同时报告是否发生了有损解码
    pub fn detokenize_checked(&self, ids: &[i64]) -> Detokenized {
        let bytes = self.decode_bytes(ids);
        match String::from_utf8(bytes) {
            Ok(text) => Detokenized { text, degraded: false },
            Err(e) => {
                let bytes = e.into_bytes();
                warn!(
                    len = bytes.len(),
                    "decoded bytes are not valid UTF-8, falling back to lossy decoding"
                );
                Detokenized {
                    text: String::from_utf8_lossy(&bytes).into_owned(),
                    degraded: true,
                }
            }
        }
    }

    pub fn detokenize(&self, ids: &[i64]) -> String {
        self.detokenize_checked(ids).text
    }

    pub fn roles(&self) -> TokenRoles {
        self.roles
    }

    pub fn image_id(&self) -> Option<i64> {
        self.roles.image
    }

    pub fn eos_id(&self) -> Option<i64> {
        self.roles.eos
    }

    pub fn pad_id(&self) -> Option<i64> {
        self.roles.pad
    }

    pub fn bos_id(&self) -> Option<i64> {
        self.roles.bos
    }

    pub fn unk_id(&self) -> Option<i64> {
        self.roles.unk
    }

    pub fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len() + self.specials.len()
    }

    pub fn token_to_id(&self, token: &str) -> Option<i64> {
        self.specials.id(token).or_else(|| self.vocab.id(token))
    }

    pub fn id_to_token(&self, id: i64) -> Option<&str> {
        self.specials.content(id).or_else(|| self.vocab.token(id))
    }

    pub fn specials(&self) -> &SpecialTokens {
        &self.specials
    }
}

fn resolve_tokenizer_dir(dir: &Path) -> PathBuf {
    if dir.join("vocab.json").exists() {
        return dir.to_path_buf();
    }
    if let Some(parent) = dir.parent() {
        let sibling = parent.join("tokenizer");
        if sibling.join("vocab.json").exists() {
            debug!(dir = %sibling.display(), "using sibling tokenizer directory");
            return sibling;
        }
    }
    dir.to_path_buf()
}

/// 由一个最小字节级词表构建 tokenizer：256 个单字节符号 + 给定的合并结果
///
/// 主要给测试和工具使用
pub fn byte_level_vocab<I, S>(extra: I) -> HashMap<String, i64>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let codec = ByteUnicodeCodec::global();
    let mut map: HashMap<String, i64> = (0..=255u8)
        .map(|b| (codec.encode(b).to_string(), b as i64))
        .collect();
    for token in extra {
        let next = map.len() as i64;
        map.entry(token.into()).or_insert(next);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_tokenizer() -> BpeTokenizer {
        let vocab = Vocabulary::new(byte_level_vocab(["lo", "low", "Ġw", "or", "ld", "Ġwor", "Ġworld"])).unwrap();
        let merges = MergeRanks::from_pairs([
            ("l", "o"),
            ("lo", "w"),
            ("Ġ", "w"),
            ("o", "r"),
            ("Ġw", "or"),
            ("l", "d"),
            ("Ġwor", "ld"),
        ]);
        let specials = SpecialTokens::new([("<|im_start|>", 1000), ("<|im_end|>", 1001), (IMAGE_MARKER, 1002)]);
        BpeTokenizer::from_parts(vocab, merges, specials, TokenRoles::default()).unwrap()
    }

    #[test]
    fn test_low_merges_into_single_token() {
        let tok = tiny_tokenizer();
        let ids = tok.tokenize("low").unwrap();
        assert_eq!(ids, vec![tok.token_to_id("low").unwrap()]);
    }

    #[test]
    fn test_special_markers_bypass_bpe() {
        let tok = tiny_tokenizer();
        let ids = tok.tokenize("<|im_start|>low<image><|im_end|>").unwrap();
        assert_eq!(ids.first(), Some(&1000));
        assert_eq!(ids[ids.len() - 2..], [1002, 1001]);
        assert_eq!(tok.image_id(), Some(1002));
    }

    #[test]
    fn test_detokenize_skips_specials() {
        let tok = tiny_tokenizer();
        let ids = tok.tokenize("<|im_start|>low world<|im_end|>").unwrap();
        assert_eq!(tok.detokenize(&ids), "low world");
    }

    #[test]
    fn test_unknown_symbol_without_unk_is_error() {
        let vocab = Vocabulary::new(HashMap::from([("a".to_string(), 0)])).unwrap();
        let tok =
            BpeTokenizer::from_parts(vocab, MergeRanks::default(), SpecialTokens::default(), TokenRoles::default())
                .unwrap();
        let err = tok.tokenize("ab").unwrap_err();
        assert!(matches!(err, EngineError::UnknownToken { ref symbol } if symbol == "b"));
    }

    #[test]
    fn test_unknown_symbol_falls_back_to_unk() {
        let vocab = Vocabulary::new(HashMap::from([("a".to_string(), 0), ("<unk>".to_string(), 1)])).unwrap();
        let roles = TokenRoles {
            unk: Some(1),
            ..Default::default()
        };
        let tok = BpeTokenizer::from_parts(vocab, MergeRanks::default(), SpecialTokens::default(), roles).unwrap();
        assert_eq!(tok.tokenize("ab").unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_invalid_utf8_is_decoded_lossily() {
        let tok = tiny_tokenizer();
        // 0xE4 是一个多字节序列的首字节，单独出现不是合法 UTF-8
        let result = tok.detokenize_checked(&[0xE4, b'a' as i64]);
        assert!(result.degraded);
        assert!(result.text.ends_with('a'));
    }

    #[test]
    fn test_pretokenizer_splits_words_and_punctuation() {
        let tok = tiny_tokenizer();
        let pieces: Vec<&str> = tok
            .pattern
            .find_iter("Hello, world's  end")
            .map(|m| m.unwrap().as_str())
            .collect();
        assert_eq!(pieces, vec!["Hello", ",", " world", "'s", " ", " end"]);
    }
}
