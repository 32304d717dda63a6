//! BPE 合并规则表与贪心合并算法

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// 合并规则 (left, right) -> rank，rank 越小越先合并
#[derive(Debug, Default, Clone)]
pub struct MergeRanks {
    ranks: HashMap<(String, String), u32>,
}

impl MergeRanks {
    /// 按给定顺序构建，第 i 条规则的 rank 为 i；重复规则保留第一次出现的 rank
    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut ranks = HashMap::new();
        for (rank, (a, b)) in pairs.into_iter().enumerate() {
            ranks.entry((a.into(), b.into())).or_insert(rank as u32);
        }
        Self { ranks }
    }

    /// 解析 merges.txt：每行 `left right`，空行与 `#` 开头的行（版本头）跳过
    pub fn parse(content: &str, origin: &Path) -> EngineResult<Self> {
        let mut pairs = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => {
                    pairs.push((a.to_string(), b.to_string()));
                }
                _ => {
                    return Err(EngineError::artifact(
                        origin,
                        format!("malformed merge rule at line {}: {:?}", line_no + 1, line),
                    ));
                }
            }
        }
        Ok(Self::from_pairs(pairs))
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| EngineError::artifact(path, format!("failed to read merges: {e}")))?;
        Self::parse(&content, path)
    }

    pub fn rank(&self, left: &str, right: &str) -> Option<u32> {
        self.ranks.get(&(left.to_string(), right.to_string())).copied()
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

/// 对一个已经过字节映射的片段做贪心 BPE 合并
///
/// 每一轮选出 rank 最小的相邻 pair（不在表中的 pair 不参与），
/// 从左到右替换所有不重叠的出现，直到只剩一个符号或没有可合并的 pair。
pub fn merge_word(piece: &str, ranks: &MergeRanks) -> Vec<String> {
    let mut word: Vec<String> = piece.chars().map(String::from).collect();
    if word.len() < 2 {
        return word;
    }

    loop {
        let best = word
            .windows(2)
            .filter_map(|pair| ranks.rank(&pair[0], &pair[1]).map(|r| (r, pair)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, pair)| (pair[0].clone(), pair[1].clone()));

        let Some((first, second)) = best else {
            break;
        };

        let mut merged = Vec::with_capacity(word.len());
        let mut i = 0;
        while i < word.len() {
            if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                merged.push(format!("{first}{second}"));
                i += 2;
            } else {
                merged.push(std::mem::take(&mut word[i]));
                i += 1;
            }
        }
        word = merged;

        if word.len() == 1 {
            break;
        }
    }

    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_rank_merges_first() {
        let ranks = MergeRanks::from_pairs([("l", "o"), ("lo", "w")]);
        assert_eq!(merge_word("low", &ranks), vec!["low"]);
    }

    #[test]
    fn test_rank_order_beats_position() {
        // ("o","w") 的 rank 更低，所以先合成 "ow"，("l","o") 再也没有机会
        let ranks = MergeRanks::from_pairs([("o", "w"), ("l", "o")]);
        assert_eq!(merge_word("low", &ranks), vec!["l", "ow"]);
    }

    #[test]
    fn test_non_overlapping_left_to_right() {
        let ranks = MergeRanks::from_pairs([("a", "a")]);
        assert_eq!(merge_word("aaa", &ranks), vec!["aa", "a"]);
        assert_eq!(merge_word("aaaa", &ranks), vec!["aa", "aa"]);
    }

    #[test]
    fn test_no_eligible_pair_keeps_chars() {
        let ranks = MergeRanks::from_pairs([("x", "y")]);
        assert_eq!(merge_word("abc", &ranks), vec!["a", "b", "c"]);
        assert_eq!(merge_word("", &ranks), Vec::<String>::new());
        assert_eq!(merge_word("z", &ranks), vec!["z"]);
    }

    #[test]
    fn test_parse_skips_header_and_blank_lines() {
        let content = "#version: 0.2\n\nĠ t\nh e\n";
        let ranks = MergeRanks::parse(content, Path::new("merges.txt")).unwrap();
        assert_eq!(ranks.len(), 2);
        assert_eq!(ranks.rank("Ġ", "t"), Some(0));
        assert_eq!(ranks.rank("h", "e"), Some(1));
        assert_eq!(ranks.rank("e", "h"), None);
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        let err = MergeRanks::parse("a b c\n", Path::new("merges.txt")).unwrap_err();
        assert!(matches!(err, EngineError::Artifact { .. }));
    }
}
