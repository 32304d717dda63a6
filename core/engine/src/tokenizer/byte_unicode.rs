//! 字节 ↔ Unicode 字符的可逆映射（GPT-2 风格）
//!
//! BPE 合并在字符层面进行，为了让任意字节（包括控制字符、非法 UTF-8 片段）
//! 都有一个可打印、互不相同的表示，先把每个字节映射到一个 Unicode 字符。

use std::collections::HashMap;
use std::sync::OnceLock;

/// 256 个字节值与字符之间的双射
pub struct ByteUnicodeCodec {
    encoder: [char; 256],
    decoder: HashMap<char, u8>,
}

impl ByteUnicodeCodec {
    fn build() -> Self {
        // 可打印 ASCII 与大部分 Latin-1 补充字符映射到自身
        let mut printable = [false; 256];
        for b in (33u16..=126).chain(161..=172).chain(174..=255) {
            printable[b as usize] = true;
        }

        let mut encoder = ['\0'; 256];
        let mut next = 256u32;
        for (b, keep) in printable.iter().enumerate() {
            let code = if *keep {
                b as u32
            } else {
                let code = next;
                next += 1;
                code
            };
            // 0..=323 全部是合法的 Unicode 标量值
            encoder[b] = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
        }

        let decoder = encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        Self { encoder, decoder }
    }

    /// 进程内共享的映射表（只读）
    pub fn global() -> &'static ByteUnicodeCodec {
        static CODEC: OnceLock<ByteUnicodeCodec> = OnceLock::new();
        CODEC.get_or_init(Self::build)
    }

    pub fn encode(&self, byte: u8) -> char {
        self.encoder[byte as usize]
    }

    pub fn decode(&self, ch: char) -> Option<u8> {
        self.decoder.get(&ch).copied()
    }

    /// 把一段字节编码成 BPE 使用的字符串
    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| self.encode(b)).collect()
    }

    /// 逆映射；不在字母表中的字符被跳过
    pub fn decode_str(&self, text: &str) -> Vec<u8> {
        text.chars().filter_map(|c| self.decode(c)).collect()
    }
}

pub fn encode(byte: u8) -> char {
    ByteUnicodeCodec::global().encode(byte)
}

pub fn decode(ch: char) -> Option<u8> {
    ByteUnicodeCodec::global().decode(ch)
}
