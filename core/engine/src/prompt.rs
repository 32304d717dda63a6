//! Chat 模板：system / user（带一个图像占位符）/ assistant 起始

use crate::tokenizer::IMAGE_MARKER;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Please answer in English only.";

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    system_prompt: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

impl PromptTemplate {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 生成完整 prompt，assistant 轮只有起始标记，没有内容
    pub fn render(&self, instruction: &str) -> String {
        format!(
            "{IM_START}system\n{system}{IM_END}\n\
             {IM_START}user\n{IMAGE_MARKER}\n{instruction}{IM_END}\n\
             {IM_START}assistant\n",
            system = self.system_prompt,
        )
    }
}
