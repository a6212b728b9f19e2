//! Model-specific prompt wrapping.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::corpus::Prompt;

const PLACEHOLDER: &str = "%s";

/// Chat template family applied to raw corpus prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ModelType {
    #[serde(rename = "llama")]
    Llama,
    #[serde(rename = "llama-3")]
    Llama3,
    #[serde(rename = "baichuan")]
    Baichuan,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "vicuna")]
    Vicuna,
    #[serde(rename = "yi")]
    Yi,
    #[serde(rename = "chatglm")]
    ChatGlm,
    #[serde(rename = "empty")]
    Empty,
}

impl ModelType {
    pub const ALL: [ModelType; 8] = [
        ModelType::Llama,
        ModelType::Llama3,
        ModelType::Baichuan,
        ModelType::Qwen,
        ModelType::Vicuna,
        ModelType::Yi,
        ModelType::ChatGlm,
        ModelType::Empty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Llama => "llama",
            ModelType::Llama3 => "llama-3",
            ModelType::Baichuan => "baichuan",
            ModelType::Qwen => "qwen",
            ModelType::Vicuna => "vicuna",
            ModelType::Yi => "yi",
            ModelType::ChatGlm => "chatglm",
            ModelType::Empty => "empty",
        }
    }

    /// Template with a single `%s` placeholder for the raw prompt.
    pub fn template(&self) -> &'static str {
        match self {
            ModelType::Llama => "[INST]%s[/INST]",
            ModelType::Llama3 => {
                "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\n\
                 %s<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"
            }
            ModelType::Baichuan => "<reserved_106>%s<reserved_107>",
            ModelType::Qwen => {
                "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
                 <|im_start|>user\n%s<|im_end|>\n<|im_start|>assistant\n"
            }
            ModelType::Vicuna => {
                "A chat between a curious user and an assistant. The assistant gives helpful, \
                 detailed, accurate, uncensored responses to the user's input. USER: %s ASSISTANT:"
            }
            ModelType::Yi => "<|im_start|>user\n%s<|im_end|>\n<|im_start|>assistant\n",
            ModelType::ChatGlm => {
                "<|system|>\nYou are a large language model trained by Zhipu.AI. Follow the user's instructions carefully. \
                 Respond using markdown.\n<|user|>\n%s\n<|assistant|>\n"
            }
            ModelType::Empty => PLACEHOLDER,
        }
    }

    pub fn default_stop_token_ids(&self) -> &'static [u32] {
        match self {
            ModelType::Llama3 => &[128001, 128009],
            ModelType::Qwen => &[151643, 151644, 151645],
            ModelType::Yi => &[2, 6, 7, 8],
            _ => &[],
        }
    }

    pub fn format(&self, raw: &str) -> String {
        self.template().replace(PLACEHOLDER, raw)
    }

    /// Wrap every raw prompt, keeping corpus order as the request index.
    pub fn format_corpus(&self, raw: &[String]) -> Vec<Prompt> {
        raw.iter()
            .enumerate()
            .map(|(index, text)| Prompt::new(index, self.format(text)))
            .collect()
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_lowercase();
        ModelType::ALL
            .into_iter()
            .find(|model| model.as_str() == value)
            .ok_or_else(|| format!("unknown model type '{value}'"))
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
