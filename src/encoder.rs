//! Collaborator contracts: tokenization and multimodal processing.
//!
//! The preference pipeline only needs "tokenize a string into ids plus an
//! attention mask" and, for vision records, "process text plus images into
//! ids, mask and image features". Both are traits so the core transforms can
//! be exercised without a real tokenizer.

use crate::config::TokenizerConfig;
use crate::globals;
use serde::{Deserialize, Serialize};

/// Tokenizer contract consumed by the sequence builder.
pub trait TokenEncoder: Sync {
    /// Tokenize with truncation at `max_length`, no special tokens added.
    fn encode(&self, text: &str, max_length: usize) -> (Vec<i32>, Vec<i32>);
    fn eos_token(&self) -> &str;
    fn eos_token_id(&self) -> i32;
    fn pad_token_id(&self) -> i32;
}

/// Image features in extractor-native shape. Rows are stacked along the
/// batch axis at collation, never length-padded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageFeatures {
    /// Flattened pixel/patch features, `feature_width` values per row.
    pub pixel_values: Vec<f32>,
    pub feature_width: usize,
    /// Per-image (temporal, height, width) patch grid.
    pub image_grid: Vec<[i32; 3]>,
}

impl ImageFeatures {
    /// Stack another example's features after this one's.
    pub fn append(&mut self, other: &ImageFeatures) {
        if self.pixel_values.is_empty() {
            self.feature_width = other.feature_width;
        }
        self.pixel_values.extend_from_slice(&other.pixel_values);
        self.image_grid.extend_from_slice(&other.image_grid);
    }

    pub fn num_rows(&self) -> usize {
        if self.feature_width == 0 {
            0
        } else {
            self.pixel_values.len() / self.feature_width
        }
    }
}

/// What a multimodal processor returns for one rendered side.
#[derive(Debug, Clone)]
pub struct VisionEncoding {
    pub input_ids: Vec<i32>,
    pub attention_mask: Vec<i32>,
    pub features: ImageFeatures,
}

/// Multimodal processor contract: rendered text plus image references in,
/// token ids and extractor-native feature tensors out.
pub trait VisionProcessor: Sync {
    fn process(
        &self,
        text: &str,
        images: &[String],
        max_length: usize,
    ) -> anyhow::Result<VisionEncoding>;
    fn eos_token_id(&self) -> i32;
    fn pad_token_id(&self) -> i32;
}

/// [`TokenEncoder`] backed by the process-wide hf tokenizer.
pub struct HfTokenEncoder {
    eos_token: String,
    eos_token_id: i32,
    pad_token_id: i32,
}

const EOS_TOKENS: [&str; 5] = [
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<eos>",
];
const PAD_TOKENS: [&str; 4] = ["<pad>", "[PAD]", "<|pad|>", "<|finetune_right_pad_id|>"];

fn resolve_eos(lookup: impl Fn(&str) -> Option<u32>) -> Option<(String, u32)> {
    EOS_TOKENS
        .iter()
        .find_map(|token| lookup(token).map(|id| (token.to_string(), id)))
}

// Tokenizer files rarely name their pad token consistently, so common
// names are probed and the eos id is the fallback.
fn resolve_pad(lookup: impl Fn(&str) -> Option<u32>, eos_token_id: u32) -> u32 {
    PAD_TOKENS
        .iter()
        .find_map(|token| lookup(token))
        .unwrap_or(eos_token_id)
}

impl HfTokenEncoder {
    /// Resolve eos/pad ids against the initialized tokenizer, taking the
    /// eos token name from `tokenizer_config.json`.
    pub fn from_config(config: &TokenizerConfig) -> anyhow::Result<Self> {
        let tokenizer = globals::tokenizer();
        let eos_token_id = tokenizer
            .token_to_id(&config.eos_token)
            .ok_or_else(|| anyhow::anyhow!("eos token {} not in vocab", config.eos_token))?;
        let pad_token_id = resolve_pad(|token| tokenizer.token_to_id(token), eos_token_id);
        Ok(Self {
            eos_token: config.eos_token.clone(),
            eos_token_id: eos_token_id as i32,
            pad_token_id: pad_token_id as i32,
        })
    }

    /// Resolve eos/pad by probing common token names on the loaded
    /// tokenizer. Local `tokenizer.json` files come without a
    /// `tokenizer_config.json` naming the eos token, so it has to be
    /// discovered from the vocab.
    pub fn from_tokenizer() -> anyhow::Result<Self> {
        let tokenizer = globals::tokenizer();
        let (eos_token, eos_token_id) = resolve_eos(|token| tokenizer.token_to_id(token))
            .ok_or_else(|| anyhow::anyhow!("no recognizable eos token in vocab"))?;
        let pad_token_id = resolve_pad(|token| tokenizer.token_to_id(token), eos_token_id);
        Ok(Self {
            eos_token,
            eos_token_id: eos_token_id as i32,
            pad_token_id: pad_token_id as i32,
        })
    }
}

impl TokenEncoder for HfTokenEncoder {
    fn encode(&self, text: &str, max_length: usize) -> (Vec<i32>, Vec<i32>) {
        let encoding = globals::tokenize(text);
        let mut input_ids: Vec<i32> = encoding.get_ids().iter().map(|&x| x as i32).collect();
        let mut attention_mask: Vec<i32> = encoding
            .get_attention_mask()
            .iter()
            .map(|&x| x as i32)
            .collect();
        input_ids.truncate(max_length);
        attention_mask.truncate(max_length);
        (input_ids, attention_mask)
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }

    fn eos_token_id(&self) -> i32 {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> i32 {
        self.pad_token_id
    }
}
