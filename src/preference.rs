// Normalizes raw preference records and turns each side into fixed-shape
// token sequences with per-token loss masks.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PreferenceConfig;
use crate::encoder::{ImageFeatures, TokenEncoder, VisionProcessor};
use crate::template::{ChatTemplate, Turn, TurnContent};

/// Per-example payload carried next to the token tensors: the training
/// margin for reward modelling, or the prompt token length in DPO mode.
///
/// Serialized with its variant name so downstream readers can tell an
/// integral margin from a prompt length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Extra {
    PromptIdsLen(usize),
    Margin(f32),
}

/// A chosen or rejected field as it appears in the raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SideText {
    Text(String),
    Turns(Vec<Turn>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedExample {
    pub prompt: String,
    pub chosen: SideText,
    pub rejected: SideText,
    pub extra: Extra,
}

/// One tokenized side of a preference pair. All three sequences have equal
/// length, at most `max_length`, and always end in the eos id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizedSide {
    pub input_ids: Vec<i32>,
    pub attention_mask: Vec<i32>,
    pub loss_mask: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizedPair {
    pub chosen: TokenizedSide,
    pub rejected: TokenizedSide,
    pub extra: Extra,
    /// Image features per side, present only on the multimodal path.
    pub images: Option<(ImageFeatures, ImageFeatures)>,
}

fn field<'a>(data: &'a Value, key: &str) -> anyhow::Result<&'a Value> {
    data.get(key)
        .with_context(|| format!("record has no '{}' field", key))
}

fn turns_field(data: &Value, key: &str) -> anyhow::Result<Vec<Turn>> {
    serde_json::from_value(field(data, key)?.clone())
        .with_context(|| format!("'{}' is not a list of turns", key))
}

fn side_field(data: &Value, key: &str) -> anyhow::Result<SideText> {
    serde_json::from_value(field(data, key)?.clone())
        .with_context(|| format!("'{}' is neither a string nor a list of turns", key))
}

// Chat templates render a conversation front to back, so the continuation
// alone is recovered by cutting the rendered prompt prefix off.
fn strip_rendered_prompt(full: &str, prompt: &str) -> String {
    full.get(prompt.len()..).unwrap_or_default().to_string()
}

/// Extract `(prompt, chosen, rejected, extra)` from a raw record.
///
/// Returns `Ok(None)` for examples dropped in DPO mode: a prompt tokenizing
/// to `max_length - 2` ids or more leaves no room for any answer.
pub fn normalize_record(
    data: &Value,
    config: &PreferenceConfig,
    template: Option<&ChatTemplate>,
    encoder: &dyn TokenEncoder,
    max_length: usize,
) -> anyhow::Result<Option<NormalizedExample>> {
    let (prompt, chosen, rejected) = if let Some(ct) = template {
        if let Some(prompt_key) = &config.prompt_key {
            let prompt_turns = turns_field(data, prompt_key)?;
            let chosen_turns = turns_field(data, &config.chosen_key)?;
            let rejected_turns = turns_field(data, &config.rejected_key)?;

            let prompt = ct.apply(prompt_turns.clone(), true)?;
            let mut full = prompt_turns.clone();
            full.extend(chosen_turns);
            let chosen = strip_rendered_prompt(&ct.apply(full, false)?, &prompt);
            let mut full = prompt_turns;
            full.extend(rejected_turns);
            let rejected = strip_rendered_prompt(&ct.apply(full, false)?, &prompt);
            (prompt, SideText::Text(chosen), SideText::Text(rejected))
        } else {
            let chosen_turns = turns_field(data, &config.chosen_key)?;
            let rejected_turns = turns_field(data, &config.rejected_key)?;

            let mut chosen = ct.apply(chosen_turns.clone(), false)?;
            let mut rejected = ct.apply(rejected_turns, false)?;
            let mut prompt = String::new();
            if config.is_dpo {
                // The prompt is everything up to the final (answer) turn.
                let head = &chosen_turns[..chosen_turns.len().saturating_sub(1)];
                prompt = ct.apply(head.to_vec(), true)?;
                chosen = strip_rendered_prompt(&chosen, &prompt);
                rejected = strip_rendered_prompt(&rejected, &prompt);
            }
            (prompt, SideText::Text(chosen), SideText::Text(rejected))
        }
    } else {
        let prompt = match &config.prompt_key {
            Some(prompt_key) => {
                let raw = field(data, prompt_key)?
                    .as_str()
                    .with_context(|| format!("'{}' is not a string", prompt_key))?;
                match &config.input_template {
                    Some(input_template) => input_template.replace("{}", raw),
                    None => raw.to_string(),
                }
            }
            None => String::new(),
        };
        let chosen = side_field(data, &config.chosen_key)?;
        let rejected = side_field(data, &config.rejected_key)?;
        (prompt, chosen, rejected)
    };

    let extra = if config.is_dpo {
        let (_, attention_mask) = encoder.encode(&prompt, max_length);
        let prompt_ids_len: usize = attention_mask.iter().map(|&m| m as usize).sum();
        // Filter the sample whose length is greater than max_length (2 for answer length)
        if prompt_ids_len >= max_length.saturating_sub(2) {
            return Ok(None);
        }
        Extra::PromptIdsLen(prompt_ids_len)
    } else {
        let margin = data.get("margin").and_then(Value::as_f64).unwrap_or(0.0);
        Extra::Margin(margin as f32)
    };

    Ok(Some(NormalizedExample {
        prompt,
        chosen,
        rejected,
        extra,
    }))
}

// Truncation can cut off the natural terminator; every training sequence
// must still end in a recognizable eos.
fn force_eos(input_ids: &mut [i32], attention_mask: &mut [i32], eos_token_id: i32) {
    if let (Some(last_id), Some(last_mask)) = (input_ids.last_mut(), attention_mask.last_mut()) {
        *last_id = eos_token_id;
        *last_mask = 1;
    }
}

/// Tokenize `prompt + answer` into `(input_ids, attention_mask)` of length
/// at most `max_length`, always terminated by the eos id.
pub fn build_sequence(
    prompt: &str,
    answer: &str,
    encoder: &dyn TokenEncoder,
    max_length: usize,
) -> (Vec<i32>, Vec<i32>) {
    let text = format!("{}{}", prompt, answer);
    let text = text.trim_end_matches('\n');
    let text = if text.ends_with(encoder.eos_token()) {
        text.to_string()
    } else {
        format!("{} {}", text, encoder.eos_token())
    };
    let (mut input_ids, mut attention_mask) = encoder.encode(&text, max_length);
    force_eos(&mut input_ids, &mut attention_mask, encoder.eos_token_id());
    (input_ids, attention_mask)
}

/// Compute which positions count toward the training loss.
///
/// Without a response template every real token counts. With one, only the
/// spans between each verified template match and the next eos (or the end
/// of the sequence when truncation removed the eos) are kept.
pub fn response_loss_mask(
    input_ids: &[i32],
    attention_mask: &[i32],
    response_template: Option<&[i32]>,
    eos_token_id: i32,
) -> Vec<i32> {
    let template = match response_template {
        Some(template) if !template.is_empty() => template,
        _ => return attention_mask.to_vec(),
    };

    let mut loss_mask = vec![0; input_ids.len()];
    for candidate in 0..input_ids.len() {
        if input_ids[candidate] != template[0] {
            continue;
        }
        match input_ids.get(candidate..candidate + template.len()) {
            Some(window) if window == template => {}
            _ => continue,
        }
        let answer_start = candidate + template.len();
        if answer_start >= input_ids.len() {
            continue;
        }
        let answer_end = input_ids[answer_start..]
            .iter()
            .position(|&id| id == eos_token_id)
            .map(|offset| answer_start + offset)
            .unwrap_or(input_ids.len() - 1);
        for slot in &mut loss_mask[answer_start..=answer_end] {
            *slot = 1;
        }
    }
    loss_mask
}

fn tokenize_side(
    prompt: &str,
    answer: &str,
    encoder: &dyn TokenEncoder,
    max_length: usize,
    response_ids: Option<&[i32]>,
) -> TokenizedSide {
    let (input_ids, attention_mask) = build_sequence(prompt, answer, encoder, max_length);
    let loss_mask = response_loss_mask(
        &input_ids,
        &attention_mask,
        response_ids,
        encoder.eos_token_id(),
    );
    TokenizedSide {
        input_ids,
        attention_mask,
        loss_mask,
    }
}

/// Tokenize both sides of a normalized text example.
pub fn build_pair(
    example: &NormalizedExample,
    encoder: &dyn TokenEncoder,
    max_length: usize,
    response_ids: Option<&[i32]>,
) -> anyhow::Result<TokenizedPair> {
    let (chosen, rejected) = match (&example.chosen, &example.rejected) {
        (SideText::Text(chosen), SideText::Text(rejected)) => (chosen, rejected),
        _ => bail!("structured turn content requires a chat template or the multimodal path"),
    };
    Ok(TokenizedPair {
        chosen: tokenize_side(&example.prompt, chosen, encoder, max_length, response_ids),
        rejected: tokenize_side(&example.prompt, rejected, encoder, max_length, response_ids),
        extra: example.extra,
        images: None,
    })
}

/// Validate vision-bearing turns.
///
/// Null placeholder fields (a `text: null` on an image part, an
/// `image: null` on a text part) deserialize to `None` and are omitted
/// again on render, so real values are left untouched. An image part
/// without image data indicates a malformed upstream record and fails hard.
pub fn validate_turns(turns: &[Turn]) -> anyhow::Result<()> {
    for turn in turns {
        let TurnContent::Parts(parts) = &turn.content else {
            continue;
        };
        for part in parts {
            if part.kind == "image" && part.image.is_none() {
                bail!("image part without image data in '{}' turn", turn.role);
            }
        }
    }
    Ok(())
}

/// Collect image references from vision-bearing turns, in turn order.
pub fn extract_image_refs(turns: &[Turn]) -> Vec<String> {
    let mut images = Vec::new();
    for turn in turns {
        let TurnContent::Parts(parts) = &turn.content else {
            continue;
        };
        for part in parts {
            if part.kind == "image" {
                if let Some(image) = &part.image {
                    images.push(image.clone());
                }
            }
        }
    }
    images
}

fn process_side(
    turns: &[Turn],
    template: &ChatTemplate,
    processor: &dyn VisionProcessor,
    max_length: usize,
    response_ids: Option<&[i32]>,
) -> anyhow::Result<(TokenizedSide, ImageFeatures)> {
    validate_turns(turns)?;
    let text = template.apply(turns.to_vec(), false)?;
    let images = extract_image_refs(turns);
    let mut encoding = processor.process(&text, &images, max_length)?;
    force_eos(
        &mut encoding.input_ids,
        &mut encoding.attention_mask,
        processor.eos_token_id(),
    );
    let loss_mask = response_loss_mask(
        &encoding.input_ids,
        &encoding.attention_mask,
        response_ids,
        processor.eos_token_id(),
    );
    Ok((
        TokenizedSide {
            input_ids: encoding.input_ids,
            attention_mask: encoding.attention_mask,
            loss_mask,
        },
        encoding.features,
    ))
}

/// Tokenize both sides of a vision-bearing pair through the multimodal
/// processor, carrying each side's image features along.
pub fn build_multimodal_pair(
    chosen: &[Turn],
    rejected: &[Turn],
    extra: Extra,
    template: &ChatTemplate,
    processor: &dyn VisionProcessor,
    max_length: usize,
    response_ids: Option<&[i32]>,
) -> anyhow::Result<TokenizedPair> {
    let (chosen, chosen_images) =
        process_side(chosen, template, processor, max_length, response_ids)?;
    let (rejected, rejected_images) =
        process_side(rejected, template, processor, max_length, response_ids)?;
    Ok(TokenizedPair {
        chosen,
        rejected,
        extra,
        images: Some((chosen_images, rejected_images)),
    })
}
