/// Handles the downloading of configuration files
/// Reference from hf tokenizers for downloading:
/// https://github.com/huggingface/tokenizers/blob/c45aebd1029acfbe9e5dfe64e8b8441d9fae727a/tokenizers/src/utils/from_pretrained.rs#L26

use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Deserialize, Debug)]
pub struct TokenizerConfig {
    pub bos_token: String,
    pub eos_token: String,
    pub chat_template: String,
}

/// How raw preference records are interpreted.
///
/// Every field that the upstream record format may or may not carry is an
/// explicit named option here, rather than being looked up ad hoc.
#[derive(Debug, Clone)]
pub struct PreferenceConfig {
    /// Record key holding the shared prompt. When absent, chosen/rejected
    /// are expected to carry the full conversation themselves.
    pub prompt_key: Option<String>,
    /// Record key holding the chosen continuation.
    pub chosen_key: String,
    /// Record key holding the rejected continuation.
    pub rejected_key: String,
    /// Format string applied to bare (non chat-template) prompts, `{}` is
    /// replaced with the raw prompt.
    pub input_template: Option<String>,
    /// Text marking where an answer begins. When set, the loss mask covers
    /// only the span between each match and the next eos token.
    pub response_template: Option<String>,
    /// DPO mode: `extra` carries the prompt token length instead of the
    /// margin, prompts too long to leave room for an answer are dropped,
    /// and padded batches pad right instead of left.
    pub is_dpo: bool,
}

impl Default for PreferenceConfig {
    fn default() -> Self {
        Self {
            prompt_key: None,
            chosen_key: "chosen".to_string(),
            rejected_key: "rejected".to_string(),
            input_template: None,
            response_template: None,
            is_dpo: false,
        }
    }
}

/// Defines the additional parameters available for the `from_pretrained` function
#[derive(Debug, Clone)]
pub struct FromPretrainedParameters {
    pub revision: String,
    pub user_agent: HashMap<String, String>,
    pub token: Option<String>,
}

impl Default for FromPretrainedParameters {
    fn default() -> Self {
        Self {
            revision: "main".into(),
            user_agent: HashMap::new(),
            token: None,
        }
    }
}

/// Downloads and cache the identified tokenizer if it exists on
/// the Hugging Face Hub, and returns a local path to the file
fn from_pretrained<S: AsRef<str>>(
    identifier: S,
    params: Option<FromPretrainedParameters>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let identifier: String = identifier.as_ref().to_string();

    let valid_chars = ['-', '_', '.', '/'];
    let is_valid_char = |x: char| x.is_alphanumeric() || valid_chars.contains(&x);

    let valid = identifier.chars().all(is_valid_char);
    let valid_chars_stringified = valid_chars
        .iter()
        .fold(vec![], |mut buf, x| {
            buf.push(format!("'{}'", x));
            buf
        })
        .join(", "); // "'/', '-', '_', '.'"
    if !valid {
        return Err(format!(
            "Model \"{}\" contains invalid characters, expected only alphanumeric or {valid_chars_stringified}",
            identifier
        )
        .into());
    }
    let params = params.unwrap_or_default();

    let revision = &params.revision;
    let valid_revision = revision.chars().all(is_valid_char);
    if !valid_revision {
        return Err(format!(
            "Revision \"{}\" contains invalid characters, expected only alphanumeric or {valid_chars_stringified}",
            revision
        )
        .into());
    }

    let mut builder = ApiBuilder::new();
    if let Some(token) = params.token {
        builder = builder.with_token(Some(token));
    }
    let api = builder.build()?;
    let repo = Repo::with_revision(identifier, RepoType::Model, params.revision);
    let api = api.repo(repo);
    Ok(api.get("tokenizer_config.json")?)
}

pub fn read_config(tokenizer: &str) -> Result<TokenizerConfig, Box<dyn std::error::Error>> {
    let path = from_pretrained(tokenizer, None)?;
    let config = std::fs::read_to_string(path)?;
    let config: TokenizerConfig = serde_json::from_str(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let raw = r#"{
            "bos_token": "<|begin_of_text|>",
            "eos_token": "<|eot_id|>",
            "chat_template": "{{ messages }}",
            "model_max_length": 131072
        }"#;
        let config: TokenizerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.bos_token, "<|begin_of_text|>");
        assert_eq!(config.eos_token, "<|eot_id|>");
    }

    #[test]
    fn test_default_keys() {
        let config = PreferenceConfig::default();
        assert_eq!(config.chosen_key, "chosen");
        assert_eq!(config.rejected_key, "rejected");
        assert!(config.prompt_key.is_none());
        assert!(!config.is_dpo);
    }
}
