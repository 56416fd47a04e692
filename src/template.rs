// Much of this code was adapted from huggingface, for future reference
// https://github.com/huggingface/text-generation-inference/blob/main/router/src/infer/chat_template.rs
//
use crate::config::TokenizerConfig;
use minijinja::{Environment, Error, Template};
use minijinja_contrib::pycompat;
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, Default)]
pub(crate) struct ChatTemplateInputs<'a> {
    messages: Vec<Turn>,
    bos_token: Option<&'a str>,
    eos_token: Option<&'a str>,
    add_generation_prompt: bool,
}

/// One conversation turn. Content is either a plain string or a list of
/// typed parts for vision-bearing records.
#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct Turn {
    pub role: String,
    pub content: TurnContent,
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A single content element of a multimodal turn. Upstream records routinely
/// carry null placeholder fields for the variant they are not, which is why
/// both fields are optional and skipped when absent.
#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Clone)]
pub struct ChatTemplate {
    template: Template<'static, 'static>,
    bos_token: Option<String>,
    eos_token: Option<String>,
}

impl ChatTemplate {
    pub fn new(
        template: String,
        bos_token: Option<String>,
        eos_token: Option<String>,
    ) -> Self {
        let mut env = Box::new(Environment::new());
        // hf chat templates lean on python string methods like .strip()
        env.set_unknown_method_callback(pycompat::unknown_method_callback);

        let template_str = template.into_boxed_str();

        // leaking env and template_str as read-only, static resources for performance.
        let template = Box::leak(env)
            .template_from_str(Box::leak(template_str))
            .unwrap();

        Self {
            template,
            bos_token: bos_token.map(|token| token.as_str().to_string()),
            eos_token: eos_token.map(|token| token.as_str().to_string()),
        }
    }

    pub fn from_config(config: TokenizerConfig) -> Self {
        Self::new(
            config.chat_template,
            Some(config.bos_token),
            Some(config.eos_token),
        )
    }

    /// Render turns to a string. With `add_generation_prompt` the template
    /// appends its assistant header, which is how a prompt-only prefix is
    /// rendered for later stripping.
    pub fn apply(&self, messages: Vec<Turn>, add_generation_prompt: bool) -> Result<String, Error> {
        self.template.render(ChatTemplateInputs {
            messages,
            bos_token: self.bos_token.as_deref(),
            eos_token: self.eos_token.as_deref(),
            add_generation_prompt,
        })
    }
}

impl Turn {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: TurnContent::Text(content.to_string()),
        }
    }
}
