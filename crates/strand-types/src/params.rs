use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// SLA class of a request. Tier 0 (`Urgent`) is selected first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    pub const TIERS: usize = 5;

    /// Numeric tier, 0 = most urgent.
    pub fn tier(self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }

    pub fn from_tier(tier: usize) -> Option<Self> {
        match tier {
            0 => Some(Priority::Urgent),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            4 => Some(Priority::Background),
            _ => None,
        }
    }

    /// One tier more urgent; saturates at `Urgent`.
    pub fn promoted(self) -> Self {
        Priority::from_tier(self.tier().saturating_sub(1)).unwrap_or(Priority::Urgent)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// A scalar value a prompt template may substitute.
///
/// Deliberately closed: strings, finite numbers, and booleans only. Template
/// rendering performs pure text substitution; values are never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl TemplateValue {
    /// Render the scalar as substitution text. Non-finite numbers are
    /// rejected at validation time, before rendering.
    pub fn render(&self) -> String {
        match self {
            TemplateValue::String(s) => s.clone(),
            TemplateValue::Number(n) => {
                // Integral values print without a trailing ".0".
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            TemplateValue::Bool(b) => b.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            TemplateValue::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

/// A prompt template: literal text with `{{name}}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub text: String,
    /// Substitution values, keyed by placeholder name.
    #[serde(default)]
    pub variables: BTreeMap<String, TemplateValue>,
}

/// The prompt a generation request carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    /// Raw prompt text, forwarded as-is.
    Text(String),
    /// Pre-tokenized ids, opaque to the gateway.
    Tokens(Vec<u32>),
    /// Template expanded by the gateway before dispatch.
    Template(PromptTemplate),
}

/// Structured-output mode forwarded to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GuidanceMode {
    JsonSchema,
    Xml,
}

/// Guidance block for structured output. The runtime enforces it; the
/// gateway only validates the mode, never the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guidance {
    pub mode: GuidanceMode,
    pub schema: serde_json::Value,
}

/// Everything a `generate` call sends to the runtime worker.
///
/// Sampling fields are passed through opaquely; the gateway neither clamps
/// nor reinterprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateParams {
    pub model_id: String,
    pub prompt: PromptInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_token_ids: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<Guidance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_model: Option<String>,
}

impl GenerateParams {
    /// Minimal params: a model and a raw text prompt.
    pub fn text(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: PromptInput::Text(prompt.into()),
            max_tokens: None,
            temperature: None,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
            repetition_penalty: None,
            stop_sequences: None,
            stop_token_ids: None,
            seed: None,
            guidance: None,
            draft_model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_tiers_round_trip() {
        for tier in 0..Priority::TIERS {
            let p = Priority::from_tier(tier).expect("tier in range");
            assert_eq!(p.tier(), tier);
        }
        assert!(Priority::from_tier(5).is_none());
    }

    #[test]
    fn promotion_saturates_at_urgent() {
        assert_eq!(Priority::Background.promoted(), Priority::Low);
        assert_eq!(Priority::Urgent.promoted(), Priority::Urgent);
    }

    #[test]
    fn template_value_renders_integers_cleanly() {
        assert_eq!(TemplateValue::Number(3.0).render(), "3");
        assert_eq!(TemplateValue::Number(2.5).render(), "2.5");
        assert_eq!(TemplateValue::Bool(true).render(), "true");
    }

    #[test]
    fn non_finite_numbers_are_invalid() {
        assert!(!TemplateValue::Number(f64::NAN).is_valid());
        assert!(!TemplateValue::Number(f64::INFINITY).is_valid());
        assert!(TemplateValue::Number(0.0).is_valid());
    }

    #[test]
    fn prompt_input_deserializes_untagged() {
        let text: PromptInput = serde_json::from_value(serde_json::json!("hello")).unwrap();
        assert!(matches!(text, PromptInput::Text(_)));
        let tokens: PromptInput = serde_json::from_value(serde_json::json!([1, 2, 3])).unwrap();
        assert!(matches!(tokens, PromptInput::Tokens(_)));
    }
}
