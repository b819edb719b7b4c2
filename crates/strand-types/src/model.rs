use serde::{Deserialize, Serialize};

/// What kind of input a model consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Modality {
    Text,
    Vision,
}

/// Immutable description of a loaded model.
///
/// Created by a successful `load_model`, destroyed by `unload_model` or
/// engine shutdown. All fields come from the runtime's load response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub family: String,
    pub modality: Modality,
    pub context_length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}
