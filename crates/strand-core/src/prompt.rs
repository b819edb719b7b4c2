//! Prompt materialization.
//!
//! Templates are pure text substitution: `{{name}}` is replaced by the
//! scalar bound to `name`, and nothing else happens. Values are never parsed,
//! re-expanded, or evaluated: a value containing `{{...}}` passes through
//! literally. The scalar-only value domain is enforced before any rendering.

use std::collections::BTreeMap;

use strand_types::{EngineError, PromptInput, PromptTemplate, TemplateValue};

/// Prompt as it goes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePrompt {
    Text(String),
    /// Pre-tokenized ids, forwarded opaquely.
    Tokens(Vec<u32>),
}

/// Expand a template into its final text.
///
/// The output depends only on `template.text` and `template.variables`.
/// Placeholders without a binding stay verbatim.
pub fn fill_template(template: &PromptTemplate) -> Result<String, EngineError> {
    validate_variables(&template.variables)?;

    let text = template.text.as_str();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = &after[..end];
                match template.variables.get(name) {
                    Some(value) => out.push_str(&value.render()),
                    None => {
                        out.push_str("{{");
                        out.push_str(name);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated opener: emit the remainder verbatim.
                out.push_str("{{");
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn validate_variables(variables: &BTreeMap<String, TemplateValue>) -> Result<(), EngineError> {
    for (name, value) in variables {
        if name.is_empty() {
            return Err(EngineError::InvalidArgument {
                message: "template variable name is empty".into(),
            });
        }
        if !value.is_valid() {
            return Err(EngineError::InvalidArgument {
                message: format!("template variable '{name}' is not a finite scalar"),
            });
        }
    }
    Ok(())
}

/// Turn caller-supplied prompt input into its wire form.
pub fn materialize(input: &PromptInput) -> Result<WirePrompt, EngineError> {
    match input {
        PromptInput::Text(text) => Ok(WirePrompt::Text(text.clone())),
        PromptInput::Tokens(ids) => {
            if ids.is_empty() {
                return Err(EngineError::InvalidArgument {
                    message: "prompt token array is empty".into(),
                });
            }
            Ok(WirePrompt::Tokens(ids.clone()))
        }
        PromptInput::Template(template) => Ok(WirePrompt::Text(fill_template(template)?)),
    }
}
