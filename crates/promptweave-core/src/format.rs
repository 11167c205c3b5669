//! Prompt formatter seam.
//!
//! Rendering a step's template into a [`ConversationPrompt`] is the job of
//! an external templating collaborator; the core only defines the seam.
//! [`SimpleFormatter`] is the built-in minimal implementation: single-pass
//! `{{ name }}` substitution from the variable set, unknown references left
//! as-is.

use serde_json::Value;

use promptweave_types::content::{ContentPart, ConversationPrompt, Message};
use promptweave_types::error::FormatError;

/// Renders a prompt template against the merged variable set.
pub trait PromptFormatter: Send + Sync {
    /// `vars` is a JSON object: global variables overlaid with context
    /// variables plus `$history` and `$output`. `mime_types`, when present,
    /// restricts which file parts the target provider accepts.
    fn format(
        &self,
        template: &str,
        vars: &Value,
        mime_types: Option<&[String]>,
    ) -> Result<ConversationPrompt, FormatError>;
}

/// Minimal `{{ name }}` substitution formatter producing a single user
/// message.
#[derive(Debug, Default, Clone)]
pub struct SimpleFormatter;

impl SimpleFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl PromptFormatter for SimpleFormatter {
    fn format(
        &self,
        template: &str,
        vars: &Value,
        _mime_types: Option<&[String]>,
    ) -> Result<ConversationPrompt, FormatError> {
        let rendered = resolve_template(template, vars);
        Ok(ConversationPrompt::new(vec![Message::user(vec![
            ContentPart::text(rendered),
        ])]))
    }
}

/// Replace `{{ name }}` markers with the named variable's display value.
/// Unknown references are left as-is (not an error).
fn resolve_template(template: &str, vars: &Value) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match vars.get(name) {
                    Some(value) => result.push_str(&value_to_string(value)),
                    None => {
                        result.push_str("{{");
                        result.push_str(&after[..end]);
                        result.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                result.push_str("{{");
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}

/// Convert a JSON value to a display string for template resolution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolves_variables() {
        let vars = json!({"topic": "rust", "count": 3});
        let out = resolve_template("Write {{ count }} facts about {{ topic }}.", &vars);
        assert_eq!(out, "Write 3 facts about rust.");
    }

    #[test]
    fn test_unknown_reference_left_as_is() {
        let vars = json!({});
        let out = resolve_template("Hello {{ missing }}!", &vars);
        assert_eq!(out, "Hello {{ missing }}!");
    }

    #[test]
    fn test_object_values_render_as_json() {
        let vars = json!({"payload": {"a": 1}});
        let out = resolve_template("data: {{ payload }}", &vars);
        assert_eq!(out, r#"data: {"a":1}"#);
    }

    #[test]
    fn test_unterminated_marker() {
        let vars = json!({"x": 1});
        let out = resolve_template("broken {{ x", &vars);
        assert_eq!(out, "broken {{ x");
    }

    #[test]
    fn test_formatter_produces_user_message() {
        let prompt = SimpleFormatter::new()
            .format("Say {{ word }}", &json!({"word": "hi"}), None)
            .unwrap();
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].parts[0].as_text(), Some("Say hi"));
    }
}
