//! Conversation content types for Promptweave.
//!
//! A prompt or a model output is an ordered list of [`ContentPart`]s: plain
//! text, file blobs, function calls, function responses, or structured JSON.
//! Parts carry a canonical total order ([`ContentPart::canonical_cmp`]) used
//! to reconcile history branches produced by concurrent step completions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a model conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// One element of a prompt or a model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },

    /// A file blob (data is base64-encoded).
    File {
        name: String,
        mime_type: String,
        data: String,
    },

    /// A function call requested by the model.
    FunctionCall {
        id: String,
        name: String,
        arguments: Value,
    },

    /// The answer to a previously requested function call.
    FunctionResponse { name: String, output: Value },

    /// Structured JSON output.
    Structured { value: Value },
}

impl ContentPart {
    /// Shorthand for a text part.
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// The text of this part, if it is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, ContentPart::FunctionCall { .. })
    }

    /// Rank used to order parts of different kinds.
    fn kind_rank(&self) -> u8 {
        match self {
            ContentPart::Text { .. } => 0,
            ContentPart::File { .. } => 1,
            ContentPart::FunctionCall { .. } => 2,
            ContentPart::FunctionResponse { .. } => 3,
            ContentPart::Structured { .. } => 4,
        }
    }

    /// Canonical total order over content parts.
    ///
    /// Parts of different kinds order by kind; parts of the same kind order
    /// by their bytes (text, file data) or name (function call/response),
    /// with JSON payloads compared by their serialized form.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        let by_kind = self.kind_rank().cmp(&other.kind_rank());
        if by_kind != Ordering::Equal {
            return by_kind;
        }
        match (self, other) {
            (ContentPart::Text { text: a }, ContentPart::Text { text: b }) => {
                a.as_bytes().cmp(b.as_bytes())
            }
            (
                ContentPart::File {
                    name: an,
                    mime_type: am,
                    data: ad,
                },
                ContentPart::File {
                    name: bn,
                    mime_type: bm,
                    data: bd,
                },
            ) => an
                .cmp(bn)
                .then_with(|| am.cmp(bm))
                .then_with(|| ad.as_bytes().cmp(bd.as_bytes())),
            (
                ContentPart::FunctionCall {
                    name: an,
                    arguments: aa,
                    ..
                },
                ContentPart::FunctionCall {
                    name: bn,
                    arguments: ba,
                    ..
                },
            ) => an.cmp(bn).then_with(|| cmp_values(aa, ba)),
            (
                ContentPart::FunctionResponse {
                    name: an,
                    output: ao,
                },
                ContentPart::FunctionResponse {
                    name: bn,
                    output: bo,
                },
            ) => an.cmp(bn).then_with(|| cmp_values(ao, bo)),
            (ContentPart::Structured { value: a }, ContentPart::Structured { value: b }) => {
                cmp_values(a, b)
            }
            _ => Ordering::Equal,
        }
    }
}

/// Compare two JSON values by their serialized form.
fn cmp_values(a: &Value, b: &Value) -> Ordering {
    let a = serde_json::to_string(a).unwrap_or_default();
    let b = serde_json::to_string(b).unwrap_or_default();
    a.cmp(&b)
}

/// A single message in a model conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: MessageRole::User,
            parts,
        }
    }

    pub fn tool(parts: Vec<ContentPart>) -> Self {
        Self {
            role: MessageRole::Tool,
            parts,
        }
    }
}

/// A fully rendered conversation, ready to hand to a model provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationPrompt {
    pub messages: Vec<Message>,
}

impl ConversationPrompt {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// All parts of all messages, in order.
    pub fn parts(&self) -> Vec<ContentPart> {
        self.messages
            .iter()
            .flat_map(|m| m.parts.iter().cloned())
            .collect()
    }
}

/// The terminal output of a pipeline run: a plain string, or an ordered
/// list of parts when the final step produced more than text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl OutputValue {
    /// Collapse a part list into the simplest faithful representation.
    pub fn from_parts(parts: Vec<ContentPart>) -> Self {
        match parts.as_slice() {
            [ContentPart::Text { text }] => OutputValue::Text(text.clone()),
            _ => OutputValue::Parts(parts),
        }
    }

    /// The output as text, if it is a single text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutputValue::Text(text) => Some(text),
            OutputValue::Parts(parts) => match parts.as_slice() {
                [ContentPart::Text { text }] => Some(text),
                _ => None,
            },
        }
    }
}
