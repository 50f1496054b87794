use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single conversation turn or system instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    /// Usually `"user"` or `"model"`. Absent for `systemInstruction`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Ordered parts that constitute a single message.
    #[serde(default)]
    pub parts: Vec<Part>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Content {
    /// A text-only content with the given role.
    pub fn text(role: impl Into<Option<String>>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            parts: vec![Part {
                text: Some(text.into()),
                ..Default::default()
            }],
            extra: BTreeMap::new(),
        }
    }

    /// Concatenated plain text of all non-thought parts.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter(|part| part.thought != Some(true))
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// One atomic piece of content inside a `Content` turn.
///
/// `text` is the most common variant; other part types are modeled as raw
/// values for transparent pass-through, and unrecognized fields are
/// preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Model-thought marker; thought parts are excluded from plain-text views.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,

    /// Opaque reusable thought signature (base64 string).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,

    /// Inline text data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Inline media bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Value>,

    /// Function call produced by the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,

    /// Function response used as context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<Value>,

    /// URI-based file data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_is_transparent_string() {
        let input = json!({
            "role": "user",
            "parts": [{"text": "x"}]
        });

        let content: Content = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(content.role.as_deref(), Some("user"));
        assert_eq!(serde_json::to_value(&content).unwrap(), input);
    }

    #[test]
    fn joined_text_skips_thought_parts() {
        let content: Content = serde_json::from_value(json!({
            "role": "model",
            "parts": [
                {"thought": true, "text": "internal plan"},
                {"text": "Hello"},
                {"text": ", world"}
            ]
        }))
        .unwrap();

        assert_eq!(content.joined_text(), "Hello, world");
    }

    #[test]
    fn function_call_and_response_parts_preserved() {
        let input = json!([
            {
                "role": "model",
                "parts": [{
                    "functionCall": {"name": "get_weather", "args": {"city": "London"}}
                }]
            },
            {
                "role": "user",
                "parts": [{
                    "functionResponse": {"name": "get_weather", "response": {"temperature": 15}}
                }]
            }
        ]);

        let contents: Vec<Content> = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(serde_json::to_value(&contents).unwrap(), input);
    }

    #[test]
    fn unknown_part_fields_preserved_in_extra() {
        let content: Content = serde_json::from_value(json!({
            "role": "user",
            "parts": [{
                "text": "look",
                "videoMetadata": {"startOffset": "1s"}
            }]
        }))
        .unwrap();

        assert!(content.parts[0].extra.contains_key("videoMetadata"));
    }
}
