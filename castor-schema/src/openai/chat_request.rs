//! OpenAI chat-completions request schema and its Gemini translation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::gemini::{Content, GeminiGenerateContentRequest, GenerationConfig, Part};

/// `POST /v1/chat/completions` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,

    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One chat turn. `content` may be a plain string or an array of typed parts
/// (only the `text` parts are forwarded upstream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,

    #[serde(default)]
    pub content: Value,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChatMessage {
    /// Flatten string-or-parts content into plain text.
    pub fn plain_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| {
                    (part.get("type").and_then(Value::as_str) == Some("text"))
                        .then(|| part.get("text").and_then(Value::as_str))
                        .flatten()
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

impl ChatCompletionRequest {
    /// Translate to the Gemini `generateContent` shape.
    ///
    /// `system` messages merge into `systemInstruction`; `assistant` maps to
    /// the `model` role; everything else is forwarded as `user`.
    pub fn to_gemini(&self) -> GeminiGenerateContentRequest {
        let mut system_texts = Vec::new();
        let mut contents = Vec::new();

        for message in &self.messages {
            let text = message.plain_text();
            match message.role.as_str() {
                "system" | "developer" => {
                    if !text.trim().is_empty() {
                        system_texts.push(text);
                    }
                }
                "assistant" => contents.push(Content::text(Some("model".to_string()), text)),
                _ => contents.push(Content::text(Some("user".to_string()), text)),
            }
        }

        let system_instruction = (!system_texts.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part {
                text: Some(system_texts.join("\n\n")),
                ..Default::default()
            }],
            extra: BTreeMap::new(),
        });

        let generation_config = (self.temperature.is_some()
            || self.top_p.is_some()
            || self.max_tokens.is_some()
            || self.stop.is_some())
        .then(|| {
            let mut extra = BTreeMap::new();
            if let Some(stop) = &self.stop {
                let sequences = match stop {
                    Value::String(s) => Value::Array(vec![Value::String(s.clone())]),
                    other => other.clone(),
                };
                extra.insert("stopSequences".to_string(), sequences);
            }
            GenerationConfig {
                temperature: self.temperature,
                top_p: self.top_p,
                max_output_tokens: self.max_tokens,
                extra,
                ..Default::default()
            }
        });

        GeminiGenerateContentRequest {
            contents,
            system_instruction,
            generation_config,
            tools: None,
            tool_config: None,
            extra: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn roles_map_to_gemini() {
        let req = request(json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "bye"}
            ]
        }));

        let gemini = req.to_gemini();
        assert_eq!(gemini.contents.len(), 3);
        assert_eq!(gemini.contents[0].role.as_deref(), Some("user"));
        assert_eq!(gemini.contents[1].role.as_deref(), Some("model"));
        assert_eq!(
            gemini.system_instruction.unwrap().parts[0].text.as_deref(),
            Some("be terse")
        );
    }

    #[test]
    fn content_parts_array_flattened() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}},
                {"type": "text", "text": "second"}
            ]
        }))
        .unwrap();

        assert_eq!(msg.plain_text(), "first\nsecond");
    }

    #[test]
    fn sampling_params_become_generation_config() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.3,
            "top_p": 0.8,
            "max_tokens": 2048,
            "stop": "STOP"
        }));

        let gc = req.to_gemini().generation_config.unwrap();
        assert_eq!(gc.temperature, Some(0.3));
        assert_eq!(gc.top_p, Some(0.8));
        assert_eq!(gc.max_output_tokens, Some(2048));
        assert_eq!(gc.extra.get("stopSequences"), Some(&json!(["STOP"])));
    }

    #[test]
    fn no_sampling_params_no_generation_config() {
        let req = request(json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "hi"}]
        }));

        assert!(!req.stream);
        assert!(req.to_gemini().generation_config.is_none());
    }
}
