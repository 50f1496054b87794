//! OpenAI chat-completions response shapes, built from Gemini responses.
//!
//! The schema crate stays free of clocks and id generators; callers supply
//! `id` and `created`.

use serde::{Deserialize, Serialize};

use crate::gemini::GeminiResponseBody;

/// Unary `chat.completion` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatDelta>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Streaming `chat.completion.chunk` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

fn map_finish_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "MAX_TOKENS" => "length",
            "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" | "BLOCKLIST" => "content_filter",
            _ => "stop",
        }
        .to_string()
    })
}

fn usage_from(resp: &GeminiResponseBody) -> Option<ChatUsage> {
    resp.usage_metadata.as_ref().map(|_| ChatUsage {
        prompt_tokens: resp.usage_count("promptTokenCount").unwrap_or(0),
        completion_tokens: resp.usage_count("candidatesTokenCount").unwrap_or(0),
        total_tokens: resp.usage_count("totalTokenCount").unwrap_or(0),
    })
}

impl ChatCompletion {
    /// Translate a whole Gemini response into a unary completion.
    pub fn from_gemini(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        resp: &GeminiResponseBody,
    ) -> Self {
        let finish_reason = resp
            .candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref());

        Self {
            id: id.into(),
            object: "chat.completion".to_string(),
            created,
            model: model.into(),
            choices: vec![ChatChoice {
                index: 0,
                message: Some(ChatDelta {
                    role: Some("assistant".to_string()),
                    content: Some(resp.first_candidate_text()),
                }),
                delta: None,
                finish_reason: map_finish_reason(finish_reason).or(Some("stop".to_string())),
            }],
            usage: usage_from(resp),
        }
    }
}

impl ChatCompletionChunk {
    /// Translate one Gemini stream frame into a chunk.
    ///
    /// `first` controls whether the delta carries the assistant role marker,
    /// which OpenAI clients expect exactly once per stream.
    pub fn from_gemini(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        resp: &GeminiResponseBody,
        first: bool,
    ) -> Self {
        let text = resp.first_candidate_text();
        let finish_reason = resp
            .candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref());

        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.into(),
            choices: vec![ChatChoice {
                index: 0,
                message: None,
                delta: Some(ChatDelta {
                    role: first.then(|| "assistant".to_string()),
                    content: (!text.is_empty()).then_some(text),
                }),
                finish_reason: map_finish_reason(finish_reason),
            }],
        }
    }

    /// A content-only chunk, used by the fake-stream chunker.
    pub fn from_text(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        text: impl Into<String>,
        first: bool,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.into(),
            choices: vec![ChatChoice {
                index: 0,
                message: None,
                delta: Some(ChatDelta {
                    role: first.then(|| "assistant".to_string()),
                    content: Some(text.into()),
                }),
                finish_reason: None,
            }],
        }
    }

    /// The closing chunk carrying only a finish reason.
    pub fn finish(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        reason: &str,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.into(),
            choices: vec![ChatChoice {
                index: 0,
                message: None,
                delta: Some(ChatDelta::default()),
                finish_reason: Some(reason.to_string()),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn gemini(value: Value) -> GeminiResponseBody {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn unary_translation_carries_text_and_usage() {
        let resp = gemini(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello!"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7}
        }));

        let completion = ChatCompletion::from_gemini("chatcmpl-1", 1700000000, "gemini-2.5-flash", &resp);
        assert_eq!(completion.object, "chat.completion");
        let message = completion.choices[0].message.as_ref().unwrap();
        assert_eq!(message.content.as_deref(), Some("Hello!"));
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.usage.as_ref().unwrap().total_tokens, 7);
    }

    #[test]
    fn max_tokens_maps_to_length() {
        let resp = gemini(json!({
            "candidates": [{"content": {"parts": [{"text": "…"}]}, "finishReason": "MAX_TOKENS"}]
        }));

        let completion = ChatCompletion::from_gemini("c", 0, "m", &resp);
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn chunk_role_emitted_once() {
        let resp = gemini(json!({
            "candidates": [{"content": {"parts": [{"text": "a"}]}}]
        }));

        let first = ChatCompletionChunk::from_gemini("c", 0, "m", &resp, true);
        let later = ChatCompletionChunk::from_gemini("c", 0, "m", &resp, false);

        assert_eq!(
            first.choices[0].delta.as_ref().unwrap().role.as_deref(),
            Some("assistant")
        );
        assert!(later.choices[0].delta.as_ref().unwrap().role.is_none());
    }

    #[test]
    fn finish_chunk_has_empty_delta() {
        let chunk = ChatCompletionChunk::finish("c", 0, "m", "stop");
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["choices"][0]["delta"], json!({}));
        assert_eq!(value["choices"][0]["finish_reason"], json!("stop"));
    }

    #[test]
    fn thought_parts_do_not_leak_into_content() {
        let resp = gemini(json!({
            "candidates": [{
                "content": {"parts": [
                    {"thought": true, "text": "scratchpad"},
                    {"text": "answer"}
                ]}
            }]
        }));

        let chunk = ChatCompletionChunk::from_gemini("c", 0, "m", &resp, false);
        assert_eq!(
            chunk.choices[0].delta.as_ref().unwrap().content.as_deref(),
            Some("answer")
        );
    }
}
