//! Google Code Assist internal wire shapes.
//!
//! The internal endpoint wraps the public Gemini request inside
//! `{"model", "project", "request"}` and wraps the public response inside
//! `{"response": {...}, "modelVersion": ...}`. These types model both sides
//! of that envelope; `From<CodeAssistResponseBody>` performs the unwrap.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::gemini::{Candidate, GeminiGenerateContentRequest, GeminiResponseBody};

/// Upstream request envelope for `v1internal:generateContent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAssistEnvelope {
    pub model: String,
    pub project: String,
    pub request: GeminiGenerateContentRequest,
}

impl CodeAssistEnvelope {
    pub fn new(
        model: impl Into<String>,
        project: impl Into<String>,
        request: GeminiGenerateContentRequest,
    ) -> Self {
        Self {
            model: model.into(),
            project: project.into(),
            request,
        }
    }
}

/// Upstream response envelope; one frame of an SSE stream or a whole unary
/// body.
#[derive(Debug, Deserialize)]
pub struct CodeAssistResponseBody {
    #[serde(rename = "response")]
    pub inner: CodeAssistResponseObject,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAssistResponseObject {
    #[serde(default)]
    pub candidates: Vec<Candidate>,

    pub prompt_feedback: Option<Value>,

    pub usage_metadata: Option<Value>,

    pub model_version: Option<String>,

    pub response_id: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl From<CodeAssistResponseBody> for GeminiResponseBody {
    fn from(body: CodeAssistResponseBody) -> Self {
        let inner = body.inner;
        GeminiResponseBody {
            candidates: inner.candidates,
            prompt_feedback: inner.prompt_feedback,
            usage_metadata: inner.usage_metadata,
            model_version: inner.model_version,
            response_id: inner.response_id,
            extra: inner.extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_roundtrips() {
        let input = json!({
            "model": "gemini-2.5-pro",
            "project": "project-1",
            "request": {
                "contents": [{"role": "user", "parts": [{"text": "ping"}]}]
            }
        });

        let body: CodeAssistEnvelope = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(body.model, "gemini-2.5-pro");
        assert_eq!(serde_json::to_value(body).unwrap(), input);
    }

    #[test]
    fn response_unwraps_to_public_shape() {
        let raw = json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "pong"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"totalTokenCount": 7},
                "modelVersion": "gemini-2.5-flash"
            }
        });

        let envelope: CodeAssistResponseBody = serde_json::from_value(raw).unwrap();
        let public: GeminiResponseBody = envelope.into();

        assert_eq!(public.first_candidate_text(), "pong");
        assert_eq!(public.model_version.as_deref(), Some("gemini-2.5-flash"));
        // The `response` wrapper must not survive the unwrap.
        let out = serde_json::to_value(&public).unwrap();
        assert!(out.get("response").is_none());
        assert!(out.get("candidates").is_some());
    }

    #[test]
    fn unknown_envelope_fields_preserved() {
        let raw = json!({
            "response": {
                "candidates": [],
                "createTime": "2025-01-01T00:00:00Z"
            }
        });

        let public: GeminiResponseBody =
            serde_json::from_value::<CodeAssistResponseBody>(raw).unwrap().into();
        assert!(public.extra.contains_key("createTime"));
    }
}
