//! Typed Gemini v1beta `generateContent` request schema.
//!
//! Incoming native Gemini requests are parsed into typed structs instead of
//! being passed through as raw `serde_json::Value`. Known fields get
//! compile-time access (the dispatcher rewrites `thinkingConfig` and `tools`
//! for virtual model suffixes); everything else survives via `extra`
//! catch-all maps at every level.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::content::{Content, Part};

/// Gemini `generateContent` / `streamGenerateContent` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerateContentRequest {
    /// Required conversation turns.
    pub contents: Vec<Content>,

    /// System-level instruction. Normalized on deserialization: role dropped,
    /// text parts merged, empty instructions become `None`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_system_instruction"
    )]
    pub system_instruction: Option<Content>,

    /// Generation parameters (temperature, topP, maxOutputTokens, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,

    /// Tool declarations (function calling, search grounding, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Tool-calling configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,

    /// Catch-all for unknown fields, including `safetySettings` and
    /// `cachedContent`.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl GeminiGenerateContentRequest {
    /// Overwrite `generationConfig.thinkingConfig.thinkingBudget`, creating
    /// the intermediate objects when absent.
    pub fn set_thinking_budget(&mut self, budget: i64) {
        let gc = self.generation_config.get_or_insert_with(Default::default);
        match gc.thinking_config.as_mut().and_then(Value::as_object_mut) {
            Some(obj) => {
                obj.insert("thinkingBudget".to_string(), Value::from(budget));
            }
            None => {
                gc.thinking_config = Some(serde_json::json!({ "thinkingBudget": budget }));
            }
        }
    }

    /// Append a `googleSearch` tool declaration.
    pub fn enable_search_grounding(&mut self) {
        let mut extra = BTreeMap::new();
        extra.insert("googleSearch".to_string(), serde_json::json!({}));
        self.tools.get_or_insert_with(Vec::new).push(Tool {
            function_declarations: None,
            extra,
        });
    }
}

/// `generationConfig` object.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Kept as raw value for transparent pass-through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `tools[]` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_declarations: Option<Vec<Value>>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `toolConfig` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_calling_config: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn deserialize_system_instruction<'de, D>(deserializer: D) -> Result<Option<Content>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(content) = Option::<Content>::deserialize(deserializer)? else {
        return Ok(None);
    };

    let merged_text = content
        .parts
        .into_iter()
        .filter_map(|part| part.text.filter(|text| !text.trim().is_empty()))
        .collect::<Vec<_>>()
        .join("\n\n");

    Ok((!merged_text.is_empty()).then(|| Content {
        role: None,
        parts: vec![Part {
            text: Some(merged_text),
            ..Default::default()
        }],
        extra: BTreeMap::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_request_deserializes_with_defaults() {
        let req: GeminiGenerateContentRequest =
            serde_json::from_value(json!({"contents": []})).unwrap();
        assert!(req.contents.is_empty());
        assert!(req.system_instruction.is_none());
        assert!(req.generation_config.is_none());
        assert!(req.tools.is_none());
        assert!(req.extra.is_empty());
    }

    #[test]
    fn missing_contents_rejected() {
        let err = serde_json::from_value::<GeminiGenerateContentRequest>(json!({})).unwrap_err();
        assert!(err.to_string().contains("contents"));
    }

    #[test]
    fn full_request_roundtrips() {
        let input = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": "hello"}]
            }],
            "systemInstruction": {
                "parts": [{"text": "be helpful"}]
            },
            "generationConfig": {
                "temperature": 0.7,
                "topP": 0.9,
                "topK": 40,
                "maxOutputTokens": 1024,
                "stopSequences": ["END"],
                "thinkingConfig": {"thinkingBudget": 2048}
            },
            "tools": [{"functionDeclarations": []}],
            "toolConfig": {"functionCallingConfig": {"mode": "AUTO"}},
            "safetySettings": [{"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"}]
        });

        let req: GeminiGenerateContentRequest = serde_json::from_value(input.clone()).unwrap();

        assert_eq!(req.contents.len(), 1);
        let gc = req.generation_config.as_ref().unwrap();
        assert_eq!(gc.temperature, Some(0.7));
        assert_eq!(gc.max_output_tokens, Some(1024));
        assert_eq!(gc.extra.get("stopSequences"), Some(&json!(["END"])));
        assert_eq!(gc.thinking_config, Some(json!({"thinkingBudget": 2048})));

        let output = serde_json::to_value(&req).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn system_instruction_role_dropped_and_text_merged() {
        let req: GeminiGenerateContentRequest = serde_json::from_value(json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "systemInstruction": {
                "role": "user",
                "parts": [{"text": "be"}, {"text": "precise"}]
            }
        }))
        .unwrap();

        let si = req.system_instruction.unwrap();
        assert!(si.role.is_none());
        assert_eq!(si.parts.len(), 1);
        assert_eq!(si.parts[0].text.as_deref(), Some("be\n\nprecise"));
    }

    #[test]
    fn system_instruction_without_text_becomes_none() {
        let req: GeminiGenerateContentRequest = serde_json::from_value(json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "systemInstruction": {
                "parts": [{"inlineData": {"mimeType": "image/png", "data": "abc"}}]
            }
        }))
        .unwrap();

        assert!(req.system_instruction.is_none());
    }

    #[test]
    fn set_thinking_budget_creates_missing_config() {
        let mut req: GeminiGenerateContentRequest =
            serde_json::from_value(json!({"contents": []})).unwrap();

        req.set_thinking_budget(0);
        let gc = req.generation_config.as_ref().unwrap();
        assert_eq!(gc.thinking_config, Some(json!({"thinkingBudget": 0})));
    }

    #[test]
    fn set_thinking_budget_preserves_sibling_fields() {
        let mut req: GeminiGenerateContentRequest = serde_json::from_value(json!({
            "contents": [],
            "generationConfig": {
                "thinkingConfig": {"includeThoughts": true, "thinkingBudget": 1024}
            }
        }))
        .unwrap();

        req.set_thinking_budget(32768);
        let gc = req.generation_config.as_ref().unwrap();
        assert_eq!(
            gc.thinking_config,
            Some(json!({"includeThoughts": true, "thinkingBudget": 32768}))
        );
    }

    #[test]
    fn enable_search_grounding_appends_tool() {
        let mut req: GeminiGenerateContentRequest = serde_json::from_value(json!({
            "contents": [],
            "tools": [{"functionDeclarations": [{"name": "f", "description": "d"}]}]
        }))
        .unwrap();

        req.enable_search_grounding();
        let tools = req.tools.as_ref().unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools[1].extra.contains_key("googleSearch"));
    }

    #[test]
    fn unknown_fields_preserved_in_extra() {
        let req: GeminiGenerateContentRequest = serde_json::from_value(json!({
            "contents": [{"parts": [{"text": "ping"}]}],
            "cachedContent": "projects/foo/cachedContents/bar"
        }))
        .unwrap();

        assert_eq!(
            req.extra.get("cachedContent"),
            Some(&json!("projects/foo/cachedContents/bar"))
        );
    }
}
