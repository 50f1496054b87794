//! Inbound model-name routing.
//!
//! A requested model id carries up to three kinds of decoration:
//!
//! - a streaming-mode prefix (`假流式/`, `流式抗截断/`),
//! - a thinking suffix (`-maxthinking`, `-nothinking`),
//! - a search suffix (`-search`).
//!
//! All three are recognized here, once, and exposed as a typed
//! [`ModelRoute`]; the rest of the crate never string-matches on model
//! names. The undecorated remainder is what goes upstream.

use castor_schema::gemini::GeminiGenerateContentRequest;

/// Prefix selecting unary-upstream/SSE-downstream emulation.
pub const FAKE_STREAM_PREFIX: &str = "假流式/";
/// Prefix selecting buffered ("anti-truncation") streaming.
pub const ANTI_TRUNCATION_PREFIX: &str = "流式抗截断/";

const MAXTHINKING_SUFFIX: &str = "-maxthinking";
const NOTHINKING_SUFFIX: &str = "-nothinking";
const SEARCH_SUFFIX: &str = "-search";

pub const MODEL_FLASH_25: &str = "gemini-2.5-flash";
pub const MODEL_PRO_25: &str = "gemini-2.5-pro";
pub const MODEL_PRO_30: &str = "gemini-3-pro-preview";
pub const MODEL_FLASH_IMAGE: &str = "gemini-2.5-flash-image";

/// How the downstream response is produced for a streaming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Real SSE pass-through.
    #[default]
    PassThrough,
    /// Unary upstream call, chunked into SSE locally.
    FakeStream,
    /// SSE upstream, fully buffered before re-emission.
    AntiTruncation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingVariant {
    #[default]
    Default,
    None,
    Max,
}

/// Credential capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Tier25,
    Tier30,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Tier25 => "2.5",
            ModelTier::Tier30 => "3",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        if s == "3" { ModelTier::Tier30 } else { ModelTier::Tier25 }
    }

    /// A tier-2.5 request accepts any credential; tier-3 requires tier-3.
    pub fn accepts(self, credential_tier: ModelTier) -> bool {
        match self {
            ModelTier::Tier25 => true,
            ModelTier::Tier30 => credential_tier == ModelTier::Tier30,
        }
    }
}

/// Cooldown scope for a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelGroup {
    Flash,
    Pro,
    Three,
}

impl ModelGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelGroup::Flash => "flash",
            ModelGroup::Pro => "pro",
            ModelGroup::Three => "30",
        }
    }
}

/// Tier required to serve `model` (an undecorated upstream id).
pub fn required_tier(model: &str) -> ModelTier {
    if model.to_ascii_lowercase().contains("gemini-3-") {
        ModelTier::Tier30
    } else {
        ModelTier::Tier25
    }
}

/// Cooldown group of `model` (an undecorated upstream id).
pub fn model_group(model: &str) -> ModelGroup {
    let lower = model.to_ascii_lowercase();
    if lower.contains("gemini-3-") {
        ModelGroup::Three
    } else if lower.contains("pro") {
        ModelGroup::Pro
    } else {
        ModelGroup::Flash
    }
}

/// Fully parsed inbound model id.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    /// Model id exactly as the client sent it.
    pub requested: String,
    /// Undecorated id sent upstream.
    pub upstream_model: String,
    pub mode: StreamMode,
    pub thinking: ThinkingVariant,
    pub search: bool,
}

impl ModelRoute {
    pub fn parse(raw: &str) -> Self {
        let requested = raw.to_string();

        let (mode, rest) = if let Some(rest) = raw.strip_prefix(FAKE_STREAM_PREFIX) {
            (StreamMode::FakeStream, rest)
        } else if let Some(rest) = raw.strip_prefix(ANTI_TRUNCATION_PREFIX) {
            (StreamMode::AntiTruncation, rest)
        } else {
            (StreamMode::PassThrough, raw)
        };

        let (rest, search) = match rest.strip_suffix(SEARCH_SUFFIX) {
            Some(rest) => (rest, true),
            None => (rest, false),
        };

        let (rest, thinking) = if let Some(rest) = rest.strip_suffix(MAXTHINKING_SUFFIX) {
            (rest, ThinkingVariant::Max)
        } else if let Some(rest) = rest.strip_suffix(NOTHINKING_SUFFIX) {
            (rest, ThinkingVariant::None)
        } else {
            (rest, ThinkingVariant::Default)
        };

        Self {
            requested,
            upstream_model: rest.to_string(),
            mode,
            thinking,
            search,
        }
    }

    pub fn required_tier(&self) -> ModelTier {
        required_tier(&self.upstream_model)
    }

    pub fn group(&self) -> ModelGroup {
        model_group(&self.upstream_model)
    }

    /// Rewrite the outgoing request for the virtual suffixes.
    pub fn apply_virtual_suffixes(&self, request: &mut GeminiGenerateContentRequest) {
        match self.thinking {
            ThinkingVariant::Default => {}
            ThinkingVariant::None => {
                // gemini-2.5-pro rejects a zero budget outright.
                let budget = if self.upstream_model == MODEL_PRO_25 { 128 } else { 0 };
                request.set_thinking_budget(budget);
            }
            ThinkingVariant::Max => {
                let budget = match self.group() {
                    ModelGroup::Flash => 24576,
                    ModelGroup::Pro | ModelGroup::Three => 32768,
                };
                request.set_thinking_budget(budget);
            }
        }

        if self.search {
            request.enable_search_grounding();
        }
    }
}

/// Every model id the proxy accepts, for static `/models` listings:
/// base × stream-mode prefix × thinking/search suffix, with tier-3 bases
/// included only when the caller can actually reach a tier-3 credential.
pub fn expanded_model_list(include_tier3: bool) -> Vec<String> {
    let mut bases = vec![MODEL_PRO_25, MODEL_FLASH_25];
    if include_tier3 {
        bases.push(MODEL_PRO_30);
    }

    let mut suffixes = vec![String::new()];
    for thinking in [MAXTHINKING_SUFFIX, NOTHINKING_SUFFIX] {
        suffixes.push(thinking.to_string());
        suffixes.push(format!("{thinking}{SEARCH_SUFFIX}"));
    }
    suffixes.push(SEARCH_SUFFIX.to_string());

    let mut out = Vec::new();
    for base in bases {
        for suffix in &suffixes {
            let decorated = format!("{base}{suffix}");
            out.push(decorated.clone());
            out.push(format!("{FAKE_STREAM_PREFIX}{decorated}"));
            out.push(format!("{ANTI_TRUNCATION_PREFIX}{decorated}"));
        }
    }
    out.push(MODEL_FLASH_IMAGE.to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_model_passes_through() {
        let route = ModelRoute::parse("gemini-2.5-flash");
        assert_eq!(route.upstream_model, "gemini-2.5-flash");
        assert_eq!(route.mode, StreamMode::PassThrough);
        assert_eq!(route.thinking, ThinkingVariant::Default);
        assert!(!route.search);
    }

    #[test]
    fn prefixes_select_stream_mode() {
        assert_eq!(
            ModelRoute::parse("假流式/gemini-2.5-pro").mode,
            StreamMode::FakeStream
        );
        assert_eq!(
            ModelRoute::parse("流式抗截断/gemini-2.5-pro").mode,
            StreamMode::AntiTruncation
        );
    }

    #[test]
    fn combined_decorations_strip_in_order() {
        let route = ModelRoute::parse("假流式/gemini-3-pro-preview-maxthinking-search");
        assert_eq!(route.upstream_model, "gemini-3-pro-preview");
        assert_eq!(route.mode, StreamMode::FakeStream);
        assert_eq!(route.thinking, ThinkingVariant::Max);
        assert!(route.search);
        assert_eq!(route.required_tier(), ModelTier::Tier30);
        assert_eq!(route.group(), ModelGroup::Three);
    }

    #[test]
    fn tier_gate_is_upward_only() {
        assert!(required_tier("gemini-2.5-flash").accepts(ModelTier::Tier30));
        assert!(required_tier("gemini-2.5-flash").accepts(ModelTier::Tier25));
        assert!(!required_tier("gemini-3-pro-preview").accepts(ModelTier::Tier25));
    }

    #[test]
    fn groups_cover_all_families() {
        assert_eq!(model_group("gemini-2.5-flash"), ModelGroup::Flash);
        assert_eq!(model_group("gemini-2.5-pro"), ModelGroup::Pro);
        assert_eq!(model_group("gemini-3-pro-preview"), ModelGroup::Three);
        assert_eq!(model_group("gemini-2.5-flash-image"), ModelGroup::Flash);
    }

    #[test]
    fn nothinking_budget_respects_pro_minimum() {
        let mut req: GeminiGenerateContentRequest =
            serde_json::from_value(json!({"contents": []})).unwrap();
        ModelRoute::parse("gemini-2.5-pro-nothinking").apply_virtual_suffixes(&mut req);
        assert_eq!(
            req.generation_config.unwrap().thinking_config,
            Some(json!({"thinkingBudget": 128}))
        );

        let mut req: GeminiGenerateContentRequest =
            serde_json::from_value(json!({"contents": []})).unwrap();
        ModelRoute::parse("gemini-2.5-flash-nothinking").apply_virtual_suffixes(&mut req);
        assert_eq!(
            req.generation_config.unwrap().thinking_config,
            Some(json!({"thinkingBudget": 0}))
        );
    }

    #[test]
    fn search_suffix_adds_grounding_tool() {
        let mut req: GeminiGenerateContentRequest =
            serde_json::from_value(json!({"contents": []})).unwrap();
        ModelRoute::parse("gemini-2.5-flash-search").apply_virtual_suffixes(&mut req);
        assert!(req.tools.unwrap()[0].extra.contains_key("googleSearch"));
    }

    #[test]
    fn listing_enumerates_every_combination() {
        let without = expanded_model_list(false);
        let with = expanded_model_list(true);

        // 2 bases × 6 suffix forms × 3 stream forms + image model.
        assert_eq!(without.len(), 2 * 6 * 3 + 1);
        assert_eq!(with.len(), 3 * 6 * 3 + 1);

        assert!(with.contains(&"流式抗截断/gemini-3-pro-preview-nothinking-search".to_string()));
        assert!(!without.iter().any(|m| m.contains("gemini-3-")));

        // Every listed id must parse back to a known upstream base.
        for id in &with {
            let route = ModelRoute::parse(id);
            assert!(
                [MODEL_PRO_25, MODEL_FLASH_25, MODEL_PRO_30, MODEL_FLASH_IMAGE]
                    .contains(&route.upstream_model.as_str()),
                "unexpected upstream id {} for {}",
                route.upstream_model,
                id
            );
        }
    }
}
