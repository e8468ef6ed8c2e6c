use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Normalized request family used as the third component of a pricing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Chat,
    Completion,
    Responses,
    Embedding,
    AudioSpeech,
    AudioTranscription,
    ImageGeneration,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Completion => "completion",
            Mode::Responses => "responses",
            Mode::Embedding => "embedding",
            Mode::AudioSpeech => "audio_speech",
            Mode::AudioTranscription => "audio_transcription",
            Mode::ImageGeneration => "image_generation",
        }
    }

    /// Parses a mode string, returning `None` for anything not in the
    /// recognized set (callers treat that as "unknown").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Mode::Chat),
            "completion" => Some(Mode::Completion),
            "responses" => Some(Mode::Responses),
            "embedding" => Some(Mode::Embedding),
            "audio_speech" => Some(Mode::AudioSpeech),
            "audio_transcription" => Some(Mode::AudioTranscription),
            "image_generation" => Some(Mode::ImageGeneration),
            _ => None,
        }
    }

    /// Fixed scan order used by `GetPricingForModel` when no explicit mode
    /// is requested.
    pub const SCAN_ORDER: [Mode; 6] = [
        Mode::Completion,
        Mode::Chat,
        Mode::Responses,
        Mode::Embedding,
        Mode::AudioSpeech,
        Mode::AudioTranscription,
    ];

    pub fn is_responses_family(self) -> bool {
        matches!(self, Mode::Responses)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage band selecting a pricing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Base,
    Above128k,
    Above200k,
}

impl Tier {
    /// `above_200k` if `total_tokens > 200_000`; else `above_128k` if
    /// `> 128_000`; else `base`.
    pub fn select(total_tokens: i64) -> Self {
        if total_tokens > 200_000 {
            Tier::Above200k
        } else if total_tokens > 128_000 {
            Tier::Above128k
        } else {
            Tier::Base
        }
    }
}

/// A pricing key: `(model, provider, mode)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PricingKey {
    pub model: String,
    pub provider: String,
    pub mode: Mode,
}

/// Dollars-per-unit pricing for one `(model, provider, mode)` triple.
///
/// All optional fields are nullable; absence means "fall back to the next
/// lower tier, ultimately the base rate". Numeric fields are dollars per
/// unit (token, character, image, second) in double precision — no rounding
/// happens anywhere in this struct or the cost calculator built on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingRow {
    /// Base input rate. `None` behaves as `0.0` for calculation purposes,
    /// but stays an `Option` so the override engine's "non-nil field wins"
    /// patch rule applies uniformly across every pricing dimension.
    pub input_cost_per_token: Option<f64>,
    pub output_cost_per_token: Option<f64>,

    pub cache_read_cost_per_token: Option<f64>,
    pub cache_creation_cost_per_token: Option<f64>,

    pub above_128k_input_cost_per_token: Option<f64>,
    pub above_128k_output_cost_per_token: Option<f64>,
    pub above_128k_cache_read_cost_per_token: Option<f64>,
    pub above_128k_cache_creation_cost_per_token: Option<f64>,

    pub above_200k_input_cost_per_token: Option<f64>,
    pub above_200k_output_cost_per_token: Option<f64>,
    pub above_200k_cache_read_cost_per_token: Option<f64>,
    pub above_200k_cache_creation_cost_per_token: Option<f64>,

    pub input_cost_per_character: Option<f64>,
    pub output_cost_per_character: Option<f64>,

    /// Flat per-image rate, used when an image-generation response reports
    /// no token counts at all.
    pub input_cost_per_image: Option<f64>,
    pub above_128k_input_cost_per_image: Option<f64>,

    /// Image-specific token rates, used instead of the generic per-token
    /// rate when splitting an image response's tokens into image/text.
    pub input_cost_per_image_token: Option<f64>,
    pub output_cost_per_image_token: Option<f64>,
    pub above_128k_input_cost_per_image_token: Option<f64>,
    pub above_128k_output_cost_per_image_token: Option<f64>,

    pub input_cost_per_second: Option<f64>,
    pub above_128k_input_cost_per_second: Option<f64>,

    /// Video-specific per-second output rate; `output_cost_per_second` is
    /// the generic fallback when this is absent.
    pub output_cost_per_video_second: Option<f64>,
    pub output_cost_per_second: Option<f64>,

    pub batch_input_cost_per_token: Option<f64>,
    pub batch_output_cost_per_token: Option<f64>,
}

impl PricingRow {
    pub fn base_input_per_token(&self) -> f64 {
        self.input_cost_per_token.unwrap_or(0.0)
    }

    pub fn base_output_per_token(&self) -> f64 {
        self.output_cost_per_token.unwrap_or(0.0)
    }

    pub fn tiered_input_per_token(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Above200k => self
                .above_200k_input_cost_per_token
                .or(self.above_128k_input_cost_per_token)
                .unwrap_or_else(|| self.base_input_per_token()),
            Tier::Above128k => self
                .above_128k_input_cost_per_token
                .unwrap_or_else(|| self.base_input_per_token()),
            Tier::Base => self.base_input_per_token(),
        }
    }

    pub fn tiered_output_per_token(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Above200k => self
                .above_200k_output_cost_per_token
                .or(self.above_128k_output_cost_per_token)
                .unwrap_or_else(|| self.base_output_per_token()),
            Tier::Above128k => self
                .above_128k_output_cost_per_token
                .unwrap_or_else(|| self.base_output_per_token()),
            Tier::Base => self.base_output_per_token(),
        }
    }

    pub fn tiered_cache_read_per_token(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Above200k => self
                .above_200k_cache_read_cost_per_token
                .or(self.above_128k_cache_read_cost_per_token)
                .or(self.cache_read_cost_per_token),
            Tier::Above128k => self
                .above_128k_cache_read_cost_per_token
                .or(self.cache_read_cost_per_token),
            Tier::Base => self.cache_read_cost_per_token,
        }
    }

    pub fn tiered_cache_creation_per_token(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Above200k => self
                .above_200k_cache_creation_cost_per_token
                .or(self.above_128k_cache_creation_cost_per_token)
                .or(self.cache_creation_cost_per_token),
            Tier::Above128k => self
                .above_128k_cache_creation_cost_per_token
                .or(self.cache_creation_cost_per_token),
            Tier::Base => self.cache_creation_cost_per_token,
        }
    }

    pub fn tiered_input_per_second(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Above200k | Tier::Above128k => {
                self.above_128k_input_cost_per_second.or(self.input_cost_per_second)
            }
            Tier::Base => self.input_cost_per_second,
        }
    }

    pub fn tiered_input_per_image(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Above200k | Tier::Above128k => {
                self.above_128k_input_cost_per_image.or(self.input_cost_per_image)
            }
            Tier::Base => self.input_cost_per_image,
        }
    }

    pub fn tiered_input_image_token(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Above200k | Tier::Above128k => self
                .above_128k_input_cost_per_image_token
                .or(self.input_cost_per_image_token),
            Tier::Base => self.input_cost_per_image_token,
        }
    }

    pub fn tiered_output_image_token(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::Above200k | Tier::Above128k => self
                .above_128k_output_cost_per_image_token
                .or(self.output_cost_per_image_token),
            Tier::Base => self.output_cost_per_image_token,
        }
    }
}

/// Normalizes a raw provider string per the catalog invariant: `vertex_ai*`
/// and `google-vertex` collapse to `vertex`; any string containing
/// `bedrock` collapses to `bedrock`; any string containing `cohere`
/// collapses to `cohere`; otherwise the string passes through unchanged
/// (lowercased).
pub fn normalize_provider(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("vertex_ai") || lower == "google-vertex" {
        "vertex".to_string()
    } else if lower.contains("bedrock") {
        "bedrock".to_string()
    } else if lower.contains("cohere") {
        "cohere".to_string()
    } else {
        lower
    }
}

/// Strips a trailing date suffix or provider prefix to compute the
/// canonical base model name used for model-equivalence queries, e.g.
/// `claude-3-5-sonnet-20241022` -> `claude-3-5-sonnet`.
pub fn base_model_name(model: &str) -> String {
    let without_prefix = model.rsplit('/').next().unwrap_or(model);
    let parts: Vec<&str> = without_prefix.split('-').collect();
    if let Some(last) = parts.last() {
        if last.len() == 8 && last.chars().all(|c| c.is_ascii_digit()) {
            return parts[..parts.len() - 1].join("-");
        }
    }
    without_prefix.to_string()
}

/// Usage details extracted from a provider response. Every field defaults
/// to zero/`None` because `CalculateCostFromUsage` must accept partially
/// populated (or entirely absent) usage when only audio or image data is
/// present — every field access below is guarded rather than assumed.
#[derive(Debug, Clone, Default)]
pub struct UsageRecord {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,

    pub cached_prompt_tokens: i64,
    pub cached_completion_tokens: i64,

    /// Seconds of audio, for TTS (`audio_speech`) or transcription
    /// (`audio_transcription`) responses billed per second.
    pub audio_seconds: f64,
    /// Audio-token count, for providers that bill audio by token instead
    /// of by second.
    pub audio_tokens: i64,

    /// Text-token share of the input, used alongside `audio_tokens` or the
    /// image-token fields below when a modality splits input into two
    /// token classes.
    pub input_text_tokens: i64,
    pub input_image_tokens: i64,
    pub output_text_tokens: i64,
    pub output_image_tokens: i64,

    pub video_seconds: f64,

    pub is_batch: bool,

    /// If the provider already reports a positive computed cost, it wins
    /// outright (no further calculation).
    pub provider_reported_cost: Option<f64>,
    /// Used as a fallback pricing-lookup key when `(model, provider, mode)`
    /// misses directly.
    pub deployment_id: Option<String>,
}

/// A map from a provider string (already normalized) to the model names
/// known under it — used internally by the catalog for `model_pool`.
pub type ModelPool = HashMap<String, std::collections::HashSet<String>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_provider_collapses_known_families() {
        assert_eq!(normalize_provider("vertex_ai-gemini"), "vertex");
        assert_eq!(normalize_provider("google-vertex"), "vertex");
        assert_eq!(normalize_provider("aws-bedrock-runtime"), "bedrock");
        assert_eq!(normalize_provider("cohere-v2"), "cohere");
        assert_eq!(normalize_provider("OpenAI"), "openai");
    }

    #[test]
    fn normalize_provider_is_idempotent() {
        for raw in ["vertex_ai", "google-vertex", "amazon-bedrock", "cohere", "openai"] {
            let once = normalize_provider(raw);
            let twice = normalize_provider(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn base_model_name_strips_date_suffix() {
        assert_eq!(base_model_name("claude-3-5-sonnet-20241022"), "claude-3-5-sonnet");
        assert_eq!(base_model_name("gpt-4o"), "gpt-4o");
        assert_eq!(
            base_model_name("bedrock/anthropic.claude-3-sonnet"),
            "anthropic.claude-3-sonnet"
        );
    }

    #[test]
    fn tier_selection_matches_spec_bands() {
        assert_eq!(Tier::select(50_000), Tier::Base);
        assert_eq!(Tier::select(128_001), Tier::Above128k);
        assert_eq!(Tier::select(200_001), Tier::Above200k);
        assert_eq!(Tier::select(200_000), Tier::Above128k);
    }

    #[test]
    fn tiered_rate_falls_back_through_bands() {
        let row = PricingRow {
            input_cost_per_token: Some(1.0),
            above_128k_input_cost_per_token: Some(2.0),
            ..Default::default()
        };
        assert_eq!(row.tiered_input_per_token(Tier::Base), 1.0);
        assert_eq!(row.tiered_input_per_token(Tier::Above128k), 2.0);
        // No above_200k override: falls back to the 128k rate.
        assert_eq!(row.tiered_input_per_token(Tier::Above200k), 2.0);
    }
}
