//! Modality-aware cost calculation over a resolved [`PricingRow`].
//!
//! All costs accumulate in `f64`; nothing here rounds intermediate values,
//! per the numeric semantics mandated for the pricing lookup.

use crate::catalog::types::{Mode, PricingRow, Tier, UsageRecord};

/// Describes the outcome of a cache lookup performed before falling
/// through to normal cost calculation.
#[derive(Debug, Clone)]
pub enum CacheDebugStatus {
    /// No cache layer configured; calculate normally.
    Disabled,
    /// Exact cache hit: the request cost nothing.
    DirectHit,
    /// Semantic cache hit: the stored embedding lookup is priced and
    /// returned on its own (the base response cost is not charged).
    SemanticHit { embedding_cost: f64 },
    /// Cache miss: the embedding lookup cost is added on top of the base
    /// cost.
    Miss { embedding_cost: f64 },
}

/// Computes the cost of one usage record against an already-resolved
/// pricing row (override patching, if any, must already have happened).
///
/// `mode` is the request's modality, used to select the dispatch path
/// directly rather than inferring it from which usage fields happen to be
/// populated — a zeroed `audio_speech` response and a zeroed `chat`
/// response both have every field at zero, but only the former prices as
/// "no audio".
///
/// `usage` may be a fully zeroed/default record — every field access is
/// guarded, per the "accept a nil usage" discipline the source product
/// requires when only audio or image data is present.
pub fn calculate_cost(row: &PricingRow, mode: Mode, usage: &UsageRecord) -> f64 {
    if let Some(reported) = usage.provider_reported_cost {
        if reported > 0.0 {
            return reported;
        }
    }

    let tier = Tier::select(usage.total_tokens);

    let base = match mode {
        Mode::AudioSpeech | Mode::AudioTranscription => {
            if usage.audio_seconds > 0.0 {
                audio_by_seconds_cost(row, usage, tier)
            } else {
                audio_by_token_cost(row, usage, tier)
            }
        }
        Mode::ImageGeneration => {
            if usage.input_image_tokens > 0 || usage.output_image_tokens > 0 {
                image_generation_token_cost(row, usage, tier)
            } else {
                image_generation_flat_cost(row, tier)
            }
        }
        _ if usage.video_seconds > 0.0 => video_generation_cost(row, usage, tier),
        _ if usage.is_batch => batch_cost(row, usage),
        _ => default_cost(row, usage, tier),
    };

    base.max(0.0)
}

fn audio_by_seconds_cost(row: &PricingRow, usage: &UsageRecord, tier: Tier) -> f64 {
    let per_second = row.tiered_input_per_second(tier);
    let input_cost = match per_second {
        Some(rate) => usage.audio_seconds * rate,
        None => usage.prompt_tokens as f64 * row.tiered_input_per_token(tier),
    };
    let output_cost = usage.completion_tokens as f64 * row.tiered_output_per_token(tier);
    input_cost + output_cost
}

fn audio_by_token_cost(row: &PricingRow, usage: &UsageRecord, tier: Tier) -> f64 {
    let input_rate = row.tiered_input_per_token(tier);
    let input_cost =
        (usage.audio_tokens as f64 + usage.input_text_tokens as f64) * input_rate;
    let output_cost = usage.completion_tokens as f64 * row.tiered_output_per_token(tier);
    input_cost + output_cost
}

fn image_generation_flat_cost(row: &PricingRow, tier: Tier) -> f64 {
    row.tiered_input_per_image(tier).unwrap_or(0.0)
}

fn image_generation_token_cost(row: &PricingRow, usage: &UsageRecord, tier: Tier) -> f64 {
    let image_in_rate = row
        .tiered_input_image_token(tier)
        .unwrap_or_else(|| row.tiered_input_per_token(tier));
    let image_out_rate = row
        .tiered_output_image_token(tier)
        .unwrap_or_else(|| row.tiered_output_per_token(tier));

    let input_cost = usage.input_image_tokens as f64 * image_in_rate
        + usage.input_text_tokens as f64 * row.tiered_input_per_token(tier);
    let output_cost = usage.output_image_tokens as f64 * image_out_rate
        + usage.output_text_tokens as f64 * row.tiered_output_per_token(tier);
    input_cost + output_cost
}

fn video_generation_cost(row: &PricingRow, usage: &UsageRecord, tier: Tier) -> f64 {
    let per_video_second = row
        .output_cost_per_video_second
        .or(row.output_cost_per_second);
    let output_cost = per_video_second
        .map(|rate| usage.video_seconds * rate)
        .unwrap_or(0.0);
    let input_cost = if usage.prompt_tokens > 0 {
        usage.prompt_tokens as f64 * row.tiered_input_per_token(tier)
    } else {
        0.0
    };
    input_cost + output_cost
}

fn batch_cost(row: &PricingRow, usage: &UsageRecord) -> f64 {
    let input_rate = row
        .batch_input_cost_per_token
        .unwrap_or_else(|| row.base_input_per_token());
    let output_rate = row
        .batch_output_cost_per_token
        .unwrap_or_else(|| row.base_output_per_token());
    usage.prompt_tokens as f64 * input_rate + usage.completion_tokens as f64 * output_rate
}

fn default_cost(row: &PricingRow, usage: &UsageRecord, tier: Tier) -> f64 {
    let input_rate = row.tiered_input_per_token(tier);
    let output_rate = row.tiered_output_per_token(tier);

    let billable_prompt = (usage.prompt_tokens - usage.cached_prompt_tokens).max(0);
    let billable_completion = (usage.completion_tokens - usage.cached_completion_tokens).max(0);

    let mut cost = billable_prompt as f64 * input_rate + billable_completion as f64 * output_rate;

    if usage.cached_prompt_tokens > 0 {
        if let Some(rate) = row.tiered_cache_read_per_token(tier) {
            cost += usage.cached_prompt_tokens as f64 * rate;
        }
    }
    if usage.cached_completion_tokens > 0 {
        if let Some(rate) = row.tiered_cache_creation_per_token(tier) {
            cost += usage.cached_completion_tokens as f64 * rate;
        }
    }

    cost
}

/// Applies the cache-debug overlay described in the spec: a direct cache
/// hit costs nothing; a semantic hit is priced purely as the embedding
/// lookup; a miss adds the embedding lookup cost on top of `base_cost`.
pub fn apply_cache_debug_overlay(base_cost: f64, status: &CacheDebugStatus) -> f64 {
    match status {
        CacheDebugStatus::Disabled => base_cost,
        CacheDebugStatus::DirectHit => 0.0,
        CacheDebugStatus::SemanticHit { embedding_cost } => *embedding_cost,
        CacheDebugStatus::Miss { embedding_cost } => base_cost + embedding_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(input: f64, output: f64) -> PricingRow {
        PricingRow {
            input_cost_per_token: Some(input),
            output_cost_per_token: Some(output),
            ..Default::default()
        }
    }

    #[test]
    fn sc1_basic_chat_pricing() {
        let r = row(0.000005, 0.000015);
        let usage = UsageRecord {
            prompt_tokens: 1000,
            completion_tokens: 500,
            total_tokens: 1500,
            ..Default::default()
        };
        let cost = calculate_cost(&r, Mode::Chat, &usage);
        assert!((cost - 0.0125).abs() < 1e-12);
    }

    #[test]
    fn cost_is_non_negative_for_zero_usage() {
        let r = row(0.01, 0.02);
        let usage = UsageRecord::default();
        assert_eq!(calculate_cost(&r, Mode::Chat, &usage), 0.0);
    }

    #[test]
    fn provider_reported_cost_wins_outright() {
        let r = row(1.0, 1.0);
        let usage = UsageRecord {
            prompt_tokens: 1000,
            provider_reported_cost: Some(0.5),
            ..Default::default()
        };
        assert_eq!(calculate_cost(&r, Mode::Chat, &usage), 0.5);
    }

    #[test]
    fn default_path_charges_cache_read_and_creation_separately() {
        let r = PricingRow {
            input_cost_per_token: Some(1.0),
            output_cost_per_token: Some(2.0),
            cache_read_cost_per_token: Some(0.1),
            cache_creation_cost_per_token: Some(0.5),
            ..Default::default()
        };
        let usage = UsageRecord {
            prompt_tokens: 100,
            cached_prompt_tokens: 40,
            completion_tokens: 10,
            cached_completion_tokens: 5,
            total_tokens: 110,
            ..Default::default()
        };
        // billable prompt: 60 * 1.0 = 60; cached prompt: 40 * 0.1 = 4
        // billable completion: 5 * 2.0 = 10; cached completion: 5 * 0.5 = 2.5
        let expected = 60.0 + 4.0 + 10.0 + 2.5;
        assert!((calculate_cost(&r, Mode::Chat, &usage) - expected).abs() < 1e-12);
    }

    #[test]
    fn audio_by_seconds_uses_tiered_per_second_rate() {
        let r = PricingRow {
            input_cost_per_second: Some(0.0001),
            above_128k_input_cost_per_second: Some(0.00005),
            output_cost_per_token: Some(0.00002),
            ..Default::default()
        };
        let usage = UsageRecord {
            audio_seconds: 60.0,
            completion_tokens: 10,
            total_tokens: 200_000,
            ..Default::default()
        };
        let expected = 60.0 * 0.00005 + 10.0 * 0.00002;
        assert!((calculate_cost(&r, Mode::AudioSpeech, &usage) - expected).abs() < 1e-12);
    }

    #[test]
    fn image_generation_flat_rate_used_when_all_tokens_zero() {
        let r = PricingRow {
            input_cost_per_image: Some(0.04),
            ..Default::default()
        };
        let usage = UsageRecord::default();
        assert_eq!(calculate_cost(&r, Mode::ImageGeneration, &usage), 0.04);
    }

    #[test]
    fn zeroed_chat_usage_does_not_route_through_image_pricing() {
        let r = PricingRow {
            input_cost_per_image: Some(0.04),
            ..Default::default()
        };
        let usage = UsageRecord::default();
        assert_eq!(calculate_cost(&r, Mode::Chat, &usage), 0.0);
    }

    #[test]
    fn video_generation_falls_back_to_generic_per_second_rate() {
        let r = PricingRow {
            output_cost_per_second: Some(0.1),
            ..Default::default()
        };
        let usage = UsageRecord {
            video_seconds: 5.0,
            ..Default::default()
        };
        assert_eq!(calculate_cost(&r, Mode::Chat, &usage), 0.5);
    }

    #[test]
    fn cache_debug_overlay_direct_hit_is_free() {
        assert_eq!(
            apply_cache_debug_overlay(5.0, &CacheDebugStatus::DirectHit),
            0.0
        );
    }

    #[test]
    fn cache_debug_overlay_miss_adds_embedding_cost() {
        let status = CacheDebugStatus::Miss {
            embedding_cost: 0.001,
        };
        assert_eq!(apply_cache_debug_overlay(1.0, &status), 1.001);
    }
}
