//! Override engine: user-supplied rules that patch selected fields of a
//! pricing row for matching `(provider, model, mode)` triples.

use regex::Regex;

use crate::catalog::types::{Mode, PricingRow};
use crate::error::{CatalogError, CatalogResult};

/// Upper bound on override pattern length, rejected before compiling a
/// regex — patterns come from trusted config but match time should still
/// be bounded.
const MAX_PATTERN_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchType {
    Exact = 0,
    Wildcard = 1,
    Regex = 2,
}

/// A single user-supplied override rule, as provided by the caller before
/// compilation.
#[derive(Debug, Clone)]
pub struct OverrideRule {
    pub match_type: MatchType,
    pub pattern: String,
    /// `None` means the rule applies regardless of request mode.
    pub mode_filter: Option<String>,
    pub patch: PricingRow,
}

/// A compiled, ranked override rule ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledOverride {
    pub match_type: MatchType,
    pattern: String,
    regex: Option<Regex>,
    pub mode_filter: Option<Mode>,
    pub literal_chars: usize,
    pub declaration_order: usize,
    pub patch: PricingRow,
}

impl CompiledOverride {
    fn matches_model(&self, model: &str) -> bool {
        match self.match_type {
            MatchType::Exact => self.pattern == model,
            MatchType::Wildcard => wildcard_match(&self.pattern, model),
            MatchType::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(model)),
        }
    }

    fn matches_mode(&self, mode: Mode) -> bool {
        match self.mode_filter {
            Some(filter) => filter == mode,
            None => true,
        }
    }

    /// Ordering key for selection: smaller is "more specific" and wins.
    /// `has_mode_filter` is inverted (rules *with* a filter rank before
    /// those without) so it composes with the tuple's natural ascending
    /// order.
    fn rank_key(&self) -> (u8, u8, std::cmp::Reverse<usize>, usize) {
        (
            self.match_type as u8,
            if self.mode_filter.is_some() { 0 } else { 1 },
            std::cmp::Reverse(self.literal_chars),
            self.declaration_order,
        )
    }
}

/// Compiles a list of raw override rules for one provider, validating each
/// against its match type and normalizing its mode filter.
pub fn compile_overrides(rules: &[OverrideRule]) -> CatalogResult<Vec<CompiledOverride>> {
    let mut compiled = Vec::with_capacity(rules.len());
    for (order, rule) in rules.iter().enumerate() {
        compiled.push(compile_one(rule, order)?);
    }
    Ok(compiled)
}

fn compile_one(rule: &OverrideRule, declaration_order: usize) -> CatalogResult<CompiledOverride> {
    if rule.pattern.is_empty() {
        return Err(CatalogError::Configuration(
            "override pattern must not be empty".to_string(),
        ));
    }
    if rule.pattern.len() > MAX_PATTERN_LEN {
        return Err(CatalogError::Configuration(format!(
            "override pattern exceeds {MAX_PATTERN_LEN} characters"
        )));
    }
    if rule.match_type == MatchType::Wildcard && !rule.pattern.contains('*') {
        return Err(CatalogError::Configuration(
            "wildcard override pattern must contain at least one '*'".to_string(),
        ));
    }

    let mode_filter = match &rule.mode_filter {
        Some(raw) => {
            let parsed = Mode::parse(raw).ok_or_else(|| {
                CatalogError::Configuration(format!("override mode filter '{raw}' is unknown"))
            })?;
            Some(parsed)
        }
        None => None,
    };

    let regex = if rule.match_type == MatchType::Regex {
        Some(Regex::new(&rule.pattern).map_err(|e| {
            CatalogError::Configuration(format!("invalid override regex '{}': {e}", rule.pattern))
        })?)
    } else {
        None
    };

    let literal_chars = match rule.match_type {
        MatchType::Exact => rule.pattern.len(),
        MatchType::Wildcard => rule.pattern.len() - rule.pattern.matches('*').count(),
        MatchType::Regex => rule.pattern.len(),
    };

    Ok(CompiledOverride {
        match_type: rule.match_type,
        pattern: rule.pattern.clone(),
        regex,
        mode_filter,
        literal_chars,
        declaration_order,
        patch: rule.patch.clone(),
    })
}

/// Selects the single best-matching override for `(model, mode)` among
/// `candidates`, or `None` if nothing matches. Ranking: exact < wildcard <
/// regex; rules with a mode filter beat those without; more literal
/// characters beats fewer; earliest declaration wins remaining ties.
pub fn select_override<'a>(
    candidates: &'a [CompiledOverride],
    model: &str,
    mode: Mode,
) -> Option<&'a CompiledOverride> {
    candidates
        .iter()
        .filter(|c| c.matches_mode(mode) && c.matches_model(model))
        .min_by_key(|c| c.rank_key())
}

/// Applies the chosen override's non-`None` fields onto a copy of `base`,
/// leaving unspecified fields untouched. Never mutates `base` in place —
/// the base index and the patched result never share storage.
pub fn apply_override(base: &PricingRow, patch: &PricingRow) -> PricingRow {
    let mut out = base.clone();
    macro_rules! patch_opt {
        ($field:ident) => {
            if patch.$field.is_some() {
                out.$field = patch.$field;
            }
        };
    }
    patch_opt!(input_cost_per_token);
    patch_opt!(output_cost_per_token);
    patch_opt!(cache_read_cost_per_token);
    patch_opt!(cache_creation_cost_per_token);
    patch_opt!(above_128k_input_cost_per_token);
    patch_opt!(above_128k_output_cost_per_token);
    patch_opt!(above_128k_cache_read_cost_per_token);
    patch_opt!(above_128k_cache_creation_cost_per_token);
    patch_opt!(above_200k_input_cost_per_token);
    patch_opt!(above_200k_output_cost_per_token);
    patch_opt!(above_200k_cache_read_cost_per_token);
    patch_opt!(above_200k_cache_creation_cost_per_token);
    patch_opt!(input_cost_per_character);
    patch_opt!(output_cost_per_character);
    patch_opt!(input_cost_per_image);
    patch_opt!(above_128k_input_cost_per_image);
    patch_opt!(input_cost_per_image_token);
    patch_opt!(output_cost_per_image_token);
    patch_opt!(above_128k_input_cost_per_image_token);
    patch_opt!(above_128k_output_cost_per_image_token);
    patch_opt!(input_cost_per_second);
    patch_opt!(above_128k_input_cost_per_second);
    patch_opt!(output_cost_per_video_second);
    patch_opt!(output_cost_per_second);
    patch_opt!(batch_input_cost_per_token);
    patch_opt!(batch_output_cost_per_token);
    out
}

/// `*` matches any substring (including empty). The pattern is split on
/// `*`; the first literal segment must be a prefix of `text`, the last
/// must be a suffix, and middle segments must appear in order at
/// non-overlapping positions. Empty segments (adjacent `**`) are skipped.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let first = segments[0];
    let last = segments[segments.len() - 1];

    if !text.starts_with(first) {
        return false;
    }
    if !text.ends_with(last) {
        return false;
    }

    // Search region excludes the anchored prefix/suffix so middle segments
    // cannot overlap with them.
    let start = first.len();
    let end = text.len() - last.len();
    if start > end {
        return false;
    }
    let middle_region = &text[start..end];
    let mut offset = 0usize;
    for seg in &segments[1..segments.len() - 1] {
        if seg.is_empty() {
            continue;
        }
        match middle_region[offset..].find(seg) {
            Some(pos) => offset += pos + seg.len(),
            None => return false,
        }
    }
    true
}
