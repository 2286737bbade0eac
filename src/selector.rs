//! Topicality-weighted reply choice.
//!
//! Works on a borrowed [`Context`] so the caller can run it under the index
//! read lock; cost is linear in the variants of that one context.

use crate::config::Config;
use crate::models::{Context, GroupId};
use crate::moderation::Moderation;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectParams {
    /// Variants seen fewer times are never offered.
    pub answer_threshold: i64,
    /// Variants of other groups are offered once they reach this count; 0 disables.
    pub cross_group_threshold: i64,
    pub half_life_secs: i64,
}

impl From<&Config> for SelectParams {
    fn from(config: &Config) -> Self {
        Self {
            answer_threshold: config.answer_threshold,
            cross_group_threshold: config.cross_group_threshold,
            half_life_secs: config.topicality_half_life_secs,
        }
    }
}

impl Default for SelectParams {
    fn default() -> Self {
        SelectParams::from(&Config::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<'a> {
    pub text: &'a str,
    pub weight: f64,
}

/// `count` halved for every `half_life` the variant lags the context.
pub fn topicality(count: i64, variant_time: i64, context_time: i64, half_life: i64) -> f64 {
    let age = (context_time - variant_time).max(0) as f64;
    count as f64 * 0.5f64.powf(age / half_life.max(1) as f64)
}

/// Replyable variants for `group_id` with their weights.
pub fn candidates<'a>(
    context: &'a Context,
    group_id: GroupId,
    moderation: &Moderation,
    params: &SelectParams,
) -> Vec<Candidate<'a>> {
    let mut out: Vec<Candidate<'a>> = Vec::new();
    let mut seen: HashMap<&'a str, usize> = HashMap::new();

    for answer in &context.answers {
        let own = answer.group_id == group_id;
        if !own && params.cross_group_threshold <= 0 {
            continue;
        }
        if context.is_banned(answer.group_id) {
            continue;
        }
        for variant in &answer.messages {
            if variant.count < params.answer_threshold.max(1) {
                continue;
            }
            if !own && variant.count < params.cross_group_threshold {
                continue;
            }
            if moderation.is_forbidden(group_id, &variant.text) {
                continue;
            }
            let weight = topicality(
                variant.count,
                variant.time,
                context.time,
                params.half_life_secs,
            );
            match seen.get(variant.text.as_str()) {
                Some(&idx) => out[idx].weight += weight,
                None => {
                    seen.insert(variant.text.as_str(), out.len());
                    out.push(Candidate {
                        text: &variant.text,
                        weight,
                    });
                }
            }
        }
    }
    out
}

/// Picks one reply, or `None` when the fingerprint is banned in the group or
/// nothing survives filtering.
pub fn select<R: Rng>(
    context: &Context,
    group_id: GroupId,
    moderation: &Moderation,
    params: &SelectParams,
    rng: &mut R,
) -> Option<String> {
    if context.is_banned(group_id) {
        return None;
    }
    let candidates = candidates(context, group_id, moderation, params);
    if candidates.is_empty() {
        return None;
    }

    let idx = match WeightedIndex::new(candidates.iter().map(|c| c.weight)) {
        Ok(dist) => dist.sample(rng),
        // Weights can underflow to zero for very old variants.
        Err(_) => rng.gen_range(0..candidates.len()),
    };
    Some(candidates[idx].text.to_string())
}
