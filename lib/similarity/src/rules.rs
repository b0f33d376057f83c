use serde::{Deserialize, Serialize};

/// Accumulated points needed before a candidate person qualifies
pub const WEIGHT_MATCH_THRESHOLD: i64 = 100;
pub const WEIGHT_MAX: i64 = 99_999;
pub const WEIGHT_MIN: i64 = -99_999;

pub const WEIGHT_SIMILAR_NAME: i64 = 100;
pub const WEIGHT_SIMILAR_MOBILE_PHONE_NUMBER: i64 = 100;
pub const WEIGHT_SIMILAR_PHONE_NUMBER: i64 = 55;
pub const WEIGHT_SIMILAR_EMAIL: i64 = 100;
pub const WEIGHT_SIMILAR_IM: i64 = 100;

/// What a matched rule does to a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", content = "points", rename_all = "camelCase")]
pub enum RuleEffect {
    /// Include the candidate regardless of points, unless forbidden
    Require,
    /// Exclude the candidate regardless of anything else
    Forbid,
    Contribute(i64),
}

impl RuleEffect {
    /// The single-number weight older consumers expect, with sentinels for overrides.
    pub fn legacy_weight(self) -> i64 {
        match self {
            RuleEffect::Require => WEIGHT_MAX,
            RuleEffect::Forbid => WEIGHT_MIN,
            RuleEffect::Contribute(points) => points,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimilarityRule {
    pub label: &'static str,
    pub effect: RuleEffect,
}

pub const SIMILAR_NAME: SimilarityRule = SimilarityRule {
    label: "Similar Name",
    effect: RuleEffect::Contribute(WEIGHT_SIMILAR_NAME),
};

pub const SIMILAR_MOBILE_PHONE_NUMBER: SimilarityRule = SimilarityRule {
    label: "Similar Mobile Phone Number",
    effect: RuleEffect::Contribute(WEIGHT_SIMILAR_MOBILE_PHONE_NUMBER),
};

pub const SIMILAR_PHONE_NUMBER: SimilarityRule = SimilarityRule {
    label: "Similar Phone Number",
    effect: RuleEffect::Contribute(WEIGHT_SIMILAR_PHONE_NUMBER),
};

pub const SIMILAR_EMAIL: SimilarityRule = SimilarityRule {
    label: "Similar Email",
    effect: RuleEffect::Contribute(WEIGHT_SIMILAR_EMAIL),
};

pub const SIMILAR_IM: SimilarityRule = SimilarityRule {
    label: "Similar IM",
    effect: RuleEffect::Contribute(WEIGHT_SIMILAR_IM),
};

pub const SIMILAR_CLB_MANUAL_LINK: SimilarityRule = SimilarityRule {
    label: "CLB Manual Link",
    effect: RuleEffect::Require,
};

pub const SIMILAR_CLB_MANUAL_UNLINK: SimilarityRule = SimilarityRule {
    label: "CLB Manual Unlink",
    effect: RuleEffect::Forbid,
};
