//! # personlink Similarity
//!
//! Weighted evidence that a contact and an existing person describe the same
//! real-world identity.
//!
//! ## Features
//!
//! - **Rules**: name, mobile phone, generic phone, email, IM, manual link and manual unlink
//! - **Tri-state effects**: each rule contributes points, requires a merge, or forbids one
//! - **Evidence trail**: every unit records which rules fired and whether they stack
//!
//! ## Decision
//!
//! ```text
//! any Forbid            -> excluded
//! else any Require      -> included
//! else sum(points)>=100 -> included
//! ```
//!
//! ## Example
//!
//! ```rust
//! use personlink_core::Person;
//! use personlink_similarity::{WeightMap, SIMILAR_EMAIL, SIMILAR_PHONE_NUMBER};
//!
//! let person = Person { id: Some("p1".into()), ..Default::default() };
//! let mut weights = WeightMap::new();
//! weights.add_similarity(&SIMILAR_PHONE_NUMBER, &person, true);
//! assert!(weights.qualifying(None).is_empty());
//!
//! weights.add_similarity(&SIMILAR_EMAIL, &person, true);
//! assert_eq!(weights.qualifying(None).len(), 1);
//! ```

pub mod rules;
pub mod scorer;
pub mod unit;

pub use rules::{
    RuleEffect, SimilarityRule, SIMILAR_CLB_MANUAL_LINK, SIMILAR_CLB_MANUAL_UNLINK, SIMILAR_EMAIL,
    SIMILAR_IM, SIMILAR_MOBILE_PHONE_NUMBER, SIMILAR_NAME, SIMILAR_PHONE_NUMBER,
    WEIGHT_MATCH_THRESHOLD,
};
pub use scorer::SimilarityScorer;
pub use unit::{AutoLinkUnit, Evidence, WeightMap};
