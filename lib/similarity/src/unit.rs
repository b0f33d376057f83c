use crate::rules::{RuleEffect, SimilarityRule, WEIGHT_MATCH_THRESHOLD};
use ahash::AHashMap;
use personlink_core::Person;
use serde::Serialize;

/// One entry of a unit's evidence trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evidence {
    pub label: &'static str,
    pub additive: bool,
}

/// Evidence accumulated for one candidate person while scoring a contact.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoLinkUnit {
    #[serde(skip)]
    pub person: Person,
    points: i64,
    weight: i64,
    required: bool,
    forbidden: bool,
    similar_on: Vec<Evidence>,
}

impl AutoLinkUnit {
    pub fn new(person: Person) -> Self {
        Self {
            person,
            points: 0,
            weight: 0,
            required: false,
            forbidden: false,
            similar_on: Vec::new(),
        }
    }

    pub fn add_similarity(&mut self, rule: &SimilarityRule, additive: bool) {
        match rule.effect {
            RuleEffect::Require => self.required = true,
            RuleEffect::Forbid => self.forbidden = true,
            RuleEffect::Contribute(points) => self.points += points,
        }
        self.weight = self.weight.saturating_add(rule.effect.legacy_weight());
        self.similar_on.push(Evidence {
            label: rule.label,
            additive,
        });
    }

    /// Forbid beats Require, Require beats points, points must reach the threshold.
    pub fn meets_weight_requirement(&self) -> bool {
        if self.forbidden {
            return false;
        }
        self.required || self.points >= WEIGHT_MATCH_THRESHOLD
    }

    pub fn points(&self) -> i64 {
        self.points
    }

    /// Sum of legacy weights, sentinels included
    pub fn weight(&self) -> i64 {
        self.weight
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_forbidden(&self) -> bool {
        self.forbidden
    }

    pub fn similar_on(&self) -> &[Evidence] {
        &self.similar_on
    }
}

/// Units keyed by person id, iterated in the order persons were first credited.
#[derive(Debug, Clone, Default)]
pub struct WeightMap {
    order: Vec<String>,
    units: AHashMap<String, AutoLinkUnit>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `rule` to `person`. Persons without an id cannot be tracked and are ignored.
    pub fn add_similarity(&mut self, rule: &SimilarityRule, person: &Person, additive: bool) {
        let Some(id) = person.id.as_deref() else {
            return;
        };
        if !self.units.contains_key(id) {
            self.order.push(id.to_string());
            self.units
                .insert(id.to_string(), AutoLinkUnit::new(person.clone()));
        }
        if let Some(unit) = self.units.get_mut(id) {
            unit.add_similarity(rule, additive);
        }
    }

    pub fn get(&self, person_id: &str) -> Option<&AutoLinkUnit> {
        self.units.get(person_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AutoLinkUnit> {
        self.order.iter().filter_map(|id| self.units.get(id))
    }

    /// Persons meeting the weight requirement, in first-credited order, minus `exclude`.
    pub fn qualifying(&self, exclude: Option<&str>) -> Vec<Person> {
        self.iter()
            .filter(|u| u.meets_weight_requirement())
            .filter(|u| exclude.map_or(true, |ex| u.person.id.as_deref() != Some(ex)))
            .map(|u| u.person.clone())
            .collect()
    }
}
