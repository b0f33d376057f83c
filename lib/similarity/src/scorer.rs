use crate::rules::{
    SimilarityRule, SIMILAR_CLB_MANUAL_LINK, SIMILAR_CLB_MANUAL_UNLINK, SIMILAR_EMAIL, SIMILAR_IM,
    SIMILAR_MOBILE_PHONE_NUMBER, SIMILAR_NAME, SIMILAR_PHONE_NUMBER,
};
use crate::unit::WeightMap;
use ahash::{AHashMap, AHashSet};
use personlink_core::{
    Contact, CurrentPerson, DigitComparator, DocumentStore, FilterCondition, Name,
    ParsedPhoneNumber, Person, PhoneNumber, PhoneNumberComparator, Query, Result,
};
use personlink_ledger::{LedgerKind, ManualLinkLedger};
use std::sync::Arc;
use tracing::debug;

/// Ranks existing persons against one contact.
///
/// Rules run in a fixed order: name, mobile phone, generic phone, email,
/// IM, manual links and finally manual unlinks. The current person may be
/// credited like any other; leaving it out of the merge is the caller's job.
#[derive(Clone)]
pub struct SimilarityScorer {
    store: Arc<dyn DocumentStore>,
    ledger: ManualLinkLedger,
    comparator: Arc<dyn PhoneNumberComparator>,
}

impl SimilarityScorer {
    pub fn new(store: Arc<dyn DocumentStore>, ledger: ManualLinkLedger) -> Self {
        Self {
            store,
            ledger,
            comparator: Arc::new(DigitComparator),
        }
    }

    #[must_use]
    pub fn with_comparator(mut self, comparator: Arc<dyn PhoneNumberComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// The comparator phone rules parse and group numbers with
    pub fn comparator(&self) -> &dyn PhoneNumberComparator {
        self.comparator.as_ref()
    }

    pub async fn score(&self, contact: &Contact, current: &CurrentPerson) -> Result<WeightMap> {
        let mut weights = WeightMap::new();
        let current = current.person();

        self.similar_name(contact, current, &mut weights).await?;
        let mobile_groups = self
            .similar_phone_numbers(contact, current, &mut weights, PhonePass::Mobile, &AHashSet::new())
            .await?;
        self.similar_phone_numbers(contact, current, &mut weights, PhonePass::Any, &mobile_groups)
            .await?;
        self.similar_addresses(
            "emails.normalizedValue",
            &SIMILAR_EMAIL,
            collect_values(current.map(|p| p.emails.as_slice()), &contact.emails),
            &mut weights,
        )
        .await?;
        self.similar_addresses(
            "ims.normalizedValue",
            &SIMILAR_IM,
            collect_values(current.map(|p| p.ims.as_slice()), &contact.ims),
            &mut weights,
        )
        .await?;
        self.manual_links(contact, &mut weights).await?;
        self.manual_unlinks(contact, &mut weights).await?;

        debug!(
            "Scored contact {:?} against {} candidate persons",
            contact.id,
            weights.len()
        );
        Ok(weights)
    }

    async fn similar_name(
        &self,
        contact: &Contact,
        current: Option<&Person>,
        weights: &mut WeightMap,
    ) -> Result<()> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        let names = current
            .map(|p| p.names.iter().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .chain(std::iter::once(&contact.name));
        for name in names {
            let family = name.family_name.trim();
            let given = name.given_name.trim();
            if family.is_empty() || given.is_empty() {
                continue;
            }
            let pair = (family.to_lowercase(), given.to_lowercase());
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }

        let mut credited = AHashSet::new();
        if !pairs.is_empty() {
            for (family, given) in &pairs {
                let query = Query::new(Person::KIND)
                    .filter(FilterCondition::equals_primary("names.familyName", family.as_str()))
                    .filter(FilterCondition::equals_primary("names.givenName", given.as_str()));
                for person in self.find_persons(&query).await? {
                    let same_entry = person.names.iter().any(|n| {
                        n.family_name.trim().to_lowercase() == *family
                            && n.given_name.trim().to_lowercase() == *given
                    });
                    if !same_entry || names_disagree(&person.name, &contact.name) {
                        continue;
                    }
                    credit_once(weights, &mut credited, &SIMILAR_NAME, &person, false);
                }
            }
            return Ok(());
        }

        // Company-only contacts match persons that are also just that company.
        for org in &contact.organizations {
            if org.name.trim().is_empty() || !org.title.trim().is_empty() {
                continue;
            }
            let query = Query::new(Person::KIND)
                .filter(FilterCondition::equals_primary("organization.name", org.name.trim()));
            for person in self.find_persons(&query).await? {
                if person.name.has_full_name() || !person.organization.title.trim().is_empty() {
                    continue;
                }
                credit_once(weights, &mut credited, &SIMILAR_NAME, &person, false);
            }
        }
        Ok(())
    }

    /// Credit persons whose numbers agree with ours, one credit per agreeing group.
    ///
    /// Groups are keyed by the comparator's short key. Returns the
    /// `(person, group)` pairs credited so a later pass can skip them.
    async fn similar_phone_numbers(
        &self,
        contact: &Contact,
        current: Option<&Person>,
        weights: &mut WeightMap,
        pass: PhonePass,
        already_credited: &AHashSet<(String, String)>,
    ) -> Result<AHashSet<(String, String)>> {
        let ours: Vec<&PhoneNumber> = current
            .map(|p| p.phone_numbers.iter().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .chain(contact.phone_numbers.iter())
            .filter(|n| pass.accepts(n))
            .collect();
        let our_groups = self.group_numbers(&ours);

        let mut credited = AHashSet::new();
        if our_groups.is_empty() {
            return Ok(credited);
        }

        let mut candidates: Vec<Person> = Vec::new();
        for (key, _) in &our_groups {
            let query = Query::new(Person::KIND)
                .filter(FilterCondition::prefix("phoneNumbers.normalizedValue", key.as_str()));
            for person in self.find_persons(&query).await? {
                if !candidates.iter().any(|c| c.id == person.id) {
                    candidates.push(person);
                }
            }
        }

        let rule: &SimilarityRule = match pass {
            PhonePass::Mobile => &SIMILAR_MOBILE_PHONE_NUMBER,
            PhonePass::Any => &SIMILAR_PHONE_NUMBER,
        };
        for candidate in &candidates {
            let Some(person_id) = candidate.id.clone() else {
                continue;
            };
            let theirs: Vec<&PhoneNumber> = candidate
                .phone_numbers
                .iter()
                .filter(|n| pass.accepts(n))
                .collect();
            let their_groups: AHashMap<String, Vec<ParsedPhoneNumber>> =
                self.group_numbers(&theirs).into_iter().collect();

            for (key, our_numbers) in &our_groups {
                let Some(their_numbers) = their_groups.get(key) else {
                    continue;
                };
                let all_equal = our_numbers.iter().all(|a| {
                    their_numbers
                        .iter()
                        .all(|b| self.comparator.equal(a, b))
                });
                if !all_equal {
                    continue;
                }
                let group = (person_id.clone(), key.clone());
                if already_credited.contains(&group) || !credited.insert(group) {
                    continue;
                }
                weights.add_similarity(rule, candidate, true);
            }
        }
        Ok(credited)
    }

    /// Parse and bucket numbers by short key, keeping first-seen key order.
    fn group_numbers(&self, numbers: &[&PhoneNumber]) -> Vec<(String, Vec<ParsedPhoneNumber>)> {
        let mut groups: Vec<(String, Vec<ParsedPhoneNumber>)> = Vec::new();
        for number in numbers {
            let Some(parsed) = self.comparator.parse(&number.value) else {
                debug!("Skipping unparsable phone number {:?}", number.value);
                continue;
            };
            let key = self.comparator.short_key(&parsed);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => {
                    if !members.contains(&parsed) {
                        members.push(parsed);
                    }
                }
                None => groups.push((key, vec![parsed])),
            }
        }
        groups
    }

    async fn similar_addresses(
        &self,
        field: &str,
        rule: &SimilarityRule,
        values: Vec<String>,
        weights: &mut WeightMap,
    ) -> Result<()> {
        for value in values {
            let query = Query::new(Person::KIND).filter(FilterCondition::equals(field, value));
            for person in self.find_persons(&query).await? {
                weights.add_similarity(rule, &person, true);
            }
        }
        Ok(())
    }

    async fn manual_links(&self, contact: &Contact, weights: &mut WeightMap) -> Result<()> {
        let Ok(hash) = contact.link_hash() else {
            return Ok(());
        };
        let links = self
            .ledger
            .records_for_hash(LedgerKind::ManualLink, &hash)
            .await?;
        for link in links {
            for side in [&link.contact_entity_a, &link.contact_entity_b] {
                for contact_id in self.ledger.contact_ids_for_hash(side).await? {
                    if let Some(person) =
                        Person::find_for_contact(self.store.as_ref(), &contact_id).await?
                    {
                        weights.add_similarity(&SIMILAR_CLB_MANUAL_LINK, &person, true);
                    }
                }
            }
        }
        Ok(())
    }

    /// Veto candidates that an unlink row keeps apart from the contact or from each other.
    async fn manual_unlinks(&self, contact: &Contact, weights: &mut WeightMap) -> Result<()> {
        let mut contact_ids: Vec<String> = Vec::new();
        for unit in weights.iter() {
            for id in &unit.person.contact_ids {
                if !contact_ids.contains(id) {
                    contact_ids.push(id.clone());
                }
            }
        }
        if contact_ids.is_empty() {
            return Ok(());
        }

        let candidate_id = contact.id.as_deref().unwrap_or_default();
        let holders = |ids: &[String], weights: &WeightMap| -> Vec<Person> {
            weights
                .iter()
                .filter(|u| u.person.contact_ids.iter().any(|c| ids.contains(c)))
                .map(|u| u.person.clone())
                .collect()
        };

        let mut hash_cache: AHashMap<String, Vec<String>> = AHashMap::new();
        let mut seen_rows = AHashSet::new();
        for held in Contact::load_many(self.store.as_ref(), &contact_ids).await? {
            let Ok(hash) = held.link_hash() else {
                continue;
            };
            let rows = self
                .ledger
                .records_for_hash(LedgerKind::ManualUnlink, &hash)
                .await?;
            for row in rows {
                if !seen_rows.insert((row.contact_entity_a.clone(), row.contact_entity_b.clone())) {
                    continue;
                }
                let ids_a = self.ids_for_hash(&mut hash_cache, &row.contact_entity_a).await?;
                let ids_b = self.ids_for_hash(&mut hash_cache, &row.contact_entity_b).await?;

                if ids_a.iter().any(|id| id == candidate_id) {
                    for person in holders(ids_b.as_slice(), &*weights) {
                        weights.add_similarity(&SIMILAR_CLB_MANUAL_UNLINK, &person, true);
                    }
                } else if ids_b.iter().any(|id| id == candidate_id) {
                    for person in holders(ids_a.as_slice(), &*weights) {
                        weights.add_similarity(&SIMILAR_CLB_MANUAL_UNLINK, &person, true);
                    }
                } else {
                    for (mine, other) in [(&ids_a, &ids_b), (&ids_b, &ids_a)] {
                        for holder in holders(mine.as_slice(), &*weights) {
                            for person in holders(other.as_slice(), &*weights) {
                                if person.id != holder.id {
                                    weights.add_similarity(
                                        &SIMILAR_CLB_MANUAL_UNLINK,
                                        &person,
                                        true,
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn ids_for_hash(
        &self,
        cache: &mut AHashMap<String, Vec<String>>,
        hash: &str,
    ) -> Result<Vec<String>> {
        if let Some(ids) = cache.get(hash) {
            return Ok(ids.clone());
        }
        let ids = self.ledger.contact_ids_for_hash(hash).await?;
        cache.insert(hash.to_string(), ids.clone());
        Ok(ids)
    }

    async fn find_persons(&self, query: &Query) -> Result<Vec<Person>> {
        self.store
            .find_all(query)
            .await?
            .into_iter()
            .map(Person::from_document)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhonePass {
    Mobile,
    Any,
}

impl PhonePass {
    fn accepts(self, number: &PhoneNumber) -> bool {
        match self {
            PhonePass::Mobile => number.is_mobile(),
            PhonePass::Any => true,
        }
    }
}

fn credit_once(
    weights: &mut WeightMap,
    credited: &mut AHashSet<String>,
    rule: &SimilarityRule,
    person: &Person,
    additive: bool,
) {
    if let Some(id) = person.id.as_deref() {
        if credited.insert(id.to_string()) {
            weights.add_similarity(rule, person, additive);
        }
    }
}

/// Suffix or middle name set on both sides to different values.
fn names_disagree(a: &Name, b: &Name) -> bool {
    fn differs(x: &str, y: &str) -> bool {
        let (x, y) = (x.trim(), y.trim());
        !x.is_empty() && !y.is_empty() && !x.eq_ignore_ascii_case(y)
    }
    differs(&a.honorific_suffix, &b.honorific_suffix) || differs(&a.middle_name, &b.middle_name)
}

fn collect_values(
    current: Option<&[personlink_core::Address]>,
    contact: &[personlink_core::Address],
) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();
    for address in current.unwrap_or_default().iter().chain(contact.iter()) {
        let value = address.normalized_value.trim();
        if !value.is_empty() && !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
    }
    values
}
