use crate::contact::{is_false, Address, Contact, Name, Organization, PhoneNumber};
use crate::filter::{FilterCondition, Query};
use crate::store::{DocumentStore, KIND_FIELD};
use crate::{Error, Result};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How person sort keys are built for list display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListSortOrder {
    #[default]
    FamilyGiven,
    GivenFamily,
    CompanyFamilyGiven,
    CompanyGivenFamily,
}

/// A real-world identity aggregating one or more contacts.
///
/// Everything except `contact_ids` is derived by [`Person::fixup`] from the
/// linked contacts, in `contact_ids` order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Person {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<u64>,
    #[serde(rename = "_del", skip_serializing_if = "is_false")]
    pub deleted: bool,
    pub contact_ids: Vec<String>,
    pub names: Vec<Name>,
    pub name: Name,
    pub phone_numbers: Vec<PhoneNumber>,
    pub emails: Vec<Address>,
    pub ims: Vec<Address>,
    pub organization: Organization,
    pub sort_key: String,
}

impl Person {
    pub const KIND: &'static str = "person";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contacts(contact_ids: Vec<String>) -> Self {
        Self {
            contact_ids,
            ..Default::default()
        }
    }

    pub fn id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .ok_or_else(|| Error::InvalidDocument("person has no _id".to_string()))
    }

    pub fn contact_count(&self) -> usize {
        self.contact_ids.len()
    }

    pub fn has_contact(&self, contact_id: &str) -> bool {
        self.contact_ids.iter().any(|id| id == contact_id)
    }

    /// Append a contact id if not already linked. Returns whether it was added.
    pub fn add_contact_id(&mut self, contact_id: impl Into<String>) -> bool {
        let contact_id = contact_id.into();
        if self.has_contact(&contact_id) {
            return false;
        }
        self.contact_ids.push(contact_id);
        true
    }

    pub fn remove_contact_id(&mut self, contact_id: &str) -> bool {
        let before = self.contact_ids.len();
        self.contact_ids.retain(|id| id != contact_id);
        before != self.contact_ids.len()
    }

    /// Re-derive the display fields from `contacts`.
    ///
    /// Contacts not listed in `contact_ids`, and deleted contacts, are ignored.
    pub fn fixup(&mut self, contacts: &[Contact], order: ListSortOrder) {
        let linked: Vec<&Contact> = self
            .contact_ids
            .iter()
            .filter_map(|id| {
                contacts
                    .iter()
                    .find(|c| c.id.as_deref() == Some(id.as_str()) && !c.deleted)
            })
            .collect();

        let mut names = Vec::new();
        let mut phones = Vec::new();
        let mut emails = Vec::new();
        let mut ims = Vec::new();
        let mut seen_phones = AHashSet::new();
        let mut seen_emails = AHashSet::new();
        let mut seen_ims = AHashSet::new();
        let mut organization = Organization::default();

        for contact in &linked {
            if !contact.name.is_empty() && !names.contains(&contact.name) {
                names.push(contact.name.clone());
            }
            for phone in &contact.phone_numbers {
                let key = if phone.normalized_value.is_empty() {
                    phone.value.clone()
                } else {
                    phone.normalized_value.clone()
                };
                if seen_phones.insert(key) {
                    phones.push(phone.clone());
                }
            }
            for email in &contact.emails {
                if seen_emails.insert(email.normalized_value.clone()) {
                    emails.push(email.clone());
                }
            }
            for im in &contact.ims {
                if seen_ims.insert(im.normalized_value.clone()) {
                    ims.push(im.clone());
                }
            }
            if organization.is_empty() {
                if let Some(org) = contact.organizations.iter().find(|o| !o.is_empty()) {
                    organization = org.clone();
                }
            }
        }

        self.name = names.first().cloned().unwrap_or_default();
        self.names = names;
        self.phone_numbers = phones;
        self.emails = emails;
        self.ims = ims;
        self.organization = organization;
        self.sort_key = self.compute_sort_key(order);
    }

    fn compute_sort_key(&self, order: ListSortOrder) -> String {
        let given = self.name.given_name.trim();
        let family = self.name.family_name.trim();
        let company = self.organization.name.trim();
        fn join(parts: &[&str]) -> String {
            parts
                .iter()
                .filter(|p| !p.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join(" ")
        }
        let key = match order {
            ListSortOrder::FamilyGiven => join(&[family, given]),
            ListSortOrder::GivenFamily => join(&[given, family]),
            ListSortOrder::CompanyFamilyGiven => join(&[company, family, given]),
            ListSortOrder::CompanyGivenFamily => join(&[company, given, family]),
        };
        let key = if key.is_empty() { company.to_string() } else { key };
        let key = match (key.is_empty(), self.emails.first(), self.phone_numbers.first()) {
            (false, _, _) => key,
            (true, Some(email), _) => email.value.clone(),
            (true, None, Some(phone)) => phone.value.clone(),
            (true, None, None) => key,
        };
        key.to_lowercase()
    }

    /// Merged contact-id order for a survivor absorbing `others`.
    ///
    /// Survivor ids come first, then each other person's ids in turn, then
    /// `new_contact`. Duplicates keep their first position, so the result
    /// is the same however often the merge is repeated.
    pub fn order_contact_ids(
        survivor: &Person,
        others: &[Person],
        new_contact: Option<&str>,
    ) -> Vec<String> {
        let mut seen = AHashSet::new();
        let mut ordered = Vec::new();
        let all = survivor
            .contact_ids
            .iter()
            .chain(others.iter().flat_map(|p| p.contact_ids.iter()))
            .map(String::as_str)
            .chain(new_contact);
        for id in all {
            if seen.insert(id.to_string()) {
                ordered.push(id.to_string());
            }
        }
        ordered
    }

    pub fn from_document(doc: Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }

    /// The live person currently holding `contact_id`, if any.
    pub async fn find_for_contact(
        store: &dyn DocumentStore,
        contact_id: &str,
    ) -> Result<Option<Person>> {
        let query = Query::new(Self::KIND)
            .filter(FilterCondition::equals("contactIds", contact_id))
            .limit(1);
        match store.find(&query).await?.results.into_iter().next() {
            Some(doc) => Ok(Some(Person::from_document(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn load(store: &dyn DocumentStore, person_id: &str) -> Result<Person> {
        let doc = store
            .get(&[person_id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::PersonNotFound(person_id.to_string()))?;
        Person::from_document(doc)
    }

    /// Load this person's contacts in `contact_ids` order.
    pub async fn reload_contacts(&self, store: &dyn DocumentStore) -> Result<Vec<Contact>> {
        Contact::load_many(store, &self.contact_ids).await
    }

    pub fn to_document(&self) -> Result<Value> {
        let mut doc = serde_json::to_value(self)?;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert(KIND_FIELD.to_string(), Value::from(Self::KIND));
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::PhoneType;

    fn contacts() -> Vec<Contact> {
        vec![
            Contact::new()
                .with_id("c1")
                .with_name("Ada", "Lovelace")
                .with_phone("555 0100", PhoneType::Mobile)
                .with_email("ada@example.com"),
            Contact::new()
                .with_id("c2")
                .with_name("Ada", "King")
                .with_phone("555-0100", PhoneType::Home)
                .with_email("ADA@example.com")
                .with_organization("Analytical Engines", "Countess"),
        ]
    }

    #[test]
    fn test_fixup_unions_and_dedupes() {
        let mut person = Person::with_contacts(vec!["c2".into(), "c1".into()]);
        person.fixup(&contacts(), ListSortOrder::FamilyGiven);
        assert_eq!(person.names.len(), 2);
        assert_eq!(person.name.family_name, "King");
        assert_eq!(person.phone_numbers.len(), 1);
        assert_eq!(person.emails.len(), 1);
        assert_eq!(person.organization.name, "Analytical Engines");
        assert_eq!(person.sort_key, "king ada");
    }

    #[test]
    fn test_fixup_ignores_deleted_contacts() {
        let mut all = contacts();
        all[1].deleted = true;
        let mut person = Person::with_contacts(vec!["c1".into(), "c2".into()]);
        person.fixup(&all, ListSortOrder::GivenFamily);
        assert_eq!(person.names.len(), 1);
        assert_eq!(person.sort_key, "ada lovelace");
    }

    #[test]
    fn test_sort_key_falls_back_to_email() {
        let mut person = Person::with_contacts(vec!["c".into()]);
        person.fixup(
            &[Contact::new().with_id("c").with_email("Zed@Example.com")],
            ListSortOrder::FamilyGiven,
        );
        assert_eq!(person.sort_key, "zed@example.com");
    }

    #[test]
    fn test_order_contact_ids_is_stable() {
        let survivor = Person::with_contacts(vec!["a".into(), "b".into()]);
        let others = vec![
            Person::with_contacts(vec!["c".into(), "a".into()]),
            Person::with_contacts(vec!["d".into()]),
        ];
        let merged = Person::order_contact_ids(&survivor, &others, Some("e"));
        assert_eq!(merged, vec!["a", "b", "c", "d", "e"]);

        let again = Person::with_contacts(merged.clone());
        assert_eq!(Person::order_contact_ids(&again, &others, Some("e")), merged);
    }

    #[test]
    fn test_contact_membership() {
        let mut person = Person::new();
        assert!(person.add_contact_id("x"));
        assert!(!person.add_contact_id("x"));
        assert!(person.remove_contact_id("x"));
        assert_eq!(person.contact_count(), 0);
    }
}
