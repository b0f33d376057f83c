use crate::link_hash;
use crate::phone::{DigitComparator, PhoneNumberComparator};
use crate::store::{DocumentStore, KIND_FIELD};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Name {
    pub given_name: String,
    pub family_name: String,
    pub middle_name: String,
    pub honorific_prefix: String,
    pub honorific_suffix: String,
}

impl Name {
    pub fn new(given: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            given_name: given.into(),
            family_name: family.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.given_name.trim().is_empty()
            && self.family_name.trim().is_empty()
            && self.middle_name.trim().is_empty()
            && self.honorific_prefix.trim().is_empty()
            && self.honorific_suffix.trim().is_empty()
    }

    /// Whether this name carries a usable (family, given) pair
    pub fn has_full_name(&self) -> bool {
        !self.given_name.trim().is_empty() || !self.family_name.trim().is_empty()
    }

    pub fn display(&self) -> String {
        [
            self.honorific_prefix.trim(),
            self.given_name.trim(),
            self.middle_name.trim(),
            self.family_name.trim(),
            self.honorific_suffix.trim(),
        ]
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneType {
    Mobile,
    Home,
    Work,
    Fax,
    Pager,
    #[default]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhoneNumber {
    pub value: String,
    #[serde(rename = "type")]
    pub kind: PhoneType,
    pub normalized_value: String,
}

impl PhoneNumber {
    pub fn new(value: impl Into<String>, kind: PhoneType) -> Self {
        let value = value.into();
        let normalized_value = DigitComparator.normalize(&value);
        Self { value, kind, normalized_value }
    }

    pub fn is_mobile(&self) -> bool {
        self.kind == PhoneType::Mobile
    }
}

/// An email address or IM handle. `normalized_value` is the lowercase, trimmed form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Address {
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub normalized_value: String,
}

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let normalized_value = normalize_address(&value);
        Self {
            value,
            kind: String::new(),
            normalized_value,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

pub fn normalize_address(value: &str) -> String {
    value.trim().to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Organization {
    pub name: String,
    pub title: String,
}

impl Organization {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.trim().is_empty() && self.title.trim().is_empty()
    }
}

/// A single contact record as synced from one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Contact {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<u64>,
    #[serde(rename = "_del", skip_serializing_if = "is_false")]
    pub deleted: bool,
    pub name: Name,
    pub phone_numbers: Vec<PhoneNumber>,
    pub emails: Vec<Address>,
    pub ims: Vec<Address>,
    pub organizations: Vec<Organization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_hash: Option<String>,
}

impl Contact {
    pub const KIND: &'static str = "contact";

    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_name(mut self, given: impl Into<String>, family: impl Into<String>) -> Self {
        self.name = Name::new(given, family);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_phone(mut self, value: impl Into<String>, kind: PhoneType) -> Self {
        self.phone_numbers.push(PhoneNumber::new(value, kind));
        self
    }

    #[inline]
    #[must_use]
    pub fn with_email(mut self, value: impl Into<String>) -> Self {
        self.emails.push(Address::new(value));
        self
    }

    #[inline]
    #[must_use]
    pub fn with_im(mut self, value: impl Into<String>, kind: impl Into<String>) -> Self {
        self.ims.push(Address::new(value).with_kind(kind));
        self
    }

    #[inline]
    #[must_use]
    pub fn with_organization(mut self, name: impl Into<String>, title: impl Into<String>) -> Self {
        self.organizations.push(Organization::new(name, title));
        self
    }

    #[inline]
    #[must_use]
    pub fn with_sync_identity(
        mut self,
        account_id: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> Self {
        self.account_id = Some(account_id.into());
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .ok_or_else(|| Error::InvalidDocument("contact has no _id".to_string()))
    }

    /// Recompute every normalized value from its raw form.
    pub fn normalize(&mut self, comparator: &dyn PhoneNumberComparator) {
        for phone in &mut self.phone_numbers {
            phone.normalized_value = comparator.normalize(&phone.value);
        }
        for address in self.emails.iter_mut().chain(self.ims.iter_mut()) {
            address.normalized_value = normalize_address(&address.value);
        }
    }

    /// The stable identity hash for this contact. Prefers the stored value.
    pub fn link_hash(&self) -> Result<String> {
        match &self.link_hash {
            Some(hash) if !hash.is_empty() => Ok(hash.clone()),
            _ => link_hash::compute(self),
        }
    }

    pub fn from_document(doc: Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }

    /// Fetch contacts by id, deleted ones included, skipping ids that do not exist.
    pub async fn load_many(store: &dyn DocumentStore, ids: &[String]) -> Result<Vec<Contact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        store
            .get(ids)
            .await?
            .into_iter()
            .map(Contact::from_document)
            .collect()
    }

    /// Serialize for the store, stamping `_kind` and the link hash when one can be derived.
    pub fn to_document(&self) -> Result<Value> {
        let mut contact = self.clone();
        if contact.link_hash.is_none() {
            contact.link_hash = link_hash::compute(self).ok();
        }
        let mut doc = serde_json::to_value(&contact)?;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert(KIND_FIELD.to_string(), Value::from(Self::KIND));
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_normalizes() {
        let contact = Contact::new()
            .with_name("Ada", "Lovelace")
            .with_phone("(555) 010-0199", PhoneType::Mobile)
            .with_email("  Ada@Example.COM ");
        assert_eq!(contact.phone_numbers[0].normalized_value, "9910010555");
        assert_eq!(contact.emails[0].normalized_value, "ada@example.com");
        assert!(contact.phone_numbers[0].is_mobile());
    }

    #[test]
    fn test_document_carries_kind_and_hash() {
        let contact = Contact::new().with_id("c1").with_email("a@b.c");
        let doc = contact.to_document().unwrap();
        assert_eq!(doc["_kind"], "contact");
        assert!(doc["linkHash"].as_str().unwrap().starts_with("v1:"));
        assert!(doc.get("_del").is_none());

        let back = Contact::from_document(doc).unwrap();
        assert_eq!(back.id.as_deref(), Some("c1"));
        assert_eq!(back.emails, contact.emails);
    }

    #[test]
    fn test_display_name() {
        let mut name = Name::new("Grace", "Hopper");
        name.honorific_prefix = "Rear Admiral".to_string();
        assert_eq!(name.display(), "Rear Admiral Grace Hopper");
        assert!(Name::default().is_empty());
    }
}
