//! Versioned identity hashes for contacts.
//!
//! The manual-link ledger stores pairs of these hashes instead of contact
//! ids, so an override survives the contact being deleted and re-synced.
//! A contact with a sync identity hashes `accountId`/`remoteId` only;
//! otherwise the normalized name and sorted addresses are hashed.

use crate::contact::{normalize_address, Contact};
use crate::{Error, Result};
use sha2::{Digest, Sha256};

pub const LINK_HASH_VERSION: &str = "v1";

pub fn compute(contact: &Contact) -> Result<String> {
    let mut hasher = Sha256::new();
    match (&contact.account_id, &contact.remote_id) {
        (Some(account), Some(remote)) if !account.is_empty() && !remote.is_empty() => {
            hasher.update(b"sync\0");
            hasher.update(account.as_bytes());
            hasher.update(b"\0");
            hasher.update(remote.as_bytes());
        }
        _ => {
            let fields = identity_fields(contact);
            if fields.iter().all(|(_, values)| values.is_empty()) {
                return Err(Error::MissingLinkHash(
                    contact.id.clone().unwrap_or_else(|| "<unsaved>".to_string()),
                ));
            }
            for (label, values) in fields {
                hasher.update(label.as_bytes());
                for value in values {
                    hasher.update(b"\0");
                    hasher.update(value.as_bytes());
                }
                hasher.update(b"\n");
            }
        }
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("{}:{}", LINK_HASH_VERSION, hex))
}

fn identity_fields(contact: &Contact) -> Vec<(&'static str, Vec<String>)> {
    let name = &contact.name;
    let name_parts: Vec<String> = [
        &name.honorific_prefix,
        &name.given_name,
        &name.middle_name,
        &name.family_name,
        &name.honorific_suffix,
    ]
    .iter()
    .map(|p| p.trim().to_lowercase())
    .collect();
    let name_values = if name_parts.iter().all(String::is_empty) {
        Vec::new()
    } else {
        name_parts
    };

    let sorted = |mut values: Vec<String>| {
        values.retain(|v| !v.is_empty());
        values.sort();
        values.dedup();
        values
    };

    vec![
        ("name", name_values),
        (
            "emails",
            sorted(contact.emails.iter().map(|e| normalize_address(&e.value)).collect()),
        ),
        (
            "phones",
            sorted(
                contact
                    .phone_numbers
                    .iter()
                    .map(|p| p.normalized_value.clone())
                    .collect(),
            ),
        ),
        (
            "ims",
            sorted(contact.ims.iter().map(|i| normalize_address(&i.value)).collect()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::PhoneType;

    #[test]
    fn test_stable_across_field_order_and_case() {
        let a = Contact::new()
            .with_name("Ada", "Lovelace")
            .with_email("ada@example.com")
            .with_email("ADA@work.org");
        let b = Contact::new()
            .with_name("ada", "LOVELACE")
            .with_email("ada@work.org")
            .with_email("Ada@Example.com");
        assert_eq!(compute(&a).unwrap(), compute(&b).unwrap());
    }

    #[test]
    fn test_sync_identity_wins() {
        let a = Contact::new()
            .with_name("Ada", "Lovelace")
            .with_sync_identity("acct", "r-1");
        let b = Contact::new()
            .with_phone("555 0100", PhoneType::Home)
            .with_sync_identity("acct", "r-1");
        assert_eq!(compute(&a).unwrap(), compute(&b).unwrap());
        assert_ne!(
            compute(&a).unwrap(),
            compute(&Contact::new().with_sync_identity("acct", "r-2")).unwrap()
        );
    }

    #[test]
    fn test_missing_identity_is_error() {
        let err = compute(&Contact::new().with_id("c9")).unwrap_err();
        assert!(matches!(err, Error::MissingLinkHash(id) if id == "c9"));
    }

    #[test]
    fn test_versioned() {
        let hash = compute(&Contact::new().with_email("x@y.z")).unwrap();
        assert!(hash.starts_with("v1:"));
        assert_eq!(hash.len(), 3 + 64);
    }
}
