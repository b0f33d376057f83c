//! Phone number parsing and comparison.
//!
//! Matching rules treat the comparator as opaque: they only need a parse
//! step, a short lookup key and a pairwise equality test. [`DigitComparator`]
//! is the built-in implementation and works on bare digits.

use serde::{Deserialize, Serialize};

/// Number of normalized digits used as the lookup key
pub const SHORT_KEY_LEN: usize = 7;

const MIN_DIGITS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParsedPhoneNumber {
    pub digits: String,
    /// Digits in reverse order, so suffix matches become prefix matches
    pub normalized: String,
}

pub trait PhoneNumberComparator: Send + Sync {
    /// Returns `None` for values that cannot be treated as a phone number.
    fn parse(&self, raw: &str) -> Option<ParsedPhoneNumber>;

    fn equal(&self, a: &ParsedPhoneNumber, b: &ParsedPhoneNumber) -> bool;

    /// Lookup key for candidate queries. Must be a prefix of [`normalize`]'s
    /// output, which is what persons store as `normalizedValue`.
    ///
    /// [`normalize`]: PhoneNumberComparator::normalize
    fn short_key(&self, parsed: &ParsedPhoneNumber) -> String {
        parsed.normalized.chars().take(SHORT_KEY_LEN).collect()
    }

    fn normalize(&self, raw: &str) -> String {
        self.parse(raw).map(|p| p.normalized).unwrap_or_default()
    }
}

/// Digit-only comparison: numbers are equal when their digits match, or
/// when both carry at least [`SHORT_KEY_LEN`] digits and one is a suffix of
/// the other (local vs. international forms of the same line).
#[derive(Debug, Clone, Copy, Default)]
pub struct DigitComparator;

impl PhoneNumberComparator for DigitComparator {
    fn parse(&self, raw: &str) -> Option<ParsedPhoneNumber> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.len() < MIN_DIGITS {
            return None;
        }
        let normalized = digits.chars().rev().collect();
        Some(ParsedPhoneNumber { digits, normalized })
    }

    fn equal(&self, a: &ParsedPhoneNumber, b: &ParsedPhoneNumber) -> bool {
        if a.digits == b.digits {
            return true;
        }
        if a.digits.len() < SHORT_KEY_LEN || b.digits.len() < SHORT_KEY_LEN {
            return false;
        }
        a.normalized.starts_with(&b.normalized) || b.normalized.starts_with(&a.normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_formatting() {
        let parsed = DigitComparator.parse("+1 (408) 555-0100").unwrap();
        assert_eq!(parsed.digits, "14085550100");
        assert_eq!(parsed.normalized, "00105558041");
        assert_eq!(DigitComparator.short_key(&parsed), "0010555");
    }

    #[test]
    fn test_unparsable() {
        assert!(DigitComparator.parse("call me").is_none());
        assert!(DigitComparator.parse("12").is_none());
        assert_eq!(DigitComparator.normalize("n/a"), "");
    }

    #[test]
    fn test_suffix_equality() {
        let cmp = DigitComparator;
        let local = cmp.parse("555-0100").unwrap();
        let intl = cmp.parse("+1 408 555 0100").unwrap();
        let other = cmp.parse("555-0199").unwrap();
        assert!(cmp.equal(&local, &intl));
        assert!(!cmp.equal(&local, &other));

        let short = cmp.parse("911").unwrap();
        let longer = cmp.parse("1911").unwrap();
        assert!(!cmp.equal(&short, &longer));
    }
}
