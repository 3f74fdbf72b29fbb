//! Tag grammar validation and canonicalization.
//!
//! A series string is `metric|k1=v1,k2=v2,...` with tags sorted
//! lexicographically by their full `"k=v"` text. Grounded on bolo's
//! `tags.c`; the canonicalizer here just sorts, rather than porting the C
//! implementation's in-place bubble-pass string-reversal swap, which has no
//! idiomatic Rust analogue worth keeping.

use crate::error::{IngestError, Result};

/// True if `c` is a valid leading character for a tag key.
fn is_key_start(c: char) -> bool {
    c.is_ascii_alphabetic()
}

/// True if `c` is a valid non-leading character for a tag key.
fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '%' | '@')
}

/// True if `c` is a valid character for a tag value: any octet but `,`.
fn is_value_char(c: char) -> bool {
    c != ','
}

/// Parses and validates a raw `k1=v1,k2=v2,...` tag string into `(key,
/// value)` pairs, in input order.
///
/// # Errors
///
/// Returns [`IngestError::InvalidTags`] if any pair fails the grammar: a key
/// must start with a letter and continue with letters, digits, or `_`; a
/// value must be non-empty and contain no `,` or whitespace.
pub fn parse(raw: &str) -> Result<Vec<(String, String)>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let mut pairs = Vec::new();
    for pair in raw.split(',') {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            IngestError::InvalidTags(format!("missing '=' in tag pair {pair:?}"))
        })?;

        let mut chars = key.chars();
        let first = chars.next().filter(|&c| is_key_start(c)).ok_or_else(|| {
            IngestError::InvalidTags(format!("invalid key {key:?}"))
        })?;
        let _ = first;
        if !chars.clone().all(is_key_char) {
            return Err(IngestError::InvalidTags(format!("invalid key {key:?}")).into());
        }

        if value.is_empty() || !value.chars().all(is_value_char) {
            return Err(IngestError::InvalidTags(format!("invalid value {value:?}")).into());
        }

        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

/// Renders `(key, value)` pairs into the canonical `k1=v1,k2=v2,...` string,
/// sorted lexicographically by the full `"key=value"` text. Stable: the
/// first-seen entry for a repeated key sorts ahead of any later duplicate of
/// the same key (see `SPEC_FULL.md` §9 on duplicate tag keys).
#[must_use]
pub fn canonicalize(mut pairs: Vec<(String, String)>) -> String {
    pairs.sort_by(|a, b| format!("{}={}", a.0, a.1).cmp(&format!("{}={}", b.0, b.1)));
    pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

/// Parses, validates, and canonicalizes a raw tag string in one step.
pub fn parse_and_canonicalize(raw: &str) -> Result<String> {
    Ok(canonicalize(parse(raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_by_full_pair() {
        assert_eq!(parse_and_canonicalize("c=d,a=b").unwrap(), "a=b,c=d");
        assert_eq!(parse_and_canonicalize("beta=22,alpha=1").unwrap(), "alpha=1,beta=22");
    }

    #[test]
    fn rejects_bad_key() {
        assert!(parse("1key=v").is_err());
        assert!(parse("k$ey=v").is_err());
    }

    #[test]
    fn rejects_empty_value() {
        assert!(parse("key=").is_err());
    }

    #[test]
    fn accepts_underscored_keys_and_mixed_values() {
        let pairs = parse("host_name=web1,env=prod").unwrap();
        assert_eq!(pairs, vec![
            ("host_name".to_string(), "web1".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]);
    }

    #[test]
    fn empty_tag_string_is_no_tags() {
        assert_eq!(parse("").unwrap(), Vec::<(String, String)>::new());
        assert_eq!(canonicalize(Vec::new()), "");
    }
}
