//! Line-oriented measurement ingestor.
//!
//! Parses `METRIC TAGS TS VALUE\n` submissions into `(series, ts_ms, value)`
//! tuples ready for [`crate::store::Store::insert`]. Grounded on bolo's
//! `ingest.c`: four whitespace-separated fields, strict numeric parsing (no
//! trailing garbage tolerated), canonical series synthesized as
//! `metric|canonical_tags`.

use crate::error::{IngestError, Result};
use crate::tags;

/// A single parsed measurement submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Canonical `metric|k1=v1,...` series string.
    pub series: String,
    /// Millisecond timestamp.
    pub ts: u64,
    /// Measurement value.
    pub value: f64,
}

/// Parses one `METRIC TAGS TS VALUE` line (without its trailing newline).
///
/// # Errors
///
/// Returns [`IngestError::Malformed`] if the line does not split into
/// exactly four whitespace-separated fields, [`IngestError::InvalidTags`]
/// if the tag field fails the tag grammar, and
/// [`IngestError::InvalidTimestamp`] / [`IngestError::InvalidValue`] if the
/// numeric fields contain anything beyond a valid integer or float.
pub fn parse_line(line: &str) -> Result<Submission> {
    let mut fields = line.split_whitespace();
    let metric = fields.next();
    let raw_tags = fields.next();
    let raw_ts = fields.next();
    let raw_value = fields.next();
    if fields.next().is_some() || raw_value.is_none() {
        return Err(IngestError::Malformed(line.to_string()).into());
    }
    let (metric, raw_tags, raw_ts, raw_value) =
        (metric.unwrap(), raw_tags.unwrap(), raw_ts.unwrap(), raw_value.unwrap());

    let canonical_tags = tags::parse_and_canonicalize(raw_tags)?;
    let series = format!("{metric}|{canonical_tags}");

    let ts = parse_strict_u64(raw_ts)
        .ok_or_else(|| IngestError::InvalidTimestamp(raw_ts.to_string()))?;
    let value =
        parse_strict_f64(raw_value).ok_or_else(|| IngestError::InvalidValue(raw_value.to_string()))?;

    Ok(Submission { series, ts, value })
}

/// Parses every complete (newline-terminated) line in `buf`, returning the
/// submissions in order and the byte offset of the first unconsumed
/// (partial) line.
///
/// # Errors
///
/// Returns the first parse error encountered; lines before it are not
/// returned (the caller is expected to treat ingest as all-or-nothing per
/// batch, matching the line-at-a-time consumption model of the reference
/// protocol).
pub fn parse_batch(buf: &str) -> Result<(Vec<Submission>, usize)> {
    let mut subs = Vec::new();
    let mut consumed = 0;
    for line in buf.split_inclusive('\n') {
        let Some(trimmed) = line.strip_suffix('\n') else {
            break; // partial line, not yet terminated
        };
        if trimmed.is_empty() {
            consumed += line.len();
            continue;
        }
        subs.push(parse_line(trimmed)?);
        consumed += line.len();
    }
    Ok((subs, consumed))
}

/// Strict `u64` parse: rejects leading `+`, whitespace, or any trailing
/// garbage that `str::parse` would otherwise tolerate via surrounding calls.
fn parse_strict_u64(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Strict `f64` parse: rejects empty input; otherwise defers to Rust's
/// `f64::from_str`, which itself rejects trailing garbage.
fn parse_strict_f64(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_submission() {
        let sub = parse_line("cpu host=web1,env=prod 1531000200000 42.5").unwrap();
        assert_eq!(sub.series, "cpu|env=prod,host=web1");
        assert_eq!(sub.ts, 1531000200000);
        assert_eq!(sub.value, 42.5);
    }

    #[test]
    fn parses_two_line_batch() {
        let (subs, consumed) =
            parse_batch("cpu a=b 123456789 34.567\ncpu a=b 123456790 34.887\n").unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0], Submission { series: "cpu|a=b".to_string(), ts: 123456789, value: 34.567 });
        assert_eq!(subs[1], Submission { series: "cpu|a=b".to_string(), ts: 123456790, value: 34.887 });
        assert_eq!(consumed, "cpu a=b 123456789 34.567\ncpu a=b 123456790 34.887\n".len());
    }

    #[test]
    fn leaves_partial_trailing_line_unconsumed() {
        let (subs, consumed) = parse_batch("cpu a=b 1 1.0\ncpu a=b 2 2").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(consumed, "cpu a=b 1 1.0\n".len());
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse_line("cpu a=b 123").is_err());
        assert!(parse_line("cpu a=b 123 1.0 extra").is_err());
    }

    #[test]
    fn rejects_non_strict_numbers() {
        assert!(parse_line("cpu a=b +123 1.0").is_err());
        assert!(parse_line("cpu a=b 123 1.0x").is_err());
    }
}
