//! BQIP: the framed wire protocol between clients and [`crate::server`].
//!
//! Each request is one frame: `T|LEN|PAYLOAD`, where `T` is `Q` (Query), `P`
//! (Plan), or `M` (Measurement), and `LEN` is the ASCII decimal length of
//! `PAYLOAD` in bytes. Exactly one request is accepted per connection and
//! the connection is closed after the matching response — no pipelining.
//!
//! A successful response is `R|field=value:ts,field=value:ts,...`; a failed
//! one is `E|<message>`. Grounded on bolo's `bqip.c`/`bqip.h`.
//!
//! Query and Plan payloads are JSON-encoded [`crate::query::Query`] values —
//! the framing this module defines is deliberately independent of any
//! particular query *text* grammar, which SPEC_FULL.md leaves unspecified.
//! Measurement payloads are single ingest lines, parsed by [`crate::ingest`].

use crate::error::{BqipError, Result};
use crate::query::{Query, QueryResult};

/// Largest payload this connection will buffer, in bytes.
pub const MAX_PAYLOAD: usize = 1 << 20;

/// The three request frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Execute a query and return its result.
    Query,
    /// Resolve a query's `PUSH`es without executing it, for diagnostics.
    Plan,
    /// Ingest a single measurement submission line.
    Measurement,
}

impl RequestType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'Q' => Ok(RequestType::Query),
            b'P' => Ok(RequestType::Plan),
            b'M' => Ok(RequestType::Measurement),
            other => Err(BqipError::UnknownType(other as char).into()),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            RequestType::Query => b'Q',
            RequestType::Plan => b'P',
            RequestType::Measurement => b'M',
        }
    }
}

/// One decoded request frame.
#[derive(Debug, Clone)]
pub struct Request {
    /// Which kind of request this is.
    pub kind: RequestType,
    /// The raw payload bytes (UTF-8 for all three request types).
    pub payload: Vec<u8>,
}

impl Request {
    /// Frames a request for transmission: `T|LEN|PAYLOAD`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 16);
        out.push(self.kind.as_byte());
        out.push(b'|');
        out.extend_from_slice(self.payload.len().to_string().as_bytes());
        out.push(b'|');
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes `buf` as a single query request carrying a JSON-encoded
    /// [`Query`].
    #[must_use]
    pub fn query(query: &Query) -> Self {
        Request { kind: RequestType::Query, payload: serde_json::to_vec(query).expect("Query always serializes") }
    }

    /// Decodes the query this frame carries, if it is a `Query` or `Plan`
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`BqipError::BadHeader`] wrapped as a [`crate::error::RondoError`]
    /// if the payload is not valid JSON for a [`Query`].
    pub fn as_query(&self) -> Result<Query> {
        serde_json::from_slice(&self.payload).map_err(|_| BqipError::BadHeader.into())
    }
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet contain a complete frame (the
/// caller should read more bytes and retry); returns the frame and the
/// number of bytes it consumed from `buf` otherwise.
///
/// # Errors
///
/// Returns [`BqipError::BadHeader`] if the `T|LEN|` preamble is malformed,
/// [`BqipError::UnknownType`] if `T` is not `Q`/`P`/`M`, or
/// [`BqipError::TooLarge`] if `LEN` exceeds [`MAX_PAYLOAD`].
pub fn decode(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    let Some(first_pipe) = buf.iter().position(|&b| b == b'|') else { return Ok(None) };
    if first_pipe != 1 {
        return Err(BqipError::BadHeader.into());
    }
    let kind = RequestType::from_byte(buf[0])?;

    let rest = &buf[first_pipe + 1..];
    let Some(second_pipe) = rest.iter().position(|&b| b == b'|') else { return Ok(None) };
    let len_str = std::str::from_utf8(&rest[..second_pipe]).map_err(|_| BqipError::BadHeader)?;
    let len: usize = len_str.parse().map_err(|_| BqipError::BadHeader)?;
    if len > MAX_PAYLOAD {
        return Err(BqipError::TooLarge { len, max: MAX_PAYLOAD }.into());
    }

    let payload_start = first_pipe + 1 + second_pipe + 1;
    let payload_end = payload_start + len;
    if buf.len() < payload_end {
        return Ok(None);
    }

    let payload = buf[payload_start..payload_end].to_vec();
    Ok(Some((Request { kind, payload }, payload_end)))
}

/// A response frame: either a successful result or an error message.
#[derive(Debug, Clone)]
pub enum Response {
    /// A query or plan succeeded.
    Result(QueryResult),
    /// A request failed; `message` is human-readable.
    Error(String),
}

impl Response {
    /// Renders this response in BQIP's wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Result(result) => {
                let mut out = Vec::from(&b"R|"[..]);
                let mut first = true;
                for field in &result.fields {
                    for &(ts, value) in &field.series.points {
                        if !first {
                            out.push(b',');
                        }
                        first = false;
                        out.extend_from_slice(format!("{}={}:{}", field.name, value, ts).as_bytes());
                    }
                }
                out
            }
            Response::Error(message) => {
                let mut out = Vec::from(&b"E|"[..]);
                out.extend_from_slice(message.as_bytes());
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ConsolidationConfig, Field, Op};
    use crate::reservoir::CfKind;

    fn sample_query() -> Query {
        Query {
            select: vec![Field { name: "cpu".to_string(), ops: vec![Op::Push("cpu".to_string())] }],
            where_: None,
            from_secs: -60,
            until_secs: 0,
            bucket: ConsolidationConfig { cf: CfKind::Mean, stride_secs: 60, samples: 64 },
            aggregate: None,
        }
    }

    #[test]
    fn round_trips_query_frame() {
        let req = Request::query(&sample_query());
        let encoded = req.encode();
        let (decoded, consumed) = decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.kind, RequestType::Query);
        assert_eq!(decoded.as_query().unwrap().from_secs, -60);
    }

    #[test]
    fn decode_waits_for_more_bytes() {
        let req = Request::query(&sample_query());
        let encoded = req.encode();
        assert!(decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(decode(b"X|3|abc").is_err());
    }

    #[test]
    fn rejects_oversized_payload() {
        let frame = format!("M|{}|", MAX_PAYLOAD + 1);
        assert!(decode(frame.as_bytes()).is_err());
    }

    #[test]
    fn measurement_request_round_trips_through_ingest() {
        let line = "cpu host=web1 1000 42.0";
        let req = Request { kind: RequestType::Measurement, payload: line.as_bytes().to_vec() };
        let encoded = req.encode();
        let (decoded, _) = decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.kind, RequestType::Measurement);
        let sub = crate::ingest::parse_line(std::str::from_utf8(&decoded.payload).unwrap()).unwrap();
        assert_eq!(sub.ts, 1000);
    }

    #[test]
    fn error_response_renders_with_prefix() {
        let resp = Response::Error("no such series".to_string());
        assert_eq!(resp.encode(), b"E|no such series");
    }
}
