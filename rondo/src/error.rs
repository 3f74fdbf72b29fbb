//! Error types for the rondo time-series storage engine.

use thiserror::Error;

/// The main error type for all rondo operations.
///
/// This enum covers all possible error conditions that can occur while
/// mounting a database, ingesting measurements, and running queries.
#[derive(Error, Debug)]
pub enum RondoError {
    /// A hash-table lookup missed (series, tag, or btree key not found).
    #[error("not set")]
    NotSet,

    /// `main.db` failed to parse or its HMAC trailer did not validate.
    #[error("bad catalog hash: {0}")]
    BadHash(String),

    /// A B-tree node's header, magic, or size was invalid.
    #[error("bad btree node: {0}")]
    BadTree(String),

    /// A slab header was invalid.
    #[error("bad slab: {0}")]
    BadSlab(String),

    /// The target block has no room for another cell.
    #[error("block {block_id} is full")]
    BlockFull {
        /// The id of the full block.
        block_id: u64,
    },

    /// A timestamp fell outside the addressable range of its block.
    #[error("timestamp {ts} is out of range for block {block_id} (base {base})")]
    BlockRange {
        /// The block that was targeted.
        block_id: u64,
        /// The block's base timestamp.
        base: u64,
        /// The timestamp that didn't fit.
        ts: u64,
    },

    /// `main.db` is missing from the database root.
    #[error("no main.db in database root")]
    NoMainDb,

    /// The database root directory does not exist.
    #[error("no database root at '{0}'")]
    NoDbRoot(String),

    /// An HMAC trailer did not match its region.
    #[error("HMAC check failed for '{0}'")]
    BadHmac(String),

    /// A slab's endian sentinel did not match this host's.
    #[error("endian mismatch in slab '{0}'")]
    EndianMismatch(String),

    /// A referenced slab id has no backing file mapped.
    #[error("no slab for id {0:#x}")]
    NoSlab(u64),

    /// A referenced block id has no backing block mapped.
    #[error("no block for id {0:#x}")]
    NoBlock(u64),

    /// A query referenced a series that does not exist in the catalog.
    #[error("no such series: {0}")]
    NoSuchRef(String),

    /// Error while parsing or planning a query.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error while parsing an ingest submission.
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Error while framing or unframing a BQIP message.
    #[error("protocol error: {0}")]
    Protocol(#[from] BqipError),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RondoError {
    /// True if this error reflects a malformed request rather than a
    /// database-state problem (maps to CLI exit code 1, see SPEC_FULL.md §6.7).
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(self, RondoError::Query(_) | RondoError::Ingest(_) | RondoError::Protocol(_))
    }

    /// True if this error reflects a missing, corrupt, or unauthorized
    /// database (maps to CLI exit code 2, see SPEC_FULL.md §6.7).
    #[must_use]
    pub fn is_database_error(&self) -> bool {
        matches!(
            self,
            RondoError::BadHash(_)
                | RondoError::BadTree(_)
                | RondoError::BadSlab(_)
                | RondoError::NoMainDb
                | RondoError::NoDbRoot(_)
                | RondoError::BadHmac(_)
                | RondoError::EndianMismatch(_)
                | RondoError::NoSlab(_)
                | RondoError::NoBlock(_)
        )
    }
}

/// Errors that can occur while parsing or planning a query.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query has no `select` fields.
    #[error("query has no select fields")]
    EmptySelect,

    /// The requested time window is empty or inverted.
    #[error("invalid time window: from {from} until {until}")]
    InvalidWindow {
        /// Window start, seconds relative to now.
        from: i64,
        /// Window end, seconds relative to now.
        until: i64,
    },

    /// An `AGGR` op was nested inside another aggregation on the same field.
    #[error("nested aggregation is not allowed")]
    NestedAggregation,

    /// A binary stack op ran with fewer than two values on the stack.
    #[error("stack underflow evaluating op {op}")]
    StackUnderflow {
        /// The op that underflowed.
        op: String,
    },

    /// `RETURN` ran with other than exactly one value on the stack.
    #[error("expected exactly one result on return, found {found}")]
    BadReturnStack {
        /// How many values were actually on the stack.
        found: usize,
    },

    /// Two operand series had mismatched bucket counts.
    #[error("length mismatch combining series: {left} vs {right}")]
    LengthMismatch {
        /// Length of the left operand.
        left: usize,
        /// Length of the right operand.
        right: usize,
    },
}

/// Errors that can occur while parsing an ingest submission line.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The submission did not split into exactly four whitespace-separated
    /// fields.
    #[error("malformed submission: {0:?}")]
    Malformed(String),

    /// The tag portion failed the key/value grammar.
    #[error("invalid tags: {0}")]
    InvalidTags(String),

    /// The timestamp field did not parse as a strict, unsigned integer.
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    /// The value field did not parse as a strict floating point number.
    #[error("invalid value: {0:?}")]
    InvalidValue(String),
}

/// Errors that can occur while framing or unframing a BQIP message.
#[derive(Error, Debug)]
pub enum BqipError {
    /// The frame header (`T|LEN|`) was malformed.
    #[error("malformed frame header")]
    BadHeader,

    /// The frame type byte was not one of `Q`, `P`, `M`.
    #[error("unknown frame type {0:?}")]
    UnknownType(char),

    /// The declared length exceeds the protocol's buffer size.
    #[error("frame length {len} exceeds buffer size {max}")]
    TooLarge {
        /// The declared payload length.
        len: usize,
        /// The maximum payload length this connection will buffer.
        max: usize,
    },
}

/// Type alias for `Result<T, RondoError>`.
pub type Result<T> = std::result::Result<T, RondoError>;
