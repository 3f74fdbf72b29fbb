//! # rondo
//!
//! An embedded time-series storage and query engine with HMAC-sealed,
//! memory-mapped on-disk structures and no background threads.
//!
//! rondo models a measurement as `(series, timestamp, value)`, where a
//! series is a canonicalized `metric|k1=v1,k2=v2,...` string. Measurements
//! append into fixed-size, HMAC-SHA-512-sealed blocks ([`tblock`]) chained
//! together inside slab files ([`tslab`]); a per-series B-tree ([`btree`])
//! maps timestamps to the block holding them, and a catalog ([`catalog`])
//! resolves metric names and tag predicates to the series that match.
//! Queries ([`query`]) are small stack programs over reservoir-sampled,
//! bucketed series, consolidated with one of eight functions ([`reservoir`]).
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key properties
//!
//! - Append-only, HMAC-sealed on-disk format — no in-place rewrites once a
//!   block is sealed
//! - Two-phase reservoir consolidation at query time, not write time — no
//!   background downsampler, no compaction surprises
//! - Dimensional labels (tags) on every series, resolved via a catalog of
//!   hash indexes rebuilt on mount
//! - No background threads; a single-threaded, cooperative network server
//!   is provided ([`server`]) for out-of-process use
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rondo::store::Store;
//! use rondo::ingest::Submission;
//! use rondo::query::{ConsolidationConfig, Field, Op, Query};
//! use rondo::reservoir::CfKind;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = Store::init("./my_metrics".as_ref(), b"0123456789abcdef".to_vec())?;
//!
//! store.insert(&Submission { series: "cpu|host=web1".to_string(), ts: 1_640_000_000_000, value: 85.5 })?;
//! store.sync()?;
//!
//! let result = store.query(Query {
//!     select: vec![Field { name: "cpu".to_string(), ops: vec![Op::Push("cpu".to_string())] }],
//!     where_: None,
//!     from_secs: -3600,
//!     until_secs: 0,
//!     bucket: ConsolidationConfig { cf: CfKind::Mean, stride_secs: 60, samples: 2048 },
//!     aggregate: None,
//! })?;
//! for field in &result.fields {
//!     for (ts, value) in &field.series.points {
//!         println!("{ts}: {value}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`store::Store`] — top-level handle: mount/init, insert, query, sync
//! - [`catalog::Catalog`] — series → index resolution, by-metric/by-tag sets
//! - [`btree::BTree`] — per-series on-disk index, timestamp → block id
//! - [`tblock::TBlock`] / [`tslab::TSlab`] — the sealed, append-only storage
//! - [`query`] — query AST, planner, and stack-based executor
//! - [`reservoir`] — reservoir sampling and the eight consolidation functions
//! - [`ingest`] / [`tags`] — line protocol parsing and tag canonicalization
//! - [`bqip`] / [`server`] — the wire protocol and its network server
//! - [`config`] — host-application configuration surface
//! - [`error`] — error types

pub mod bqip;
pub mod btree;
pub mod catalog;
pub mod config;
pub mod error;
pub mod hmac;
pub mod ingest;
pub mod page;
pub mod query;
pub mod reservoir;
pub mod server;
pub mod store;
pub mod tags;
pub mod tblock;
pub mod tslab;

// Re-export primary API types at crate root for convenience.
pub use config::RondoConfig;
pub use error::{Result, RondoError};
pub use query::{Query, QueryResult};
pub use store::Store;
