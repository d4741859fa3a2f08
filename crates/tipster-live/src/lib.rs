//! Shared live-query cache for Tipster.
//!
//! Many local consumers observe the same remote query (the games feed, the
//! leaderboard). This crate keeps exactly one upstream subscription per
//! logical query and fans every snapshot out to all local observers.
//!
//! ## Features
//!
//! - **Cache**: [`SharedQueryCache`] with per-query entries torn down when the last observer leaves
//! - **Query keys**: [`QueryKey`] naming a collection plus an optional ordering
//! - **Source seam**: [`QuerySource`] / [`Subscription`] / [`SnapshotSink`], the only store capability consumed

pub mod cache;
mod error;
mod query;
pub mod source;

pub use cache::{Detach, EntryInfo, SharedQueryCache};
pub use error::UpstreamError;
pub use query::{Direction, OrderBy, QueryKey};
pub use source::{Delivery, Document, QuerySource, Snapshot, SnapshotSink, Subscription};
