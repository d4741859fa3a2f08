//! Document store boundary for Tipster.
//!
//! This crate is everything the dashboard knows about the remote store:
//!
//! - **Records**: typed payloads for games, leaderboard entries and notifications
//! - **REST client**: create/update/delete/get over HTTP ([`StoreClient`])
//! - **Listener**: WebSocket live queries feeding a [`tipster_live::SnapshotSink`] ([`ListenClient`])
//! - **Memory store**: in-process store for tests and offline runs ([`MemoryStore`])
//! - **Decoding**: [`Decoded`] turns raw JSON live queries into typed ones

mod client;
mod error;
pub mod listen;
pub mod memory;
mod store;
mod typed;
mod types;

pub use client::StoreClient;
pub use error::StoreError;
pub use listen::ListenClient;
pub use memory::MemoryStore;
pub use store::DocumentStore;
pub use typed::Decoded;
pub use types::*;
