//! Tipster: sports predictions dashboard.
//!
//! Consumer side of the shared live-query cache:
//! - `feeds`: the dashboard's live feeds (free picks, all picks, leaderboard, notifications)
//! - `admin`: posting, deactivating and deleting picks
//! - `config`: store endpoints and credentials

pub mod admin;
pub mod config;
mod error;
pub mod feeds;

pub use admin::{NewGame, deactivate_game, delete_game, post_game};
pub use config::Config;
pub use error::ConfigError;
pub use feeds::{Dashboard, Feed};
