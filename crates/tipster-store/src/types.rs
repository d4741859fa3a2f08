//! Record payloads stored in the dashboard's collections.
//!
//! Field names follow the store's camelCase JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collection holding prediction picks.
pub const GAMES: &str = "games";
/// Collection holding ranked players.
pub const LEADERBOARD: &str = "leaderboard";
/// Collection holding broadcast notifications.
pub const NOTIFICATIONS: &str = "notifications";

/// Who can see a pick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Premium,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// A player's subscription plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Premium,
}

/// Bookmakers the admin form knows about.
pub const KNOWN_BOOKMAKERS: &[&str] = &["sportybet", "bet9ja", "betway", "bet365", "_1xbet"];

/// Booking codes per bookmaker.
///
/// Blank codes are never kept, whether inserted locally or read from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Option<String>>",
    into = "BTreeMap<String, String>"
)]
pub struct BookingCodes(BTreeMap<String, String>);

impl BookingCodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the code for `bookmaker`. Blank codes remove the entry.
    pub fn insert(&mut self, bookmaker: impl Into<String>, code: impl AsRef<str>) {
        let bookmaker = bookmaker.into();
        let code = code.as_ref().trim();
        if code.is_empty() {
            self.0.remove(&bookmaker);
        } else {
            self.0.insert(bookmaker, code.to_string());
        }
    }

    pub fn get(&self, bookmaker: &str) -> Option<&str> {
        self.0.get(bookmaker).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, Option<String>>> for BookingCodes {
    fn from(raw: BTreeMap<String, Option<String>>) -> Self {
        let mut codes = Self::new();
        for (bookmaker, code) in raw {
            if let Some(code) = code {
                codes.insert(bookmaker, code);
            }
        }
        codes
    }
}

impl From<BookingCodes> for BTreeMap<String, String> {
    fn from(codes: BookingCodes) -> Self {
        codes.0
    }
}

impl<K: Into<String>, V: AsRef<str>> FromIterator<(K, V)> for BookingCodes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut codes = Self::new();
        for (bookmaker, code) in iter {
            codes.insert(bookmaker, code);
        }
        codes
    }
}

/// A prediction pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    /// e.g. "Arsenal vs Chelsea"
    pub fixture: String,
    #[serde(default)]
    pub league: String,
    #[serde(default)]
    pub sport: String,
    /// Kick-off time as entered by the admin.
    pub time: String,
    #[serde(default)]
    pub tier: Tier,
    pub prediction: String,
    #[serde(default)]
    pub booking_codes: BookingCodes,
    /// Percentage, 0-100.
    #[serde(default)]
    pub confidence: u8,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A ranked player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub username: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub streak: u32,
    #[serde(default)]
    pub plan: Plan,
    /// Stored rank; when absent the position in the feed is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

/// A broadcast notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppNotification {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}
