//! Live feeds for the dashboard screens.
//!
//! Every feed is a projection over a shared cache entry: the free-picks and
//! all-picks feeds read the same `games` query, so any number of screens
//! showing picks share one upstream subscription.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use tipster_live::{Detach, Direction, Document, QueryKey, QuerySource, SharedQueryCache, Snapshot};
use tipster_store::{
    AppNotification, Decoded, GAMES, Game, LEADERBOARD, LeaderboardEntry, NOTIFICATIONS, Tier,
};

/// Picks, newest first.
pub fn games_query() -> QueryKey {
    QueryKey::collection(GAMES).order_by("createdAt", Direction::Descending)
}

/// Players, highest score first.
pub fn leaderboard_query() -> QueryKey {
    QueryKey::collection(LEADERBOARD).order_by("score", Direction::Descending)
}

/// Notifications, newest first.
pub fn notifications_query() -> QueryKey {
    QueryKey::collection(NOTIFICATIONS).order_by("createdAt", Direction::Descending)
}

/// Active free-tier picks.
pub fn free_picks(games: &[Document<Game>]) -> Vec<Document<Game>> {
    games
        .iter()
        .filter(|game| game.data.active && game.data.tier == Tier::Free)
        .cloned()
        .collect()
}

/// Every active pick.
pub fn active_picks(games: &[Document<Game>]) -> Vec<Document<Game>> {
    games.iter().filter(|game| game.data.active).cloned().collect()
}

/// Leaderboard with ranks filled in from position, unless the record stores one.
pub fn ranked(entries: &[Document<LeaderboardEntry>]) -> Vec<Document<LeaderboardEntry>> {
    entries
        .iter()
        .enumerate()
        .map(|(position, entry)| {
            let mut entry = entry.clone();
            if entry.data.rank.is_none() {
                entry.data.rank = Some(position as u32 + 1);
            }
            entry
        })
        .collect()
}

/// The latest projection of one cache entry.
///
/// Dropping the feed (or calling [`Feed::detach`]) releases its observer.
pub struct Feed<T> {
    rx: watch::Receiver<Vec<T>>,
    detach: Detach,
}

impl<T: Clone + Send + Sync + 'static> Feed<T> {
    /// Observe `key` on `cache`, storing `project(snapshot)` on every delivery.
    pub fn attach<R, P>(cache: &SharedQueryCache<R>, key: QueryKey, project: P) -> Self
    where
        R: Send + Sync + 'static,
        P: Fn(&Snapshot<R>) -> Vec<T> + Send + Sync + 'static,
    {
        debug!(cache = cache.name(), query = %key, "attaching feed");
        let (tx, mut rx) = watch::channel(Vec::new());
        let detach = cache.subscribe(key, move |snapshot| {
            tx.send_replace(project(&snapshot));
        });
        // The replay already ran; only later deliveries count as changes.
        rx.borrow_and_update();
        Self { rx, detach }
    }

    /// Items from the most recent delivery.
    pub fn current(&self) -> Vec<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next delivery.
    ///
    /// Fails once the feed is detached or its cache entry is reset.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await?;
        self.rx.borrow_and_update();
        Ok(())
    }

    /// Stop observing. Idempotent.
    pub fn detach(&self) {
        self.detach.detach();
    }

    pub fn is_detached(&self) -> bool {
        self.detach.is_detached()
    }
}

impl<T> std::fmt::Debug for Feed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("items", &self.rx.borrow().len())
            .finish_non_exhaustive()
    }
}

/// The dashboard's caches, one per record type, over one raw source.
#[derive(Clone)]
pub struct Dashboard {
    games: SharedQueryCache<Game>,
    leaderboard: SharedQueryCache<LeaderboardEntry>,
    notifications: SharedQueryCache<AppNotification>,
}

impl Dashboard {
    pub fn new(source: Arc<dyn QuerySource<Value>>) -> Self {
        debug!("creating dashboard caches");
        Self {
            games: SharedQueryCache::new(GAMES, Decoded::new(Arc::clone(&source))),
            leaderboard: SharedQueryCache::new(LEADERBOARD, Decoded::new(Arc::clone(&source))),
            notifications: SharedQueryCache::new(NOTIFICATIONS, Decoded::new(source)),
        }
    }

    /// Active free-tier picks, newest first.
    pub fn free_picks(&self) -> Feed<Document<Game>> {
        Feed::attach(&self.games, games_query(), |games| free_picks(games))
    }

    /// Every active pick, newest first.
    pub fn all_picks(&self) -> Feed<Document<Game>> {
        Feed::attach(&self.games, games_query(), |games| active_picks(games))
    }

    /// Ranked players, highest score first.
    pub fn leaderboard(&self) -> Feed<Document<LeaderboardEntry>> {
        Feed::attach(&self.leaderboard, leaderboard_query(), |entries| {
            ranked(entries)
        })
    }

    /// Notifications, newest first.
    pub fn notifications(&self) -> Feed<Document<AppNotification>> {
        Feed::attach(
            &self.notifications,
            notifications_query(),
            |notifications| notifications.to_vec(),
        )
    }

    pub fn games_cache(&self) -> &SharedQueryCache<Game> {
        &self.games
    }

    pub fn leaderboard_cache(&self) -> &SharedQueryCache<LeaderboardEntry> {
        &self.leaderboard
    }

    pub fn notifications_cache(&self) -> &SharedQueryCache<AppNotification> {
        &self.notifications
    }

    /// Cancel every upstream subscription; open feeds stop updating.
    pub fn shutdown(&self) {
        self.games.reset();
        self.leaderboard.reset();
        self.notifications.reset();
    }
}

impl std::fmt::Debug for Dashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dashboard")
            .field("games", &self.games)
            .field("leaderboard", &self.leaderboard)
            .field("notifications", &self.notifications)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tipster_store::{BookingCodes, Plan};

    fn game(id: &str, tier: Tier, active: bool) -> Document<Game> {
        Document::new(
            id,
            Game {
                fixture: format!("fixture {}", id),
                league: "Premier League".to_string(),
                sport: "football".to_string(),
                time: "18:00".to_string(),
                tier,
                prediction: "Home win".to_string(),
                booking_codes: BookingCodes::new(),
                confidence: 75,
                active,
                created_at: None,
            },
        )
    }

    fn entry(id: &str, score: f64, rank: Option<u32>) -> Document<LeaderboardEntry> {
        Document::new(
            id,
            LeaderboardEntry {
                username: id.to_string(),
                score,
                streak: 0,
                plan: Plan::Free,
                rank,
            },
        )
    }

    fn ids<T>(docs: &[Document<T>]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_free_picks_projection() {
        let games = vec![
            game("g4", Tier::Free, true),
            game("g3", Tier::Premium, true),
            game("g2", Tier::Free, false),
            game("g1", Tier::Free, true),
        ];
        assert_eq!(ids(&free_picks(&games)), vec!["g4", "g1"]);
        assert_eq!(ids(&active_picks(&games)), vec!["g4", "g3", "g1"]);
    }

    #[test]
    fn test_ranked_prefers_stored_rank() {
        let entries = vec![entry("a", 300.0, None), entry("b", 200.0, Some(7)), entry("c", 100.5, None)];
        let ranks: Vec<_> = ranked(&entries).iter().map(|e| e.data.rank).collect();
        assert_eq!(ranks, vec![Some(1), Some(7), Some(3)]);
    }

    #[test]
    fn test_projections_of_empty_snapshot() {
        assert!(free_picks(&[]).is_empty());
        assert!(ranked(&[]).is_empty());
    }

    #[test]
    fn test_dashboard_caches_named_by_collection() {
        let dashboard = Dashboard::new(Arc::new(tipster_store::MemoryStore::new()));
        assert_eq!(dashboard.games_cache().name(), GAMES);
        assert_eq!(dashboard.leaderboard_cache().name(), LEADERBOARD);
        assert_eq!(dashboard.notifications_cache().name(), NOTIFICATIONS);
    }

    #[test]
    fn test_query_keys() {
        assert_eq!(games_query().to_string(), "games orderBy createdAt desc");
        assert_eq!(leaderboard_query().to_string(), "leaderboard orderBy score desc");
        assert_eq!(
            notifications_query().to_string(),
            "notifications orderBy createdAt desc"
        );
    }
}
