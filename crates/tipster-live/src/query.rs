//! Query keys identifying one logical live query.

use std::fmt;

/// Sort direction for an ordered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    /// Wire name used in query strings (`asc` / `desc`).
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-field ordering applied by the upstream store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Identifies one logical live query against the remote store.
///
/// Two keys are equal exactly when they name the same collection with the
/// same ordering, so every consumer asking for "games newest first" lands on
/// the same cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    collection: String,
    order: Option<OrderBy>,
}

impl QueryKey {
    /// Query every document of a collection in store order.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            order: None,
        }
    }

    /// Order the query by a single field.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// The collection name.
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// The ordering, if any.
    pub fn order(&self) -> Option<&OrderBy> {
        self.order.as_ref()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.order {
            Some(order) => write!(
                f,
                "{} orderBy {} {}",
                self.collection, order.field, order.direction
            ),
            None => f.write_str(&self.collection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(QueryKey::collection("games").to_string(), "games");
        assert_eq!(
            QueryKey::collection("leaderboard")
                .order_by("score", Direction::Descending)
                .to_string(),
            "leaderboard orderBy score desc"
        );
    }

    #[test]
    fn test_ordering_is_part_of_identity() {
        let plain = QueryKey::collection("games");
        let newest = QueryKey::collection("games").order_by("createdAt", Direction::Descending);
        let oldest = QueryKey::collection("games").order_by("createdAt", Direction::Ascending);

        assert_ne!(plain, newest);
        assert_ne!(newest, oldest);
        assert_eq!(
            newest,
            QueryKey::collection("games").order_by("createdAt", Direction::Descending)
        );
    }

    #[test]
    fn test_accessors() {
        let key = QueryKey::collection("games").order_by("createdAt", Direction::Descending);
        assert_eq!(key.collection_name(), "games");
        let order = key.order().unwrap();
        assert_eq!(order.field, "createdAt");
        assert_eq!(order.direction, Direction::Descending);
        assert!(QueryKey::collection("games").order().is_none());
    }
}
