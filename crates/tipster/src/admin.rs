//! Admin operations on picks.

use chrono::Utc;
use serde_json::json;
use tracing::info;

use tipster_store::{BookingCodes, DocumentStore, GAMES, Game, KNOWN_BOOKMAKERS, StoreError, Tier};

/// Highest accepted confidence percentage.
pub const MAX_CONFIDENCE: u8 = 100;

/// A pick as entered by an admin, before the store assigns an id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewGame {
    pub fixture: String,
    pub league: String,
    pub sport: String,
    pub time: String,
    pub tier: Tier,
    pub prediction: String,
    pub booking_codes: BookingCodes,
    pub confidence: u8,
}

impl NewGame {
    /// Check the required fields, the confidence and the bookmakers.
    pub fn validate(&self) -> Result<(), StoreError> {
        let required = [
            ("fixture", &self.fixture),
            ("time", &self.time),
            ("prediction", &self.prediction),
        ];
        let missing: Vec<_> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        if self.confidence > MAX_CONFIDENCE {
            return Err(StoreError::Validation(format!(
                "confidence must be at most {}, got {}",
                MAX_CONFIDENCE, self.confidence
            )));
        }

        let unknown: Vec<_> = self
            .booking_codes
            .iter()
            .map(|(bookmaker, _)| bookmaker)
            .filter(|bookmaker| !KNOWN_BOOKMAKERS.contains(bookmaker))
            .collect();
        if !unknown.is_empty() {
            return Err(StoreError::Validation(format!(
                "unknown bookmakers: {} (expected one of {})",
                unknown.join(", "),
                KNOWN_BOOKMAKERS.join(", ")
            )));
        }

        Ok(())
    }

    /// The stored record: active, stamped with the current time.
    fn into_record(self) -> Game {
        Game {
            fixture: self.fixture.trim().to_string(),
            league: self.league.trim().to_string(),
            sport: self.sport.trim().to_string(),
            time: self.time.trim().to_string(),
            tier: self.tier,
            prediction: self.prediction.trim().to_string(),
            booking_codes: self.booking_codes,
            confidence: self.confidence,
            active: true,
            created_at: Some(Utc::now()),
        }
    }
}

/// Publish a new pick. Returns the store-assigned id.
pub async fn post_game<S>(store: &S, game: NewGame) -> Result<String, StoreError>
where
    S: DocumentStore + ?Sized,
{
    game.validate()?;
    let record = game.into_record();
    let value = serde_json::to_value(&record)?;

    let id = store.create(GAMES, value).await?;
    info!(
        id = %id,
        fixture = %record.fixture,
        tier = %record.tier,
        codes = record.booking_codes.len(),
        "posted pick"
    );
    Ok(id)
}

/// Hide a pick from every feed without deleting it.
pub async fn deactivate_game<S>(store: &S, id: &str) -> Result<(), StoreError>
where
    S: DocumentStore + ?Sized,
{
    store.update(GAMES, id, json!({"active": false})).await?;
    info!(id = %id, "deactivated pick");
    Ok(())
}

/// Remove a pick permanently.
pub async fn delete_game<S>(store: &S, id: &str) -> Result<(), StoreError>
where
    S: DocumentStore + ?Sized,
{
    store.delete(GAMES, id).await?;
    info!(id = %id, "deleted pick");
    Ok(())
}
