//! Tipster: sports predictions dashboard
//!
//! Main binary with subcommands:
//! - `watch`: print a live feed until interrupted
//! - `post`: publish a new pick
//! - `deactivate`: hide a pick from every feed
//! - `delete`: remove a pick

use std::fmt::Display;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tipster::config::{DEFAULT_LISTEN_URL, DEFAULT_STORE_URL};
use tipster::{Config, Dashboard, Feed, NewGame};
use tipster_live::Document;
use tipster_store::{AppNotification, BookingCodes, Game, LeaderboardEntry, Tier};

#[derive(Parser)]
#[command(name = "tipster")]
#[command(about = "Sports predictions dashboard", long_about = None)]
struct Cli {
    /// Document store REST endpoint
    #[arg(long, global = true, env = "TIPSTER_STORE_URL", default_value = DEFAULT_STORE_URL)]
    store_url: String,

    /// Live-query WebSocket endpoint
    #[arg(long, global = true, env = "TIPSTER_LISTEN_URL", default_value = DEFAULT_LISTEN_URL)]
    listen_url: String,

    /// Bearer token for the store
    #[arg(long, global = true, env = "TIPSTER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FeedKind {
    /// Active free-tier picks
    Free,
    /// Every active pick
    Picks,
    /// Ranked players
    Leaderboard,
    /// Broadcast notifications
    Notifications,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a live feed on every update until Ctrl-C
    Watch {
        #[arg(value_enum)]
        feed: FeedKind,
    },

    /// Publish a new pick
    Post {
        /// Fixture, e.g. "Arsenal vs Chelsea"
        #[arg(long)]
        fixture: String,

        #[arg(long, default_value = "")]
        league: String,

        #[arg(long, default_value = "")]
        sport: String,

        /// Kick-off time
        #[arg(long)]
        time: String,

        /// free or premium
        #[arg(long, default_value = "free")]
        tier: Tier,

        #[arg(long)]
        prediction: String,

        /// Confidence percentage (0-100)
        #[arg(long, default_value = "75")]
        confidence: u8,

        /// Booking code as bookmaker=CODE; repeatable
        #[arg(long = "code", value_parser = parse_booking_code)]
        codes: Vec<(String, String)>,
    },

    /// Hide a pick from every feed
    Deactivate {
        /// Pick id
        id: String,
    },

    /// Delete a pick
    Delete {
        /// Pick id
        id: String,
    },
}

/// Parse `bookmaker=CODE`.
fn parse_booking_code(s: &str) -> Result<(String, String), String> {
    let (bookmaker, code) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid booking code '{}', expected bookmaker=CODE", s))?;
    let bookmaker = bookmaker.trim();
    if bookmaker.is_empty() {
        return Err(format!("invalid booking code '{}', missing bookmaker", s));
    }
    Ok((bookmaker.to_string(), code.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tipster=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config {
        store_url: cli.store_url,
        listen_url: cli.listen_url,
        token: cli.token,
    };
    config.validate().map_err(|e| miette::miette!("{}", e))?;

    match cli.command {
        Commands::Watch { feed } => watch(&config, feed).await,

        Commands::Post {
            fixture,
            league,
            sport,
            time,
            tier,
            prediction,
            confidence,
            codes,
        } => {
            let store = config
                .store_client()
                .map_err(|e| miette::miette!("failed to create store client: {}", e))?;
            let game = NewGame {
                fixture,
                league,
                sport,
                time,
                tier,
                prediction,
                booking_codes: codes.into_iter().collect::<BookingCodes>(),
                confidence,
            };
            let id = tipster::post_game(&store, game)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("{}", id);
            Ok(())
        }

        Commands::Deactivate { id } => {
            let store = config
                .store_client()
                .map_err(|e| miette::miette!("failed to create store client: {}", e))?;
            tipster::deactivate_game(&store, &id)
                .await
                .map_err(|e| miette::miette!("{}", e))
        }

        Commands::Delete { id } => {
            let store = config
                .store_client()
                .map_err(|e| miette::miette!("failed to create store client: {}", e))?;
            tipster::delete_game(&store, &id)
                .await
                .map_err(|e| miette::miette!("{}", e))
        }
    }
}

async fn watch(config: &Config, kind: FeedKind) -> Result<()> {
    let dashboard = Dashboard::new(Arc::new(config.listen_client()));

    match kind {
        FeedKind::Free => follow(dashboard.free_picks(), format_game).await,
        FeedKind::Picks => follow(dashboard.all_picks(), format_game).await,
        FeedKind::Leaderboard => follow(dashboard.leaderboard(), format_entry).await,
        FeedKind::Notifications => follow(dashboard.notifications(), format_notification).await,
    }

    dashboard.shutdown();
    Ok(())
}

/// Print every update of `feed` until Ctrl-C or the feed closes.
async fn follow<T, F, D>(mut feed: Feed<T>, format: F)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T) -> D,
    D: Display,
{
    loop {
        let items = feed.current();
        println!("--- {} item(s)", items.len());
        for item in &items {
            println!("{}", format(item));
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            changed = feed.changed() => {
                if changed.is_err() {
                    info!("feed closed");
                    break;
                }
            }
        }
    }
    feed.detach();
}

fn format_game(game: &Document<Game>) -> String {
    let codes: Vec<_> = game
        .data
        .booking_codes
        .iter()
        .map(|(bookmaker, code)| format!("{}={}", bookmaker, code))
        .collect();
    format!(
        "[{}] {} | {} {} | {} ({}%) {} {}",
        game.id,
        game.data.fixture,
        game.data.league,
        game.data.time,
        game.data.prediction,
        game.data.confidence,
        game.data.tier,
        codes.join(" ")
    )
}

fn format_entry(entry: &Document<LeaderboardEntry>) -> String {
    format!(
        "#{} {} score={} streak={}",
        entry.data.rank.unwrap_or_default(),
        entry.data.username,
        entry.data.score,
        entry.data.streak
    )
}

fn format_notification(notification: &Document<AppNotification>) -> String {
    let when = notification
        .data
        .created_at
        .map(|at| at.format("%b %e").to_string())
        .unwrap_or_default();
    format!(
        "{} {}: {}",
        when, notification.data.title, notification.data.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_booking_code() {
        assert_eq!(
            parse_booking_code("sportybet=SB123"),
            Ok(("sportybet".to_string(), "SB123".to_string()))
        );
        assert_eq!(
            parse_booking_code(" bet365 = B3 "),
            Ok(("bet365".to_string(), "B3".to_string()))
        );
        assert!(parse_booking_code("sportybet").is_err());
        assert!(parse_booking_code("=CODE").is_err());
    }

    #[test]
    fn test_cli_parses_post() {
        let cli = Cli::try_parse_from([
            "tipster",
            "post",
            "--fixture",
            "Arsenal vs Chelsea",
            "--time",
            "18:30",
            "--prediction",
            "Over 2.5",
            "--tier",
            "premium",
            "--code",
            "sportybet=SB1",
            "--code",
            "bet9ja=B9",
        ])
        .unwrap();

        match cli.command {
            Commands::Post {
                tier,
                codes,
                confidence,
                ..
            } => {
                assert_eq!(tier, Tier::Premium);
                assert_eq!(confidence, 75);
                assert_eq!(codes.len(), 2);
            }
            _ => panic!("expected post"),
        }
    }

    #[test]
    fn test_cli_verifies() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
