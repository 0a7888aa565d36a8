//! Score Feed Client
//!
//! Read-only view of the external sports score service. The engines only
//! need two questions answered: where is this game in its period lifecycle,
//! and which units advanced in each playoff round. Both are behind the
//! [`ScoreSource`] trait so schedulers can run against a stub in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Halftime,
    Final,
}

impl GameStatus {
    /// Maps the feed's status vocabulary onto ours. Unknown strings read as
    /// Scheduled, which reveals nothing early.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in_progress" | "in" | "live" | "playing" => GameStatus::InProgress,
            "halftime" | "half" => GameStatus::Halftime,
            "final" | "post" | "complete" | "closed" => GameStatus::Final,
            _ => GameStatus::Scheduled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GameScore {
    pub game_id: String,
    pub status: GameStatus,
    /// 1-based quarter currently in play; 0 before kickoff.
    pub period: u8,
    pub home_points: u32,
    pub away_points: u32,
}

#[async_trait]
pub trait ScoreSource: Send + Sync {
    async fn game_status(&self, game_id: &str) -> Result<GameScore>;

    /// Round key -> units that advanced, for the whole season so far.
    async fn round_winners(&self, season: &str) -> Result<BTreeMap<String, Vec<String>>>;
}

#[derive(Debug, Deserialize)]
struct FeedGame {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default, alias = "quarter")]
    period: u8,
    #[serde(default)]
    home_points: u32,
    #[serde(default)]
    away_points: u32,
}

#[derive(Debug, Deserialize)]
struct FeedPlayoffs {
    #[serde(default)]
    rounds: BTreeMap<String, Vec<String>>,
}

#[derive(Clone)]
pub struct SportsFeedClient {
    client: Client,
    base_url: String,
}

impl SportsFeedClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", key)
                    .parse()
                    .context("Invalid score feed api key")?,
            );
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .context("Failed to build SportsFeedClient")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ScoreSource for SportsFeedClient {
    async fn game_status(&self, game_id: &str) -> Result<GameScore> {
        let url = self.url(&format!("/v1/games/{}", game_id));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET /v1/games/{} failed", game_id))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET /v1/games/{} {}: {}", game_id, status, text));
        }

        let game: FeedGame = resp
            .json()
            .await
            .context("Failed to parse game status response")?;

        Ok(GameScore {
            game_id: game.id.unwrap_or_else(|| game_id.to_string()),
            status: GameStatus::parse(&game.status),
            period: game.period,
            home_points: game.home_points,
            away_points: game.away_points,
        })
    }

    async fn round_winners(&self, season: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let url = self.url(&format!("/v1/seasons/{}/playoff-winners", season));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET playoff winners for {} failed", season))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "GET playoff winners for {} {}: {}",
                season,
                status,
                text
            ));
        }

        let payload: FeedPlayoffs = resp
            .json()
            .await
            .context("Failed to parse playoff winners response")?;
        Ok(payload.rounds)
    }
}
