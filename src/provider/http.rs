use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{FeedProvider, OddsApiEvent, RawFeed, Scoreboard};
use crate::config::{Config, League};
use crate::error::{EngineError, Result};
use crate::model::Period;

/// The Odds API reports exhausted credits with this code on a 401.
const OUT_OF_CREDITS: &str = "OUT_OF_USAGE_CREDITS";

/// HTTP feeds: The Odds API for markets, the ESPN site API for results.
pub struct HttpFeedProvider {
    http_client: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
    odds_api_key: String,
    odds_api_base_url: String,
    scoreboard_base_url: String,
}

struct RawResponse {
    status: StatusCode,
    body: String,
}

impl HttpFeedProvider {
    pub fn new(config: &Config) -> Result<Self> {
        let per_minute = NonZeroU32::new(config.requests_per_minute)
            .ok_or_else(|| EngineError::Config("requests_per_minute must be positive".into()))?;

        // HTTP client with timeouts
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(5)
            .build()?;

        Ok(Self {
            http_client,
            rate_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            odds_api_key: config.odds_api_key.clone(),
            odds_api_base_url: config.odds_api_base_url.trim_end_matches('/').to_string(),
            scoreboard_base_url: config.scoreboard_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Rate-limited GET that aborts as soon as `cancel` fires.
    async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<RawResponse> {
        let request = async {
            // Wait for rate limit
            self.rate_limiter.until_ready().await;

            let response = self
                .http_client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(map_transport_error)?;

            // Log API usage from headers
            if let Some(remaining) = response.headers().get("x-requests-remaining") {
                info!(
                    url = %url,
                    remaining = remaining.to_str().unwrap_or("?"),
                    "API requests remaining"
                );
            }

            let status = response.status();
            let body = response.text().await.map_err(map_transport_error)?;
            Ok::<_, EngineError>(RawResponse { status, body })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = request => result,
        }
    }

    fn odds_query<'a>(&'a self, markets: &'a str, bookmakers: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
        let mut query = vec![
            ("apiKey", self.odds_api_key.as_str()),
            ("regions", "us"),
            ("markets", markets),
            ("oddsFormat", "american"),
        ];
        if let Some(books) = bookmakers {
            query.push(("bookmakers", books));
        }
        query
    }
}

fn map_transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::UpstreamTimeout(e.to_string())
    } else {
        EngineError::Http(e)
    }
}

/// Maps a non-success status to the error taxonomy.
fn classify_failure(status: StatusCode, body: &str) -> EngineError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return EngineError::QuotaExceeded(format!("status {}", status.as_u16()));
    }
    if status == StatusCode::UNAUTHORIZED && body.contains(OUT_OF_CREDITS) {
        return EngineError::QuotaExceeded("usage credits exhausted".to_string());
    }
    if status == StatusCode::GATEWAY_TIMEOUT || status == StatusCode::REQUEST_TIMEOUT {
        return EngineError::UpstreamTimeout(format!("status {}", status.as_u16()));
    }
    EngineError::malformed(status.as_u16(), body)
}

/// Half-game answer. A 404 or an event without bookmakers means the event has
/// no period markets; any other failure is an error for the caller to count.
fn parse_period_event(response: &RawResponse) -> Result<Option<OddsApiEvent>> {
    if response.status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !response.status.is_success() {
        return Err(classify_failure(response.status, &response.body));
    }
    let event: OddsApiEvent = parse_body(response)?;
    Ok(Some(event).filter(|e| !e.bookmakers.is_empty()))
}

/// Parses a successful body; non-JSON or unexpected shapes keep a preview for diagnosis.
fn parse_body<T: DeserializeOwned>(response: &RawResponse) -> Result<T> {
    serde_json::from_str(&response.body).map_err(|e| {
        debug!(error = %e, "Upstream body failed to parse");
        EngineError::malformed(response.status.as_u16(), &response.body)
    })
}

#[async_trait]
impl FeedProvider for HttpFeedProvider {
    async fn fetch_odds(&self, league: &League, cancel: &CancellationToken) -> Result<RawFeed> {
        let url = format!("{}/sports/{}/odds", self.odds_api_base_url, league.sport_key);
        // Do not restrict bookmakers for full-game markets; sharper books are preferred downstream.
        let query = self.odds_query("spreads,totals,h2h", None);
        let response = self.get(&url, &query, cancel).await?;

        if !response.status.is_success() {
            return Err(classify_failure(response.status, &response.body));
        }

        let events: Vec<OddsApiEvent> = parse_body(&response)?;
        info!(league = %league.id, events = events.len(), "Fetched events from The Odds API");
        Ok(RawFeed::OddsApiEvents(events))
    }

    async fn fetch_period_odds(
        &self,
        league: &League,
        event_id: &str,
        period: Period,
        cancel: &CancellationToken,
    ) -> Result<Option<RawFeed>> {
        let (markets, bookmakers) = match period {
            // Bovada has the best half-game coverage; keep sharper books where available
            Period::FirstHalf => ("spreads_h1,totals_h1,h2h_h1", "bovada,pinnacle,circa,bookmaker"),
            Period::SecondHalf => ("spreads_h2,totals_h2,h2h_h2", "draftkings,fanduel,pinnacle,bovada"),
            Period::Full => return Ok(None),
        };
        let url = format!(
            "{}/sports/{}/events/{}/odds",
            self.odds_api_base_url, league.sport_key, event_id
        );
        let query = self.odds_query(markets, Some(bookmakers));
        let response = self.get(&url, &query, cancel).await?;

        match parse_period_event(&response)? {
            Some(event) => Ok(Some(RawFeed::OddsApiEvent { period, event })),
            None => {
                debug!(league = %league.id, event_id, period = period.as_str(), "No period odds for event");
                Ok(None)
            }
        }
    }

    async fn fetch_results(
        &self,
        league: &League,
        cancel: &CancellationToken,
    ) -> Result<Option<RawFeed>> {
        let path = match &league.scoreboard_path {
            Some(path) => path,
            None => return Ok(None),
        };
        let url = format!("{}/{}/scoreboard", self.scoreboard_base_url, path);
        let response = self.get(&url, &[], cancel).await?;

        if !response.status.is_success() {
            return Err(classify_failure(response.status, &response.body));
        }

        let scoreboard: Scoreboard = parse_body(&response)?;
        info!(league = %league.id, events = scoreboard.events.len(), "Fetched scoreboard");
        Ok(Some(RawFeed::Scoreboard(scoreboard)))
    }
}
