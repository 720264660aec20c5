//! MT5 bridge `/history/series` client

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{build_client, check_status, transport_error};
use crate::error::CollaboratorError;
use crate::history::HistorySource;
use crate::types::{timeframe_ms, Kline};

const RATE_LIMITED: &[StatusCode] = &[StatusCode::TOO_MANY_REQUESTS];
/// The bridge clamps `limit` to this range
const MIN_LIMIT: usize = 50;
const MAX_LIMIT: usize = 10_000;

#[derive(Clone)]
pub struct Mt5BridgeSource {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct SeriesRequest<'a> {
    symbol: &'a str,
    resolution: &'a str,
    /// Epoch seconds
    from: i64,
    to: i64,
    limit: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeriesResponse {
    ok: bool,
    #[serde(default)]
    bars: Vec<BridgeBar>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    fetched_at_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BridgeBar {
    t: i64,
    o: Option<f64>,
    h: Option<f64>,
    l: Option<f64>,
    c: Option<f64>,
    #[serde(default)]
    v: Option<f64>,
}

impl Mt5BridgeSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn to_decimal(value: Option<f64>) -> Option<Decimal> {
    value.and_then(Decimal::from_f64)
}

fn parse_series(body: &str, timeframe: &str) -> Result<Vec<Kline>> {
    let response: SeriesResponse = serde_json::from_str(body)?;
    if !response.ok {
        return Err(anyhow!(response
            .error
            .unwrap_or_else(|| "bridge reported failure".to_string())));
    }

    let bar_ms = timeframe_ms(timeframe).unwrap_or(0);
    let mut klines: Vec<Kline> = response
        .bars
        .into_iter()
        .filter_map(|bar| {
            Some(Kline {
                open_time: bar.t,
                open: to_decimal(bar.o)?,
                high: to_decimal(bar.h)?,
                low: to_decimal(bar.l)?,
                close: to_decimal(bar.c)?,
                volume: to_decimal(bar.v).unwrap_or_default(),
                close_time: bar.t + bar_ms - 1,
            })
        })
        .collect();
    klines.sort_by_key(|k| k.open_time);
    Ok(klines)
}

#[async_trait]
impl HistorySource for Mt5BridgeSource {
    fn name(&self) -> &str {
        "mt5"
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        from_ms: i64,
        to_ms: i64,
        limit: usize,
    ) -> Result<Vec<Kline>, CollaboratorError> {
        let url = format!("{}/history/series", self.base_url);
        let body = SeriesRequest {
            symbol,
            resolution: timeframe,
            from: from_ms / 1000,
            to: to_ms / 1000,
            limit: limit.clamp(MIN_LIMIT, MAX_LIMIT),
        };

        debug!(symbol, timeframe, from_ms, to_ms, "Fetching series from MT5 bridge");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, "MT5 bridge", RATE_LIMITED).await?;
        let text = response.text().await.map_err(transport_error)?;

        let bars = parse_series(&text, timeframe)
            .map_err(|e| CollaboratorError::Failed(format!("MT5 bridge: {e}")))?;
        // The bridge works in whole seconds; trim to the requested range
        Ok(bars
            .into_iter()
            .filter(|k| k.open_time >= from_ms && k.open_time <= to_ms)
            .collect())
    }
}
