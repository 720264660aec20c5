//! Binance public klines as a history source (no authentication required)

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::debug;

use super::{build_client, check_status, transport_error};
use crate::error::CollaboratorError;
use crate::history::HistorySource;
use crate::types::Kline;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: usize = 1000;
// 418 is Binance's IP ban after ignoring 429s
const RATE_LIMITED: &[StatusCode] = &[StatusCode::TOO_MANY_REQUESTS, StatusCode::IM_A_TEAPOT];

#[derive(Clone)]
pub struct BinanceSource {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl Default for BinanceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceSource {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn parse_klines(body: &str) -> Result<Vec<Kline>> {
    let raw_klines: Vec<RawKline> = serde_json::from_str(body)?;
    Ok(raw_klines
        .into_iter()
        .filter_map(|raw| {
            Some(Kline {
                open_time: raw.0,
                open: Decimal::from_str(&raw.1).ok()?,
                high: Decimal::from_str(&raw.2).ok()?,
                low: Decimal::from_str(&raw.3).ok()?,
                close: Decimal::from_str(&raw.4).ok()?,
                volume: Decimal::from_str(&raw.5).ok()?,
                close_time: raw.6,
            })
        })
        .collect())
}

#[async_trait]
impl HistorySource for BinanceSource {
    fn name(&self) -> &str {
        "binance"
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        from_ms: i64,
        to_ms: i64,
        limit: usize,
    ) -> Result<Vec<Kline>, CollaboratorError> {
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url, symbol, timeframe, from_ms, to_ms, limit
        );

        debug!(symbol, timeframe, from_ms, to_ms, "Fetching klines from Binance");

        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let response = check_status(response, "Binance API", RATE_LIMITED).await?;
        let body = response.text().await.map_err(transport_error)?;

        let klines = parse_klines(&body)
            .map_err(|e| CollaboratorError::Failed(format!("Binance klines: {e}")))?;
        debug!(count = klines.len(), "Fetched klines");
        Ok(klines)
    }
}
