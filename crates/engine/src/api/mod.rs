//! HTTP clients for external collaborators

pub mod binance;
pub mod mt5;
pub mod optimizer;

pub use binance::BinanceSource;
pub use mt5::Mt5BridgeSource;
pub use optimizer::HttpOptimizer;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use crate::error::CollaboratorError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// `Retry-After` in whole seconds, when present
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn transport_error(err: reqwest::Error) -> CollaboratorError {
    if err.is_connect() || err.is_timeout() {
        CollaboratorError::Unavailable(err.to_string())
    } else {
        CollaboratorError::Failed(err.to_string())
    }
}

/// Map non-success statuses; `rate_limit_statuses` are reported as rate limits
pub(crate) async fn check_status(
    response: Response,
    service: &str,
    rate_limit_statuses: &[StatusCode],
) -> Result<Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if rate_limit_statuses.contains(&status) {
        return Err(CollaboratorError::RateLimited {
            retry_after: retry_after(response.headers()),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(CollaboratorError::Failed(format!("{service} error {status}: {body}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }
}
