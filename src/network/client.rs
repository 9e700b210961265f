use crate::config::NetworkConfig;
/// HTTP client construction
///
/// Pre-configured `reqwest::Client` builders for the engine. Transfer
/// clients get a connect timeout only; stall detection is handled by the
/// downloaders' idle watchdogs so long responses are not cut off mid-body.
use std::time::Duration;

/// Client for metadata requests (HEAD, range probes). Bounded end to end.
pub fn create_metadata_client(cfg: &NetworkConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(&cfg.user_agent)
        .timeout(Duration::from_millis(cfg.head_timeout_ms))
        .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
        .build()
}

/// Client for body transfers: connect timeout, keep-alive reuse, no overall
/// deadline.
pub fn create_transfer_client(cfg: &NetworkConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(&cfg.user_agent)
        .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
        .read_timeout(Duration::from_millis(cfg.response_timeout_ms))
        .build()
}
