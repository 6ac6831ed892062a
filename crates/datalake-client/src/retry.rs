// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! Retry policy for registry traffic.
//!
//! Registry requests fall in two groups:
//!
//! - **RegistryApi**: JSON endpoints of the registry server (`/is-valid`,
//!   `/splits`, `/rows`). Status codes carry meaning (401 gated, 404 unknown
//!   dataset) and must reach the caller untouched, so only throttling, server
//!   errors and transport failures are retried.
//! - **Asset**: image downloads from asset URLs returned in row payloads,
//!   usually a CDN. Retried on every transient failure, including 409 and 423.
//!
//! Both groups share the configured retry count
//! ([`RegistryConfig::max_retries`](crate::RegistryConfig::max_retries)).

use url::Url;

/// Category of a registry request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryScope {
    /// JSON API call against the registry host.
    RegistryApi,
    /// Asset (image) download from any other host.
    Asset,
}

/// Classify `url` against the registry API host.
///
/// Only HTTP(S) URLs whose host equals `api_host` are API calls; everything
/// else, including unparseable URLs, is treated as an asset download.
///
/// ```rust
/// use datalake_client::{RetryScope, classify_url};
///
/// let host = "datasets-server.huggingface.co";
/// assert_eq!(
///     classify_url("https://datasets-server.huggingface.co/rows?dataset=x", host),
///     RetryScope::RegistryApi
/// );
/// assert_eq!(
///     classify_url("https://cdn-lfs.huggingface.co/x/0.png", host),
///     RetryScope::Asset
/// );
/// ```
pub fn classify_url(url: &str, api_host: &str) -> RetryScope {
    match Url::parse(url) {
        Ok(parsed)
            if matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str() == Some(api_host) =>
        {
            RetryScope::RegistryApi
        }
        _ => RetryScope::Asset,
    }
}

/// Build the reqwest retry policy for a registry whose API lives on `api_host`.
pub fn create_retry_policy(api_host: String, max_retries: u32) -> reqwest::retry::Builder {
    reqwest::retry::for_host("*")
        .max_retries_per_request(max_retries)
        .classify_fn(move |req_rep| {
            let url = req_rep.uri().to_string();

            match classify_url(&url, &api_host) {
                RetryScope::RegistryApi => match req_rep.status() {
                    Some(status) => match status.as_u16() {
                        408 | 429 | 500..=599 => req_rep.retryable(),
                        _ => req_rep.success(),
                    },
                    None if req_rep.error().is_some() => req_rep.retryable(),
                    None => req_rep.success(),
                },
                RetryScope::Asset => match req_rep.status() {
                    Some(status) => match status.as_u16() {
                        408 | 409 | 423 | 429 | 500..=599 => req_rep.retryable(),
                        _ => req_rep.success(),
                    },
                    None if req_rep.error().is_some() => req_rep.retryable(),
                    None => req_rep.success(),
                },
            }
        })
}
