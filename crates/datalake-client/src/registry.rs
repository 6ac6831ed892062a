// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! External dataset registries.
//!
//! A registry hosts datasets as rows of an image column and an annotation
//! column, grouped by configuration and split. [`HuggingFaceRegistry`] talks
//! to the Hugging Face datasets-server API:
//!
//! | Endpoint    | Use                                             |
//! |-------------|-------------------------------------------------|
//! | `/is-valid` | availability and gating check                   |
//! | `/splits`   | enumerate `(config, split)` pairs               |
//! | `/rows`     | page through rows, 100 at a time                |
//!
//! Images are referenced by URL in row payloads and fetched on demand with
//! [`DatasetRegistry::fetch_image`], so downloads can run on the upload pool.

use crate::{
    Error, RegistryConfig,
    retry::create_retry_policy,
    source::RegistrySource,
};
use async_trait::async_trait;
use futures::{
    StreamExt as _,
    stream::{self, BoxStream},
};
use log::{debug, warn};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{collections::VecDeque, time::Duration};
use url::Url;

const ROWS_PAGE_SIZE: u64 = 100;

/// Lazy stream of registry items.
pub type ItemStream<'a> = BoxStream<'a, Result<RegistryItem, Error>>;

/// Image payload of a registry row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Encoded image bytes, already in memory.
    Bytes(Vec<u8>),
    /// Location the encoded image is served from.
    Url(String),
}

/// One row of a registry dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryItem {
    pub config: String,
    pub split: String,
    pub row_index: u64,
    pub image: ImageRef,
    pub annotation: Value,
}

/// Source of externally registered datasets.
#[async_trait]
pub trait DatasetRegistry: Send + Sync {
    /// Confirm the dataset exists and can be served with the given token.
    ///
    /// Fails with [`Error::NotFound`], [`Error::GatedAccess`],
    /// [`Error::NotAvailable`] or [`Error::Connectivity`].
    async fn check_availability(&self, source: &RegistrySource) -> Result<(), Error>;

    /// Every row of every configuration and split, lazily.
    fn items<'a>(&'a self, source: &'a RegistrySource) -> ItemStream<'a>;

    /// Resolve an [`ImageRef`] into encoded image bytes.
    async fn fetch_image(&self, image: ImageRef) -> Result<Vec<u8>, Error> {
        match image {
            ImageRef::Bytes(data) => Ok(data),
            ImageRef::Url(url) => Err(Error::InvalidParameters(format!(
                "registry cannot fetch remote image {}",
                url
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IsValid {
    #[serde(default)]
    viewer: bool,
    #[serde(default)]
    preview: bool,
}

#[derive(Debug, Deserialize)]
struct SplitsResponse {
    splits: Vec<SplitEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct SplitEntry {
    config: String,
    split: String,
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    rows: Vec<RowEntry>,
    #[serde(default)]
    num_rows_total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row_idx: u64,
    row: Map<String, Value>,
}

/// Position of the item stream across splits and pages.
struct Cursor {
    splits: Option<VecDeque<SplitEntry>>,
    current: Option<(SplitEntry, u64)>,
    rows: VecDeque<(SplitEntry, RowEntry)>,
}

/// [`DatasetRegistry`] backed by the Hugging Face datasets-server API.
#[derive(Debug, Clone)]
pub struct HuggingFaceRegistry {
    http: reqwest::Client,
    base_url: Url,
}

impl HuggingFaceRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self, Error> {
        let base_url = Url::parse(&config.base_url)?;
        let host = base_url
            .host_str()
            .ok_or_else(|| {
                Error::InvalidParameters(format!("registry URL {} has no host", config.base_url))
            })?
            .to_owned();

        debug!(
            "Registry client: base_url={}, timeout={}s, max_retries={}",
            base_url, config.timeout, config.max_retries
        );

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10).min(config.timeout()))
            .timeout(config.timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .retry(create_retry_policy(host, config.max_retries))
            .build()?;

        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                Error::InvalidParameters(format!("invalid registry URL {}", self.base_url))
            })?
            .pop_if_empty()
            .push(path);
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    fn get(&self, url: Url, token: Option<&str>) -> RequestBuilder {
        let request = self.http.get(url);
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn splits(&self, source: &RegistrySource) -> Result<Vec<SplitEntry>, Error> {
        let url = self.endpoint("splits", &[("dataset", source.name.as_str())])?;
        let resp = self.get(url, source.token.as_deref()).send().await?;
        let resp = check_status(resp, &source.name)?;
        let splits: SplitsResponse = resp.json().await?;
        debug!("{}: {} splits", source.name, splits.splits.len());
        Ok(splits.splits)
    }

    async fn rows(
        &self,
        source: &RegistrySource,
        entry: &SplitEntry,
        offset: u64,
    ) -> Result<RowsResponse, Error> {
        let offset = offset.to_string();
        let length = ROWS_PAGE_SIZE.to_string();
        let url = self.endpoint(
            "rows",
            &[
                ("dataset", source.name.as_str()),
                ("config", entry.config.as_str()),
                ("split", entry.split.as_str()),
                ("offset", offset.as_str()),
                ("length", length.as_str()),
            ],
        )?;
        let resp = self.get(url, source.token.as_deref()).send().await?;
        let resp = check_status(resp, &source.name)?;
        Ok(resp.json().await?)
    }

    /// Pull the next item, fetching split lists and row pages as needed.
    async fn advance(
        &self,
        source: &RegistrySource,
        cursor: &mut Cursor,
    ) -> Result<Option<RegistryItem>, Error> {
        loop {
            if let Some((entry, row)) = cursor.rows.pop_front() {
                match to_item(source, entry, row) {
                    Some(item) => return Ok(Some(item)),
                    None => continue,
                }
            }

            if cursor.splits.is_none() {
                cursor.splits = Some(self.splits(source).await?.into());
            }

            let (entry, offset) = match cursor.current.take() {
                Some(current) => current,
                None => match cursor.splits.as_mut().and_then(VecDeque::pop_front) {
                    Some(entry) => (entry, 0),
                    None => return Ok(None),
                },
            };

            let page = self.rows(source, &entry, offset).await?;
            let fetched = page.rows.len() as u64;
            let next = offset + fetched;
            debug!(
                "{}: {}/{} rows {}..{}",
                source.name, entry.config, entry.split, offset, next
            );

            let exhausted = fetched < ROWS_PAGE_SIZE
                || page.num_rows_total.is_some_and(|total| next >= total);
            if !exhausted {
                cursor.current = Some((entry.clone(), next));
            }
            cursor
                .rows
                .extend(page.rows.into_iter().map(|row| (entry.clone(), row)));
        }
    }
}

/// Map registry status codes onto the error taxonomy.
fn check_status(resp: Response, dataset: &str) -> Result<Response, Error> {
    match resp.status() {
        status if status.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED => Err(Error::GatedAccess(format!(
            "dataset '{}' is gated and requires an access token",
            dataset
        ))),
        StatusCode::NOT_FOUND => Err(Error::NotFound(format!(
            "dataset '{}' not found in registry",
            dataset
        ))),
        status => Err(Error::NotAvailable(format!(
            "registry request for '{}' failed with status {}",
            dataset, status
        ))),
    }
}

/// Build an item from a row, or `None` (logged) when the row lacks the
/// configured columns.
fn to_item(source: &RegistrySource, entry: SplitEntry, mut row: RowEntry) -> Option<RegistryItem> {
    let image = match row.row.remove(&source.image_column) {
        Some(Value::Object(cell)) => match cell.get("src") {
            Some(Value::String(src)) => ImageRef::Url(src.clone()),
            _ => {
                warn!(
                    "{}: row {} image cell has no src, skipping",
                    source.name, row.row_idx
                );
                return None;
            }
        },
        Some(Value::String(src)) => ImageRef::Url(src),
        _ => {
            warn!(
                "{}: row {} has no '{}' image column, skipping",
                source.name, row.row_idx, source.image_column
            );
            return None;
        }
    };

    let Some(annotation) = row.row.remove(&source.annotation_column) else {
        warn!(
            "{}: row {} has no '{}' annotation column, skipping",
            source.name, row.row_idx, source.annotation_column
        );
        return None;
    };

    Some(RegistryItem {
        config: entry.config,
        split: entry.split,
        row_index: row.row_idx,
        image,
        annotation,
    })
}

#[async_trait]
impl DatasetRegistry for HuggingFaceRegistry {
    async fn check_availability(&self, source: &RegistrySource) -> Result<(), Error> {
        let url = self.endpoint("is-valid", &[("dataset", source.name.as_str())])?;
        let resp = self
            .get(url, source.token.as_deref())
            .send()
            .await
            .map_err(|e| {
                Error::Connectivity(format!("failed to reach registry for '{}': {}", source.name, e))
            })?;
        let resp = check_status(resp, &source.name)?;

        let status: IsValid = resp.json().await?;
        if !(status.viewer || status.preview) {
            return Err(Error::NotAvailable(format!(
                "dataset '{}' is not available for download",
                source.name
            )));
        }

        debug!("{}: available (viewer={}, preview={})", source.name, status.viewer, status.preview);
        Ok(())
    }

    fn items<'a>(&'a self, source: &'a RegistrySource) -> ItemStream<'a> {
        let cursor = Cursor {
            splits: None,
            current: None,
            rows: VecDeque::new(),
        };

        // A page failure ends the stream after yielding the error.
        stream::unfold(Some(cursor), move |state| async move {
            let mut cursor = state?;
            match self.advance(source, &mut cursor).await {
                Ok(Some(item)) => Some((Ok(item), Some(cursor))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }

    async fn fetch_image(&self, image: ImageRef) -> Result<Vec<u8>, Error> {
        match image {
            ImageRef::Bytes(data) => Ok(data),
            ImageRef::Url(src) => {
                let url = Url::parse(&src)?;
                let resp = self.http.get(url).send().await?;
                if !resp.status().is_success() {
                    return Err(Error::NotAvailable(format!(
                        "image {} failed with status {}",
                        src,
                        resp.status()
                    )));
                }
                Ok(resp.bytes().await?.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{StreamExt as _, TryStreamExt as _};
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path, query_param},
    };

    fn registry(server: &MockServer) -> HuggingFaceRegistry {
        HuggingFaceRegistry::new(&RegistryConfig {
            base_url: server.uri(),
            token: None,
            timeout: 5,
            max_retries: 0,
        })
        .unwrap()
    }

    async fn availability(status: u16, body: Value) -> Result<(), Error> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/is-valid"))
            .and(query_param("dataset", "owner/litter"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        registry(&server)
            .check_availability(&RegistrySource::new("owner/litter"))
            .await
    }

    #[tokio::test]
    async fn test_availability_status_mapping() {
        assert!(availability(200, json!({"viewer": true, "preview": false})).await.is_ok());
        assert!(availability(200, json!({"viewer": false, "preview": true})).await.is_ok());
        assert!(matches!(
            availability(200, json!({"viewer": false, "preview": false})).await,
            Err(Error::NotAvailable(_))
        ));
        assert!(matches!(
            availability(401, json!({})).await,
            Err(Error::GatedAccess(_))
        ));
        assert!(matches!(
            availability(404, json!({})).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            availability(500, json!({})).await,
            Err(Error::NotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_availability_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/is-valid"))
            .and(header("authorization", "Bearer hf_secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"viewer": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/is-valid"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let registry = registry(&server);
        let source = RegistrySource::new("owner/litter");
        assert!(registry.check_availability(&source).await.is_err());
        assert!(
            registry
                .check_availability(&source.with_token("hf_secret"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_connectivity_error() {
        let registry = HuggingFaceRegistry::new(&RegistryConfig {
            base_url: "http://127.0.0.1:1".to_owned(),
            token: None,
            timeout: 2,
            max_retries: 0,
        })
        .unwrap();
        let result = registry
            .check_availability(&RegistrySource::new("owner/litter"))
            .await;
        assert!(matches!(result, Err(Error::Connectivity(_))));
    }

    fn rows(offset: u64, count: u64, total: u64) -> Value {
        let rows: Vec<Value> = (offset..offset + count)
            .map(|i| {
                json!({
                    "row_idx": i,
                    "row": {
                        "image": {"src": format!("https://cdn.example/{}.jpg", i), "height": 4, "width": 4},
                        "annotations": {"label": ["can"], "bbox": [[0, 0, 1, 1]]},
                    },
                    "truncated_cells": [],
                })
            })
            .collect();
        json!({"rows": rows, "num_rows_total": total})
    }

    #[tokio::test]
    async fn test_items_pages_through_splits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/splits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "splits": [
                    {"dataset": "owner/litter", "config": "default", "split": "train"},
                    {"dataset": "owner/litter", "config": "default", "split": "test"},
                ]
            })))
            .mount(&server)
            .await;
        for (offset, count) in [(0, 100), (100, 50)] {
            Mock::given(method("GET"))
                .and(path("/rows"))
                .and(query_param("split", "train"))
                .and(query_param("offset", offset.to_string()))
                .respond_with(ResponseTemplate::new(200).set_body_json(rows(offset, count, 150)))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/rows"))
            .and(query_param("split", "test"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows(0, 3, 3)))
            .mount(&server)
            .await;

        let registry = registry(&server);
        let source = RegistrySource::new("owner/litter");
        let items: Vec<RegistryItem> = registry.items(&source).try_collect().await.unwrap();

        assert_eq!(items.len(), 153);
        assert_eq!(items.iter().filter(|i| i.split == "train").count(), 150);
        assert_eq!(items[0].image, ImageRef::Url("https://cdn.example/0.jpg".to_owned()));
        assert_eq!(items[0].annotation["label"], json!(["can"]));
        assert_eq!(items[152].row_index, 2);
    }

    #[tokio::test]
    async fn test_items_skip_rows_without_columns() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/splits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "splits": [{"config": "default", "split": "train"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [
                    {"row_idx": 0, "row": {"image": {"src": "https://cdn.example/0.jpg"}}},
                    {"row_idx": 1, "row": {"annotations": {}}},
                    {"row_idx": 2, "row": {"image": {"src": "https://cdn.example/2.jpg"}, "annotations": []}},
                ],
                "num_rows_total": 3
            })))
            .mount(&server)
            .await;

        let registry = registry(&server);
        let items: Vec<RegistryItem> = registry
            .items(&RegistrySource::new("owner/litter"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].row_index, 2);
    }

    #[tokio::test]
    async fn test_items_page_failure_ends_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/splits"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let registry = registry(&server);
        let source = RegistrySource::new("owner/litter");
        let results: Vec<Result<RegistryItem, Error>> = registry.items(&source).collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::GatedAccess(_))));
    }

    #[tokio::test]
    async fn test_fetch_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assets/0.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let registry = registry(&server);
        let url = format!("{}/assets/0.png", server.uri());
        assert_eq!(registry.fetch_image(ImageRef::Url(url)).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(
            registry.fetch_image(ImageRef::Bytes(vec![9])).await.unwrap(),
            vec![9]
        );

        let missing = format!("{}/assets/404.png", server.uri());
        assert!(registry.fetch_image(ImageRef::Url(missing)).await.is_err());
    }
}
