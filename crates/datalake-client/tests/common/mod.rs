// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use datalake_client::{
    Error, MemoryStore, Metadata, ObjectBody, ObjectStore, ObjectStream,
};
use futures::{StreamExt as _, stream};
use serde_json::{Value, json};
use std::{
    io::Cursor,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub const SOURCES: &str = "data-sources";
pub const DATASETS: &str = "datasets";

/// Encoded PNG with a solid fill; distinct colours give distinct bytes.
pub fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let mut data = Vec::new();
    image::RgbImage::from_pixel(width, height, image::Rgb([shade, 64, 128]))
        .write_to(&mut Cursor::new(&mut data), image::ImageFormat::Png)
        .unwrap();
    data
}

pub fn jpeg(shade: u8) -> Vec<u8> {
    let mut data = Vec::new();
    image::RgbImage::from_pixel(8, 8, image::Rgb([shade, shade, shade]))
        .write_to(&mut Cursor::new(&mut data), image::ImageFormat::Jpeg)
        .unwrap();
    data
}

pub fn annotation(image_path: &str) -> Value {
    json!({
        "label": ["bottle"],
        "bbox": [[1, 2, 3, 4]],
        "image_path": image_path,
    })
}

/// Store with both buckets created.
pub async fn memory_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new().with_page_size(2));
    store.make_bucket(SOURCES, true).await.unwrap();
    store.make_bucket(DATASETS, true).await.unwrap();
    store
}

/// Upload an annotation and, if `image` is given, the image it references.
pub async fn put_pair(store: &MemoryStore, source: &str, stem: &str, annotation: Value, image: Option<Vec<u8>>) {
    store
        .upload_data(
            SOURCES,
            &format!("{}/annotations/{}.json", source, stem),
            serde_json::to_vec(&annotation).unwrap(),
            None,
        )
        .await
        .unwrap();
    if let Some(image) = image {
        store
            .upload_data(SOURCES, &format!("{}/images/{}.png", source, stem), image, None)
            .await
            .unwrap();
    }
}

/// Valid pair `{stem}.json` / `{stem}.png` under `source`.
pub async fn put_valid_pair(store: &MemoryStore, source: &str, stem: &str, shade: u8) {
    let image_path = format!("{}/images/{}.png", source, stem);
    put_pair(store, source, stem, annotation(&image_path), Some(png(4, 4, shade))).await;
}

/// Object store wrapper that injects failures and measures concurrency.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    fail_get: Mutex<Option<String>>,
    deny_get: Mutex<Option<String>>,
    fail_list_after: Option<usize>,
    fail_copy_suffix: Mutex<Option<String>>,
    fail_upload_suffix: Mutex<Option<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub gets: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_get: Mutex::new(None),
            deny_get: Mutex::new(None),
            fail_list_after: None,
            fail_copy_suffix: Mutex::new(None),
            fail_upload_suffix: Mutex::new(None),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `get_object` of this exact object fails with a connectivity error.
    pub fn fail_get_of(self, object: &str) -> Self {
        *self.fail_get.lock().unwrap() = Some(object.to_owned());
        self
    }

    /// `get_object` of this exact object is refused with a storage error.
    pub fn deny_get_of(self, object: &str) -> Self {
        *self.deny_get.lock().unwrap() = Some(object.to_owned());
        self
    }

    /// Listings yield `count` objects, then fail.
    pub fn fail_list_after(mut self, count: usize) -> Self {
        self.fail_list_after = Some(count);
        self
    }

    /// `copy_object` of any source object ending in `suffix` fails.
    pub fn fail_copy_of(self, suffix: &str) -> Self {
        *self.fail_copy_suffix.lock().unwrap() = Some(suffix.to_owned());
        self
    }

    /// `upload_data`/`upload_file` of any object ending in `suffix` fails.
    pub fn fail_upload_of(self, suffix: &str) -> Self {
        *self.fail_upload_suffix.lock().unwrap() = Some(suffix.to_owned());
        self
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn upload_fails(&self, object: &str) -> bool {
        matches!(&*self.fail_upload_suffix.lock().unwrap(), Some(s) if object.ends_with(s.as_str()))
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn check_connection(&self) -> Result<(), Error> {
        self.inner.check_connection().await
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, Error> {
        self.inner.bucket_exists(bucket).await
    }

    async fn make_bucket(&self, bucket: &str, enable_versioning: bool) -> Result<(), Error> {
        self.inner.make_bucket(bucket, enable_versioning).await
    }

    async fn upload_file(
        &self,
        bucket: &str,
        object: &str,
        path: &Path,
        metadata: Option<&Metadata>,
    ) -> Result<(), Error> {
        self.enter().await;
        let result = if self.upload_fails(object) {
            Err(Error::Storage {
                operation: "upload_file",
                message: "injected".to_owned(),
            })
        } else {
            self.inner.upload_file(bucket, object, path, metadata).await
        };
        self.leave();
        result
    }

    async fn upload_data(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
        metadata: Option<&Metadata>,
    ) -> Result<(), Error> {
        self.enter().await;
        let result = if self.upload_fails(object) {
            Err(Error::Storage {
                operation: "upload_data",
                message: "injected".to_owned(),
            })
        } else {
            self.inner.upload_data(bucket, object, data, metadata).await
        };
        self.leave();
        result
    }

    fn list_objects<'a>(&'a self, bucket: &'a str, prefix: &'a str) -> ObjectStream<'a> {
        let objects = self.inner.list_objects(bucket, prefix);
        match self.fail_list_after {
            Some(count) => objects
                .take(count)
                .chain(stream::once(async {
                    Err(Error::Storage {
                        operation: "list_objects",
                        message: "page request failed".to_owned(),
                    })
                }))
                .boxed(),
            None => objects,
        }
    }

    async fn get_object(&self, bucket: &str, object: &str) -> Result<ObjectBody, Error> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.lock().unwrap().as_deref() == Some(object) {
            return Err(Error::Connectivity(format!("connection reset reading {}", object)));
        }
        if self.deny_get.lock().unwrap().as_deref() == Some(object) {
            return Err(Error::Storage {
                operation: "get_object",
                message: "AccessDenied".to_owned(),
            });
        }
        self.inner.get_object(bucket, object).await
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_object: &str,
        destination_bucket: &str,
        destination_object: &str,
    ) -> Result<(), Error> {
        let fails = matches!(
            &*self.fail_copy_suffix.lock().unwrap(),
            Some(s) if source_object.ends_with(s.as_str())
        );
        if fails {
            return Err(Error::Storage {
                operation: "copy_object",
                message: "injected".to_owned(),
            });
        }
        self.inner
            .copy_object(source_bucket, source_object, destination_bucket, destination_object)
            .await
    }
}
