// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! Concurrent ingestion of data sources into object storage.
//!
//! Registry datasets are written as content-addressed pairs:
//!
//! ```text
//! {bucket}/{name}/images/{sha256}.png
//! {bucket}/{name}/annotations/{sha256}.json
//! ```
//!
//! where `sha256` is the hex digest of the image bytes as served by the
//! registry. Identical images always map to identical keys, so re-running an
//! interrupted upload simply overwrites what is already there.
//!
//! Local directories are mirrored under `{bucket}/{name}/{relative path}` with
//! [`DatasetMetadata`] attached to every object.

use crate::{
    Error,
    metadata::DatasetMetadata,
    registry::{DatasetRegistry, RegistryItem},
    source::{DataSource, LocalSource, RegistrySource},
    store::ObjectStore,
};
use futures::StreamExt as _;
use log::{debug, error, info, warn};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::{
    io::Cursor,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{
    sync::{Semaphore, mpsc::Sender},
    task::{JoinError, JoinSet},
};
use walkdir::WalkDir;

const DEFAULT_MAX_WORKERS: usize = 10;

/// Progress information for long-running operations.
///
/// For registry uploads the total grows while items are still being
/// scheduled; it is final once the registry stream is exhausted.
///
/// # Examples
///
/// ```rust
/// use datalake_client::Progress;
///
/// let progress = Progress {
///     current: 25,
///     total: 100,
/// };
/// assert_eq!(progress.current * 4, progress.total);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Number of completed items.
    pub current: usize,
    /// Number of items scheduled.
    pub total: usize,
}

/// A single item that could not be uploaded.
#[derive(Debug)]
pub struct UploadFailure {
    /// Human readable reference to the item (file path or registry row).
    pub item: String,
    pub error: Error,
}

/// Outcome of [`BulkUploader::upload`].
#[derive(Debug, Default)]
pub struct UploadReport {
    /// Data source name (object prefix).
    pub source: String,
    /// Items scheduled on the pool.
    pub scheduled: usize,
    /// Items fully uploaded.
    pub uploaded: usize,
    /// Items that failed, in completion order.
    pub failures: Vec<UploadFailure>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn a report with failures into [`Error::UploadFailed`].
    pub fn into_result(self) -> Result<Self, Error> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::UploadFailed {
                failed: self.failures.len(),
                total: self.scheduled,
            })
        }
    }

    fn record(&mut self, joined: Result<(String, Result<(), Error>), JoinError>) {
        match joined {
            Ok((_, Ok(()))) => self.uploaded += 1,
            Ok((item, Err(error))) => {
                warn!("Upload of {} failed: {}", item, error);
                self.failures.push(UploadFailure { item, error });
            }
            Err(err) => {
                error!("Upload task aborted: {}", err);
                self.failures.push(UploadFailure {
                    item: "<task>".to_owned(),
                    error: Error::JoinError(err),
                });
            }
        }
    }
}

/// Uploads data sources into a bucket on a bounded pool of tasks.
///
/// # Examples
///
/// ```rust
/// use datalake_client::{BulkUploader, DataSource, LocalSource, MemoryStore, ObjectStore};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), datalake_client::Error> {
/// let dir = std::env::temp_dir().join("datalake-doc-upload");
/// std::fs::create_dir_all(dir.join("annotations"))?;
/// std::fs::write(dir.join("annotations/a.json"), b"{}")?;
///
/// let store = Arc::new(MemoryStore::new());
/// store.make_bucket("data-sources", true).await?;
///
/// let uploader = BulkUploader::new(store.clone()).with_max_workers(4);
/// let source = DataSource::Local(LocalSource::new(&dir).with_name("beach"));
/// let report = uploader.upload("data-sources", &source).await?.into_result()?;
/// assert_eq!(report.uploaded, 1);
/// assert!(store.object("data-sources", "beach/annotations/a.json").is_some());
/// # Ok(())
/// # }
/// ```
pub struct BulkUploader {
    store: Arc<dyn ObjectStore>,
    registry: Option<Arc<dyn DatasetRegistry>>,
    max_workers: usize,
    progress: Option<Sender<Progress>>,
}

impl BulkUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            registry: None,
            max_workers: DEFAULT_MAX_WORKERS,
            progress: None,
        }
    }

    /// Maximum number of concurrent upload tasks (at least 1).
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Registry used for [`DataSource::Registry`] sources.
    pub fn with_registry(mut self, registry: Arc<dyn DatasetRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Report completed items on `progress`.
    pub fn with_progress(mut self, progress: Sender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Upload every item of `source` into `bucket`.
    ///
    /// Per-item failures are collected in [`UploadReport::failures`]; the
    /// call itself fails only when the source cannot be read at all
    /// (missing directory, unavailable or gated registry dataset, registry
    /// stream failure). Items already in flight are always awaited first.
    #[cfg_attr(feature = "profiling", tracing::instrument(skip(self, source), fields(source = source.name())))]
    pub async fn upload(&self, bucket: &str, source: &DataSource) -> Result<UploadReport, Error> {
        let report = match source {
            DataSource::Local(local) => {
                self.upload_local(bucket, local, source.metadata()).await?
            }
            DataSource::Registry(registry) => self.upload_registry(bucket, registry).await?,
        };

        info!(
            "Uploaded {}/{} items of {} into {} ({} failed)",
            report.uploaded,
            report.scheduled,
            report.source,
            bucket,
            report.failures.len()
        );
        Ok(report)
    }

    async fn upload_local(
        &self,
        bucket: &str,
        source: &LocalSource,
        metadata: DatasetMetadata,
    ) -> Result<UploadReport, Error> {
        source.verify()?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&source.root).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                let key = object_key(&source.name, entry.path().strip_prefix(&source.root)?);
                files.push((entry.into_path(), key));
            }
        }
        debug!("{}: {} files under {:?}", source.name, files.len(), source.root);

        let metadata = Arc::new(metadata.to_map());
        let total = files.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let sem = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        let mut report = UploadReport {
            source: source.name.clone(),
            scheduled: total,
            ..Default::default()
        };

        for (path, key) in files {
            let permit = sem.clone().acquire_owned().await?;
            let store = self.store.clone();
            let bucket = bucket.to_owned();
            let metadata = metadata.clone();
            let progress = self.progress.clone();
            let completed = completed.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let result = store
                    .upload_file(&bucket, &key, &path, Some(&metadata))
                    .await;
                notify(&progress, &completed, total).await;
                (path.display().to_string(), result)
            });

            while let Some(joined) = tasks.try_join_next() {
                report.record(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            report.record(joined);
        }
        Ok(report)
    }

    async fn upload_registry(
        &self,
        bucket: &str,
        source: &RegistrySource,
    ) -> Result<UploadReport, Error> {
        let registry = self.registry.clone().ok_or_else(|| {
            Error::InvalidParameters(format!(
                "no registry configured for data source '{}'",
                source.name
            ))
        })?;

        registry.check_availability(source).await?;
        info!("{}: registry dataset available, scheduling uploads", source.name);

        let scheduled = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let sem = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        let mut report = UploadReport {
            source: source.name.clone(),
            ..Default::default()
        };
        let mut stream_error = None;

        let mut items = registry.items(source);
        while let Some(item) = items.next().await {
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    error!("{}: registry stream failed: {}", source.name, err);
                    stream_error = Some(err);
                    break;
                }
            };

            // The stream is not polled again until a worker slot is free.
            let permit = sem.clone().acquire_owned().await?;
            scheduled.fetch_add(1, Ordering::SeqCst);
            report.scheduled += 1;

            let store = self.store.clone();
            let registry = registry.clone();
            let bucket = bucket.to_owned();
            let name = source.name.clone();
            let progress = self.progress.clone();
            let completed = completed.clone();
            let scheduled = scheduled.clone();

            let label = format!("{}/{}#{}", item.config, item.split, item.row_index);
            let task = async move {
                let _permit = permit;
                let result = upload_item(store.as_ref(), registry.as_ref(), &bucket, &name, item)
                    .await
                    .map(|hash| debug!("Uploaded {} as {}", label, hash));
                notify(&progress, &completed, scheduled.load(Ordering::SeqCst)).await;
                (label, result)
            };

            #[cfg(feature = "profiling")]
            let task = {
                use crate::instrument::{Instrument as _, info_span};
                let span = info_span!("registry_item", row = report.scheduled);
                task.instrument(span)
            };

            tasks.spawn(task);

            while let Some(joined) = tasks.try_join_next() {
                report.record(joined);
            }
        }
        drop(items);

        while let Some(joined) = tasks.join_next().await {
            report.record(joined);
        }

        match stream_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

async fn notify(progress: &Option<Sender<Progress>>, completed: &AtomicUsize, total: usize) {
    let current = completed.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(progress) = progress {
        let _ = progress.send(Progress { current, total }).await;
    }
}

/// Object key for a file, always `/` separated.
fn object_key(name: &str, relative: &Path) -> String {
    let mut key = name.to_owned();
    for component in relative.components() {
        key.push('/');
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}

/// Hex encoded SHA-256 digest of encoded image bytes.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Encoded image as PNG, re-encoding only when it is not PNG already.
pub fn ensure_png(data: Vec<u8>) -> Result<Vec<u8>, Error> {
    if matches!(image::guess_format(&data), Ok(image::ImageFormat::Png)) {
        return Ok(data);
    }

    let image = image::load_from_memory(&data)?;
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(png)
}

/// Upload one registry item; returns its content hash.
async fn upload_item(
    store: &dyn ObjectStore,
    registry: &dyn DatasetRegistry,
    bucket: &str,
    name: &str,
    item: RegistryItem,
) -> Result<String, Error> {
    let data = registry.fetch_image(item.image).await?;
    let hash = content_hash(&data);
    let png = tokio::task::spawn_blocking(move || ensure_png(data)).await??;

    let image_key = format!("{}/images/{}.png", name, hash);
    let annotation_key = format!("{}/annotations/{}.json", name, hash);

    let mut annotation = item.annotation;
    if let Value::Object(fields) = &mut annotation {
        fields
            .entry("image_path")
            .or_insert_with(|| Value::String(image_key.clone()));
    }

    store.upload_data(bucket, &image_key, png, None).await?;
    store
        .upload_data(bucket, &annotation_key, serde_json::to_vec(&annotation)?, None)
        .await?;
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(format: image::ImageFormat) -> Vec<u8> {
        let mut data = Vec::new();
        image::RgbImage::from_pixel(4, 3, image::Rgb([1, 2, 3]))
            .write_to(&mut Cursor::new(&mut data), format)
            .unwrap();
        data
    }

    #[test]
    fn test_content_hash_is_stable() {
        let data = encoded(image::ImageFormat::Png);
        assert_eq!(content_hash(&data), content_hash(&data.clone()));
        assert_eq!(content_hash(&data).len(), 64);
        assert_ne!(content_hash(&data), content_hash(b"other"));
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_ensure_png() {
        let png = encoded(image::ImageFormat::Png);
        assert_eq!(ensure_png(png.clone()).unwrap(), png);

        let jpeg = encoded(image::ImageFormat::Jpeg);
        let converted = ensure_png(jpeg).unwrap();
        assert_eq!(
            image::guess_format(&converted).unwrap(),
            image::ImageFormat::Png
        );

        assert!(ensure_png(b"garbage".to_vec()).is_err());
    }

    #[test]
    fn test_object_key() {
        assert_eq!(
            object_key("beach", Path::new("annotations/a.json")),
            "beach/annotations/a.json"
        );
        assert_eq!(object_key("beach", Path::new("a.png")), "beach/a.png");
    }

    #[test]
    fn test_report_into_result() {
        let report = UploadReport {
            source: "beach".to_owned(),
            scheduled: 3,
            uploaded: 2,
            failures: vec![UploadFailure {
                item: "a.png".to_owned(),
                error: Error::Connectivity("reset".to_owned()),
            }],
        };
        assert!(!report.is_success());
        assert!(matches!(
            report.into_result(),
            Err(Error::UploadFailed { failed: 1, total: 3 })
        ));
    }
}
