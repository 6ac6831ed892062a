// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! Object storage abstraction.
//!
//! The pipeline only needs a handful of object storage operations, captured
//! by the [`ObjectStore`] trait. Two implementations are provided:
//!
//! - [`S3Store`](crate::S3Store): any S3 compatible service (MinIO, AWS S3)
//! - [`MemoryStore`](crate::MemoryStore): in-process storage (no persistence)
//!
//! Object contents are returned as an [`ObjectBody`], a scoped handle that
//! owns the underlying connection. The connection is released when the
//! handle is consumed or dropped, so every exit path (success, validation
//! failure, early return through `?`) gives it back.

use crate::Error;
use async_trait::async_trait;
use futures::{StreamExt as _, stream::BoxStream};
use log::trace;
use std::{collections::HashMap, path::Path, pin::Pin, sync::Arc};
use tokio::io::{AsyncRead, AsyncReadExt as _};

/// User metadata attached to an object at upload time.
pub type Metadata = HashMap<String, String>;

/// Lazy listing of the objects under a prefix.
///
/// Listings are pulled page by page as the stream is polled; a prefix with
/// millions of objects is never held in memory at once.
pub type ObjectStream<'a> = BoxStream<'a, Result<ObjectSummary, Error>>;

/// Summary of a stored object returned by [`ObjectStore::list_objects`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Full object name (key) within the bucket.
    pub name: String,
    /// Object size in bytes, when the store reports it.
    pub size: Option<u64>,
}

/// Readable contents of a stored object.
///
/// The handle owns the connection serving the object. Consuming it with
/// [`ObjectBody::bytes`] or [`ObjectBody::write_to`], or simply dropping it,
/// releases that connection.
pub struct ObjectBody {
    bucket: String,
    name: String,
    reader: Pin<Box<dyn AsyncRead + Send>>,
    lease: Option<Arc<()>>,
}

impl ObjectBody {
    pub fn new(
        bucket: impl Into<String>,
        name: impl Into<String>,
        reader: impl AsyncRead + Send + 'static,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            reader: Box::pin(reader),
            lease: None,
        }
    }

    /// Tie the handle to a lease token; the token is dropped with the handle.
    pub(crate) fn with_lease(mut self, lease: Arc<()>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the whole object into memory and release the connection.
    pub async fn bytes(mut self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        self.reader.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// Stream the object into a local file and release the connection.
    ///
    /// Returns the number of bytes written.
    pub async fn write_to(mut self, path: &Path) -> Result<u64, Error> {
        let mut file = tokio::fs::File::create(path).await?;
        let written = tokio::io::copy(&mut self.reader, &mut file).await?;
        Ok(written)
    }
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("bucket", &self.bucket)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for ObjectBody {
    fn drop(&mut self) {
        trace!("Released object {}/{}", self.bucket, self.name);
    }
}

/// Operations the pipeline performs against object storage.
///
/// All operations may fail with [`Error::Connectivity`] when the service is
/// unreachable, [`Error::NotFound`] for missing buckets or objects, and
/// [`Error::Storage`] for any other failure reported by the service.
///
/// Implementations must be thread-safe; the bulk uploader shares one store
/// across many concurrent tasks.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Succeeds iff the endpoint is reachable and the credentials are valid.
    async fn check_connection(&self) -> Result<(), Error>;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, Error>;

    /// Create a bucket, enabling version retention if requested.
    ///
    /// Not idempotent: callers check [`ObjectStore::bucket_exists`] first.
    async fn make_bucket(&self, bucket: &str, enable_versioning: bool) -> Result<(), Error>;

    /// Upload a local file, silently replacing any existing object.
    async fn upload_file(
        &self,
        bucket: &str,
        object: &str,
        path: &Path,
        metadata: Option<&Metadata>,
    ) -> Result<(), Error>;

    /// Upload an in-memory buffer, silently replacing any existing object.
    async fn upload_data(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
        metadata: Option<&Metadata>,
    ) -> Result<(), Error>;

    /// Lazily list the objects whose names start with `prefix`.
    fn list_objects<'a>(&'a self, bucket: &'a str, prefix: &'a str) -> ObjectStream<'a>;

    /// Open an object for reading.
    async fn get_object(&self, bucket: &str, object: &str) -> Result<ObjectBody, Error>;

    /// Server-side copy of an object, possibly across buckets.
    async fn copy_object(
        &self,
        source_bucket: &str,
        source_object: &str,
        destination_bucket: &str,
        destination_object: &str,
    ) -> Result<(), Error>;

    /// Returns true if at least one object exists under `prefix`.
    async fn prefix_exists(&self, bucket: &str, prefix: &str) -> Result<bool, Error> {
        let mut objects = self.list_objects(bucket, prefix);
        match objects.next().await {
            Some(Ok(_)) => Ok(true),
            Some(Err(err)) => Err(err),
            None => Ok(false),
        }
    }
}

/// Final segment of an object name or path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// MIME type for an object, sniffed from its leading bytes.
pub(crate) fn content_type(object: &str, data: &[u8]) -> &'static str {
    match infer::get(data) {
        Some(kind) => kind.mime_type(),
        None if object.to_lowercase().ends_with(".json") => "application/json",
        None => "application/octet-stream",
    }
}
