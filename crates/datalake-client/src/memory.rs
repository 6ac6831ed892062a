// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

use crate::{
    Error,
    store::{Metadata, ObjectBody, ObjectStore, ObjectStream, ObjectSummary, content_type},
};
use async_trait::async_trait;
use futures::{StreamExt as _, TryStreamExt as _, stream};
use log::debug;
use std::{
    collections::{BTreeMap, HashMap},
    io::Cursor,
    ops::Bound,
    path::Path,
    sync::{Arc, RwLock},
};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// An object held by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: Metadata,
    pub content_type: String,
}

#[derive(Debug, Default)]
struct Bucket {
    versioning: bool,
    objects: BTreeMap<String, StoredObject>,
}

/// In-memory object store (no persistence).
///
/// Behaves like an S3 bucket for the operations the pipeline uses: objects
/// are kept in key order, listings are served in pages, copies fail when the
/// source object or either bucket is missing, and uploads overwrite.
///
/// Every [`ObjectBody`] handed out holds a lease on the store, so tests can
/// assert with [`MemoryStore::open_handles`] that nothing was leaked.
///
/// # Examples
///
/// ```rust
/// use datalake_client::{MemoryStore, ObjectStore};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), datalake_client::Error> {
/// let store = MemoryStore::new();
/// store.make_bucket("datasets", false).await?;
/// store
///     .upload_data("datasets", "a.json", b"{}".to_vec(), None)
///     .await?;
/// let body = store.get_object("datasets", "a.json").await?;
/// assert_eq!(body.bytes().await?, b"{}");
/// assert_eq!(store.open_handles(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, Bucket>>,
    lease: Arc<()>,
    page_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            lease: Arc::new(()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Serve listings in pages of `page_size` objects.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of [`ObjectBody`] handles that are still alive.
    pub fn open_handles(&self) -> usize {
        Arc::strong_count(&self.lease) - 1
    }

    /// Returns a copy of a stored object, if present.
    pub fn object(&self, bucket: &str, object: &str) -> Option<StoredObject> {
        let buckets = self.buckets.read().ok()?;
        buckets.get(bucket)?.objects.get(object).cloned()
    }

    /// All object names in a bucket, in key order.
    pub fn object_names(&self, bucket: &str) -> Vec<String> {
        match self.buckets.read() {
            Ok(buckets) => buckets
                .get(bucket)
                .map(|b| b.objects.keys().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Versioning flag of a bucket, or `None` if it does not exist.
    pub fn is_versioned(&self, bucket: &str) -> Option<bool> {
        let buckets = self.buckets.read().ok()?;
        buckets.get(bucket).map(|b| b.versioning)
    }

    fn poisoned(operation: &'static str) -> Error {
        Error::Storage {
            operation,
            message: "memory store lock poisoned".to_owned(),
        }
    }

    fn page(
        &self,
        bucket: &str,
        prefix: &str,
        after: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, Error> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| Self::poisoned("list_objects"))?;
        let objects = &buckets
            .get(bucket)
            .ok_or_else(|| Error::NotFound(format!("bucket {}", bucket)))?
            .objects;

        let lower = match after {
            Some(after) => Bound::Excluded(after.to_owned()),
            None => Bound::Included(prefix.to_owned()),
        };

        Ok(objects
            .range((lower, Bound::Unbounded))
            .take_while(|(name, _)| name.starts_with(prefix))
            .take(self.page_size)
            .map(|(name, object)| ObjectSummary {
                name: name.clone(),
                size: Some(object.data.len() as u64),
            })
            .collect())
    }

    fn put(
        &self,
        operation: &'static str,
        bucket: &str,
        object: &str,
        stored: StoredObject,
    ) -> Result<(), Error> {
        let mut buckets = self.buckets.write().map_err(|_| Self::poisoned(operation))?;
        let target = buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::NotFound(format!("bucket {}", bucket)))?;
        target.objects.insert(object.to_owned(), stored);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn check_connection(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, Error> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| Self::poisoned("bucket_exists"))?;
        Ok(buckets.contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str, enable_versioning: bool) -> Result<(), Error> {
        if bucket.is_empty() {
            return Err(Error::InvalidParameters("bucket name is empty".to_owned()));
        }

        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| Self::poisoned("make_bucket"))?;
        if buckets.contains_key(bucket) {
            return Err(Error::Storage {
                operation: "make_bucket",
                message: format!("bucket {} already exists", bucket),
            });
        }

        buckets.insert(
            bucket.to_owned(),
            Bucket {
                versioning: enable_versioning,
                objects: BTreeMap::new(),
            },
        );
        debug!("Created bucket {} (versioning={})", bucket, enable_versioning);
        Ok(())
    }

    async fn upload_file(
        &self,
        bucket: &str,
        object: &str,
        path: &Path,
        metadata: Option<&Metadata>,
    ) -> Result<(), Error> {
        let data = tokio::fs::read(path).await?;
        self.upload_data(bucket, object, data, metadata).await
    }

    async fn upload_data(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
        metadata: Option<&Metadata>,
    ) -> Result<(), Error> {
        let stored = StoredObject {
            content_type: content_type(object, &data).to_owned(),
            metadata: metadata.cloned().unwrap_or_default(),
            data,
        };
        self.put("upload_data", bucket, object, stored)
    }

    fn list_objects<'a>(&'a self, bucket: &'a str, prefix: &'a str) -> ObjectStream<'a> {
        // State: None when exhausted, Some(cursor) with the last key served.
        let pages = stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok(None);
            };
            let page = self.page(bucket, prefix, after.as_deref())?;
            let next = match page.last() {
                Some(last) if page.len() == self.page_size => Some(Some(last.name.clone())),
                _ => None,
            };
            Ok::<_, Error>(Some((page, next)))
        });

        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, Error>)))
            .try_flatten()
            .boxed()
    }

    async fn get_object(&self, bucket: &str, object: &str) -> Result<ObjectBody, Error> {
        let data = {
            let buckets = self
                .buckets
                .read()
                .map_err(|_| Self::poisoned("get_object"))?;
            buckets
                .get(bucket)
                .ok_or_else(|| Error::NotFound(format!("bucket {}", bucket)))?
                .objects
                .get(object)
                .ok_or_else(|| Error::NotFound(format!("object {}/{}", bucket, object)))?
                .data
                .clone()
        };

        Ok(ObjectBody::new(bucket, object, Cursor::new(data)).with_lease(self.lease.clone()))
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_object: &str,
        destination_bucket: &str,
        destination_object: &str,
    ) -> Result<(), Error> {
        let stored = {
            let buckets = self
                .buckets
                .read()
                .map_err(|_| Self::poisoned("copy_object"))?;
            buckets
                .get(source_bucket)
                .ok_or_else(|| Error::NotFound(format!("bucket {}", source_bucket)))?
                .objects
                .get(source_object)
                .ok_or_else(|| {
                    Error::NotFound(format!("object {}/{}", source_bucket, source_object))
                })?
                .clone()
        };

        self.put("copy_object", destination_bucket, destination_object, stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt as _;

    async fn seeded_store(page_size: usize) -> MemoryStore {
        let store = MemoryStore::new().with_page_size(page_size);
        store.make_bucket("sources", true).await.unwrap();
        for name in [
            "cats/annotations/a.json",
            "cats/annotations/b.json",
            "cats/annotations/c.json",
            "cats/images/a.png",
            "dogs/annotations/d.json",
        ] {
            store
                .upload_data("sources", name, name.as_bytes().to_vec(), None)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_list_objects_paged_prefix() {
        let store = seeded_store(2).await;
        let names: Vec<String> = store
            .list_objects("sources", "cats/annotations/")
            .map_ok(|o| o.name)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            names,
            vec![
                "cats/annotations/a.json",
                "cats/annotations/b.json",
                "cats/annotations/c.json"
            ]
        );
    }

    #[tokio::test]
    async fn test_list_objects_missing_bucket() {
        let store = MemoryStore::new();
        let result: Result<Vec<_>, _> = store.list_objects("nope", "").try_collect().await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_make_bucket_twice_fails() {
        let store = MemoryStore::new();
        store.make_bucket("datasets", true).await.unwrap();
        assert_eq!(store.is_versioned("datasets"), Some(true));
        assert!(store.make_bucket("datasets", false).await.is_err());
        assert!(store.bucket_exists("datasets").await.unwrap());
        assert!(!store.bucket_exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_object_errors() {
        let store = seeded_store(10).await;
        let missing_source = store
            .copy_object("sources", "cats/images/zzz.png", "sources", "x")
            .await;
        assert!(matches!(missing_source, Err(Error::NotFound(_))));

        let missing_bucket = store
            .copy_object("sources", "cats/images/a.png", "datasets", "x")
            .await;
        assert!(matches!(missing_bucket, Err(Error::NotFound(_))));

        store.make_bucket("datasets", false).await.unwrap();
        store
            .copy_object("sources", "cats/images/a.png", "datasets", "x/a.png")
            .await
            .unwrap();
        assert_eq!(
            store.object("datasets", "x/a.png").unwrap().data,
            b"cats/images/a.png"
        );
    }

    #[tokio::test]
    async fn test_open_handles_tracks_bodies() {
        let store = seeded_store(10).await;
        let body = store
            .get_object("sources", "cats/annotations/a.json")
            .await
            .unwrap();
        assert_eq!(store.open_handles(), 1);
        drop(body);
        assert_eq!(store.open_handles(), 0);

        assert!(store.prefix_exists("sources", "dogs/").await.unwrap());
        assert!(!store.prefix_exists("sources", "birds/").await.unwrap());
    }
}
