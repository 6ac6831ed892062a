// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! Preparation of datasets from data sources.
//!
//! For each data source, every annotation under `{name}/annotations/` in the
//! source bucket is fetched and validated, the image it references is fetched
//! and decoded, and valid pairs are copied into the dataset under the split
//! drawn for them. Processing is sequential so split draws map 1:1 onto
//! accepted pairs in listing order.
//!
//! Failure policy:
//!
//! | Failure                                   | Effect                         |
//! |-------------------------------------------|--------------------------------|
//! | connectivity check                        | run aborted before listing     |
//! | listing error                             | data source aborted            |
//! | annotation or image object missing       | pair skipped, logged           |
//! | annotation or image unreadable (denied)   | pair skipped, logged           |
//! | malformed annotation, corrupt image       | pair skipped, logged           |
//! | connectivity failure while fetching       | data source aborted            |
//! | copy failure                              | data source aborted, [`Error::Copy`] |

use crate::{
    Error,
    dataset::{Dataset, Split},
    error::ValidationError,
    store::ObjectStore,
    validate::{check_image, parse_annotation},
};
use futures::StreamExt as _;
use log::{debug, error, info, warn};
use std::{collections::BTreeMap, fmt};

/// Why a listed annotation did not produce a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipReason {
    /// Object name does not end in `.json`.
    NotAnnotation,
    /// Annotation disappeared between listing and fetching.
    MissingAnnotation,
    MalformedJson,
    InvalidSchema,
    /// Referenced image does not exist.
    MissingImage,
    CorruptImage,
    /// The store refused or failed to serve an object (e.g. access denied).
    Unreadable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::NotAnnotation => "not an annotation",
            SkipReason::MissingAnnotation => "missing annotation",
            SkipReason::MalformedJson => "malformed json",
            SkipReason::InvalidSchema => "invalid schema",
            SkipReason::MissingImage => "missing image",
            SkipReason::CorruptImage => "corrupt image",
            SkipReason::Unreadable => "unreadable object",
        };
        f.write_str(reason)
    }
}

impl From<&ValidationError> for SkipReason {
    fn from(err: &ValidationError) -> Self {
        match err {
            ValidationError::MalformedJson(_) => SkipReason::MalformedJson,
            ValidationError::Schema(_) => SkipReason::InvalidSchema,
            ValidationError::CorruptImage(_) => SkipReason::CorruptImage,
        }
    }
}

/// Summary of preparing one data source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparationReport {
    pub source: String,
    /// Objects listed under the annotations prefix.
    pub listed: usize,
    /// Pairs copied into the dataset.
    pub accepted: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    /// Accepted pairs per split.
    pub splits: BTreeMap<Split, usize>,
}

impl PreparationReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_owned(),
            ..Default::default()
        }
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_default() += 1;
    }
}

impl fmt::Display for PreparationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: listed {}, accepted {}, skipped {}",
            self.source,
            self.listed,
            self.accepted,
            self.skipped_total()
        )?;
        for split in Split::ALL {
            write!(f, ", {} {}", split, self.splits.get(&split).unwrap_or(&0))?;
        }
        Ok(())
    }
}

/// Fail fast when the store is unreachable.
pub async fn validate_connection(store: &dyn ObjectStore) -> Result<(), Error> {
    store.check_connection().await.inspect_err(|err| {
        error!("Object store connection failed: {}", err);
    })?;
    debug!("Object store connection verified");
    Ok(())
}

/// Create every missing bucket; existing buckets are left untouched.
///
/// Returns the buckets that were created.
pub async fn setup_buckets<S: AsRef<str>>(
    store: &dyn ObjectStore,
    buckets: &[S],
    enable_versioning: bool,
) -> Result<Vec<String>, Error> {
    validate_connection(store).await?;

    let mut created = Vec::new();
    for bucket in buckets {
        let bucket = bucket.as_ref();
        if store.bucket_exists(bucket).await? {
            info!("Bucket {} already exists", bucket);
            continue;
        }

        store.make_bucket(bucket, enable_versioning).await?;
        info!("Created bucket {} (versioning={})", bucket, enable_versioning);
        created.push(bucket.to_owned());
    }
    Ok(created)
}

/// Fetch an object fully, or record why the pair is skipped.
///
/// Only connectivity failures propagate; a missing object is recorded as
/// `missing` and any other storage error as [`SkipReason::Unreadable`]. The
/// handle is consumed before returning on every path.
async fn fetch(
    store: &dyn ObjectStore,
    bucket: &str,
    object: &str,
    missing: SkipReason,
    report: &mut PreparationReport,
) -> Result<Option<Vec<u8>>, Error> {
    match store.get_object(bucket, object).await {
        Ok(body) => body.bytes().await.map(Some).map_err(|err| {
            Error::Connectivity(format!("reading {}/{} failed: {}", bucket, object, err))
        }),
        Err(err) if err.is_connectivity() => Err(err),
        Err(err) => {
            warn!("Skipping {}/{}: {}", bucket, object, err);
            report.skip(if err.is_not_found() {
                missing
            } else {
                SkipReason::Unreadable
            });
            Ok(None)
        }
    }
}

async fn copy(
    store: &dyn ObjectStore,
    source_bucket: &str,
    source_object: &str,
    destination_bucket: &str,
    destination_object: &str,
    orphan: Option<String>,
) -> Result<(), Error> {
    store
        .copy_object(source_bucket, source_object, destination_bucket, destination_object)
        .await
        .map_err(|cause| {
            let err = Error::Copy {
                source_object: format!("{}/{}", source_bucket, source_object),
                destination: format!("{}/{}", destination_bucket, destination_object),
                orphan,
                cause: Box::new(cause),
            };
            error!("{}", err);
            err
        })
}

/// Copy the valid pairs of one data source into `dataset`.
#[cfg_attr(feature = "profiling", tracing::instrument(skip(store, dataset), fields(dataset = dataset.id())))]
pub async fn prepare_data_source(
    store: &dyn ObjectStore,
    source_bucket: &str,
    dataset: &mut Dataset,
    source: &str,
) -> Result<PreparationReport, Error> {
    let prefix = format!("{}/annotations/", source);
    let mut report = PreparationReport::new(source);
    let mut objects = store.list_objects(source_bucket, &prefix);

    while let Some(object) = objects.next().await {
        let object = object?;
        report.listed += 1;

        if !object.name.to_lowercase().ends_with(".json") {
            debug!("Ignoring {}", object.name);
            report.skip(SkipReason::NotAnnotation);
            continue;
        }

        let Some(data) = fetch(
            store,
            source_bucket,
            &object.name,
            SkipReason::MissingAnnotation,
            &mut report,
        )
        .await?
        else {
            continue;
        };

        let record = match parse_annotation(&data) {
            Ok(record) => record,
            Err(err) => {
                warn!("Skipping {}: {}", object.name, err);
                report.skip(SkipReason::from(&err));
                continue;
            }
        };

        let Some(image) = fetch(
            store,
            source_bucket,
            &record.image_path,
            SkipReason::MissingImage,
            &mut report,
        )
        .await?
        else {
            continue;
        };

        if let Err(err) = check_image(&image) {
            warn!("Skipping {} (image {}): {}", object.name, record.image_path, err);
            report.skip(SkipReason::from(&err));
            continue;
        }
        drop(image);

        let split = dataset.next_split();
        let annotation_path = dataset.format_annotation_path(&object.name, split);
        let image_path = dataset.format_image_path(&record.image_path, split);

        copy(
            store,
            source_bucket,
            &object.name,
            dataset.storage_area(),
            &annotation_path,
            None,
        )
        .await?;
        copy(
            store,
            source_bucket,
            &record.image_path,
            dataset.storage_area(),
            &image_path,
            Some(format!("{}/{}", dataset.storage_area(), annotation_path)),
        )
        .await?;

        debug!("{} -> {} ({})", object.name, annotation_path, split);
        report.accepted += 1;
        *report.splits.entry(split).or_default() += 1;
    }

    info!("{}", report);
    Ok(report)
}

/// Prepare every data source, in order, into an existing dataset.
pub async fn create_dataset_with<S: AsRef<str>>(
    store: &dyn ObjectStore,
    source_bucket: &str,
    dataset: &mut Dataset,
    sources: &[S],
) -> Result<Vec<PreparationReport>, Error> {
    validate_connection(store).await?;

    let mut reports = Vec::with_capacity(sources.len());
    for source in sources {
        reports.push(prepare_data_source(store, source_bucket, dataset, source.as_ref()).await?);
    }

    let accepted: usize = reports.iter().map(|r| r.accepted).sum();
    info!(
        "Dataset {} prepared in {}: {} pairs from {} sources",
        dataset.id(),
        dataset.storage_area(),
        accepted,
        reports.len()
    );
    Ok(reports)
}

/// Create a new dataset in `destination_bucket` from the given data sources.
///
/// # Examples
///
/// ```rust
/// use datalake_client::{MemoryStore, ObjectStore, create_dataset};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), datalake_client::Error> {
/// let store = MemoryStore::new();
/// store.make_bucket("data-sources", true).await?;
/// store.make_bucket("datasets", true).await?;
///
/// let dataset = create_dataset(&store, "data-sources", "datasets", &["empty"]).await?;
/// assert_eq!(dataset.storage_area(), "datasets");
/// # Ok(())
/// # }
/// ```
pub async fn create_dataset<S: AsRef<str>>(
    store: &dyn ObjectStore,
    source_bucket: &str,
    destination_bucket: &str,
    sources: &[S],
) -> Result<Dataset, Error> {
    let mut dataset = Dataset::new(destination_bucket);
    create_dataset_with(store, source_bucket, &mut dataset, sources).await?;
    Ok(dataset)
}

/// Re-open a dataset by identifier.
///
/// Fails with [`Error::NotFound`] unless at least one object exists under
/// `{id}/`. Never creates anything.
pub async fn retrieve_dataset(
    store: &dyn ObjectStore,
    destination_bucket: &str,
    id: &str,
) -> Result<Dataset, Error> {
    let dataset = Dataset::builder(destination_bucket).id(id).build()?;
    if !store.prefix_exists(destination_bucket, &dataset.prefix()).await? {
        return Err(Error::NotFound(format!(
            "dataset {} in {}",
            id, destination_bucket
        )));
    }
    Ok(dataset)
}
