// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! # Datalake Client Library
//!
//! Prepares machine learning datasets from raw annotated media held in object
//! storage. Raw data sources are ingested into a data-sources bucket, each
//! annotation/image pair is validated, and valid pairs are copied into a
//! dataset under a stable identifier and a deterministically drawn split.
//!
//! ## Features
//!
//! - **Object storage**: [`ObjectStore`] over any S3 compatible service
//!   ([`S3Store`]) or in process ([`MemoryStore`])
//! - **Validation**: annotation schema and image integrity checks
//! - **Datasets**: seeded split assignment and canonical object layout
//!   `{id}/{split}/{annotations|images}/{file}`
//! - **Bulk upload**: concurrent ingestion of local directories and registry
//!   datasets with content-hash deduplication
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datalake_client::{Error, S3Store, Settings, create_dataset, setup_buckets};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let settings = Settings::load(None)?;
//!     let store = S3Store::new(&settings.storage).await?;
//!
//!     setup_buckets(&store, &settings.buckets.all(), settings.buckets.versioning).await?;
//!
//!     let dataset = create_dataset(
//!         &store,
//!         &settings.buckets.data_sources,
//!         &settings.buckets.datasets,
//!         &["beach-litter"],
//!     )
//!     .await?;
//!     println!("Created dataset {}", dataset.id());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `profiling`: emits `tracing` spans on preparation, upload and download

mod config;
mod dataset;
mod error;
mod instrument;
mod memory;
mod metadata;
mod prepare;
mod registry;
mod retry;
mod s3;
mod source;
mod store;
mod upload;
mod validate;

pub use crate::{
    config::{
        BucketConfig, DatasetConfig, RegistryConfig, Settings, StoreConfig, UploadConfig,
        default_config_path,
    },
    dataset::{Dataset, DatasetBuilder, PairAudit, Split, SplitWeights, new_dataset_id},
    error::{Error, ValidationError},
    memory::{MemoryStore, StoredObject},
    metadata::{DataSourceType, DatasetMetadata},
    prepare::{
        PreparationReport, SkipReason, create_dataset, create_dataset_with, prepare_data_source,
        retrieve_dataset, setup_buckets, validate_connection,
    },
    registry::{DatasetRegistry, HuggingFaceRegistry, ImageRef, ItemStream, RegistryItem},
    retry::{RetryScope, classify_url, create_retry_policy},
    s3::S3Store,
    source::{DataSource, LocalSource, RegistrySource},
    store::{Metadata, ObjectBody, ObjectStore, ObjectStream, ObjectSummary, basename},
    upload::{BulkUploader, Progress, UploadFailure, UploadReport, content_hash, ensure_png},
    validate::{AnnotationRecord, check_image, parse_annotation, validate_annotation, validate_image},
};
