// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

use crate::{
    Error, StoreConfig,
    store::{Metadata, ObjectBody, ObjectStore, ObjectStream, ObjectSummary, content_type},
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, timeout::TimeoutConfig};
use aws_sdk_s3::{
    Client,
    config::{Credentials, http::HttpResponse},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{
        BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration,
        VersioningConfiguration,
    },
};
use futures::{StreamExt as _, TryStreamExt as _, stream};
use log::{debug, info};
use std::path::Path;
use url::Url;

/// Map an SDK failure onto the client error taxonomy.
///
/// Transport failures and timeouts are connectivity problems, 404 responses
/// and the `NoSuch*` codes are missing resources, everything else is a
/// generic storage failure.
fn classify<E>(operation: &'static str, err: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => Error::Connectivity(format!(
            "{} failed: {}",
            operation,
            DisplayErrorContext(&err)
        )),
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code().unwrap_or_default();
            if status == 404 || matches!(code, "NoSuchKey" | "NoSuchBucket" | "NotFound") {
                Error::NotFound(format!("{}: {}", operation, DisplayErrorContext(&err)))
            } else {
                Error::Storage {
                    operation,
                    message: DisplayErrorContext(&err).to_string(),
                }
            }
        }
        _ => Error::Storage {
            operation,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

/// URL-encode an object name for use in an `x-amz-copy-source` header,
/// keeping the `/` separators.
fn copy_source(bucket: &str, object: &str) -> Result<String, Error> {
    let mut url = Url::parse("s3://copy-source/")?;
    url.path_segments_mut()
        .map_err(|_| Error::InvalidParameters(format!("invalid object name {}", object)))?
        .pop_if_empty()
        .extend(object.split('/'));
    Ok(format!("{}{}", bucket, url.path()))
}

/// [`ObjectStore`] backed by an S3 compatible service (MinIO, AWS S3).
///
/// # Examples
///
/// ```rust,no_run
/// use datalake_client::{ObjectStore, S3Store, StoreConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), datalake_client::Error> {
/// let config = StoreConfig {
///     endpoint: Some("localhost:9000".to_owned()),
///     access_key: Some("minioadmin".to_owned()),
///     secret_key: Some("minioadmin".to_owned()),
///     ..Default::default()
/// };
/// let store = S3Store::new(&config).await?;
/// store.check_connection().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Build a client from explicit configuration.
    ///
    /// A custom endpoint switches to path-style addressing, which MinIO and
    /// most self-hosted services require.
    pub async fn new(config: &StoreConfig) -> Result<Self, Error> {
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(config.timeout())
            .operation_timeout(config.timeout())
            .build();

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .timeout_config(timeouts);

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials = Credentials::new(access_key, secret_key, None, None, "datalake");
            loader = loader.credentials_provider(credentials);
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = config.endpoint_url() {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        info!(
            "S3 store created: endpoint={:?}, region={}, timeout={}s",
            config.endpoint, config.region, config.timeout
        );
        Ok(Self::from_client(Client::from_conf(builder.build())))
    }

    /// Wrap an already configured SDK client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn region(&self) -> Option<String> {
        self.client.config().region().map(|r| r.to_string())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn check_connection(&self) -> Result<(), Error> {
        match self.client.list_buckets().send().await {
            Ok(_) => Ok(()),
            // Any failure here means the store cannot be used, whatever the cause.
            Err(err) => match classify("check_connection", err) {
                Error::Connectivity(msg) => Err(Error::Connectivity(msg)),
                other => Err(Error::Connectivity(other.to_string())),
            },
        }
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, Error> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => match classify("bucket_exists", err) {
                Error::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn make_bucket(&self, bucket: &str, enable_versioning: bool) -> Result<(), Error> {
        let mut request = self.client.create_bucket().bucket(bucket);

        if let Some(region) = self.region().filter(|r| r != "us-east-1") {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region.as_str()))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| classify("make_bucket", e))?;

        if enable_versioning {
            self.client
                .put_bucket_versioning()
                .bucket(bucket)
                .versioning_configuration(
                    VersioningConfiguration::builder()
                        .status(BucketVersioningStatus::Enabled)
                        .build(),
                )
                .send()
                .await
                .map_err(|e| classify("make_bucket", e))?;
        }

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
        let mime = infer::get_from_path(path)?
            .map(|kind| kind.mime_type())
            .unwrap_or_else(|| content_type(object, &[]));
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Error::IoError(std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(object)
            .content_type(mime)
            .set_metadata(metadata.cloned())
            .body(body)
            .send()
            .await
            .map_err(|e| classify("upload_file", e))?;

        debug!("Uploaded {:?} to {}/{}", path, bucket, object);
        Ok(())
    }

    async fn upload_data(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
        metadata: Option<&Metadata>,
    ) -> Result<(), Error> {
        let mime = content_type(object, &data);
        let length = data.len();

        self.client
            .put_object()
            .bucket(bucket)
            .key(object)
            .content_type(mime)
            .content_length(length as i64)
            .set_metadata(metadata.cloned())
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify("upload_data", e))?;

        debug!("Uploaded {} bytes to {}/{}", length, bucket, object);
        Ok(())
    }

    fn list_objects<'a>(&'a self, bucket: &'a str, prefix: &'a str) -> ObjectStream<'a> {
        // State: None when exhausted, Some(token) for the next page to request.
        let pages = stream::try_unfold(Some(None::<String>), move |state| async move {
            let Some(token) = state else {
                return Ok(None);
            };

            let resp = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(|e| classify("list_objects", e))?;

            let next = match (resp.is_truncated(), resp.next_continuation_token()) {
                (Some(true), Some(token)) => Some(Some(token.to_owned())),
                _ => None,
            };

            let page: Vec<ObjectSummary> = resp
                .contents()
                .iter()
                .filter_map(|object| {
                    object.key().map(|key| ObjectSummary {
                        name: key.to_owned(),
                        size: object.size().map(|size| size as u64),
                    })
                })
                .collect();

            debug!("Listed {} objects under {}/{}", page.len(), bucket, prefix);
            Ok::<_, Error>(Some((page, next)))
        });

        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, Error>)))
            .try_flatten()
            .boxed()
    }

    async fn get_object(&self, bucket: &str, object: &str) -> Result<ObjectBody, Error> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(object)
            .send()
            .await
            .map_err(|e| classify("get_object", e))?;

        Ok(ObjectBody::new(bucket, object, resp.body.into_async_read()))
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_object: &str,
        destination_bucket: &str,
        destination_object: &str,
    ) -> Result<(), Error> {
        self.client
            .copy_object()
            .copy_source(copy_source(source_bucket, source_object)?)
            .bucket(destination_bucket)
            .key(destination_object)
            .send()
            .await
            .map_err(|e| classify("copy_object", e))?;

        debug!(
            "Copied {}/{} to {}/{}",
            source_bucket, source_object, destination_bucket, destination_object
        );
        Ok(())
    }
}
