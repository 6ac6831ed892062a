// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

use crate::{
    Error,
    dataset::new_dataset_id,
    metadata::{DataSourceType, DatasetMetadata},
};
use std::path::{Path, PathBuf};

/// A directory on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSource {
    pub name: String,
    pub root: PathBuf,
}

impl LocalSource {
    /// Local source under a freshly generated name.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            name: new_dataset_id(),
            root: root.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fails with [`Error::NotFound`] if the root is missing and
    /// [`Error::InvalidParameters`] if it is not a directory.
    pub fn verify(&self) -> Result<(), Error> {
        verify_directory(&self.root)
    }
}

fn verify_directory(root: &Path) -> Result<(), Error> {
    if !root.exists() {
        return Err(Error::NotFound(format!(
            "data source path {:?} does not exist",
            root
        )));
    }
    if !root.is_dir() {
        return Err(Error::InvalidParameters(format!(
            "data source path {:?} is not a directory",
            root
        )));
    }
    Ok(())
}

/// A dataset hosted by an external registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistrySource {
    /// Registry identifier, e.g. `owner/dataset`.
    pub name: String,
    pub token: Option<String>,
    /// Row column holding the image.
    pub image_column: String,
    /// Row column holding the annotation payload.
    pub annotation_column: String,
}

impl RegistrySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: None,
            image_column: "image".to_owned(),
            annotation_column: "annotations".to_owned(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_image_column(mut self, column: impl Into<String>) -> Self {
        self.image_column = column.into();
        self
    }

    pub fn with_annotation_column(mut self, column: impl Into<String>) -> Self {
        self.annotation_column = column.into();
        self
    }
}

impl std::fmt::Debug for RegistrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySource")
            .field("name", &self.name)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("image_column", &self.image_column)
            .field("annotation_column", &self.annotation_column)
            .finish()
    }
}

/// Origin of data ingested into the data-sources bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Local(LocalSource),
    Registry(RegistrySource),
}

impl DataSource {
    /// Prefix under which the source lives in the data-sources bucket.
    pub fn name(&self) -> &str {
        match self {
            DataSource::Local(local) => &local.name,
            DataSource::Registry(registry) => &registry.name,
        }
    }

    pub fn source_type(&self) -> DataSourceType {
        match self {
            DataSource::Local(_) => DataSourceType::Imported,
            DataSource::Registry(_) => DataSourceType::HuggingFace,
        }
    }

    /// Metadata stamped with the current time.
    pub fn metadata(&self) -> DatasetMetadata {
        DatasetMetadata::new(self.name(), self.source_type())
    }
}

impl AsRef<str> for DataSource {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

impl From<LocalSource> for DataSource {
    fn from(source: LocalSource) -> Self {
        DataSource::Local(source)
    }
}

impl From<RegistrySource> for DataSource {
    fn from(source: RegistrySource) -> Self {
        DataSource::Registry(source)
    }
}
