// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

use crate::{Error, store::Metadata};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a dataset originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSourceType {
    HuggingFace,
    Kaggle,
    Imported,
    Generated,
    Other,
}

impl DataSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceType::HuggingFace => "HuggingFace",
            DataSourceType::Kaggle => "Kaggle",
            DataSourceType::Imported => "Imported",
            DataSourceType::Generated => "Generated",
            DataSourceType::Other => "Other",
        }
    }
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive metadata attached to uploaded objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub name: String,
    pub source: DataSourceType,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_records: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl DatasetMetadata {
    /// Metadata stamped with the current time as creation and modification date.
    pub fn new(name: impl Into<String>, source: DataSourceType) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            source,
            creation_date: now,
            last_modified_date: now,
            size: None,
            number_of_records: None,
            description: None,
            version: None,
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Flatten into object metadata.
    ///
    /// Dates are RFC 3339, absent optionals are omitted and tags are joined
    /// with commas.
    pub fn to_map(&self) -> Metadata {
        let mut map = Metadata::new();
        map.insert("name".to_owned(), self.name.clone());
        map.insert("source".to_owned(), self.source.to_string());
        map.insert(
            "creation_date".to_owned(),
            self.creation_date.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        map.insert(
            "last_modified_date".to_owned(),
            self.last_modified_date
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        if let Some(size) = self.size {
            map.insert("size".to_owned(), size.to_string());
        }
        if let Some(records) = self.number_of_records {
            map.insert("number_of_records".to_owned(), records.to_string());
        }
        if let Some(description) = &self.description {
            map.insert("description".to_owned(), description.clone());
        }
        if let Some(version) = &self.version {
            map.insert("version".to_owned(), version.clone());
        }
        if !self.tags.is_empty() {
            map.insert("tags".to_owned(), self.tags.join(","));
        }
        map
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn sample() -> DatasetMetadata {
        let date = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        DatasetMetadata {
            creation_date: date,
            last_modified_date: date,
            ..DatasetMetadata::new("beach-litter", DataSourceType::Imported)
        }
    }

    #[test]
    fn test_to_map_omits_absent_fields() {
        let map = sample().to_map();
        assert_eq!(map.get("name").unwrap(), "beach-litter");
        assert_eq!(map.get("source").unwrap(), "Imported");
        assert_eq!(map.get("creation_date").unwrap(), "2025-03-14T09:26:53Z");
        assert!(!map.contains_key("size"));
        assert!(!map.contains_key("tags"));
    }

    #[test]
    fn test_to_map_joins_tags() {
        let metadata = sample()
            .with_version("1.2")
            .with_tags(["litter", "coast"]);
        let map = metadata.to_map();
        assert_eq!(map.get("tags").unwrap(), "litter,coast");
        assert_eq!(map.get("version").unwrap(), "1.2");
    }

    #[test]
    fn test_json_roundtrip() {
        let metadata = sample().with_description("drone survey");
        let json = metadata.to_json().unwrap();
        assert!(!json.contains("number_of_records"));
        let parsed: DatasetMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, metadata);
    }
}
