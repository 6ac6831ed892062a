// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

use crate::{
    Error,
    store::{ObjectStore, basename},
    validate::parse_annotation,
};
use futures::{StreamExt as _, TryStreamExt as _};
use log::{debug, info, warn};
use rand::{Rng as _, SeedableRng as _};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

const DOWNLOAD_CONCURRENCY: usize = 8;

/// Partition of a dataset a pair is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
    Validation,
}

impl Split {
    /// All splits, in the order their weights are given.
    pub const ALL: [Split; 3] = [Split::Train, Split::Test, Split::Validation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
            Split::Validation => "validation",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "test" => Ok(Split::Test),
            "validation" => Ok(Split::Validation),
            _ => Err(Error::InvalidParameters(format!("unknown split '{}'", s))),
        }
    }
}

/// Train, test and validation weights.
///
/// Weights are non-negative and sum to one; they are aligned positionally
/// with [`Split::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct SplitWeights([f64; 3]);

impl SplitWeights {
    const TOLERANCE: f64 = 1e-6;

    pub fn new(train: f64, test: f64, validation: f64) -> Result<Self, Error> {
        let weights = [train, test, validation];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::InvalidParameters(format!(
                "split weights must be finite and non-negative, got {:?}",
                weights
            )));
        }

        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > Self::TOLERANCE {
            return Err(Error::InvalidParameters(format!(
                "split weights must sum to 1, got {}",
                total
            )));
        }

        Ok(Self(weights))
    }

    pub fn get(&self, split: Split) -> f64 {
        match split {
            Split::Train => self.0[0],
            Split::Test => self.0[1],
            Split::Validation => self.0[2],
        }
    }

    pub fn as_array(&self) -> [f64; 3] {
        self.0
    }
}

impl Default for SplitWeights {
    fn default() -> Self {
        Self([0.6, 0.2, 0.2])
    }
}

impl TryFrom<&[f64]> for SplitWeights {
    type Error = Error;

    fn try_from(weights: &[f64]) -> Result<Self, Self::Error> {
        match weights {
            [train, test, validation] => Self::new(*train, *test, *validation),
            _ => Err(Error::InvalidParameters(format!(
                "expected 3 split weights, got {}",
                weights.len()
            ))),
        }
    }
}

impl TryFrom<Vec<f64>> for SplitWeights {
    type Error = Error;

    fn try_from(weights: Vec<f64>) -> Result<Self, Self::Error> {
        Self::try_from(weights.as_slice())
    }
}

impl From<SplitWeights> for Vec<f64> {
    fn from(weights: SplitWeights) -> Self {
        weights.0.to_vec()
    }
}

/// Generate a new dataset identifier.
///
/// Identifiers are UUIDv7 strings: time ordered, lexicographically sortable
/// and monotonic within a process.
pub fn new_dataset_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// ChaCha8 keyed by the SHA-256 of the seed string; stable across platforms
/// and releases, unlike `StdRng`.
fn seeded_rng(seed: &str) -> ChaCha8Rng {
    let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
    ChaCha8Rng::from_seed(digest)
}

/// Builder for [`Dataset`].
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    storage_area: String,
    id: Option<String>,
    seed: String,
    weights: SplitWeights,
    annotations_subpath: String,
    images_subpath: String,
}

impl DatasetBuilder {
    /// Reference an existing dataset instead of generating a new identifier.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = seed.into();
        self
    }

    pub fn weights(mut self, weights: SplitWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn annotations_subpath(mut self, subpath: impl Into<String>) -> Self {
        self.annotations_subpath = subpath.into();
        self
    }

    pub fn images_subpath(mut self, subpath: impl Into<String>) -> Self {
        self.images_subpath = subpath.into();
        self
    }

    pub fn build(self) -> Result<Dataset, Error> {
        if self.storage_area.is_empty() {
            return Err(Error::InvalidParameters(
                "dataset storage area is empty".to_owned(),
            ));
        }
        for subpath in [&self.annotations_subpath, &self.images_subpath] {
            if subpath.is_empty() || subpath.contains('/') {
                return Err(Error::InvalidParameters(format!(
                    "invalid dataset subpath '{}'",
                    subpath
                )));
            }
        }

        let id = match self.id {
            Some(id) if id.is_empty() || id.contains('/') => {
                return Err(Error::InvalidParameters(format!(
                    "invalid dataset id '{}'",
                    id
                )));
            }
            Some(id) => id,
            None => new_dataset_id(),
        };

        Ok(Dataset {
            rng: seeded_rng(&self.seed),
            id,
            storage_area: self.storage_area,
            seed: self.seed,
            weights: self.weights,
            annotations_subpath: self.annotations_subpath,
            images_subpath: self.images_subpath,
        })
    }
}

/// Orphaned half-pairs found by [`Dataset::audit_pairs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairAudit {
    /// Number of annotation objects in the dataset.
    pub annotations: usize,
    /// Number of image objects in the dataset.
    pub images: usize,
    /// Annotations whose referenced image is missing from their split.
    pub orphaned_annotations: Vec<String>,
    /// Images no annotation in their split refers to.
    pub orphaned_images: Vec<String>,
    /// Annotations that could not be read back.
    pub unreadable: Vec<String>,
}

impl PairAudit {
    /// Returns true if every annotation has its image and vice versa.
    pub fn is_consistent(&self) -> bool {
        self.orphaned_annotations.is_empty()
            && self.orphaned_images.is_empty()
            && self.unreadable.is_empty()
    }
}

/// A prepared dataset stored under a stable identifier.
///
/// Objects are laid out as `{id}/{split}/{annotations|images}/{filename}`
/// inside the dataset's storage area (bucket). Split assignment is drawn from
/// a generator seeded by a string, so replaying the same sequence of
/// [`Dataset::next_split`] calls with the same seed reproduces the same
/// layout.
///
/// # Examples
///
/// ```rust
/// use datalake_client::{Dataset, Split};
///
/// let mut a = Dataset::new("datasets");
/// let mut b = Dataset::builder("datasets").id(a.id()).build().unwrap();
/// let draws_a: Vec<Split> = (0..5).map(|_| a.next_split()).collect();
/// let draws_b: Vec<Split> = (0..5).map(|_| b.next_split()).collect();
/// assert_eq!(draws_a, draws_b);
/// assert_eq!(
///     a.format_image_path("beach/images/0001.png", Split::Train),
///     format!("{}/train/images/0001.png", a.id())
/// );
/// ```
pub struct Dataset {
    id: String,
    storage_area: String,
    seed: String,
    weights: SplitWeights,
    rng: ChaCha8Rng,
    annotations_subpath: String,
    images_subpath: String,
}

impl Dataset {
    /// New dataset with a fresh identifier and default seed and weights.
    pub fn new(storage_area: impl Into<String>) -> Self {
        Self {
            id: new_dataset_id(),
            storage_area: storage_area.into(),
            seed: "e2e".to_owned(),
            weights: SplitWeights::default(),
            rng: seeded_rng("e2e"),
            annotations_subpath: "annotations".to_owned(),
            images_subpath: "images".to_owned(),
        }
    }

    pub fn builder(storage_area: impl Into<String>) -> DatasetBuilder {
        DatasetBuilder {
            storage_area: storage_area.into(),
            id: None,
            seed: "e2e".to_owned(),
            weights: SplitWeights::default(),
            annotations_subpath: "annotations".to_owned(),
            images_subpath: "images".to_owned(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn storage_area(&self) -> &str {
        &self.storage_area
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub fn weights(&self) -> SplitWeights {
        self.weights
    }

    pub fn split_names(&self) -> [&'static str; 3] {
        Split::ALL.map(|split| split.as_str())
    }

    pub fn annotations_subpath(&self) -> &str {
        &self.annotations_subpath
    }

    pub fn images_subpath(&self) -> &str {
        &self.images_subpath
    }

    /// Draw the split for the next pair.
    ///
    /// Single weighted draw with replacement; advances the generator. Call it
    /// exactly once per accepted pair.
    pub fn next_split(&mut self) -> Split {
        let weights = self.weights.as_array();
        let total: f64 = weights.iter().sum();
        let draw = self.rng.r#gen::<f64>() * total;

        let mut cumulative = 0.0;
        for (split, weight) in Split::ALL.iter().zip(weights) {
            cumulative += weight;
            if draw < cumulative {
                return *split;
            }
        }

        // Rounding can leave the draw at the very top of the range.
        Split::ALL
            .iter()
            .zip(weights)
            .rev()
            .find(|(_, weight)| *weight > 0.0)
            .map(|(split, _)| *split)
            .unwrap_or(Split::Train)
    }

    /// `{id}/{split}/{annotations_subpath}/{basename(original)}`
    pub fn format_annotation_path(&self, original: &str, split: Split) -> String {
        format!(
            "{}/{}/{}/{}",
            self.id,
            split,
            self.annotations_subpath,
            basename(original)
        )
    }

    /// `{id}/{split}/{images_subpath}/{basename(original)}`
    pub fn format_image_path(&self, original: &str, split: Split) -> String {
        format!(
            "{}/{}/{}/{}",
            self.id,
            split,
            self.images_subpath,
            basename(original)
        )
    }

    /// Prefix under which every object of the dataset lives.
    pub fn prefix(&self) -> String {
        format!("{}/", self.id)
    }

    /// Download every object of the dataset into `destination_root`.
    ///
    /// Files land at `destination_root/{id}/{split}/{kind}/{filename}`.
    /// Returns the number of files written.
    #[cfg_attr(feature = "profiling", tracing::instrument(skip(self, store), fields(id = %self.id)))]
    pub async fn download(
        &self,
        store: &dyn ObjectStore,
        destination_root: &Path,
    ) -> Result<usize, Error> {
        tokio::fs::create_dir_all(destination_root).await?;

        let prefix = self.prefix();
        let written = AtomicUsize::new(0);

        store
            .list_objects(&self.storage_area, &prefix)
            .try_for_each_concurrent(DOWNLOAD_CONCURRENCY, |object| {
                let written = &written;
                async move {
                    let Some(path) = local_path(destination_root, &object.name) else {
                        warn!("Skipping object with unsafe name {}", object.name);
                        return Ok(());
                    };
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }

                    let body = store.get_object(&self.storage_area, &object.name).await?;
                    let bytes = body.write_to(&path).await?;
                    debug!("Downloaded {} ({} bytes) to {:?}", object.name, bytes, path);
                    written.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), Error>(())
                }
            })
            .await?;

        let written = written.into_inner();
        info!(
            "Downloaded {} objects of dataset {} to {:?}",
            written, self.id, destination_root
        );
        Ok(written)
    }

    /// Report annotation/image half-pairs left behind by interrupted copies.
    ///
    /// Read-only: nothing is deleted.
    pub async fn audit_pairs(&self, store: &dyn ObjectStore) -> Result<PairAudit, Error> {
        let mut annotations = Vec::new();
        let mut images = HashSet::new();

        let prefix = self.prefix();
        let mut objects = store.list_objects(&self.storage_area, &prefix);
        while let Some(object) = objects.next().await {
            let object = object?;
            match self.classify(&object.name) {
                Some((_, Kind::Annotation)) => annotations.push(object.name),
                Some((_, Kind::Image)) => {
                    images.insert(object.name);
                }
                None => debug!("Ignoring unexpected object {}", object.name),
            }
        }
        drop(objects);

        let mut audit = PairAudit {
            annotations: annotations.len(),
            images: images.len(),
            ..Default::default()
        };
        let mut referenced = HashSet::new();

        for name in annotations {
            let Some((split, _)) = self.classify(&name) else {
                continue;
            };
            let data = store.get_object(&self.storage_area, &name).await?.bytes().await?;
            match parse_annotation(&data) {
                Ok(record) => {
                    let image = self.format_image_path(&record.image_path, split);
                    if images.contains(&image) {
                        referenced.insert(image);
                    } else {
                        audit.orphaned_annotations.push(name);
                    }
                }
                Err(err) => {
                    warn!("Unreadable annotation {}: {}", name, err);
                    audit.unreadable.push(name);
                }
            }
        }

        audit.orphaned_images = images.difference(&referenced).cloned().collect();
        audit.orphaned_images.sort();
        Ok(audit)
    }

    fn classify(&self, name: &str) -> Option<(Split, Kind)> {
        let rest = name.strip_prefix(&self.prefix())?;
        let mut parts = rest.splitn(3, '/');
        let split = parts.next()?.parse().ok()?;
        let kind = match parts.next()? {
            k if k == self.annotations_subpath => Kind::Annotation,
            k if k == self.images_subpath => Kind::Image,
            _ => return None,
        };
        parts.next().filter(|file| !file.is_empty())?;
        Some((split, kind))
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("storage_area", &self.storage_area)
            .field("seed", &self.seed)
            .field("weights", &self.weights)
            .field("annotations_subpath", &self.annotations_subpath)
            .field("images_subpath", &self.images_subpath)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Annotation,
    Image,
}

/// Local path for an object name, rejecting names that would escape the root.
fn local_path(root: &Path, object: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in object.split('/') {
        match segment {
            "" | "." | ".." => return None,
            s if s.contains('\\') => return None,
            s => path.push(s),
        }
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_split_roundtrip_names() {
        for split in Split::ALL {
            assert_eq!(split.as_str().parse::<Split>().unwrap(), split);
        }
        assert!("holdout".parse::<Split>().is_err());
        assert_eq!(
            Dataset::new("datasets").split_names(),
            ["train", "test", "validation"]
        );
    }

    #[test]
    fn test_split_weights_validation() {
        assert!(SplitWeights::new(0.6, 0.2, 0.2).is_ok());
        assert!(SplitWeights::new(1.0, 0.0, 0.0).is_ok());
        assert!(SplitWeights::new(0.5, 0.5, 0.5).is_err());
        assert!(SplitWeights::new(1.2, -0.1, -0.1).is_err());
        assert!(SplitWeights::new(f64::NAN, 0.5, 0.5).is_err());
        assert!(SplitWeights::try_from(&[0.5, 0.5][..]).is_err());
        assert_eq!(
            SplitWeights::try_from(vec![0.8, 0.1, 0.1]).unwrap().get(Split::Test),
            0.1
        );
    }

    #[test]
    fn test_next_split_deterministic() {
        let mut a = Dataset::new("datasets");
        let mut b = Dataset::new("datasets");
        let first: Vec<Split> = (0..200).map(|_| a.next_split()).collect();
        let second: Vec<Split> = (0..200).map(|_| b.next_split()).collect();
        assert_eq!(first, second);

        let mut other = Dataset::builder("datasets").seed("other").build().unwrap();
        let third: Vec<Split> = (0..200).map(|_| other.next_split()).collect();
        assert_ne!(first, third);
    }

    #[test]
    fn test_next_split_known_sequence() {
        use Split::{Test as Te, Train as Tr, Validation as Va};

        // Default seed "e2e" with 0.6/0.2/0.2 weights; pinned so a generator
        // change is caught.
        let mut dataset = Dataset::new("datasets");
        let drawn: Vec<Split> = (0..20).map(|_| dataset.next_split()).collect();
        assert_eq!(
            drawn,
            vec![
                Va, Tr, Va, Tr, Tr, Tr, Tr, Te, Va, Te, Tr, Va, Tr, Tr, Tr, Tr, Tr, Te, Tr, Te
            ]
        );
    }

    #[test]
    fn test_next_split_proportions() {
        let mut dataset = Dataset::new("datasets");
        let draws = 10_000;
        let mut counts: HashMap<Split, usize> = HashMap::new();
        for _ in 0..draws {
            *counts.entry(dataset.next_split()).or_default() += 1;
        }

        for split in Split::ALL {
            let observed = counts.get(&split).copied().unwrap_or(0) as f64 / draws as f64;
            let expected = dataset.weights().get(split);
            assert!(
                (observed - expected).abs() < 0.03,
                "{} observed {} expected {}",
                split,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_next_split_zero_weights() {
        let weights = SplitWeights::new(0.0, 1.0, 0.0).unwrap();
        let mut dataset = Dataset::builder("datasets").weights(weights).build().unwrap();
        assert!((0..500).all(|_| dataset.next_split() == Split::Test));
    }

    #[test]
    fn test_format_paths() {
        let dataset = Dataset::builder("datasets")
            .id("01J00000000000000000000000")
            .build()
            .unwrap();
        assert_eq!(
            dataset.format_annotation_path("beach/annotations/a.json", Split::Validation),
            "01J00000000000000000000000/validation/annotations/a.json"
        );
        assert_eq!(
            dataset.format_image_path("beach/images/a.png", Split::Train),
            "01J00000000000000000000000/train/images/a.png"
        );
        assert_eq!(
            dataset.format_image_path("a.png", Split::Train),
            dataset.format_image_path("other/dir/a.png", Split::Train)
        );
    }

    #[test]
    fn test_format_paths_independent_of_draws() {
        let mut dataset = Dataset::new("datasets");
        let before = dataset.format_annotation_path("x/a.json", Split::Test);
        for _ in 0..10 {
            dataset.next_split();
        }
        assert_eq!(before, dataset.format_annotation_path("x/a.json", Split::Test));
    }

    #[test]
    fn test_builder_rejects_invalid_parts() {
        assert!(Dataset::builder("").build().is_err());
        assert!(Dataset::builder("datasets").id("a/b").build().is_err());
        assert!(Dataset::builder("datasets").id("").build().is_err());
        assert!(
            Dataset::builder("datasets")
                .images_subpath("img/raw")
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let ids: Vec<String> = (0..50).map(|_| new_dataset_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
    }

    #[test]
    fn test_local_path_rejects_escape() {
        let root = Path::new("/tmp/out");
        assert_eq!(
            local_path(root, "id/train/images/a.png"),
            Some(PathBuf::from("/tmp/out/id/train/images/a.png"))
        );
        assert_eq!(local_path(root, "id/../../etc/passwd"), None);
        assert_eq!(local_path(root, "/abs"), None);
    }
}
