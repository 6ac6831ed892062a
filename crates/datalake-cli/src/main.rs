// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

use clap::{Parser, Subcommand};
use datalake_client::{
    BulkUploader, DataSource, Dataset, Error, HuggingFaceRegistry, LocalSource,
    Progress, RegistrySource, S3Store, Settings, SplitWeights, UploadReport, create_dataset_with,
    retrieve_dataset, setup_buckets, validate_connection,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;

const BAR_TEMPLATE: &str =
    "[{elapsed_precise} ETA: {eta}] {msg}: {wide_bar:.yellow} {human_pos}/{human_len}";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults to datalake.toml in the platform
    /// configuration directory when present.
    #[clap(long, env = "DATALAKE_CONFIG")]
    config: Option<PathBuf>,

    /// Object storage endpoint, e.g. http://localhost:9000
    #[clap(long, env = "DATALAKE_ENDPOINT")]
    endpoint: Option<String>,

    /// Object storage access key
    #[clap(long, env = "DATALAKE_ACCESS_KEY")]
    access_key: Option<String>,

    /// Object storage secret key
    #[clap(long, env = "DATALAKE_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Object storage region
    #[clap(long, env = "DATALAKE_REGION")]
    region: Option<String>,

    /// Bucket holding raw data sources
    #[clap(long, env = "DATALAKE_SOURCES_BUCKET")]
    sources_bucket: Option<String>,

    /// Bucket holding prepared datasets
    #[clap(long, env = "DATALAKE_DATASETS_BUCKET")]
    datasets_bucket: Option<String>,

    /// Maximum concurrent uploads
    #[clap(long, env = "DATALAKE_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Client Command
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Verify the object store is reachable with the configured credentials.
    Check,
    /// Create the data-sources and datasets buckets if they do not exist.
    SetupBuckets,
    /// Upload a local directory into the data-sources bucket, mirroring its
    /// tree under the data source name.
    UploadLocal {
        /// Directory to upload
        path: PathBuf,

        /// Data source name, a generated identifier when omitted
        #[clap(long)]
        name: Option<String>,
    },
    /// Stream a dataset from the registry into the data-sources bucket.
    /// Images are stored as PNG under their content hash.
    UploadRegistry {
        /// Registry dataset name, e.g. owner/dataset
        name: String,

        /// Access token for gated datasets
        #[clap(long, env = "DATALAKE_REGISTRY_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Row column holding the image
        #[clap(long, default_value = "image")]
        image_column: String,

        /// Row column holding the annotation
        #[clap(long, default_value = "annotations")]
        annotation_column: String,
    },
    /// Validate one or more data sources and copy the valid pairs into a new
    /// dataset.
    CreateDataset {
        /// Data source names (prefixes in the data-sources bucket)
        #[clap(required = true)]
        sources: Vec<String>,

        /// Seed for split assignment
        #[clap(long)]
        seed: Option<String>,

        /// Train, test and validation weights, comma separated
        #[clap(long, value_delimiter = ',', num_args = 1..)]
        weights: Option<Vec<f64>>,
    },
    /// Download every object of a dataset, reproducing its layout.
    DownloadDataset {
        /// Dataset ID
        dataset_id: String,

        /// Output directory
        #[clap(long, default_value = ".")]
        output: PathBuf,
    },
    /// Report annotations and images missing their counterpart.
    AuditDataset {
        /// Dataset ID
        dataset_id: String,

        /// Print the audit as JSON
        #[clap(long)]
        json: bool,
    },
}

impl Args {
    /// Layer command line overrides on top of the loaded settings.
    fn settings(&self) -> Result<Settings, Error> {
        let mut settings = Settings::load(self.config.as_deref())?;

        if let Some(endpoint) = &self.endpoint {
            settings.storage.endpoint = Some(endpoint.clone());
        }
        if let Some(access_key) = &self.access_key {
            settings.storage.access_key = Some(access_key.clone());
        }
        if let Some(secret_key) = &self.secret_key {
            settings.storage.secret_key = Some(secret_key.clone());
        }
        if let Some(region) = &self.region {
            settings.storage.region = region.clone();
        }
        if let Some(bucket) = &self.sources_bucket {
            settings.buckets.data_sources = bucket.clone();
        }
        if let Some(bucket) = &self.datasets_bucket {
            settings.buckets.datasets = bucket.clone();
        }
        if let Some(max_workers) = self.max_workers {
            settings.upload.max_workers = max_workers;
        }

        settings.validate()?;
        Ok(settings)
    }
}

async fn connect(settings: &Settings) -> Result<Arc<S3Store>, Error> {
    Ok(Arc::new(S3Store::new(&settings.storage).await?))
}

fn progress_bar(message: &'static str) -> Result<ProgressBar, Error> {
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .map_err(|err| Error::InvalidParameters(err.to_string()))?
        .progress_chars("█▇▆▅▄▃▂▁  ");
    let bar = ProgressBar::new(0);
    bar.set_style(style);
    bar.set_message(message);
    Ok(bar)
}

/// Drive `bar` from upload progress until the sender is dropped.
fn track(bar: ProgressBar) -> (mpsc::Sender<Progress>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Progress>(16);
    let handle = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            if progress.total > 0 {
                bar.set_length(progress.total as u64);
                bar.set_position(progress.current as u64);
            }
        }
        bar.finish();
    });
    (tx, handle)
}

fn print_upload_report(report: &UploadReport) {
    println!(
        "{}: uploaded {} of {} items",
        report.source, report.uploaded, report.scheduled
    );
    for failure in report.failures.iter().take(10) {
        println!("  failed {}: {}", failure.item, failure.error);
    }
    if report.failures.len() > 10 {
        println!("  ... and {} more", report.failures.len() - 10);
    }
}

async fn handle_check(settings: &Settings) -> Result<(), Error> {
    let store = connect(settings).await?;
    validate_connection(store.as_ref()).await?;
    println!(
        "Connected to {}",
        settings
            .storage
            .endpoint_url()
            .unwrap_or_else(|| format!("AWS S3 ({})", settings.storage.region))
    );
    Ok(())
}

async fn handle_setup_buckets(settings: &Settings) -> Result<(), Error> {
    let store = connect(settings).await?;
    let created = setup_buckets(
        store.as_ref(),
        &settings.buckets.all(),
        settings.buckets.versioning,
    )
    .await?;

    if created.is_empty() {
        println!("All buckets already exist");
    }
    for bucket in created {
        println!("Created bucket {}", bucket);
    }
    Ok(())
}

async fn run_upload(
    uploader: BulkUploader,
    bucket: &str,
    source: DataSource,
) -> Result<(), Error> {
    let (tx, bar) = track(progress_bar("Uploading")?);
    let uploader = uploader.with_progress(tx);
    let result = uploader.upload(bucket, &source).await;
    drop(uploader);
    bar.await?;

    let report = result?;
    print_upload_report(&report);
    report.into_result()?;
    Ok(())
}

#[cfg_attr(feature = "profiling", tracing::instrument(skip(settings)))]
async fn handle_upload_local(
    settings: &Settings,
    path: PathBuf,
    name: Option<String>,
) -> Result<(), Error> {
    let source = LocalSource::new(path);
    let source = match name {
        Some(name) => source.with_name(name),
        None => source,
    };
    println!("Uploading {:?} as data source {}", source.root, source.name);

    let store = connect(settings).await?;
    let uploader = BulkUploader::new(store).with_max_workers(settings.upload.max_workers);
    run_upload(uploader, &settings.buckets.data_sources, source.into()).await
}

#[cfg_attr(feature = "profiling", tracing::instrument(skip(settings, token)))]
async fn handle_upload_registry(
    settings: &Settings,
    name: String,
    token: Option<String>,
    image_column: String,
    annotation_column: String,
) -> Result<(), Error> {
    let mut source = RegistrySource::new(name)
        .with_image_column(image_column)
        .with_annotation_column(annotation_column);
    if let Some(token) = token.or_else(|| settings.registry.token.clone()) {
        source = source.with_token(token);
    }

    let registry = Arc::new(HuggingFaceRegistry::new(&settings.registry)?);
    let store = connect(settings).await?;
    let uploader = BulkUploader::new(store)
        .with_max_workers(settings.upload.max_workers)
        .with_registry(registry);
    run_upload(uploader, &settings.buckets.data_sources, source.into()).await
}

#[cfg_attr(feature = "profiling", tracing::instrument(skip(settings)))]
async fn handle_create_dataset(
    settings: &Settings,
    sources: Vec<String>,
    seed: Option<String>,
    weights: Option<Vec<f64>>,
) -> Result<(), Error> {
    let weights = SplitWeights::try_from(weights.unwrap_or_else(|| settings.dataset.weights.clone()))?;
    let seed = seed.unwrap_or_else(|| settings.dataset.seed.clone());
    let mut dataset = Dataset::builder(&settings.buckets.datasets)
        .seed(seed)
        .weights(weights)
        .build()?;

    let store = connect(settings).await?;
    let reports = create_dataset_with(
        store.as_ref(),
        &settings.buckets.data_sources,
        &mut dataset,
        sources.as_slice(),
    )
    .await?;

    for report in &reports {
        println!("{}", report);
        for (reason, count) in &report.skipped {
            println!("  skipped {} ({})", count, reason);
        }
    }
    println!("Created dataset {}", dataset.id());
    Ok(())
}

async fn handle_download_dataset(
    settings: &Settings,
    dataset_id: String,
    output: PathBuf,
) -> Result<(), Error> {
    let store = connect(settings).await?;
    let dataset = retrieve_dataset(store.as_ref(), &settings.buckets.datasets, &dataset_id).await?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Downloading {}", dataset.id()));
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    let written = dataset.download(store.as_ref(), &output).await;
    spinner.finish_and_clear();

    println!("Downloaded {} files to {:?}", written?, output.join(dataset.id()));
    Ok(())
}

async fn handle_audit_dataset(
    settings: &Settings,
    dataset_id: String,
    json: bool,
) -> Result<(), Error> {
    let store = connect(settings).await?;
    let dataset = retrieve_dataset(store.as_ref(), &settings.buckets.datasets, &dataset_id).await?;
    let audit = dataset.audit_pairs(store.as_ref()).await?;

    if json {
        let value = serde_json::json!({
            "dataset": dataset.id(),
            "annotations": audit.annotations,
            "images": audit.images,
            "orphaned_annotations": audit.orphaned_annotations,
            "orphaned_images": audit.orphaned_images,
            "unreadable": audit.unreadable,
            "consistent": audit.is_consistent(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "{}: {} annotations, {} images",
        dataset.id(),
        audit.annotations,
        audit.images
    );
    for name in &audit.orphaned_annotations {
        println!("  orphaned annotation {}", name);
    }
    for name in &audit.orphaned_images {
        println!("  orphaned image {}", name);
    }
    for name in &audit.unreadable {
        println!("  unreadable annotation {}", name);
    }
    if audit.is_consistent() {
        println!("Dataset is consistent");
    } else {
        warn!("Dataset {} has incomplete pairs", dataset.id());
    }
    Ok(())
}

#[cfg(feature = "profiling")]
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_env("DATALAKE_TRACE").unwrap_or_else(|_| EnvFilter::new("info"));
    // The log facade already belongs to env_logger, so install the
    // subscriber alone rather than through `init`, which also claims it.
    let subscriber = fmt().with_env_filter(filter).with_target(false).finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        warn!("Tracing disabled: {}", err);
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    #[cfg(feature = "profiling")]
    init_tracing();

    let args = Args::parse();
    let settings = args.settings()?;

    match args.cmd {
        Command::Check => handle_check(&settings).await,
        Command::SetupBuckets => handle_setup_buckets(&settings).await,
        Command::UploadLocal { path, name } => handle_upload_local(&settings, path, name).await,
        Command::UploadRegistry {
            name,
            token,
            image_column,
            annotation_column,
        } => {
            handle_upload_registry(&settings, name, token, image_column, annotation_column).await
        }
        Command::CreateDataset {
            sources,
            seed,
            weights,
        } => handle_create_dataset(&settings, sources, seed, weights).await,
        Command::DownloadDataset { dataset_id, output } => {
            handle_download_dataset(&settings, dataset_id, output).await
        }
        Command::AuditDataset { dataset_id, json } => {
            handle_audit_dataset(&settings, dataset_id, json).await
        }
    }
}
