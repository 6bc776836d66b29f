//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `predict <reference>` -- stream variant, prints result and delivery
//! - `diagnose <reference> --subject <id>` -- cache variant
//! - `result <subject>` -- read a cached prediction back
//! - `inspect groups|keys` -- Redis diagnostics
//! - `config show|path` -- inspect configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::aws::SigV4Signer;
use crate::config::{self, Config};
use crate::distribution::{RedisStore, ResultDistributor, StoreDiagnostics};
use crate::inference::{InferenceInvoker, SageMakerEndpoint};
use crate::pipeline::PredictionPipeline;
use crate::storage::{ImageFetcher, S3BlobStore};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Image prediction pipeline: S3 → SageMaker → Redis.
#[derive(Parser, Debug)]
#[command(
    name = "babycare-predict",
    version = env!("CARGO_PKG_VERSION"),
    about = "Run skin-image predictions and distribute the results"
)]
pub struct Cli {
    /// Config file (default: $BABYCARE_PREDICT_CONFIG or ~/.config/babycare-predict/config.json5).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Predict an image and publish the result to the stream.
    Predict {
        /// Image URL; the object key is the part after the last '/'.
        reference: String,
    },

    /// Predict an image and cache the result for a diagnosis subject.
    Diagnose {
        reference: String,

        /// Subject the cached result is keyed by.
        #[arg(short, long)]
        subject: String,
    },

    /// Print the cached prediction for a subject.
    #[command(name = "result")]
    Cached { subject: String },

    /// Inspect the Redis side of the pipeline.
    #[command(subcommand)]
    Inspect(InspectCommand),

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum InspectCommand {
    /// List consumer groups on the result stream.
    Groups {
        /// Stream name (default: from config).
        #[arg(long)]
        stream: Option<String>,
    },

    /// List keys matching a glob pattern.
    Keys {
        #[arg(default_value = "prediction:*")]
        pattern: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the loaded configuration (secrets redacted) as JSON.
    Show,

    /// Print the resolved configuration file path.
    Path,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

/// Dispatch a parsed command. `cancel` is tripped by Ctrl-C.
pub async fn run(cli: Cli, cancel: CancellationToken) -> CliResult {
    let path = config::resolve_config_path(cli.config.as_deref());
    match cli.command {
        Command::Config(ConfigCommand::Path) => {
            println!("{}", path.display());
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            let cfg = config::load_config_unvalidated(&path, |var| std::env::var(var).ok())?;
            println!("{}", serde_json::to_string_pretty(&cfg.redacted())?);
            Ok(())
        }
        Command::Predict { reference } => {
            let cfg = config::load_config(&path)?;
            let pipeline = build_pipeline(&cfg).await?;
            let prediction = pipeline.predict(&reference, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
            Ok(())
        }
        Command::Diagnose { reference, subject } => {
            let cfg = config::load_config(&path)?;
            let pipeline = build_pipeline(&cfg).await?;
            pipeline
                .predict_for_subject(&reference, &subject, &cancel)
                .await?;
            println!(
                "{}",
                json!({
                    "subject": subject,
                    "key": crate::distribution::cache_key(&cfg.redis.cache_key_prefix, &subject),
                    "ttlSecs": cfg.redis.cache_ttl_secs,
                })
            );
            Ok(())
        }
        Command::Cached { subject } => {
            let cfg = config::load_config_unvalidated(&path, |var| std::env::var(var).ok())?;
            let store = Arc::new(RedisStore::connect(&cfg.redis.url).await?);
            let distributor = ResultDistributor::new(store.clone(), store)
                .with_cache_key_prefix(cfg.redis.cache_key_prefix.clone());
            match distributor.read_cache(&subject).await? {
                Some(cached) => {
                    println!("{}", serde_json::to_string_pretty(&cached)?);
                    Ok(())
                }
                None => Err(format!("no cached prediction for subject '{subject}'").into()),
            }
        }
        Command::Inspect(inspect) => {
            let cfg = config::load_config_unvalidated(&path, |var| std::env::var(var).ok())?;
            let store = RedisStore::connect(&cfg.redis.url).await?;
            handle_inspect(&store, inspect, &cfg.redis.stream_name).await
        }
    }
}

async fn handle_inspect(
    store: &dyn StoreDiagnostics,
    command: InspectCommand,
    default_stream: &str,
) -> CliResult {
    match command {
        InspectCommand::Groups { stream } => {
            let stream = stream.as_deref().unwrap_or(default_stream);
            let groups = store.consumer_groups(stream).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "stream": stream, "groups": groups }))?
            );
        }
        InspectCommand::Keys { pattern } => {
            let keys = store.keys(&pattern).await?;
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
    }
    Ok(())
}

/// Wire the production adapters from a validated config.
pub async fn build_pipeline(cfg: &Config) -> Result<PredictionPipeline, Box<dyn std::error::Error>> {
    let credentials = cfg.credentials()?;

    let s3_signer = SigV4Signer::new(cfg.aws.region.clone(), "s3", credentials.clone());
    let mut blob_store =
        S3BlobStore::new(s3_signer, Duration::from_secs(cfg.storage.timeout_secs))?;
    if let Some(endpoint) = &cfg.storage.endpoint {
        blob_store = blob_store.with_endpoint(Url::parse(endpoint)?);
    }

    let sm_signer = SigV4Signer::new(cfg.aws.region.clone(), "sagemaker", credentials);
    let mut endpoint = SageMakerEndpoint::new(
        sm_signer,
        cfg.inference.endpoint_name.clone(),
        Duration::from_secs(cfg.inference.timeout_secs),
    )?;
    if let Some(url) = &cfg.inference.endpoint_url {
        endpoint = endpoint.with_base_url(Url::parse(url)?);
    }
    let mut invoker = InferenceInvoker::new(Arc::new(endpoint));
    if let Some(limit) = cfg.inference.max_in_flight {
        invoker = invoker.with_max_in_flight(limit);
    }

    let store = Arc::new(RedisStore::connect(&cfg.redis.url).await?);

    Ok(PredictionPipeline::new(
        ImageFetcher::new(Arc::new(blob_store), cfg.storage.bucket.clone()),
        invoker,
        ResultDistributor::new(store.clone(), store),
        cfg.pipeline_settings(),
    ))
}
