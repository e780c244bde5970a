//! prism - 画像を投入して face / agender の解析結果を JSON で出すデモ CLI
//!
//! パイプラインは全部 in-memory。推論エンジンは bytes の digest から決定的に
//! 結果を作るダミー（`engine`）。ログは stderr、結果は stdout。

mod engine;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use prism_core::app::{ImageStatus, SubmissionAck};
use prism_core::domain::{AggregateRecord, BlobMeta};
use prism_core::{ImageId, Pipeline, PipelineBuilder, PipelineConfig, PrismError, StageName};

use crate::engine::{DigestAgenderEngine, DigestFaceEngine};

#[derive(Parser, Debug)]
#[command(name = "prism")]
#[command(about = "Fan images out to face and agender analysis and print the merged records")]
#[command(version)]
struct Args {
    /// Pipeline configuration (TOML). Defaults apply when omitted.
    #[arg(short, long, env = "PRISM_CONFIG")]
    config: Option<PathBuf>,

    /// How long to wait for every stage of one image to finish
    #[arg(long, env = "PRISM_WAIT_MS", default_value_t = 10_000)]
    wait_ms: u64,

    /// Image id for the file in the same position (`img-<ULID>` or a bare ULID).
    /// Files without one get a generated id.
    #[arg(long = "id", value_name = "IMAGE_ID")]
    ids: Vec<String>,

    /// Image files to submit
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ImageReport {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack: Option<SubmissionAck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ImageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<AggregateRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob: Option<BlobMeta>,
    /// Other images stored with the same bytes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    shared_with: Vec<ImageId>,
}

impl ImageReport {
    fn rejected(path: &Path, error: impl ToString) -> Self {
        Self {
            path: path.display().to_string(),
            ack: None,
            error: Some(error.to_string()),
            status: None,
            record: None,
            blob: None,
            shared_with: Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "prism_core=info,prism_cli=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let ids = parse_ids(&args.ids)?;
    if ids.len() > args.images.len() {
        anyhow::bail!("{} ids given for {} images", ids.len(), args.images.len());
    }

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let pipeline = PipelineBuilder::in_memory(config)
        .with_inference(StageName::Face, Arc::new(DigestFaceEngine))
        .with_inference(StageName::Agender, Arc::new(DigestAgenderEngine))
        .expect_stages(&StageName::ALL)
        .build()
        .context("building pipeline")?;
    info!(images = args.images.len(), "pipeline started");

    let mut submitted = Vec::with_capacity(args.images.len());
    for (i, path) in args.images.iter().enumerate() {
        let outcome = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))
            .and_then(|bytes| {
                let ack = match ids.get(i) {
                    Some(&image_id) => pipeline.submit_as(image_id, bytes),
                    None => pipeline.submit(bytes),
                };
                ack.map_err(anyhow::Error::from)
            });
        match outcome {
            Ok(ack) => {
                info!(image_id = %ack.image_id, path = %path.display(), hash = %ack.content_hash.short(), "submitted");
                submitted.push((path.as_path(), Some(ack), None));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "submission rejected");
                submitted.push((path.as_path(), None, Some(e)));
            }
        }
    }

    let wait = Duration::from_millis(args.wait_ms);
    let mut reports = Vec::with_capacity(submitted.len());
    for (path, ack, error) in submitted {
        let Some(ack) = ack else {
            reports.push(ImageReport::rejected(path, error.map(|e| format!("{e:#}")).unwrap_or_default()));
            continue;
        };
        let image_id = ack.image_id;
        let status = tokio::select! {
            status = wait_until_processed(&pipeline, image_id, wait) => status?,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, shutting down");
                break;
            }
        };
        if !status.fully_processed {
            warn!(%image_id, "gave up waiting for every stage");
        }
        let record = pipeline.record(image_id).await?;
        let blob = pipeline.blob(&ack.content_hash).await?;
        let mut shared_with = pipeline.images_sharing(&ack.content_hash).await?;
        shared_with.retain(|other| *other != image_id);
        reports.push(ImageReport {
            path: path.display().to_string(),
            ack: Some(ack),
            error: None,
            status: Some(status),
            record,
            blob,
            shared_with,
        });
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);

    pipeline.shutdown_and_join().await;
    info!("pipeline stopped");
    Ok(())
}

fn parse_ids(raw: &[String]) -> Result<Vec<ImageId>> {
    raw.iter()
        .map(|s| {
            s.parse::<ImageId>()
                .map_err(PrismError::from)
                .with_context(|| format!("--id {s}"))
        })
        .collect()
}

async fn wait_until_processed(pipeline: &Pipeline, image_id: ImageId, wait: Duration) -> Result<ImageStatus> {
    let deadline = Instant::now() + wait;
    loop {
        let status = pipeline.status(image_id).await?;
        if status.fully_processed || Instant::now() >= deadline {
            return Ok(status);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_accept_prefixed_and_bare_ulids() {
        let ids = parse_ids(&["img-01ARZ3NDEKTSV4RRFFQ69G5FAV".into(), "01ARZ3NDEKTSV4RRFFQ69G5FAV".into()]).unwrap();
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn malformed_id_is_reported_with_the_flag() {
        let err = parse_ids(&["nope".into()]).unwrap_err();
        assert!(format!("{err:#}").contains("--id nope"));
        assert!(matches!(err.downcast_ref::<PrismError>(), Some(PrismError::InvalidId(_))));
    }
}
