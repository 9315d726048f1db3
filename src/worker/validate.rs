// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Validate worker: drains `upload`, runs the primary tool-based check and
//! (for `lite`/`latest-v1`/`latest-v2`) a secondary-daemon reference
//! cross-check, then finalizes and republishes the snapshot metadata.
//!
//! Grounded in `validate_snapshots.py`: the two-validation contract, the
//! `ChainHead` → `test_height = head - 1950` → `ChainGetTipSetByHeight` →
//! `ChainGetBlock` probe sequence, and the always-teardown secondary
//! daemon lifecycle.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    broker::{BrokerClient, DeliveryTag, Stream},
    chain_tool::ToolOutcome,
    config::PipelineConfig,
    error::ValidateError,
    metadata::{object_store_key, SnapshotMetadata, SnapshotVariant},
    metrics::PipelineMetrics,
    notify::NotifyStatus,
    object_store_client::{Bucket, R2Client},
    secondary_daemon::{with_secondary_daemon, SecondaryDaemonSpec},
    worker::WorkerContext,
};

const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const RPC_READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const SYNC_WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const TEST_HEIGHT_OFFSET: i64 = 1950;

pub async fn run(ctx: &WorkerContext) -> anyhow::Result<()> {
    for stream in [Stream::Upload, Stream::Validate, Stream::ValidateFailed] {
        ctx.broker.declare(stream).await?;
    }

    loop {
        match ctx.broker.consume(Stream::Upload).await? {
            Some((tag, body)) => {
                ctx.metrics
                    .set_total(ctx.broker.queue_size(Stream::Upload).await? as i64);
                process_message(ctx, tag, body).await;
            }
            None => {
                info!("no uploaded snapshots queued for validation, sleeping 10m");
                tokio::time::sleep(QUEUE_WAIT_TIMEOUT).await;
            }
        }
    }
}

async fn process_message(ctx: &WorkerContext, tag: DeliveryTag, body: String) {
    let metadata = match SnapshotMetadata::from_json(&body) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "malformed upload metadata message, rejecting without requeue");
            let _ = ctx.broker.reject(Stream::Upload, tag, false).await;
            return;
        }
    };

    let thread_ts = metadata.build_information.build_timestamp.clone();
    let started = std::time::Instant::now();
    let handle = tokio::spawn(validate_once(
        ctx.config.clone(),
        ctx.docker.clone(),
        ctx.object_store.clone(),
        Arc::clone(&ctx.metrics),
        metadata.clone(),
    ));

    match tokio::time::timeout(PipelineConfig::VALIDATE_TIMEOUT, handle).await {
        Ok(Ok(Ok(finalized))) => {
            ctx.metrics.processing_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.queue_processed.inc();
            ctx.metrics.refresh_progress_ratio();
            let _ = ctx.broker.ack(Stream::Upload, tag).await;
            if let Ok(json) = finalized.to_json() {
                let _ = ctx.broker.publish(Stream::Validate, &json).await;
            }
            notify_thread(ctx, NotifyStatus::Success, "Validation succeeded", &thread_ts).await;
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "validation failed");
            ctx.metrics.processing_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.queue_failed.inc();
            ctx.metrics.refresh_progress_ratio();
            let _ = ctx.broker.reject(Stream::Upload, tag, false).await;
            if let Ok(json) = metadata.to_json() {
                let _ = ctx.broker.publish(Stream::ValidateFailed, &json).await;
            }
            notify_thread(
                ctx,
                NotifyStatus::Failure,
                &format!("Validation failed: {e}"),
                &thread_ts,
            )
            .await;
        }
        Ok(Err(join_err)) => {
            error!(error = %join_err, "validation task panicked");
            ctx.metrics.processing_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.queue_failed.inc();
            ctx.metrics.refresh_progress_ratio();
            let _ = ctx.broker.reject(Stream::Upload, tag, false).await;
            if let Ok(json) = metadata.to_json() {
                let _ = ctx.broker.publish(Stream::ValidateFailed, &json).await;
            }
        }
        Err(_timeout) => {
            warn!("validation exceeded its wall-clock budget, rejecting with requeue");
            ctx.metrics.processing_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.queue_failed.inc();
            ctx.metrics.refresh_progress_ratio();
            let _ = ctx.broker.reject(Stream::Upload, tag, true).await;
        }
    }
}

/// The subordinate unit of work joined with a deadline by [`process_message`].
/// Takes owned config/docker handles rather than a borrowed `WorkerContext`
/// so it can be moved into a spawned task independent of the caller's
/// stack frame.
async fn validate_once(
    config: std::sync::Arc<PipelineConfig>,
    docker: Option<bollard::Docker>,
    object_store: Option<Arc<R2Client>>,
    metrics: Arc<PipelineMetrics>,
    mut metadata: SnapshotMetadata,
) -> Result<SnapshotMetadata, ValidateError> {
    let build_path = metadata.build_information.build_path.clone();

    primary_validate(&config, &build_path).await?;

    if needs_secondary_validation(&build_path) {
        let docker = docker.ok_or_else(|| {
            ValidateError::SecondaryFailed("validate role requires Docker access".into())
        })?;
        secondary_validate(&config, docker, &build_path, &metrics).await?;
    }

    metadata.build_information.validation.success = true;
    metadata.build_information.validation.forest_version = forest_version(&config).await;
    metadata.build_information.validation.lotus_version = lotus_version(&config).await;
    metadata.build_information.validation.validation_date = Some(chrono::Utc::now());

    if let Some(store) = object_store {
        write_back_metadata(&store, &config.chain, &build_path, &metadata).await?;
    }

    Ok(metadata)
}

/// Overwrite the artifact's `.metadata.json` sibling with the now-finalized
/// validation record (spec.md §4.5: "write metadata; upload it (overwriting)").
async fn write_back_metadata(
    store: &R2Client,
    network: &str,
    build_path: &str,
    metadata: &SnapshotMetadata,
) -> Result<(), ValidateError> {
    let path = PathBuf::from(build_path);
    let folder = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let basename = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bucket = if folder.starts_with("latest") {
        Bucket::Latest
    } else {
        Bucket::Archive
    };
    let key = object_store_key(network, &folder, &format!("{basename}.metadata.json"));
    let body = metadata
        .to_json()
        .map_err(|e| ValidateError::PrimaryFailed(format!("could not serialize metadata envelope: {e}")))?;
    store
        .put_bytes(bucket, &key, body.into_bytes())
        .await
        .map_err(ValidateError::Transient)
}

/// `lite`/`latest-v1`/`latest-v2` get a secondary-daemon cross-check;
/// `diff` artifacts, which carry no full state tree, do not.
fn needs_secondary_validation(build_path: &str) -> bool {
    for folder in [
        SnapshotVariant::Lite.policy().folder,
        SnapshotVariant::LatestV1.policy().folder,
        SnapshotVariant::LatestV2.policy().folder,
    ] {
        if build_path.contains(&format!("/{folder}/")) {
            return true;
        }
    }
    false
}

async fn primary_validate(config: &PipelineConfig, path: &str) -> Result<(), ValidateError> {
    let tool = crate::chain_tool::ChainTool::new("forest-tool");
    let env = std::collections::HashMap::new();
    let subcommand = config.primary_validate_subcommand.to_string();
    let network = config.chain.clone();
    let outcome = tool
        .run(
            &[
                "snapshot",
                &subcommand,
                "--check-network",
                &network,
                "--check-links",
                "5",
                "--check-stateroots",
                "5",
                path,
            ],
            &env,
        )
        .await
        .map_err(ValidateError::Transient)?;

    match outcome {
        ToolOutcome::Ok => Ok(()),
        ToolOutcome::RetryLater => Err(ValidateError::PrimaryFailed(
            "chain export job still in progress".into(),
        )),
        ToolOutcome::Failed { exit_code, output } => Err(ValidateError::PrimaryFailed(format!(
            "exit {exit_code:?}: {output}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

async fn rpc_call<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &url::Url,
    method: &str,
    params: serde_json::Value,
) -> anyhow::Result<Option<T>> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });
    let resp: RpcResponse<T> = http.post(url.clone()).json(&body).send().await?.json().await?;
    if let Some(err) = resp.error {
        anyhow::bail!("rpc error calling {method}: {err}");
    }
    Ok(resp.result)
}

async fn secondary_validate(
    config: &PipelineConfig,
    docker: bollard::Docker,
    build_path: &str,
    metrics: &PipelineMetrics,
) -> Result<(), ValidateError> {
    let spec = SecondaryDaemonSpec {
        image: "ghcr.io/chainsafe/forest:latest".into(),
        name: format!("forest-validate-{}", uuid_like_suffix(build_path)),
        env: vec![format!("FOREST_CHAIN={}", config.chain)],
        binds: vec![format!("{build_path}:/snapshot.car.zst:ro")],
    };

    with_secondary_daemon(docker, &spec, |daemon| async move {
        let http = reqwest::Client::new();
        let rpc_url: url::Url = "http://127.0.0.1:2345/rpc/v0"
            .parse()
            .expect("static RPC url is valid");

        let ready = daemon
            .wait_ready(RPC_READY_TIMEOUT.as_secs() as u32 / 5, Duration::from_secs(5), || {
                let http = http.clone();
                let rpc_url = rpc_url.clone();
                async move {
                    rpc_call::<serde_json::Value>(&http, &rpc_url, "Filecoin.ChainHead", json!([]))
                        .await
                        .is_ok()
                }
            })
            .await;
        if !ready {
            return Err(anyhow::anyhow!(
                "secondary daemon RPC never became ready within {:?}",
                RPC_READY_TIMEOUT
            ));
        }

        let sync_started = std::time::Instant::now();
        let synced = daemon
            .wait_ready(SYNC_WAIT_TIMEOUT.as_secs() as u32 / 30, Duration::from_secs(30), || {
                let http = http.clone();
                let rpc_url = rpc_url.clone();
                async move { chain_head_epoch(&http, &rpc_url).await.is_ok() }
            })
            .await;
        metrics.download_duration_seconds.observe(sync_started.elapsed().as_secs_f64());
        if !synced {
            return Err(anyhow::anyhow!(
                "secondary daemon never finished syncing within {:?}",
                SYNC_WAIT_TIMEOUT
            ));
        }

        let head = chain_head_epoch(&http, &rpc_url).await?;
        let test_height = head - TEST_HEIGHT_OFFSET;

        let tipset_cid = match chain_get_tipset_by_height(&http, &config.full_rpc_node, test_height).await {
            Ok(Some(cid)) => cid,
            _ => chain_get_tipset_by_height(&http, &config.backup_rpc_node, test_height)
                .await?
                .ok_or_else(|| anyhow::anyhow!("neither primary nor backup RPC returned a tipset at height {test_height}"))?,
        };

        let local_height = chain_get_block_height(&http, &rpc_url, &tipset_cid).await?;
        anyhow::ensure!(
            local_height == test_height,
            "local daemon reported height {local_height}, expected {test_height}"
        );
        Ok(())
    })
    .await
    .map_err(|e| ValidateError::SecondaryFailed(e.to_string()))
}

async fn chain_head_epoch(http: &reqwest::Client, url: &url::Url) -> anyhow::Result<i64> {
    let head: serde_json::Value = rpc_call(http, url, "Filecoin.ChainHead", json!([]))
        .await?
        .ok_or_else(|| anyhow::anyhow!("ChainHead returned no result"))?;
    head["Height"]
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("ChainHead response missing Height: {head}"))
}

async fn chain_get_tipset_by_height(
    http: &reqwest::Client,
    url: &url::Url,
    height: i64,
) -> anyhow::Result<Option<String>> {
    let tipset: Option<serde_json::Value> = rpc_call(
        http,
        url,
        "Filecoin.ChainGetTipSetByHeight",
        json!([height, serde_json::Value::Null]),
    )
    .await?;
    Ok(tipset.and_then(|t| t["Cids"][0]["/"].as_str().map(|s| s.to_owned())))
}

async fn chain_get_block_height(http: &reqwest::Client, url: &url::Url, cid: &str) -> anyhow::Result<i64> {
    let block: serde_json::Value = rpc_call(
        http,
        url,
        "Filecoin.ChainGetBlock",
        json!([{"/": cid}]),
    )
    .await?
    .ok_or_else(|| anyhow::anyhow!("ChainGetBlock returned no result for {cid}"))?;
    block["Height"]
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("ChainGetBlock response missing Height: {block}"))
}

async fn forest_version(config: &PipelineConfig) -> String {
    let tool = crate::chain_tool::ChainTool::new("forest-cli");
    let env = std::collections::HashMap::new();
    let _ = config;
    tool.run_capturing_stdout(&["--version"], &env)
        .await
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".into())
}

async fn lotus_version(config: &PipelineConfig) -> String {
    let tool = crate::chain_tool::ChainTool::new("lotus");
    let env = std::collections::HashMap::new();
    let _ = config;
    tool.run_capturing_stdout(&["--version"], &env)
        .await
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".into())
}

/// A short, deterministic container-name suffix derived from the build path,
/// so concurrent validations (which never happen within one worker, but may
/// across a restart racing a straggler teardown) don't collide on name.
fn uuid_like_suffix(build_path: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(build_path.as_bytes());
    hex::encode(&digest[..4])
}

async fn notify_thread(ctx: &WorkerContext, status: NotifyStatus, text: &str, thread_ts: &str) {
    if thread_ts.is_empty() {
        return;
    }
    if let Some(n) = &ctx.notifier {
        let _ = n.reply(status, text, thread_ts).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secondary_validation_gate_matches_variant_table() {
        assert!(needs_secondary_validation("/data/snapshots-archive/lite/forest_snapshot_mainnet_2024-01-01_height_30000.forest.car.zst"));
        assert!(needs_secondary_validation("/data/snapshots/latest/forest_snapshot_mainnet_2024-01-01_height_500.forest.car.zst"));
        assert!(needs_secondary_validation("/data/snapshots/latest-v2/forest_snapshot_mainnet_2024-01-01_height_500.forest.car.zst"));
        assert!(!needs_secondary_validation("/data/snapshots-archive/diff/forest_diff_mainnet_2024-01-01_height_27000+3000.forest.car.zst"));
    }

    #[test]
    fn test_height_offset_matches_original_constant() {
        assert_eq!(TEST_HEIGHT_OFFSET, 1950);
    }

    #[test]
    fn container_name_suffix_is_deterministic() {
        let a = uuid_like_suffix("/data/x/forest_snapshot_mainnet_height_1.forest.car.zst");
        let b = uuid_like_suffix("/data/x/forest_snapshot_mainnet_height_1.forest.car.zst");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }
}
