// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Upload worker: round-robin drains `snapshot`/`snapshot-diff`/
//! `snapshot-latest`, conveying each artifact's blob, sha256 sidecar, and
//! metadata JSON to object storage with HEAD-based dedup.
//!
//! Grounded in `upload_snapshots.py`: `upload_sha256` → `upload_metadata` →
//! `r2_upload_artifact` ordering, the per-message subordinate-thread
//! timeout, and the queue-rotation `main()` loop.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    broker::{BrokerClient, DeliveryTag, Stream},
    config::PipelineConfig,
    error::UploadError,
    metadata::{object_store_key, SnapshotMetadata},
    notify::NotifyStatus,
    object_store_client::{sha256_file, Bucket, R2Client},
    worker::WorkerContext,
};

const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Run the Upload worker forever.
pub async fn run(ctx: &WorkerContext) -> anyhow::Result<()> {
    for stream in [
        Stream::Snapshot,
        Stream::SnapshotDiff,
        Stream::SnapshotLatest,
        Stream::Upload,
        Stream::UploadFailed,
    ] {
        ctx.broker.declare(stream).await?;
    }

    loop {
        let mut processed = false;
        for stream in [Stream::Snapshot, Stream::SnapshotDiff, Stream::SnapshotLatest] {
            if let Some((tag, body)) = ctx.broker.consume(stream).await? {
                ctx.metrics.set_total(ctx.broker.queue_size(stream).await? as i64);
                process_message(ctx, stream, tag, body).await;
                processed = true;
                break;
            }
        }
        if !processed {
            info!("no snapshots queued for upload, sleeping 10m");
            tokio::time::sleep(QUEUE_WAIT_TIMEOUT).await;
        }
    }
}

async fn process_message(ctx: &WorkerContext, stream: Stream, tag: DeliveryTag, body: String) {
    let metadata = match SnapshotMetadata::from_json(&body) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "malformed snapshot metadata message, rejecting without requeue");
            let _ = ctx.broker.reject(stream, tag, false).await;
            return;
        }
    };

    let store = match &ctx.object_store {
        Some(s) => Arc::clone(s),
        None => {
            error!("upload role requires R2 configuration; rejecting with requeue");
            let _ = ctx.broker.reject(stream, tag, true).await;
            return;
        }
    };

    let build_path = PathBuf::from(&metadata.build_information.build_path);
    let folder = build_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let basename = build_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bucket = if stream == Stream::SnapshotLatest {
        Bucket::Latest
    } else {
        Bucket::Archive
    };
    let network = ctx.config.chain.clone();
    let thread_ts = metadata.build_information.build_timestamp.clone();

    let started = std::time::Instant::now();
    let handle = tokio::spawn(upload_once(
        store,
        bucket,
        network,
        folder,
        basename.clone(),
        build_path,
        metadata.clone(),
    ));

    match tokio::time::timeout(PipelineConfig::UPLOAD_TIMEOUT, handle).await {
        Ok(Ok(Ok(updated))) => {
            ctx.metrics.upload_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.processing_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.queue_processed.inc();
            ctx.metrics.refresh_progress_ratio();
            let _ = ctx.broker.ack(stream, tag).await;
            if let Ok(json) = updated.to_json() {
                let _ = ctx.broker.publish(Stream::Upload, &json).await;
            }
            notify_thread(
                ctx,
                NotifyStatus::Success,
                &format!("Upload snapshot {basename} succeeded"),
                &thread_ts,
            )
            .await;
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, basename, "upload failed");
            ctx.metrics.processing_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.queue_failed.inc();
            ctx.metrics.refresh_progress_ratio();
            let _ = ctx.broker.reject(stream, tag, false).await;
            if let Ok(json) = metadata.to_json() {
                let _ = ctx.broker.publish(Stream::UploadFailed, &json).await;
            }
            notify_thread(
                ctx,
                NotifyStatus::Failure,
                &format!("Upload snapshot {basename} failed"),
                &thread_ts,
            )
            .await;
        }
        Ok(Err(join_err)) => {
            error!(error = %join_err, basename, "upload task panicked");
            ctx.metrics.processing_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.queue_failed.inc();
            ctx.metrics.refresh_progress_ratio();
            let _ = ctx.broker.reject(stream, tag, false).await;
            if let Ok(json) = metadata.to_json() {
                let _ = ctx.broker.publish(Stream::UploadFailed, &json).await;
            }
        }
        Err(_timeout) => {
            warn!(basename, "upload exceeded its wall-clock budget, rejecting with requeue");
            ctx.metrics.processing_duration_seconds.observe(started.elapsed().as_secs_f64());
            ctx.metrics.queue_failed.inc();
            ctx.metrics.refresh_progress_ratio();
            let _ = ctx.broker.reject(stream, tag, true).await;
        }
    }
}

/// The subordinate unit of work joined with a deadline by [`process_message`]
/// (spec.md §5's "single subordinate task per message"). Touches only the
/// object store and local filesystem; holds no broker resources, so a
/// timed-out task can be safely abandoned.
async fn upload_once(
    store: Arc<R2Client>,
    bucket: Bucket,
    network: String,
    folder: String,
    basename: String,
    build_path: PathBuf,
    mut metadata: SnapshotMetadata,
) -> Result<SnapshotMetadata, UploadError> {
    let digest = sha256_file(&build_path).await.map_err(UploadError::Transient)?;
    metadata.snapshot.sha256 = Some(digest.clone());

    let sha_key = object_store_key(&network, &folder, &format!("{basename}.sha256sum"));
    store
        .put_bytes(bucket, &sha_key, digest.into_bytes())
        .await
        .map_err(UploadError::Transient)?;

    let metadata_json = metadata
        .to_json()
        .map_err(|e| UploadError::MalformedMetadata(e.to_string()))?;
    let meta_key = object_store_key(&network, &folder, &format!("{basename}.metadata.json"));
    store
        .put_bytes(bucket, &meta_key, metadata_json.into_bytes())
        .await
        .map_err(UploadError::Transient)?;

    let blob_key = object_store_key(&network, &folder, &basename);
    if store.exists(bucket, &blob_key).await.map_err(UploadError::Transient)? {
        info!(key = %blob_key, "blob already present in object store, skipping main upload");
    } else {
        let file = tokio::fs::File::open(&build_path)
            .await
            .map_err(|e| UploadError::Transient(e.into()))?;
        store
            .put_stream(bucket, &blob_key, file)
            .await
            .map_err(UploadError::Transient)?;
    }

    Ok(metadata)
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
    fn bucket_routing_by_source_stream() {
        let latest_bucket = if Stream::SnapshotLatest == Stream::SnapshotLatest {
            Bucket::Latest
        } else {
            Bucket::Archive
        };
        assert_eq!(latest_bucket, Bucket::Latest);
        let archive_bucket = if Stream::Snapshot == Stream::SnapshotLatest {
            Bucket::Latest
        } else {
            Bucket::Archive
        };
        assert_eq!(archive_bucket, Bucket::Archive);
    }

    #[tokio::test]
    async fn upload_once_writes_sidecars_and_skips_existing_blob() {
        use crate::metadata::{BuildInformation, HeadTipset, Snapshot, Validation};
        use object_store::{memory::InMemory, ObjectStore};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forest_snapshot_mainnet_2024-01-01_height_30000.forest.car.zst");
        tokio::fs::write(&path, b"fake car bytes").await.unwrap();

        let in_memory: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = Arc::new(R2Client::from_stores(Arc::clone(&in_memory), in_memory));

        let metadata = SnapshotMetadata {
            snapshot: Snapshot {
                snapshot_version: "1".into(),
                head_tipset: HeadTipset::Single("bafy1".into()),
                f3_data: None,
                f3_snapshot_version: None,
                f3_snapshot_first_instance: None,
                f3_snapshot_last_instance: None,
                car_format: "v1".into(),
                network: "mainnet".into(),
                epoch: 30_000,
                state_roots: 900,
                sha256: None,
                messages_sets: 1,
                index_size: "1 MiB".into(),
            },
            build_information: BuildInformation {
                epoch: 30_000,
                epoch_date: None,
                build_path: path.to_string_lossy().into_owned(),
                build_timestamp: "1700000000.0".into(),
                build_date: None,
                validation: Validation::default(),
            },
        };

        let updated = upload_once(
            store,
            Bucket::Archive,
            "mainnet".into(),
            "lite".into(),
            path.file_name().unwrap().to_string_lossy().into_owned(),
            path.clone(),
            metadata,
        )
        .await
        .unwrap();

        assert!(updated.snapshot.sha256.is_some());
    }
}
