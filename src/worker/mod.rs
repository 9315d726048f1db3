// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The four worker roles and the cooperative-loop scaffolding shared between
//! them: cursor recovery from a stream's head queue, the environment handed
//! to every chain-tool invocation, and the `WorkerContext` each role's
//! `run()` entrypoint is built around.

pub mod build;
pub mod compute;
pub mod upload;
pub mod validate;

use std::{collections::HashMap, sync::Arc};

use tracing::warn;

use crate::{
    broker::{BrokerClient, Stream},
    chain_tool::ChainTool,
    config::PipelineConfig,
    metrics::PipelineMetrics,
    notify::SlackNotifier,
    object_store_client::R2Client,
};

/// Everything a worker's main loop needs, assembled once at startup and
/// shared for the life of the process (spec.md §9: inject per-process
/// singletons with explicit init rather than module-load side effects).
/// Role-specific collaborators (`object_store`, `docker`) are `None` for
/// roles that never touch them.
pub struct WorkerContext {
    pub config: Arc<PipelineConfig>,
    pub broker: Arc<dyn BrokerClient>,
    pub chain_tool: ChainTool,
    pub metrics: Arc<PipelineMetrics>,
    pub notifier: Option<Arc<SlackNotifier>>,
    pub object_store: Option<Arc<R2Client>>,
    pub docker: Option<bollard::Docker>,
}

impl WorkerContext {
    /// The environment every chain-tool subprocess is spawned with:
    /// `FULLNODE_API_INFO` plus an inherited `RUST_LOG`, matching the
    /// original's `env={"FULLNODE_API_INFO": get_api_info()}` call sites.
    pub fn tool_env(&self) -> anyhow::Result<HashMap<String, String>> {
        let mut env = HashMap::new();
        env.insert("FULLNODE_API_INFO".to_owned(), self.config.fullnode_api_info()?);
        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            env.insert("RUST_LOG".to_owned(), rust_log);
        }
        Ok(env)
    }
}

/// Parse a stream's head-queue body as a decimal epoch cursor, falling back
/// to `default` on an absent or malformed message (error taxonomy category
/// 5: parsing failures on upstream messages fall back to
/// `DEFAULT_START_EPOCH` for cursor parsing, per spec.md §7).
pub async fn recover_cursor_epoch(
    broker: &dyn BrokerClient,
    stream: Stream,
    default: i64,
) -> anyhow::Result<i64> {
    match broker.consume_head(stream).await? {
        Some(body) => match body.trim().parse::<i64>() {
            Ok(epoch) => Ok(epoch),
            Err(_) => {
                warn!(%stream, body, "malformed cursor on head queue, falling back to default start epoch");
                Ok(default)
            }
        },
        None => {
            warn!(%stream, "no cursor on head queue, falling back to default start epoch");
            Ok(default)
        }
    }
}

/// Parse a stream's head-queue body as a `SnapshotMetadata` envelope and
/// extract its build epoch, falling back to `default` on an absent or
/// malformed message. Used by Build's historic-mode cursor recovery, which
/// reads full envelopes rather than bare integers off `snapshot`/
/// `snapshot-diff`.
pub async fn recover_cursor_epoch_from_metadata(
    broker: &dyn BrokerClient,
    stream: Stream,
    default: i64,
) -> anyhow::Result<i64> {
    match broker.consume_head(stream).await? {
        Some(body) => match crate::metadata::SnapshotMetadata::from_json(&body) {
            Ok(meta) => Ok(meta.build_information.epoch),
            Err(e) => {
                warn!(%stream, error = %e, "malformed snapshot metadata on head queue, falling back to default start epoch");
                Ok(default)
            }
        },
        None => {
            warn!(%stream, "no cursor on head queue, falling back to default start epoch");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;

    #[tokio::test]
    async fn recover_cursor_epoch_falls_back_on_absent_head() {
        let broker = FakeBroker::new();
        broker.declare(Stream::Compute).await.unwrap();
        let epoch = recover_cursor_epoch(&broker, Stream::Compute, 0).await.unwrap();
        assert_eq!(epoch, 0);
    }

    #[tokio::test]
    async fn recover_cursor_epoch_reads_latest_integer() {
        let broker = FakeBroker::new();
        broker.declare(Stream::Compute).await.unwrap();
        broker.publish(Stream::Compute, "100").await.unwrap();
        broker.publish(Stream::Compute, "200").await.unwrap();
        let epoch = recover_cursor_epoch(&broker, Stream::Compute, 0).await.unwrap();
        assert_eq!(epoch, 200);
    }

    #[tokio::test]
    async fn recover_cursor_epoch_falls_back_on_malformed_body() {
        let broker = FakeBroker::new();
        broker.declare(Stream::Compute).await.unwrap();
        broker.publish(Stream::Compute, "not-a-number").await.unwrap();
        let epoch = recover_cursor_epoch(&broker, Stream::Compute, 42).await.unwrap();
        assert_eq!(epoch, 42);
    }
}
