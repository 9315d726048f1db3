// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-worker error taxonomies. Each variant set maps onto one of the six
//! categories in the error-handling design: transient collaborator errors,
//! tool re-entrancy, tool failure, timeout, malformed-message, and fatal.
//!
//! Workers convert these into broker outcomes (ack/reject/DLQ) and metric
//! increments; they never propagate past the worker's own cooperative loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("transient error querying chain head or broker: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("epoch {epoch} failed to compute: {source}")]
    EpochFailed {
        epoch: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("malformed cursor in compute-head: {0}")]
    MalformedCursor(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("transient error: {0}")]
    Transient(#[source] anyhow::Error),
    /// The chain tool reported that another export job already holds its
    /// global lock; callers should back off and retry the same argv.
    #[error("chain export job already in progress")]
    ReEntrant,
    #[error("chain tool exited non-zero or produced no output file: {0}")]
    ToolFailed(String),
    #[error("malformed upstream cursor message: {0}")]
    MalformedCursor(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("transient object-store or broker error: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("upload exceeded its wall-clock budget")]
    Timeout,
    #[error("malformed snapshot metadata message: {0}")]
    MalformedMetadata(String),
}

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("transient RPC or broker error: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("primary validation failed: {0}")]
    PrimaryFailed(String),
    #[error("secondary daemon cross-check failed: {0}")]
    SecondaryFailed(String),
    #[error("validation exceeded its wall-clock budget")]
    Timeout,
    #[error("malformed upload metadata message: {0}")]
    MalformedMetadata(String),
}

/// Fatal, unrecoverable startup errors: configuration or broker connection
/// loss severe enough that the process should exit and let the supervisor
/// restart it. Never raised from inside a per-message processing loop.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),
    #[error("could not establish initial broker connection: {0}")]
    BrokerInit(#[source] anyhow::Error),
}
