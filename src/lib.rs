// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Pipeline coordination layer for Forest's periodic snapshot service.
//!
//! Four long-running worker roles — [`worker::compute`], [`worker::build`],
//! [`worker::upload`] and [`worker::validate`] — talk to each other only
//! through a durable broker ([`broker`]) and a shared metadata envelope
//! ([`metadata`]). Each worker is a thin driver over an external tool
//! ([`chain_tool`], [`secondary_daemon`]); this crate is the glue that makes
//! their composition crash-safe and idempotent.

pub mod broker;
pub mod chain_tool;
pub mod config;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod notify;
pub mod object_store_client;
pub mod secondary_daemon;
pub mod worker;

pub use config::PipelineConfig;
pub use metadata::SnapshotMetadata;
