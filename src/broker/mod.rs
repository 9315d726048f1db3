// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Broker topology and client trait.
//!
//! Grounded in `roles/forest_snapshots/files/rabbitmq.py`: one durable
//! fanout exchange per logical stream, a durable main queue bound to it with
//! a dead-letter exchange, a length-capped `drop-head` queue used only for
//! cursor recovery, and a DLX/DLQ pair. No example repo in the retrieval
//! pack speaks AMQP (Forest's own "broker" is libp2p gossip, a different
//! protocol), so the client is built on `lapin`, the ecosystem-standard
//! tokio-native AMQP 0-9-1 crate — see DESIGN.md.

use std::fmt;

use anyhow::Context;
use tokio::sync::Mutex;

use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Connection, ConnectionProperties, ExchangeKind,
};

pub mod fake;

/// The eight logical streams named in spec.md §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Compute,
    Snapshot,
    SnapshotDiff,
    SnapshotLatest,
    Upload,
    UploadFailed,
    Validate,
    ValidateFailed,
}

impl Stream {
    pub const ALL: [Stream; 8] = [
        Stream::Compute,
        Stream::Snapshot,
        Stream::SnapshotDiff,
        Stream::SnapshotLatest,
        Stream::Upload,
        Stream::UploadFailed,
        Stream::Validate,
        Stream::ValidateFailed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stream::Compute => "compute",
            Stream::Snapshot => "snapshot",
            Stream::SnapshotDiff => "snapshot-diff",
            Stream::SnapshotLatest => "snapshot-latest",
            Stream::Upload => "upload",
            Stream::UploadFailed => "upload-failed",
            Stream::Validate => "validate",
            Stream::ValidateFailed => "validate-failed",
        }
    }

    pub fn head_queue(self) -> String {
        format!("{}-head", self.name())
    }

    pub fn dlx(self) -> String {
        format!("{}.dlx", self.name())
    }

    pub fn dlq(self) -> String {
        format!("{}.dlq", self.name())
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An opaque handle identifying one delivered message, passed back to
/// [`BrokerClient::ack`] / [`BrokerClient::reject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTag(pub u64);

/// The subset of broker semantics this pipeline consumes: durable queues,
/// fanout exchanges, DLX, length-capped head queues, persistent delivery,
/// per-message ack/reject. Abstracted behind a trait so workers can be
/// exercised against an in-memory [`fake::FakeBroker`] in tests without a
/// live RabbitMQ instance.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Idempotently declare the exchange/queue/DLX topology for a stream.
    async fn declare(&self, stream: Stream) -> anyhow::Result<()>;

    /// Publish a persistent message to a stream's exchange.
    async fn publish(&self, stream: Stream, body: &str) -> anyhow::Result<()>;

    /// Fetch one message from the main (FIFO) queue, if any, without
    /// blocking.
    async fn consume(&self, stream: Stream) -> anyhow::Result<Option<(DeliveryTag, String)>>;

    /// Fetch the single retained message from the head (cursor) queue, if
    /// any, without blocking and without consuming it off the main queue.
    async fn consume_head(&self, stream: Stream) -> anyhow::Result<Option<String>>;

    /// Acknowledge successful processing of a main-queue message.
    async fn ack(&self, stream: Stream, tag: DeliveryTag) -> anyhow::Result<()>;

    /// Reject a main-queue message; `requeue=false` routes it to the DLQ.
    async fn reject(&self, stream: Stream, tag: DeliveryTag, requeue: bool) -> anyhow::Result<()>;

    /// Number of ready messages on a stream's main queue, used to size the
    /// `total` metrics gauge before a processing pass.
    async fn queue_size(&self, stream: Stream) -> anyhow::Result<u32>;
}

/// `lapin`-backed production client. A single connection/channel pair is
/// reused across calls and lazily re-opened if it's gone stale, mirroring
/// the original's `with RabbitMQClient() as rabbit:` scoping while keeping
/// the one invariant AMQP demands and a fresh-channel-per-call would
/// violate: delivery tags are scoped to the channel that received them, so
/// `ack`/`reject` must run against the same channel `consume` used.
pub struct LapinBroker {
    uri: String,
    state: Mutex<Option<(Connection, lapin::Channel)>>,
}

impl LapinBroker {
    pub fn new(host: &str, user: &str, pass: &str) -> Self {
        Self {
            uri: format!("amqp://{user}:{pass}@{host}:5672/%2f"),
            state: Mutex::new(None),
        }
    }

    async fn channel(&self) -> anyhow::Result<lapin::Channel> {
        let mut guard = self.state.lock().await;
        if let Some((conn, chan)) = guard.as_ref() {
            if conn.status().connected() && chan.status().connected() {
                return Ok(chan.clone());
            }
        }
        let conn = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .context("failed to connect to RabbitMQ")?;
        let chan = conn
            .create_channel()
            .await
            .context("failed to open AMQP channel")?;
        let out = chan.clone();
        *guard = Some((conn, chan));
        Ok(out)
    }
}

#[async_trait::async_trait]
impl BrokerClient for LapinBroker {
    async fn declare(&self, stream: Stream) -> anyhow::Result<()> {
        let chan = self.channel().await?;
        let durable_exchange = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        chan.exchange_declare(
            stream.name(),
            ExchangeKind::Fanout,
            durable_exchange,
            FieldTable::default(),
        )
        .await?;

        let mut main_args = FieldTable::default();
        main_args.insert("x-dead-letter-exchange".into(), stream.dlx().into());
        chan.queue_declare(stream.name(), durable_queue, main_args)
            .await?;
        chan.queue_bind(
            stream.name(),
            stream.name(),
            stream.name(),
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

        let mut head_args = FieldTable::default();
        head_args.insert("x-max-length".into(), 1_i32.into());
        head_args.insert("x-overflow".into(), "drop-head".into());
        chan.queue_declare(&stream.head_queue(), durable_queue, head_args)
            .await?;
        chan.queue_bind(
            &stream.head_queue(),
            stream.name(),
            &stream.head_queue(),
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

        chan.exchange_declare(
            &stream.dlx(),
            ExchangeKind::Fanout,
            durable_exchange,
            FieldTable::default(),
        )
        .await?;
        chan.queue_declare(&stream.dlq(), durable_queue, FieldTable::default())
            .await?;
        chan.queue_bind(
            &stream.dlq(),
            &stream.dlx(),
            &stream.dlq(),
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

        Ok(())
    }

    async fn publish(&self, stream: Stream, body: &str) -> anyhow::Result<()> {
        let chan = self.channel().await?;
        chan.basic_publish(
            stream.name(),
            stream.name(),
            BasicPublishOptions::default(),
            body.as_bytes(),
            BasicProperties::default().with_delivery_mode(2), // persistent
        )
        .await?
        .await?;
        Ok(())
    }

    async fn consume(&self, stream: Stream) -> anyhow::Result<Option<(DeliveryTag, String)>> {
        let chan = self.channel().await?;
        let got = chan
            .basic_get(stream.name(), BasicGetOptions::default())
            .await?;
        match got {
            Some(delivery) => {
                let tag = DeliveryTag(delivery.delivery_tag);
                let body = String::from_utf8(delivery.data)
                    .context("non-UTF-8 message body on main queue")?;
                Ok(Some((tag, body)))
            }
            None => Ok(None),
        }
    }

    async fn consume_head(&self, stream: Stream) -> anyhow::Result<Option<String>> {
        let chan = self.channel().await?;
        // Peek, don't consume: `no_ack: true` would auto-ack and drop the
        // single retained message, emptying the head queue on the very
        // first read. Fetch with manual ack and immediately requeue it so
        // the cursor stays in place for the next reader.
        let got = chan
            .basic_get(&stream.head_queue(), BasicGetOptions { no_ack: false })
            .await?;
        match got {
            Some(delivery) => {
                let tag = delivery.delivery_tag;
                let body = String::from_utf8(delivery.data)?;
                chan.basic_reject(tag, BasicRejectOptions { requeue: true })
                    .await?;
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, _stream: Stream, tag: DeliveryTag) -> anyhow::Result<()> {
        let chan = self.channel().await?;
        chan.basic_ack(tag.0, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, _stream: Stream, tag: DeliveryTag, requeue: bool) -> anyhow::Result<()> {
        let chan = self.channel().await?;
        chan.basic_reject(tag.0, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn queue_size(&self, stream: Stream) -> anyhow::Result<u32> {
        let chan = self.channel().await?;
        let passive = QueueDeclareOptions {
            passive: true,
            durable: true,
            ..Default::default()
        };
        let q = chan
            .queue_declare(stream.name(), passive, FieldTable::default())
            .await?;
        Ok(q.message_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_match_original_queue_enum() {
        assert_eq!(Stream::Compute.name(), "compute");
        assert_eq!(Stream::SnapshotDiff.name(), "snapshot-diff");
        assert_eq!(Stream::UploadFailed.name(), "upload-failed");
        assert_eq!(Stream::ValidateFailed.name(), "validate-failed");
    }

    #[test]
    fn head_dlx_dlq_naming() {
        assert_eq!(Stream::Snapshot.head_queue(), "snapshot-head");
        assert_eq!(Stream::Snapshot.dlx(), "snapshot.dlx");
        assert_eq!(Stream::Snapshot.dlq(), "snapshot.dlq");
    }
}
