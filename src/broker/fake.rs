// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-process broker double honoring the same FIFO + drop-head semantics as
//! the real topology, for exercising worker logic without a live RabbitMQ
//! instance (spec.md §8's end-to-end scenarios).

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use super::{BrokerClient, DeliveryTag, Stream};

#[derive(Default)]
struct StreamState {
    main: VecDeque<(u64, String)>,
    /// Messages that have been handed out via `consume` but not yet
    /// ack/reject-ed.
    in_flight: HashMap<u64, String>,
    dlq: Vec<String>,
    head: Option<String>,
    next_tag: u64,
}

/// An in-memory stand-in for [`super::LapinBroker`]. Every stream starts
/// declared; `declare` is a no-op kept for interface parity.
#[derive(Default)]
pub struct FakeBroker {
    streams: Mutex<HashMap<Stream, StreamState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: inspect what ended up in a stream's dead-letter queue.
    pub fn dlq_contents(&self, stream: Stream) -> Vec<String> {
        self.streams
            .lock()
            .unwrap()
            .get(&stream)
            .map(|s| s.dlq.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl BrokerClient for FakeBroker {
    async fn declare(&self, stream: Stream) -> anyhow::Result<()> {
        self.streams.lock().unwrap().entry(stream).or_default();
        Ok(())
    }

    async fn publish(&self, stream: Stream, body: &str) -> anyhow::Result<()> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream).or_default();
        let tag = state.next_tag;
        state.next_tag += 1;
        state.main.push_back((tag, body.to_owned()));
        // fanout: the head queue also receives every message, retaining
        // only the most recent (x-max-length=1, drop-head).
        state.head = Some(body.to_owned());
        Ok(())
    }

    async fn consume(&self, stream: Stream) -> anyhow::Result<Option<(DeliveryTag, String)>> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream).or_default();
        match state.main.pop_front() {
            Some((tag, body)) => {
                state.in_flight.insert(tag, body.clone());
                Ok(Some((DeliveryTag(tag), body)))
            }
            None => Ok(None),
        }
    }

    async fn consume_head(&self, stream: Stream) -> anyhow::Result<Option<String>> {
        let streams = self.streams.lock().unwrap();
        Ok(streams.get(&stream).and_then(|s| s.head.clone()))
    }

    async fn ack(&self, stream: Stream, tag: DeliveryTag) -> anyhow::Result<()> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(&stream) {
            state.in_flight.remove(&tag.0);
        }
        Ok(())
    }

    async fn reject(&self, stream: Stream, tag: DeliveryTag, requeue: bool) -> anyhow::Result<()> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(&stream) {
            if let Some(body) = state.in_flight.remove(&tag.0) {
                if requeue {
                    state.main.push_front((tag.0, body));
                } else {
                    state.dlq.push(body);
                }
            }
        }
        Ok(())
    }

    async fn queue_size(&self, stream: Stream) -> anyhow::Result<u32> {
        let streams = self.streams.lock().unwrap();
        Ok(streams.get(&stream).map(|s| s.main.len() as u32).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn head_retains_only_latest_message() {
        let broker = FakeBroker::new();
        broker.declare(Stream::Compute).await.unwrap();
        broker.publish(Stream::Compute, "100").await.unwrap();
        broker.publish(Stream::Compute, "200").await.unwrap();
        broker.publish(Stream::Compute, "300").await.unwrap();
        assert_eq!(
            broker.consume_head(Stream::Compute).await.unwrap(),
            Some("300".to_owned())
        );
    }

    #[tokio::test]
    async fn main_queue_is_fifo_and_head_independent() {
        let broker = FakeBroker::new();
        broker.declare(Stream::Snapshot).await.unwrap();
        broker.publish(Stream::Snapshot, "a").await.unwrap();
        broker.publish(Stream::Snapshot, "b").await.unwrap();
        let (tag, body) = broker.consume(Stream::Snapshot).await.unwrap().unwrap();
        assert_eq!(body, "a");
        broker.ack(Stream::Snapshot, tag).await.unwrap();
        let (_, body) = broker.consume(Stream::Snapshot).await.unwrap().unwrap();
        assert_eq!(body, "b");
        // head still reflects the latest published message, independent of
        // what's been consumed off main.
        assert_eq!(
            broker.consume_head(Stream::Snapshot).await.unwrap(),
            Some("b".to_owned())
        );
    }

    #[tokio::test]
    async fn reject_without_requeue_routes_to_dlq() {
        let broker = FakeBroker::new();
        broker.declare(Stream::Upload).await.unwrap();
        broker.publish(Stream::Upload, "payload").await.unwrap();
        let (tag, _) = broker.consume(Stream::Upload).await.unwrap().unwrap();
        broker.reject(Stream::Upload, tag, false).await.unwrap();
        assert_eq!(broker.dlq_contents(Stream::Upload), vec!["payload".to_owned()]);
        assert_eq!(broker.consume(Stream::Upload).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reject_with_requeue_returns_to_front_of_main() {
        let broker = FakeBroker::new();
        broker.declare(Stream::Upload).await.unwrap();
        broker.publish(Stream::Upload, "payload").await.unwrap();
        let (tag, _) = broker.consume(Stream::Upload).await.unwrap().unwrap();
        broker.reject(Stream::Upload, tag, true).await.unwrap();
        let (_, body) = broker.consume(Stream::Upload).await.unwrap().unwrap();
        assert_eq!(body, "payload");
    }
}
