// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fan-out of incoming publishes to registered topic-filter receivers.

use std::collections::HashMap;
use std::string::FromUtf8Error;

use thiserror::Error;
use tokio::sync::mpsc::{channel, error::SendError, Receiver, Sender};

use crate::control_packet::Publish;
use crate::topic::{TopicFilter, TopicName, TopicParseError};

/// Errors dispatching an incoming publish to registered receivers.
// NOTE: These errors should almost never happen in valid MQTT scenarios.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The receiver's channel has been closed.
    #[error("receiver closed")]
    ClosedReceiver(#[from] SendError<Publish>),
    /// The publish carried a topic name that could not be parsed.
    #[error("could not get topic from publish: {0}")]
    InvalidPublish(#[from] InvalidPublish),
}

/// Reasons a publish's topic could not be interpreted.
#[derive(Error, Debug)]
pub enum InvalidPublish {
    /// Topic bytes were not valid UTF-8.
    #[error("invalid UTF-8")]
    TopicNameUtf8(#[from] FromUtf8Error),
    /// Topic did not conform to MQTT topic name grammar.
    #[error("invalid topic: {0}")]
    TopicNameFormat(#[from] TopicParseError),
}

/// Dispatches incoming publishes to receivers registered against topic filters, falling back
/// to an unfiltered receiver for anything that matches no registered filter.
pub struct IncomingPublishDispatcher {
    channel_capacity: usize,
    filtered_txs: HashMap<TopicFilter, Vec<Sender<Publish>>>,
    unfiltered_tx: Sender<Publish>,
}

impl IncomingPublishDispatcher {
    /// Create a new dispatcher along with its unfiltered receiver.
    pub fn new(capacity: usize) -> (Self, Receiver<Publish>) {
        let (tx, rx) = channel(capacity);
        (
            IncomingPublishDispatcher {
                channel_capacity: capacity,
                filtered_txs: HashMap::new(),
                unfiltered_tx: tx,
            },
            rx,
        )
    }

    /// Register a topic filter for dispatching.
    ///
    /// Returns a receiver that will receive incoming publishes matching the filter. Multiple
    /// receivers can be registered for the same filter.
    pub fn register_filter(&mut self, topic_filter: &TopicFilter) -> Receiver<Publish> {
        self.prune();
        let (tx, rx) = channel(self.channel_capacity);
        self.filtered_txs
            .entry(topic_filter.clone())
            .or_default()
            .push(tx);
        rx
    }

    /// Dispatch a publish to all registered filters that match its topic, falling back to the
    /// unfiltered receiver if nothing matched. Returns the number of receivers reached.
    pub async fn dispatch_publish(&mut self, publish: &Publish) -> Result<usize, DispatchError> {
        let mut dispatched = 0;
        let mut closed = vec![];

        let topic_name = extract_publish_topic_name(publish)?;

        let filtered = self
            .filtered_txs
            .iter()
            .filter(|(topic_filter, _)| topic_filter.matches_topic_name(&topic_name));
        for (topic_filter, senders) in filtered {
            for (pos, tx) in senders.iter().enumerate() {
                if tx.is_closed() {
                    closed.push((topic_filter.clone(), pos));
                    continue;
                }
                tx.send(publish.clone()).await?;
                dispatched += 1;
            }
        }

        if dispatched == 0 {
            self.unfiltered_tx.send(publish.clone()).await?;
            dispatched += 1;
        }

        for (topic_filter, pos) in closed.into_iter().rev() {
            if let Some(v) = self.filtered_txs.get_mut(&topic_filter) {
                v.remove(pos);
            }
        }
        self.prune();

        Ok(dispatched)
    }

    /// Remove topic filters with no remaining live receivers.
    fn prune(&mut self) {
        self.filtered_txs.retain(|_, v| !v.is_empty());
    }
}

fn extract_publish_topic_name(publish: &Publish) -> Result<TopicName, InvalidPublish> {
    let topic = String::from_utf8(publish.topic.to_vec())?;
    Ok(topic.parse::<TopicName>()?)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::control_packet::QoS;

    fn publish(topic: &str) -> Publish {
        Publish::new(topic, QoS::AtMostOnce, Vec::<u8>::new(), None)
    }

    #[tokio::test]
    async fn dispatches_to_matching_filter() {
        let (mut dispatcher, mut unfiltered_rx) = IncomingPublishDispatcher::new(16);
        let filter = TopicFilter::from_str("IIoT/#").unwrap();
        let mut rx = dispatcher.register_filter(&filter);

        let count = dispatcher
            .dispatch_publish(&publish("IIoT/line1/temp"))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(rx.recv().await.is_some());
        assert!(unfiltered_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn falls_back_to_unfiltered_when_nothing_matches() {
        let (mut dispatcher, mut unfiltered_rx) = IncomingPublishDispatcher::new(16);
        let filter = TopicFilter::from_str("other/+").unwrap();
        let _rx = dispatcher.register_filter(&filter);

        let count = dispatcher
            .dispatch_publish(&publish("IIoT/line1/temp"))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(unfiltered_rx.recv().await.is_some());
    }
}
