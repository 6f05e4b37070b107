//! NATS bridge between the wire and the pipeline channels.
//!
//! # Subject Convention
//!
//! - **Inbound:** `{base}` or `{base}.{key}`. Everything after the base
//!   subject and its dot is the record key; a message on the bare base
//!   subject is unkeyed.
//! - **Outbound:** `{results}.{key}`, where the key is `arena_id/round_id`.
//!
//! Both directions run as background Tokio tasks. Inbound bridges stop
//! when the shutdown signal fires or the pipeline drops its receiver; the
//! result publisher stops once the pipeline closes the result channel.

use futures::StreamExt as _;
use skirmish_core::feed::{InboundRecord, OutboundRecord};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors raised by the NATS bridge.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Connecting to the server failed.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Server URL.
        url: String,
        /// Failure description.
        message: String,
    },

    /// Subscribing to a subject failed.
    #[error("failed to subscribe to {subject}: {message}")]
    Subscribe {
        /// Subject pattern.
        subject: String,
        /// Failure description.
        message: String,
    },

    /// Publishing or flushing failed.
    #[error("failed to publish on {subject}: {message}")]
    Publish {
        /// Target subject.
        subject: String,
        /// Failure description.
        message: String,
    },
}

/// The record key carried by `subject` under `base`, if any.
pub fn subject_key(base: &str, subject: &str) -> Option<String> {
    subject
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
}

/// The subject an outbound record is published on.
pub fn outbound_subject(base: &str, record: &OutboundRecord) -> String {
    match &record.key {
        Some(key) => format!("{base}.{key}"),
        None => base.to_owned(),
    }
}

/// NATS client wrapper for the engine.
#[derive(Debug, Clone)]
pub struct NatsFeed {
    client: async_nats::Client,
}

impl NatsFeed {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self, FeedError> {
        info!(url = url, "Connecting to NATS server");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| FeedError::Connect {
                url: url.to_owned(),
                message: e.to_string(),
            })?;
        info!("NATS connection established");
        Ok(Self { client })
    }

    async fn subscribe(&self, subject: String) -> Result<async_nats::Subscriber, FeedError> {
        debug!(subject = subject, "Subscribing");
        self.client
            .subscribe(subject.clone())
            .await
            .map_err(|e| FeedError::Subscribe {
                subject,
                message: e.to_string(),
            })
    }

    /// Forward every message on `base` and `base.>` into `tx`.
    ///
    /// Subscriptions are made before this returns, so nothing published
    /// afterwards is missed.
    pub async fn bridge_inbound(
        &self,
        base: String,
        tx: mpsc::Sender<InboundRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<u64>, FeedError> {
        let bare = self.subscribe(base.clone()).await?;
        let nested = self.subscribe(format!("{base}.>")).await?;
        let mut messages = futures::stream::select(bare, nested);
        info!(subject = base, "Inbound bridge subscribed");

        Ok(tokio::spawn(async move {
            let mut forwarded = 0_u64;
            loop {
                let message = tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    message = messages.next() => message,
                };
                let Some(message) = message else {
                    warn!(subject = base, "Subscription closed");
                    break;
                };
                let key = subject_key(&base, message.subject.as_str());
                let record = InboundRecord::new(key, message.payload.to_vec());
                if tx.send(record).await.is_err() {
                    debug!(subject = base, "Pipeline input closed");
                    break;
                }
                forwarded = forwarded.saturating_add(1);
            }
            info!(subject = base, forwarded, "Inbound bridge stopped");
            forwarded
        }))
    }

    /// Publish every outbound record under `base` until `rx` closes.
    ///
    /// A failed publish is logged and counted; the publisher keeps going
    /// with the next record.
    pub fn publish_results(
        &self,
        base: String,
        mut rx: mpsc::Receiver<OutboundRecord>,
    ) -> JoinHandle<Result<PublishTally, FeedError>> {
        let client = self.client.clone();
        tokio::spawn(async move {
            let tally = forward_results(&base, &mut rx, |subject, payload| {
                let client = client.clone();
                async move { client.publish(subject, payload.into()).await }
            })
            .await;
            client.flush().await.map_err(|e| FeedError::Publish {
                subject: base.clone(),
                message: format!("flush: {e}"),
            })?;
            info!(
                subject = base,
                published = tally.published,
                failed = tally.failed,
                "Result publisher stopped"
            );
            Ok(tally)
        })
    }
}

/// Outcome counts of a result publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishTally {
    /// Records handed to the server.
    pub published: u64,
    /// Records whose publish call failed and were dropped.
    pub failed: u64,
}

async fn forward_results<F, Fut, E>(
    base: &str,
    rx: &mut mpsc::Receiver<OutboundRecord>,
    mut publish: F,
) -> PublishTally
where
    F: FnMut(String, Vec<u8>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut tally = PublishTally::default();
    while let Some(record) = rx.recv().await {
        let subject = outbound_subject(base, &record);
        match publish(subject.clone(), record.payload).await {
            Ok(()) => {
                debug!(subject = subject, "Published result");
                tally.published = tally.published.saturating_add(1);
            }
            Err(e) => {
                warn!(subject = subject, error = %e, "Result publish failed");
                tally.failed = tally.failed.saturating_add(1);
            }
        }
    }
    tally
}
