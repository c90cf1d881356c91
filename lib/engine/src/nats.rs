//! NATS JetStream transport.
//!
//! Queue items are published to a work-queue stream and consumed through a
//! durable pull consumer with explicit acks:
//!
//! - each message carries the queue item ID as `Nats-Msg-Id`, so the broker
//!   drops republishes that land inside its duplicate window
//! - a nack asks for redelivery after `nack_delay`; deliveries are unbounded
//!   by default, so an item outlives any store outage
//! - messages that cannot be decoded are terminated, never redelivered

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::queue_item::QueueItem;
use crate::transport::{Acknowledger, Deliveries, Delivery, Transport};
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::context::Publish;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, warn};

/// Subject prefix for queue items.
const QUEUE_SUBJECT_PREFIX: &str = "conveyor.queue";

/// Default stream name.
const STREAM_NAME: &str = "CONVEYOR_QUEUE";

/// Default durable consumer name.
const CONSUMER_NAME: &str = "conveyor-workers";

/// Configuration for the NATS transport.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name (defaults to CONVEYOR_QUEUE).
    pub stream_name: Option<String>,
    /// Durable consumer name (defaults to conveyor-workers).
    pub consumer_name: Option<String>,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// Upper bound on deliveries of one message; `-1` for no bound.
    pub max_deliver: i64,
    /// How long a nacked message waits before redelivery.
    pub nack_delay: Duration,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: None,
            consumer_name: None,
            ack_wait: Duration::from_secs(60),
            max_deliver: -1,
            nack_delay: Duration::from_secs(5),
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(STREAM_NAME)
    }

    fn consumer(&self) -> &str {
        self.consumer_name.as_deref().unwrap_or(CONSUMER_NAME)
    }
}

/// Queue transport over a JetStream work-queue stream.
pub struct NatsTransport {
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl NatsTransport {
    /// Connects and makes sure the stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: NatsConfig) -> Result<Self, TransportError> {
        let client = async_nats::connect(&config.url).await.map_err(|e| {
            TransportError::ConnectionFailed {
                message: e.to_string(),
            }
        })?;

        let jetstream = async_nats::jetstream::new(client);
        Self::ensure_stream(&jetstream, &config).await?;

        Ok(Self { jetstream, config })
    }

    async fn ensure_stream(
        jetstream: &jetstream::Context,
        config: &NatsConfig,
    ) -> Result<(), TransportError> {
        let stream_config = jetstream::stream::Config {
            name: config.stream().to_string(),
            subjects: vec![format!("{QUEUE_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("failed to create queue stream: {e}"),
            })?;

        Ok(())
    }

    /// Returns the subject a queue item is published on.
    fn item_subject(item: &QueueItem) -> String {
        format!("{QUEUE_SUBJECT_PREFIX}.{}", item.workflow_id)
    }
}

struct NatsAcknowledger {
    message: jetstream::Message,
    nack_delay: Duration,
}

#[async_trait]
impl Acknowledger for NatsAcknowledger {
    async fn ack(&self) -> Result<(), TransportError> {
        self.message
            .ack()
            .await
            .map_err(|e| TransportError::AckFailed {
                message: e.to_string(),
            })
    }

    async fn nack(&self) -> Result<(), TransportError> {
        self.message
            .ack_with(AckKind::Nak(Some(self.nack_delay)))
            .await
            .map_err(|e| TransportError::AckFailed {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, item: &QueueItem) -> Result<(), TransportError> {
        let bytes = Envelope::new(item)
            .encode()
            .map_err(|e| TransportError::PublishFailed {
                message: format!("failed to serialize queue item: {e}"),
            })?;

        let publish = Publish::build()
            .payload(bytes.into())
            .message_id(item.id.to_string());

        self.jetstream
            .send_publish(Self::item_subject(item), publish)
            .await
            .map_err(|e| TransportError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| TransportError::PublishFailed {
                message: e.to_string(),
            })?;

        debug!(queue_item_id = %item.id, "published queue item");
        Ok(())
    }

    async fn consume(&self) -> Result<Deliveries, TransportError> {
        let stream = self
            .jetstream
            .get_stream(self.config.stream())
            .await
            .map_err(|e| TransportError::ReceiveFailed {
                message: format!("failed to get stream: {e}"),
            })?;

        let consumer = stream
            .get_or_create_consumer(
                self.config.consumer(),
                pull::Config {
                    durable_name: Some(self.config.consumer().to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::ReceiveFailed {
                message: format!("failed to create consumer: {e}"),
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| TransportError::ReceiveFailed {
                message: format!("failed to get messages: {e}"),
            })?;

        let nack_delay = self.config.nack_delay;
        let deliveries = messages.filter_map(move |message| async move {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    return Some(Err(TransportError::ReceiveFailed {
                        message: e.to_string(),
                    }));
                }
            };

            match Envelope::<QueueItem>::decode(&message.payload) {
                Ok(envelope) => Some(Ok(Delivery::new(
                    envelope.into_payload(),
                    NatsAcknowledger {
                        message,
                        nack_delay,
                    },
                ))),
                Err(e) => {
                    warn!(error = %e, subject = %message.subject, "terminating undecodable message");
                    if let Err(e) = message.ack_with(AckKind::Term).await {
                        warn!(error = %e, "failed to terminate message");
                    }
                    None
                }
            }
        });

        Ok(deliveries.boxed())
    }
}
