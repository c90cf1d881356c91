//! Queue transport contract.
//!
//! The transport delivers queue items at least once. A delivery that is not
//! acked (or is nacked) comes back later, so everything downstream of
//! `consume` has to tolerate duplicates.

use crate::error::TransportError;
use crate::queue_item::QueueItem;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Settles a single delivery with the transport.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Marks the delivery as done.
    async fn ack(&self) -> Result<(), TransportError>;

    /// Asks for redelivery.
    async fn nack(&self) -> Result<(), TransportError>;
}

/// A queue item received from the transport.
pub struct Delivery {
    item: QueueItem,
    acknowledger: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wraps a received item with the handle used to settle it.
    pub fn new(item: QueueItem, acknowledger: impl Acknowledger + 'static) -> Self {
        Self {
            item,
            acknowledger: Box::new(acknowledger),
        }
    }

    /// The delivered queue item.
    #[must_use]
    pub fn item(&self) -> &QueueItem {
        &self.item
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the acknowledgement.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acknowledger.ack().await
    }

    /// Requests redelivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the request.
    pub async fn nack(self) -> Result<(), TransportError> {
        self.acknowledger.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery").field("item", &self.item).finish()
    }
}

/// Stream of deliveries handed out by [`Transport::consume`].
pub type Deliveries = BoxStream<'static, Result<Delivery, TransportError>>;

/// Durable at-least-once channel between router and workers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes a committed queue item.
    async fn publish(&self, item: &QueueItem) -> Result<(), TransportError>;

    /// Starts consuming deliveries.
    async fn consume(&self) -> Result<Deliveries, TransportError>;
}
