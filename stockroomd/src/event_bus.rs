//! Event bus for internal daemon communication.
//!
//! Order payment notifications flow from whoever settles a payment to the
//! accounting workers (fee reconciliation). Uses tokio broadcast channels for
//! fan-out to multiple receivers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use stockroom_domain::{BusinessId, OrderId};
use tokio::sync::broadcast;

// =============================================================================
// Event Types
// =============================================================================

/// Events that flow through the daemon event bus.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// An order was paid
    OrderPaymentSucceeded(OrderPaymentSucceeded),

    /// Shutdown signal
    Shutdown,
}

/// Payment settled for an order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPaymentSucceeded {
    pub business_id: BusinessId,
    pub order_id: OrderId,
    /// Order total the fee is computed from
    pub order_total: Decimal,
    pub currency: String,
    /// Payment method descriptor (e.g. `card`)
    pub payment_method: String,
    pub paid_at: DateTime<Utc>,
}

// =============================================================================
// Event Bus
// =============================================================================

/// Event bus for daemon-wide communication.
///
/// Multiple producers can send events, and multiple consumers can receive.
pub struct EventBus {
    sender: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity.
    ///
    /// Capacity determines how many events can be buffered before
    /// slow receivers start missing events (lagging).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event, 0 when
    /// nobody is listening.
    pub fn send(&self, event: DaemonEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events sent after this call.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver { receiver: self.sender.subscribe() }
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Receiver for daemon events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<DaemonEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the sender has been dropped, and an error
    /// description if the receiver lagged (missed events).
    pub async fn recv(&mut self) -> Option<Result<DaemonEvent, String>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
