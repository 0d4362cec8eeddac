// =============================================================================
// EVENTS MODULE
// =============================================================================
// Domain events for the notification and reporting subsystems.
//
// NOTES:
// - Every envelope is written to the store's outbox in the same write as the
//   state change it describes, then broadcast; the sweeper re-broadcasts any
//   envelope still marked undelivered
// - Delivery is at-least-once: consumers deduplicate on `event_id`
// - The bus is bounded; an `EventConsumer` that falls behind replays the
//   missed range from the outbox instead of losing it
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::models::{Amount, ReservationStatus};
use crate::store::Store;

/// Replay starts this far before the last envelope seen, to cover
/// envelopes broadcast slightly out of `occurred_at` order.
const REPLAY_OVERLAP_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    ReservationCreated {
        reservation_id: Uuid,
        lot_id: Uuid,
        slot_id: Option<Uuid>,
        user_id: Uuid,
        amount: Amount,
    },
    ReservationConfirmed {
        reservation_id: Uuid,
        lot_id: Uuid,
        user_id: Uuid,
    },
    ReservationCheckedIn {
        reservation_id: Uuid,
        session_id: Uuid,
        slot_id: Uuid,
    },
    ReservationCancelled {
        reservation_id: Uuid,
        lot_id: Uuid,
        user_id: Uuid,
        previous_status: ReservationStatus,
        reason: String,
    },
    /// Pending reservation auto-cancelled by the expiry sweep
    ReservationExpired {
        reservation_id: Uuid,
        lot_id: Uuid,
        user_id: Uuid,
    },
    SessionStarted {
        session_id: Uuid,
        lot_id: Uuid,
        slot_id: Uuid,
        vehicle_id: Uuid,
    },
    SessionCompleted {
        session_id: Uuid,
        reservation_id: Option<Uuid>,
        lot_id: Uuid,
        amount_due: Amount,
    },
    PaymentRecorded {
        session_id: Uuid,
        payment_id: String,
    },
    SubscriptionCreated {
        subscription_id: Uuid,
        user_id: Uuid,
        amount: Amount,
    },
    SubscriptionRenewed {
        subscription_id: Uuid,
        user_id: Uuid,
        new_end_date: DateTime<Utc>,
        amount: Amount,
    },
    SubscriptionCancelled {
        subscription_id: Uuid,
        user_id: Uuid,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::ReservationCreated { .. } => "ReservationCreated",
            DomainEvent::ReservationConfirmed { .. } => "ReservationConfirmed",
            DomainEvent::ReservationCheckedIn { .. } => "ReservationCheckedIn",
            DomainEvent::ReservationCancelled { .. } => "ReservationCancelled",
            DomainEvent::ReservationExpired { .. } => "ReservationExpired",
            DomainEvent::SessionStarted { .. } => "SessionStarted",
            DomainEvent::SessionCompleted { .. } => "SessionCompleted",
            DomainEvent::PaymentRecorded { .. } => "PaymentRecorded",
            DomainEvent::SubscriptionCreated { .. } => "SubscriptionCreated",
            DomainEvent::SubscriptionRenewed { .. } => "SubscriptionRenewed",
            DomainEvent::SubscriptionCancelled { .. } => "SubscriptionCancelled",
        }
    }
}

/// Event plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

impl EventEnvelope {
    pub fn new(occurred_at: DateTime<Utc>, event: DomainEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at,
            event,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn send(&self, envelope: &EventEnvelope) {
        // Err only means nobody is listening
        let _ = self.sender.send(envelope.clone());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// -----------------------------------------------------------------------------
// CONSUMER
// -----------------------------------------------------------------------------

/// Bus subscriber that falls back to the outbox when the bus drops entries.
///
/// May yield an envelope more than once around a replay.
pub struct EventConsumer {
    receiver: broadcast::Receiver<EventEnvelope>,
    outbox: Arc<dyn Store>,
    /// Latest `occurred_at` handed out so far
    watermark: DateTime<Utc>,
    replay_from: Option<DateTime<Utc>>,
    backlog: VecDeque<EventEnvelope>,
}

impl EventConsumer {
    pub fn new(bus: &EventBus, outbox: Arc<dyn Store>, subscribed_at: DateTime<Utc>) -> Self {
        Self {
            receiver: bus.subscribe(),
            outbox,
            watermark: subscribed_at,
            replay_from: None,
            backlog: VecDeque::new(),
        }
    }

    /// Next envelope, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            if let Some(since) = self.replay_from {
                let since = since - Duration::seconds(REPLAY_OVERLAP_SECS);
                match self.outbox.events_since(since).await {
                    Ok(missed) => {
                        tracing::info!(replayed = missed.len(), since = %since, "Replayed events from the outbox");
                        self.backlog.extend(missed);
                        self.replay_from = None;
                    }
                    Err(e) => tracing::warn!(error = %e, "Event replay failed, retrying on next receive"),
                }
            }

            if let Some(envelope) = self.backlog.pop_front() {
                return Some(self.hand_out(envelope));
            }

            match self.receiver.recv().await {
                Ok(envelope) => return Some(self.hand_out(envelope)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event consumer lagged behind, replaying");
                    if self.replay_from.is_none() {
                        self.replay_from = Some(self.watermark);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn hand_out(&mut self, envelope: EventEnvelope) -> EventEnvelope {
        self.watermark = self.watermark.max(envelope.occurred_at);
        envelope
    }
}

/// Log every event until the bus closes.
pub fn spawn_event_logger(mut consumer: EventConsumer) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = consumer.recv().await {
            let payload = serde_json::to_string(&envelope.event).unwrap_or_default();
            tracing::info!(
                event_id = %envelope.event_id,
                event = envelope.event.name(),
                payload = %payload,
                "Domain event"
            );
        }
    })
}
