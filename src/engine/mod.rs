// =============================================================================
// RESERVATION ENGINE
// =============================================================================
// Orchestrates the catalog, the reservation lifecycle, walk-in sessions and
// subscriptions on top of a `Store`.
//
// CONCURRENCY:
// - Every write that depends on a claim check (create, check-in, walk-in
//   entry, cancel, completion) runs inside the lot's async mutex:
//   read claims → validate → persist, nothing else
// - The store adds a second line: conditional inserts and compare-and-set
//   status updates, so a racing writer in another process still loses
// - Reads (availability, slot status, occupancy, traffic) never lock
//
// EVENTS:
// - Envelopes are built before the write and committed with it, broadcast
//   afterwards, then marked delivered; `relay_outbox` re-broadcasts the ones
//   a crash or store error left unmarked
//
// SUBMODULES:
// - catalog:       lots, zones, slots, vehicles
// - lifecycle:     reservations, sessions, payments, pending expiry
// - subscriptions: purchase, renewal, cancellation, auto-renew sweep
// =============================================================================

mod catalog;
mod lifecycle;
mod subscriptions;

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::clock::Clock;
use crate::directory::{AvailableSlots, ClaimIndex};
use crate::error::{AppError, AppResult};
use crate::events::{DomainEvent, EventBus, EventConsumer, EventEnvelope};
use crate::models::{
    Actor, ParkingLot, ParkingSession, Reservation, Slot, SlotView, Subscription, Vehicle,
};
use crate::occupancy::{self, OccupancyReport, TrafficReport};
use crate::pricing::PricingConfig;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::{Store, StoreResult};
use crate::timerange::TimeRange;
use crate::{directory, metrics};

// -----------------------------------------------------------------------------
// CONFIGURATION
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Customers cannot cancel once `now > start - cancellation_lead`
    pub cancellation_lead: Duration,
    /// Pending reservations older than this are cancelled by the sweeper
    pub pending_ttl: Duration,
    pub pricing: PricingConfig,
    pub retry: RetryPolicy,
    /// Candidate slots tried when the store rejects an auto-assigned slot
    pub max_assignment_attempts: usize,
    /// Undelivered envelopes younger than this are left to the request path
    pub outbox_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancellation_lead: Duration::hours(2),
            pending_ttl: Duration::minutes(15),
            pricing: PricingConfig::default(),
            retry: RetryPolicy::default(),
            max_assignment_attempts: 3,
            outbox_grace: Duration::seconds(30),
        }
    }
}

/// Envelopes re-broadcast per relay pass
const OUTBOX_RELAY_BATCH: usize = 500;

// -----------------------------------------------------------------------------
// KEYED LOCKS
// -----------------------------------------------------------------------------

/// One async mutex per key (lot id, subscription id), created on first use.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}

// -----------------------------------------------------------------------------
// ENGINE
// -----------------------------------------------------------------------------

pub struct ReservationEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: EngineConfig,
    lot_locks: KeyedLocks,
    subscription_locks: KeyedLocks,
}

impl ReservationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
            lot_locks: KeyedLocks::default(),
            subscription_locks: KeyedLocks::default(),
        }
    }

    /// Subscriber that sees every event committed from now on.
    pub fn subscribe_events(&self) -> EventConsumer {
        EventConsumer::new(&self.events, Arc::clone(&self.store), self.now())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn health_check(&self) -> bool {
        self.store.health_check().await
    }

    // -------------------------------------------------------------------------
    // SLOT DIRECTORY READS
    // -------------------------------------------------------------------------

    /// Free slots of the lot for `range`, lowest slot number first.
    ///
    /// A snapshot: the booking write re-validates under the lot lock.
    pub async fn find_available_slots(
        &self,
        lot_id: Uuid,
        range: TimeRange,
    ) -> AppResult<AvailableSlots> {
        self.load_lot(lot_id).await?;
        let slots = self.call("list_slots", || self.store.list_slots(lot_id)).await?;
        let claims = self.claims_for(lot_id, &range).await?;
        Ok(AvailableSlots::new(slots, claims, range))
    }

    /// Every slot of the lot with its status at `at`.
    pub async fn lot_slot_statuses(
        &self,
        lot_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<SlotView>> {
        self.load_lot(lot_id).await?;
        let slots = self.call("list_slots", || self.store.list_slots(lot_id)).await?;
        let claims = self.claims_for(lot_id, &instant_window(at)).await?;
        Ok(directory::slot_views(&slots, &claims, at))
    }

    // -------------------------------------------------------------------------
    // REPORTING
    // -------------------------------------------------------------------------

    pub async fn occupancy(&self, lot_id: Uuid, at: DateTime<Utc>) -> AppResult<OccupancyReport> {
        self.load_lot(lot_id).await?;
        let zones = self.call("list_zones", || self.store.list_zones(lot_id)).await?;
        let slots = self.call("list_slots", || self.store.list_slots(lot_id)).await?;
        let claims = self.claims_for(lot_id, &instant_window(at)).await?;

        let report = occupancy::occupancy_report(lot_id, at, &zones, &slots, &claims);
        metrics::set_lot_occupancy(&lot_id.to_string(), report.percentage);
        Ok(report)
    }

    pub async fn traffic(&self, lot_id: Uuid, window: TimeRange) -> AppResult<TrafficReport> {
        self.load_lot(lot_id).await?;
        let sessions = self
            .call("sessions_touching", || self.store.sessions_touching(lot_id, &window))
            .await?;
        Ok(occupancy::traffic_report(lot_id, &window, &sessions))
    }

    // -------------------------------------------------------------------------
    // EVENT OUTBOX
    // -------------------------------------------------------------------------

    /// Re-broadcast envelopes still undelivered after `outbox_grace`.
    pub async fn relay_outbox(&self) -> AppResult<usize> {
        let cutoff = self.now() - self.config.outbox_grace;
        let pending = self
            .call("undelivered_events", || {
                self.store.undelivered_events(cutoff, OUTBOX_RELAY_BATCH)
            })
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        for envelope in &pending {
            self.events.send(envelope);
        }
        let ids: Vec<Uuid> = pending.iter().map(|e| e.event_id).collect();
        self.call("mark_events_delivered", || self.store.mark_events_delivered(&ids))
            .await?;
        tracing::info!(relayed = ids.len(), "Outbox events re-broadcast");
        Ok(ids.len())
    }

    // -------------------------------------------------------------------------
    // SHARED HELPERS
    // -------------------------------------------------------------------------

    /// Store call with bounded retry on transient failures.
    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        retry_with_backoff(&self.config.retry, operation, f)
            .await
            .map_err(AppError::from)
    }

    /// Reservations and sessions of the lot that may claim slots in `window`.
    async fn claims_for(&self, lot_id: Uuid, window: &TimeRange) -> AppResult<ClaimIndex> {
        let reservations = self
            .call("reservations_overlapping", || {
                self.store.reservations_overlapping(lot_id, window)
            })
            .await?;
        let sessions = self
            .call("sessions_touching", || self.store.sessions_touching(lot_id, window))
            .await?;
        Ok(ClaimIndex::from_records(&reservations, &sessions))
    }

    async fn load_lot(&self, lot_id: Uuid) -> AppResult<ParkingLot> {
        self.call("get_lot", || self.store.get_lot(lot_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("parking lot {lot_id} not found")))
    }

    async fn load_slot(&self, slot_id: Uuid) -> AppResult<Slot> {
        self.call("get_slot", || self.store.get_slot(slot_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("slot {slot_id} not found")))
    }

    async fn load_vehicle(&self, vehicle_id: Uuid) -> AppResult<Vehicle> {
        self.call("get_vehicle", || self.store.get_vehicle(vehicle_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("vehicle {vehicle_id} not found")))
    }

    async fn load_reservation(&self, reservation_id: Uuid) -> AppResult<Reservation> {
        self.call("get_reservation", || self.store.get_reservation(reservation_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("reservation {reservation_id} not found")))
    }

    async fn load_session(&self, session_id: Uuid) -> AppResult<ParkingSession> {
        self.call("get_session", || self.store.get_session(session_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    async fn load_subscription(&self, subscription_id: Uuid) -> AppResult<Subscription> {
        self.call("get_subscription", || self.store.get_subscription(subscription_id))
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("subscription {subscription_id} not found"))
            })
    }

    fn envelope(&self, event: DomainEvent) -> EventEnvelope {
        EventEnvelope::new(self.clock.now(), event)
    }

    /// Broadcast an envelope its write has committed.
    async fn dispatch(&self, envelope: EventEnvelope) {
        self.events.send(&envelope);
        let ids = [envelope.event_id];
        if let Err(e) = self
            .call("mark_events_delivered", || self.store.mark_events_delivered(&ids))
            .await
        {
            tracing::warn!(error = %e, event_id = %envelope.event_id, "Event left to the outbox relay");
        }
    }
}

// -----------------------------------------------------------------------------
// AUTHORIZATION
// -----------------------------------------------------------------------------

/// Customers act only on their own records; staff act on anyone's.
fn authorize_for(actor: &Actor, owner: Uuid) -> AppResult<()> {
    if actor.role.is_privileged() || actor.user_id == owner {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "not permitted to act on another user's records".to_string(),
        ))
    }
}

fn require_staff(actor: &Actor) -> AppResult<()> {
    if actor.role.is_privileged() {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "operation requires the manager or administrator role".to_string(),
        ))
    }
}

/// Smallest window that captures every claim covering `at`.
fn instant_window(at: DateTime<Utc>) -> TimeRange {
    TimeRange::new(at, at + Duration::seconds(1)).unwrap_or_else(|_| TimeRange::open_ended(at))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::models::{
        CreateReservationRequest, CreateSubscriptionRequest, ReservationStatus, SlotStatus,
        SubscriptionPeriod, SubscriptionTier,
    };
    use std::collections::HashSet;

    fn booking(f: &Fixture, range: TimeRange) -> CreateReservationRequest {
        CreateReservationRequest {
            lot_id: f.lot.id,
            vehicle_id: f.vehicle.id,
            user_id: None,
            range,
            slot_id: None,
        }
    }

    #[tokio::test]
    async fn test_available_slots_excludes_claimed_and_disabled() {
        let f = fixture(3).await;
        f.engine
            .create_reservation(
                &f.driver,
                CreateReservationRequest {
                    lot_id: f.lot.id,
                    vehicle_id: f.vehicle.id,
                    user_id: None,
                    range: range((10, 0), (12, 0)),
                    slot_id: Some(f.slots[0].id),
                },
            )
            .await
            .unwrap();
        f.engine
            .set_slot_disabled(&admin(), f.slots[2].id, true)
            .await
            .unwrap();

        let available = f
            .engine
            .find_available_slots(f.lot.id, range((11, 0), (11, 30)))
            .await
            .unwrap();
        let numbers: Vec<i32> = available.iter().map(|s| s.slot_number).collect();
        assert_eq!(numbers, vec![2]);

        let later = f
            .engine
            .find_available_slots(f.lot.id, range((12, 0), (13, 0)))
            .await
            .unwrap();
        assert_eq!(later.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_lot_is_not_found() {
        let f = fixture(1).await;
        let err = f
            .engine
            .find_available_slots(Uuid::new_v4(), range((10, 0), (11, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_slot_statuses_follow_the_lifecycle() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(
                &f.driver,
                CreateReservationRequest {
                    lot_id: f.lot.id,
                    vehicle_id: f.vehicle.id,
                    user_id: None,
                    range: range((10, 0), (12, 0)),
                    slot_id: None,
                },
            )
            .await
            .unwrap();

        let status_at = |views: Vec<SlotView>| views[0].status;
        // pending holds the slot but is not displayed as reserved
        let views = f.engine.lot_slot_statuses(f.lot.id, at(10, 30)).await.unwrap();
        assert_eq!(status_at(views), SlotStatus::Available);

        f.engine.confirm_reservation(&f.driver, r.id).await.unwrap();
        let views = f.engine.lot_slot_statuses(f.lot.id, at(10, 30)).await.unwrap();
        assert_eq!(status_at(views), SlotStatus::Reserved);

        f.clock.set(at(10, 5));
        f.engine
            .check_in(&f.driver, r.id, Default::default())
            .await
            .unwrap();
        let views = f.engine.lot_slot_statuses(f.lot.id, at(10, 30)).await.unwrap();
        assert_eq!(status_at(views), SlotStatus::Occupied);
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_per_key() {
        let locks = Arc::new(KeyedLocks::default());
        let key = Uuid::new_v4();
        let guard = locks.lock(key).await;

        // another key is independent
        let _other = locks.lock(Uuid::new_v4()).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock(key).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_as_engine_unavailable() {
        let f = fixture(1).await;
        f.store.fail_reservation_inserts(true);

        let err = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0))))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EngineUnavailable(_)), "{err:?}");
        assert_eq!(
            f.store.reservation_insert_calls(),
            RetryPolicy::default().max_attempts as usize
        );
        // nothing half-written
        assert!(f.engine.list_reservations(&f.driver, None).await.unwrap().is_empty());
        assert!(f.store.events_since(t0() - Duration::days(1)).await.unwrap().is_empty());

        f.store.fail_reservation_inserts(false);
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0))))
            .await
            .unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
    }

    #[tokio::test]
    async fn test_lagged_consumer_recovers_every_event() {
        let f = fixture_on_bus(1, EngineConfig::default(), EventBus::new(2)).await;
        let mut consumer = f.engine.subscribe_events();

        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((14, 0), (16, 0))))
            .await
            .unwrap();
        f.engine.confirm_reservation(&f.driver, r.id).await.unwrap();
        f.engine.cancel_reservation(&f.driver, r.id, None).await.unwrap();
        let sub = f
            .engine
            .create_subscription(
                &f.driver,
                CreateSubscriptionRequest {
                    user_id: None,
                    tier: SubscriptionTier::Basic,
                    period: SubscriptionPeriod::Monthly,
                    start_date: None,
                    auto_renew: false,
                    payment_id: None,
                },
            )
            .await
            .unwrap();
        f.engine.cancel_subscription(&f.driver, sub.id).await.unwrap();

        // five events through a bus holding two
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        while seen.len() < 5 {
            let envelope = consumer.recv().await.unwrap();
            if seen.insert(envelope.event_id) {
                names.push(envelope.event.name());
            }
        }
        assert_eq!(
            names,
            vec![
                "ReservationCreated",
                "ReservationConfirmed",
                "ReservationCancelled",
                "SubscriptionCreated",
                "SubscriptionCancelled"
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_rebroadcasts_undelivered_events() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0))))
            .await
            .unwrap();
        // committed but never broadcast, as after a crash
        let orphan = EventEnvelope::new(
            f.engine.now(),
            DomainEvent::ReservationConfirmed {
                reservation_id: r.id,
                lot_id: r.lot_id,
                user_id: r.user_id,
            },
        );
        assert!(f
            .store
            .update_reservation(&r, ReservationStatus::Pending, std::slice::from_ref(&orphan))
            .await
            .unwrap());

        let mut consumer = f.engine.subscribe_events();
        assert_eq!(f.engine.relay_outbox().await.unwrap(), 0);

        f.clock.advance(Duration::seconds(31));
        assert_eq!(f.engine.relay_outbox().await.unwrap(), 1);
        assert_eq!(consumer.recv().await, Some(orphan));
        assert_eq!(f.engine.relay_outbox().await.unwrap(), 0);
    }
}
