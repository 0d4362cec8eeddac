// =============================================================================
// STORE MODULE
// =============================================================================
// Persistence seam for the engine. Two implementations:
// - `MemoryStore`: maps behind a lock, for tests and single-node demos
// - `PgStore`: PostgreSQL through SQLx, for deployments
//
// NOTES:
// - Every write is atomic: one statement or one transaction
// - `insert_reservation` is a conditional write; a slot-assigned reservation
//   overlapping another slot-holding reservation is rejected with
//   `StoreError::Conflict` (PostgreSQL enforces this with an exclusion
//   constraint)
// - Status updates are compare-and-set against the expected prior status
// - Writes that change reservation, session or subscription state take the
//   event envelopes describing the change and append them to the outbox in
//   the same atomic write; a write that is rejected appends nothing
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::events::EventEnvelope;
use crate::models::{
    ParkingLot, ParkingSession, Reservation, ReservationStatus, Slot, Subscription, Vehicle, Zone,
};
use crate::timerange::TimeRange;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique key already taken (plate, slot number)
    #[error("already exists: {0}")]
    Duplicate(String),

    /// Conditional write lost against an overlapping claim on the slot
    #[error("overlapping claim on slot {slot_id}")]
    Conflict { slot_id: Uuid },

    /// Lock contention, serialization failure, pool exhaustion
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // -------------------------------------------------------------------------
    // CATALOG
    // -------------------------------------------------------------------------
    async fn insert_lot(&self, lot: &ParkingLot) -> StoreResult<()>;
    async fn get_lot(&self, lot_id: Uuid) -> StoreResult<Option<ParkingLot>>;
    async fn list_lots(&self) -> StoreResult<Vec<ParkingLot>>;

    async fn insert_zone(&self, zone: &Zone) -> StoreResult<()>;
    async fn get_zone(&self, zone_id: Uuid) -> StoreResult<Option<Zone>>;
    async fn list_zones(&self, lot_id: Uuid) -> StoreResult<Vec<Zone>>;

    /// Fails with `Duplicate` when the slot number is taken in the lot.
    async fn insert_slot(&self, slot: &Slot) -> StoreResult<()>;
    async fn get_slot(&self, slot_id: Uuid) -> StoreResult<Option<Slot>>;
    /// Slots of a lot ordered by slot number.
    async fn list_slots(&self, lot_id: Uuid) -> StoreResult<Vec<Slot>>;
    async fn set_slot_disabled(&self, slot_id: Uuid, disabled: bool) -> StoreResult<Slot>;

    // -------------------------------------------------------------------------
    // VEHICLES
    // -------------------------------------------------------------------------
    /// Fails with `Duplicate` when the plate is already registered.
    async fn insert_vehicle(&self, vehicle: &Vehicle) -> StoreResult<()>;
    async fn get_vehicle(&self, vehicle_id: Uuid) -> StoreResult<Option<Vehicle>>;

    // -------------------------------------------------------------------------
    // RESERVATIONS
    // -------------------------------------------------------------------------
    async fn insert_reservation(
        &self,
        reservation: &Reservation,
        events: &[EventEnvelope],
    ) -> StoreResult<()>;
    async fn get_reservation(&self, reservation_id: Uuid) -> StoreResult<Option<Reservation>>;
    async fn list_reservations_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Reservation>>;
    /// Reservations of any status in the lot whose range overlaps `window`.
    async fn reservations_overlapping(
        &self,
        lot_id: Uuid,
        window: &TimeRange,
    ) -> StoreResult<Vec<Reservation>>;
    /// Replace the record if its stored status still equals `expected`.
    ///
    /// Returns `false` when the status moved underneath the caller.
    async fn update_reservation(
        &self,
        reservation: &Reservation,
        expected: ReservationStatus,
        events: &[EventEnvelope],
    ) -> StoreResult<bool>;
    /// Pending reservations created at or before `cutoff`.
    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Reservation>>;

    // -------------------------------------------------------------------------
    // SESSIONS
    // -------------------------------------------------------------------------
    async fn insert_session(
        &self,
        session: &ParkingSession,
        events: &[EventEnvelope],
    ) -> StoreResult<()>;
    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<ParkingSession>>;
    async fn update_session(
        &self,
        session: &ParkingSession,
        events: &[EventEnvelope],
    ) -> StoreResult<()>;
    /// Sessions in the lot with `entry < window.end` and
    /// `exit IS NULL OR exit >= window.start`.
    async fn sessions_touching(
        &self,
        lot_id: Uuid,
        window: &TimeRange,
    ) -> StoreResult<Vec<ParkingSession>>;
    /// Move a confirmed reservation to checked-in and create its session,
    /// all or nothing. `false` when the reservation is no longer `expected`.
    async fn check_in(
        &self,
        reservation: &Reservation,
        expected: ReservationStatus,
        session: &ParkingSession,
        events: &[EventEnvelope],
    ) -> StoreResult<bool>;
    /// Close a session and, when linked, complete its reservation atomically.
    async fn complete_session(
        &self,
        session: &ParkingSession,
        reservation: Option<&Reservation>,
        events: &[EventEnvelope],
    ) -> StoreResult<bool>;

    // -------------------------------------------------------------------------
    // SUBSCRIPTIONS
    // -------------------------------------------------------------------------
    async fn insert_subscription(
        &self,
        subscription: &Subscription,
        events: &[EventEnvelope],
    ) -> StoreResult<()>;
    async fn get_subscription(&self, subscription_id: Uuid) -> StoreResult<Option<Subscription>>;
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        events: &[EventEnvelope],
    ) -> StoreResult<()>;
    /// Auto-renewing, non-cancelled subscriptions with `end_date <= now`.
    async fn subscriptions_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>>;

    // -------------------------------------------------------------------------
    // EVENT OUTBOX
    // -------------------------------------------------------------------------
    /// Undelivered envelopes with `occurred_at <= older_than`, oldest first.
    async fn undelivered_events(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<EventEnvelope>>;
    /// Unknown ids are ignored.
    async fn mark_events_delivered(&self, event_ids: &[Uuid]) -> StoreResult<()>;
    /// Every envelope with `occurred_at >= since`, delivered or not, in
    /// append order.
    async fn events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<EventEnvelope>>;

    // -------------------------------------------------------------------------
    // HEALTH
    // -------------------------------------------------------------------------
    async fn health_check(&self) -> bool;
}
