// =============================================================================
// IN-MEMORY STORE
// =============================================================================
// HashMaps behind one RwLock. Each method holds the lock for its whole body,
// which makes every write atomic and every conditional check race-free.
// The event outbox is a Vec in append order.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::events::EventEnvelope;
use crate::models::{
    ParkingLot, ParkingSession, Reservation, ReservationStatus, Slot, Subscription, Vehicle, Zone,
};
use crate::timerange::{overlaps, TimeRange};

#[derive(Default)]
struct Tables {
    lots: HashMap<Uuid, ParkingLot>,
    zones: HashMap<Uuid, Zone>,
    slots: HashMap<Uuid, Slot>,
    vehicles: HashMap<Uuid, Vehicle>,
    reservations: HashMap<Uuid, Reservation>,
    sessions: HashMap<Uuid, ParkingSession>,
    subscriptions: HashMap<Uuid, Subscription>,
    outbox: Vec<OutboxEntry>,
}

struct OutboxEntry {
    envelope: EventEnvelope,
    delivered: bool,
}

impl Tables {
    /// Mirror of the PostgreSQL exclusion constraint on reservations.
    fn reservation_conflict(&self, candidate: &Reservation) -> Option<Uuid> {
        let slot_id = candidate.slot_id?;
        if !candidate.status.holds_slot() {
            return None;
        }
        self.reservations
            .values()
            .any(|r| {
                r.id != candidate.id
                    && r.slot_id == Some(slot_id)
                    && r.status.holds_slot()
                    && overlaps(&r.range, &candidate.range)
            })
            .then_some(slot_id)
    }

    fn append_events(&mut self, events: &[EventEnvelope]) {
        for envelope in events {
            if self.outbox.iter().any(|e| e.envelope.event_id == envelope.event_id) {
                continue;
            }
            self.outbox.push(OutboxEntry {
                envelope: envelope.clone(),
                delivered: false,
            });
        }
    }
}

/// Failure injection for engine tests.
#[cfg(test)]
#[derive(Default)]
struct Faults {
    fail_reservation_inserts: AtomicBool,
    reservation_insert_calls: AtomicUsize,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    #[cfg(test)]
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, `insert_reservation` fails with `StoreError::Transient`.
    #[cfg(test)]
    pub(crate) fn fail_reservation_inserts(&self, fail: bool) {
        self.faults.fail_reservation_inserts.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn reservation_insert_calls(&self) -> usize {
        self.faults.reservation_insert_calls.load(Ordering::SeqCst)
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::Fatal("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::Fatal("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    // -------------------------------------------------------------------------
    // CATALOG
    // -------------------------------------------------------------------------

    async fn insert_lot(&self, lot: &ParkingLot) -> StoreResult<()> {
        let mut t = self.write()?;
        if t.lots.contains_key(&lot.id) {
            return Err(StoreError::Duplicate(format!("parking lot {}", lot.id)));
        }
        t.lots.insert(lot.id, lot.clone());
        Ok(())
    }

    async fn get_lot(&self, lot_id: Uuid) -> StoreResult<Option<ParkingLot>> {
        Ok(self.read()?.lots.get(&lot_id).cloned())
    }

    async fn list_lots(&self) -> StoreResult<Vec<ParkingLot>> {
        let mut lots: Vec<ParkingLot> = self.read()?.lots.values().cloned().collect();
        lots.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(lots)
    }

    async fn insert_zone(&self, zone: &Zone) -> StoreResult<()> {
        let mut t = self.write()?;
        if !t.lots.contains_key(&zone.lot_id) {
            return Err(StoreError::NotFound(format!("parking lot {}", zone.lot_id)));
        }
        t.zones.insert(zone.id, zone.clone());
        Ok(())
    }

    async fn get_zone(&self, zone_id: Uuid) -> StoreResult<Option<Zone>> {
        Ok(self.read()?.zones.get(&zone_id).cloned())
    }

    async fn list_zones(&self, lot_id: Uuid) -> StoreResult<Vec<Zone>> {
        let mut zones: Vec<Zone> = self
            .read()?
            .zones
            .values()
            .filter(|z| z.lot_id == lot_id)
            .cloned()
            .collect();
        zones.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(zones)
    }

    async fn insert_slot(&self, slot: &Slot) -> StoreResult<()> {
        let mut t = self.write()?;
        let taken = t
            .slots
            .values()
            .any(|s| s.lot_id == slot.lot_id && s.slot_number == slot.slot_number);
        if taken {
            return Err(StoreError::Duplicate(format!(
                "slot number {} in lot {}",
                slot.slot_number, slot.lot_id
            )));
        }
        t.slots.insert(slot.id, slot.clone());
        Ok(())
    }

    async fn get_slot(&self, slot_id: Uuid) -> StoreResult<Option<Slot>> {
        Ok(self.read()?.slots.get(&slot_id).cloned())
    }

    async fn list_slots(&self, lot_id: Uuid) -> StoreResult<Vec<Slot>> {
        let mut slots: Vec<Slot> = self
            .read()?
            .slots
            .values()
            .filter(|s| s.lot_id == lot_id)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.slot_number);
        Ok(slots)
    }

    async fn set_slot_disabled(&self, slot_id: Uuid, disabled: bool) -> StoreResult<Slot> {
        let mut t = self.write()?;
        let slot = t
            .slots
            .get_mut(&slot_id)
            .ok_or_else(|| StoreError::NotFound(format!("slot {slot_id}")))?;
        slot.disabled = disabled;
        Ok(slot.clone())
    }

    // -------------------------------------------------------------------------
    // VEHICLES
    // -------------------------------------------------------------------------

    async fn insert_vehicle(&self, vehicle: &Vehicle) -> StoreResult<()> {
        let mut t = self.write()?;
        if t.vehicles.values().any(|v| v.plate == vehicle.plate) {
            return Err(StoreError::Duplicate(format!("plate {}", vehicle.plate)));
        }
        t.vehicles.insert(vehicle.id, vehicle.clone());
        Ok(())
    }

    async fn get_vehicle(&self, vehicle_id: Uuid) -> StoreResult<Option<Vehicle>> {
        Ok(self.read()?.vehicles.get(&vehicle_id).cloned())
    }

    // -------------------------------------------------------------------------
    // RESERVATIONS
    // -------------------------------------------------------------------------

    async fn insert_reservation(
        &self,
        reservation: &Reservation,
        events: &[EventEnvelope],
    ) -> StoreResult<()> {
        #[cfg(test)]
        {
            self.faults.reservation_insert_calls.fetch_add(1, Ordering::SeqCst);
            if self.faults.fail_reservation_inserts.load(Ordering::SeqCst) {
                return Err(StoreError::Transient("injected insert failure".to_string()));
            }
        }
        let mut t = self.write()?;
        if let Some(slot_id) = t.reservation_conflict(reservation) {
            return Err(StoreError::Conflict { slot_id });
        }
        t.reservations.insert(reservation.id, reservation.clone());
        t.append_events(events);
        Ok(())
    }

    async fn get_reservation(&self, reservation_id: Uuid) -> StoreResult<Option<Reservation>> {
        Ok(self.read()?.reservations.get(&reservation_id).cloned())
    }

    async fn list_reservations_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let mut list: Vec<Reservation> = self
            .read()?
            .reservations
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.range.start);
        Ok(list)
    }

    async fn reservations_overlapping(
        &self,
        lot_id: Uuid,
        window: &TimeRange,
    ) -> StoreResult<Vec<Reservation>> {
        Ok(self
            .read()?
            .reservations
            .values()
            .filter(|r| r.lot_id == lot_id && overlaps(&r.range, window))
            .cloned()
            .collect())
    }

    async fn update_reservation(
        &self,
        reservation: &Reservation,
        expected: ReservationStatus,
        events: &[EventEnvelope],
    ) -> StoreResult<bool> {
        let mut t = self.write()?;
        match t.reservations.get(&reservation.id) {
            None => return Err(StoreError::NotFound(format!("reservation {}", reservation.id))),
            Some(current) if current.status != expected => return Ok(false),
            Some(_) => {}
        }
        if let Some(slot_id) = t.reservation_conflict(reservation) {
            return Err(StoreError::Conflict { slot_id });
        }
        t.reservations.insert(reservation.id, reservation.clone());
        t.append_events(events);
        Ok(true)
    }

    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Reservation>> {
        Ok(self
            .read()?
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending && r.created_at <= cutoff)
            .cloned()
            .collect())
    }

    // -------------------------------------------------------------------------
    // SESSIONS
    // -------------------------------------------------------------------------

    async fn insert_session(
        &self,
        session: &ParkingSession,
        events: &[EventEnvelope],
    ) -> StoreResult<()> {
        let mut t = self.write()?;
        t.sessions.insert(session.id, session.clone());
        t.append_events(events);
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<ParkingSession>> {
        Ok(self.read()?.sessions.get(&session_id).cloned())
    }

    async fn update_session(
        &self,
        session: &ParkingSession,
        events: &[EventEnvelope],
    ) -> StoreResult<()> {
        let mut t = self.write()?;
        if !t.sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        t.sessions.insert(session.id, session.clone());
        t.append_events(events);
        Ok(())
    }

    async fn sessions_touching(
        &self,
        lot_id: Uuid,
        window: &TimeRange,
    ) -> StoreResult<Vec<ParkingSession>> {
        Ok(self
            .read()?
            .sessions
            .values()
            .filter(|s| {
                s.lot_id == lot_id
                    && s.entry_time < window.end
                    && s.exit_time.map_or(true, |exit| exit >= window.start)
            })
            .cloned()
            .collect())
    }

    async fn check_in(
        &self,
        reservation: &Reservation,
        expected: ReservationStatus,
        session: &ParkingSession,
        events: &[EventEnvelope],
    ) -> StoreResult<bool> {
        let mut t = self.write()?;
        match t.reservations.get(&reservation.id) {
            None => return Err(StoreError::NotFound(format!("reservation {}", reservation.id))),
            Some(current) if current.status != expected => return Ok(false),
            Some(_) => {}
        }
        if let Some(slot_id) = t.reservation_conflict(reservation) {
            return Err(StoreError::Conflict { slot_id });
        }
        t.reservations.insert(reservation.id, reservation.clone());
        t.sessions.insert(session.id, session.clone());
        t.append_events(events);
        Ok(true)
    }

    async fn complete_session(
        &self,
        session: &ParkingSession,
        reservation: Option<&Reservation>,
        events: &[EventEnvelope],
    ) -> StoreResult<bool> {
        let mut t = self.write()?;
        match t.sessions.get(&session.id) {
            None => return Err(StoreError::NotFound(format!("session {}", session.id))),
            Some(current) if current.exit_time.is_some() => return Ok(false),
            Some(_) => {}
        }
        if let Some(reservation) = reservation {
            match t.reservations.get(&reservation.id) {
                Some(current) if current.status == ReservationStatus::CheckedIn => {}
                Some(_) => return Ok(false),
                None => {
                    return Err(StoreError::NotFound(format!("reservation {}", reservation.id)))
                }
            }
            t.reservations.insert(reservation.id, reservation.clone());
        }
        t.sessions.insert(session.id, session.clone());
        t.append_events(events);
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // SUBSCRIPTIONS
    // -------------------------------------------------------------------------

    async fn insert_subscription(
        &self,
        subscription: &Subscription,
        events: &[EventEnvelope],
    ) -> StoreResult<()> {
        let mut t = self.write()?;
        t.subscriptions.insert(subscription.id, subscription.clone());
        t.append_events(events);
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> StoreResult<Option<Subscription>> {
        Ok(self.read()?.subscriptions.get(&subscription_id).cloned())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        events: &[EventEnvelope],
    ) -> StoreResult<()> {
        let mut t = self.write()?;
        if !t.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::NotFound(format!("subscription {}", subscription.id)));
        }
        t.subscriptions.insert(subscription.id, subscription.clone());
        t.append_events(events);
        Ok(())
    }

    async fn subscriptions_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        Ok(self
            .read()?
            .subscriptions
            .values()
            .filter(|s| s.auto_renew && s.cancelled_at.is_none() && s.end_date <= now)
            .cloned()
            .collect())
    }

    // -------------------------------------------------------------------------
    // EVENT OUTBOX
    // -------------------------------------------------------------------------

    async fn undelivered_events(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<EventEnvelope>> {
        Ok(self
            .read()?
            .outbox
            .iter()
            .filter(|e| !e.delivered && e.envelope.occurred_at <= older_than)
            .take(limit)
            .map(|e| e.envelope.clone())
            .collect())
    }

    async fn mark_events_delivered(&self, event_ids: &[Uuid]) -> StoreResult<()> {
        let mut t = self.write()?;
        for entry in t.outbox.iter_mut() {
            if event_ids.contains(&entry.envelope.event_id) {
                entry.delivered = true;
            }
        }
        Ok(())
    }

    async fn events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<EventEnvelope>> {
        Ok(self
            .read()?
            .outbox
            .iter()
            .filter(|e| e.envelope.occurred_at >= since)
            .map(|e| e.envelope.clone())
            .collect())
    }

    async fn health_check(&self) -> bool {
        self.tables.read().is_ok()
    }
}
