// =============================================================================
// RESERVATION LIFECYCLE
// =============================================================================
// pending → confirmed → checked_in → completed, cancelled from pending or
// confirmed. Also walk-in sessions, payment outcomes and pending expiry.
//
// NOTES:
// - Slot assignment happens at booking: the preferred slot if given,
//   otherwise the lowest-numbered free slot
// - Pending reservations hold their slot until confirmed, cancelled or
//   expired, so two racing bookings never share a slot
// - Completing twice returns the completed record unchanged
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{authorize_for, require_staff, ReservationEngine};
use crate::directory::AvailableSlots;
use crate::error::{AppError, AppResult};
use crate::events::DomainEvent;
use crate::metrics;
use crate::models::{
    Actor, CheckInRequest, CreateReservationRequest, ParkingSession, RecordPaymentRequest,
    Reservation, ReservationStatus, Slot, StartSessionRequest,
};
use crate::pricing::price_reservation;
use crate::timerange::TimeRange;

/// Minimum claim a check-in keeps ahead of `now`
const MIN_CHECK_IN_HOLD_MINUTES: i64 = 1;

impl ReservationEngine {
    // -------------------------------------------------------------------------
    // CREATE
    // -------------------------------------------------------------------------
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        request: CreateReservationRequest,
    ) -> AppResult<Reservation> {
        let result = self.try_create_reservation(actor, request).await;
        metrics::record_reservation_outcome(match &result {
            Ok(_) => "created",
            Err(AppError::SlotConflict { .. }) => "slot_conflict",
            Err(AppError::NoAvailability { .. }) => "no_availability",
            Err(AppError::Validation(_)) => "invalid",
            Err(_) => "failed",
        });
        result
    }

    async fn try_create_reservation(
        &self,
        actor: &Actor,
        request: CreateReservationRequest,
    ) -> AppResult<Reservation> {
        // re-checked: the fields are public and may bypass deserialization
        let range = TimeRange::new(request.range.start, request.range.end)?;
        let user_id = request.user_id.unwrap_or(actor.user_id);
        authorize_for(actor, user_id)?;

        let now = self.now();
        if range.start < now {
            return Err(AppError::Validation(
                "reservations cannot start in the past".to_string(),
            ));
        }

        let lot = self.load_lot(request.lot_id).await?;
        // unowned vehicles (fleet, visitor) may be booked by anyone
        if let Some(owner) = self.load_vehicle(request.vehicle_id).await?.owner_id {
            authorize_for(actor, owner)?;
        }
        let amount = price_reservation(&lot.rates, &range, &self.config.pricing)?;

        let preferred = match request.slot_id {
            Some(slot_id) => Some(self.bookable_slot(slot_id, lot.id).await?),
            None => None,
        };

        let _guard = self.lot_locks.lock(lot.id).await;
        let slots = match &preferred {
            Some(slot) => vec![slot.clone()],
            None => self.call("list_slots", || self.store.list_slots(lot.id)).await?,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let claims = self.claims_for(lot.id, &range).await?;
            let slot_id = match &preferred {
                Some(slot) if claims.is_free(slot.id, &range, None) => slot.id,
                Some(slot) => return Err(AppError::SlotConflict { slot_id: slot.id }),
                None => AvailableSlots::new(slots.clone(), claims, range)
                    .iter()
                    .next()
                    .map(|slot| slot.id)
                    .ok_or(AppError::NoAvailability { lot_id: lot.id })?,
            };

            let now = self.now();
            let reservation = Reservation {
                id: Uuid::new_v4(),
                lot_id: lot.id,
                slot_id: Some(slot_id),
                vehicle_id: request.vehicle_id,
                user_id,
                range,
                status: ReservationStatus::Pending,
                amount,
                session_id: None,
                cancel_reason: None,
                created_at: now,
                updated_at: now,
            };

            let created = self.envelope(DomainEvent::ReservationCreated {
                reservation_id: reservation.id,
                lot_id: lot.id,
                slot_id: reservation.slot_id,
                user_id,
                amount,
            });
            match self
                .call("insert_reservation", || {
                    self.store
                        .insert_reservation(&reservation, std::slice::from_ref(&created))
                })
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        reservation_id = %reservation.id,
                        lot_id = %lot.id,
                        slot_id = %slot_id,
                        user_id = %user_id,
                        amount,
                        status = %reservation.status,
                        "Reservation created"
                    );
                    self.dispatch(created).await;
                    return Ok(reservation);
                }
                // lost a race against a writer outside this process
                Err(AppError::SlotConflict { slot_id }) => {
                    if preferred.is_some() {
                        return Err(AppError::SlotConflict { slot_id });
                    }
                    if attempts >= self.config.max_assignment_attempts.max(1) {
                        return Err(AppError::NoAvailability { lot_id: lot.id });
                    }
                    tracing::debug!(lot_id = %lot.id, slot_id = %slot_id, attempts, "Assigned slot taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Slot that belongs to the lot and is not administratively disabled.
    async fn bookable_slot(&self, slot_id: Uuid, lot_id: Uuid) -> AppResult<Slot> {
        let slot = self.load_slot(slot_id).await?;
        if slot.lot_id != lot_id {
            return Err(AppError::Validation(format!(
                "slot {slot_id} does not belong to parking lot {lot_id}"
            )));
        }
        if slot.disabled {
            return Err(AppError::Validation(format!("slot {slot_id} is disabled")));
        }
        Ok(slot)
    }

    // -------------------------------------------------------------------------
    // CONFIRM
    // -------------------------------------------------------------------------
    pub async fn confirm_reservation(
        &self,
        actor: &Actor,
        reservation_id: Uuid,
    ) -> AppResult<Reservation> {
        let current = self.load_reservation(reservation_id).await?;
        authorize_for(actor, current.user_id)?;

        self.transition(
            &current,
            ReservationStatus::Confirmed,
            |_| {},
            |r| DomainEvent::ReservationConfirmed {
                reservation_id,
                lot_id: r.lot_id,
                user_id: r.user_id,
            },
        )
        .await
    }

    // -------------------------------------------------------------------------
    // CHECK-IN
    // -------------------------------------------------------------------------
    /// Vehicle arrives: confirmed → checked_in with a session starting now.
    ///
    /// The slot (pre-assigned or supplied) is re-validated against everyone
    /// else's claims for `[now, max(end, now + 1min))` and must not hold a
    /// parked vehicle.
    pub async fn check_in(
        &self,
        actor: &Actor,
        reservation_id: Uuid,
        request: CheckInRequest,
    ) -> AppResult<Reservation> {
        let current = self.load_reservation(reservation_id).await?;
        authorize_for(actor, current.user_id)?;
        ensure_transition(&current, ReservationStatus::CheckedIn)?;

        let slot_id = request.slot_id.or(current.slot_id).ok_or_else(|| {
            AppError::Validation("a slot must be chosen at check-in".to_string())
        })?;
        self.bookable_slot(slot_id, current.lot_id).await?;

        let _guard = self.lot_locks.lock(current.lot_id).await;
        let now = self.now();
        let hold_until = current
            .range
            .end
            .max(now + Duration::minutes(MIN_CHECK_IN_HOLD_MINUTES));
        let window = TimeRange::new(now, hold_until)?;

        let claims = self.claims_for(current.lot_id, &window).await?;
        if !claims.is_free(slot_id, &window, Some(current.id))
            || claims.is_occupied(slot_id, now, Some(current.id))
        {
            return Err(AppError::SlotConflict { slot_id });
        }

        let session = ParkingSession {
            id: Uuid::new_v4(),
            lot_id: current.lot_id,
            slot_id,
            vehicle_id: current.vehicle_id,
            reservation_id: Some(current.id),
            entry_time: now,
            planned_exit: Some(hold_until),
            exit_time: None,
            amount_due: None,
            is_paid: false,
            payment_id: None,
        };
        let checked_in = Reservation {
            slot_id: Some(slot_id),
            status: ReservationStatus::CheckedIn,
            session_id: Some(session.id),
            updated_at: now,
            ..current.clone()
        };

        let event = self.envelope(DomainEvent::ReservationCheckedIn {
            reservation_id,
            session_id: session.id,
            slot_id,
        });
        let applied = self
            .call("check_in", || {
                self.store.check_in(
                    &checked_in,
                    ReservationStatus::Confirmed,
                    &session,
                    std::slice::from_ref(&event),
                )
            })
            .await?;
        if !applied {
            return Err(self.stale_transition(reservation_id, ReservationStatus::CheckedIn).await);
        }

        log_transition(&checked_in);
        self.dispatch(event).await;
        Ok(checked_in)
    }

    // -------------------------------------------------------------------------
    // COMPLETE
    // -------------------------------------------------------------------------
    /// checked_in → completed. Completing a completed reservation is a no-op.
    pub async fn complete_reservation(
        &self,
        actor: &Actor,
        reservation_id: Uuid,
    ) -> AppResult<Reservation> {
        let current = self.load_reservation(reservation_id).await?;
        authorize_for(actor, current.user_id)?;
        if current.status == ReservationStatus::Completed {
            return Ok(current);
        }
        ensure_transition(&current, ReservationStatus::Completed)?;

        let session_id = current.session_id.ok_or_else(|| {
            AppError::NotFound(format!("no session recorded for reservation {reservation_id}"))
        })?;
        let session = self.load_session(session_id).await?;
        let (_, completed) = self.finish_session(session, Some(current)).await?;
        completed.ok_or_else(|| {
            AppError::NotFound(format!("reservation {reservation_id} not found"))
        })
    }

    /// Vehicle leaves. Completes the linked reservation when there is one.
    pub async fn complete_session(
        &self,
        actor: &Actor,
        session_id: Uuid,
    ) -> AppResult<ParkingSession> {
        let session = self.load_session(session_id).await?;
        let reservation = match session.reservation_id {
            Some(id) => Some(self.load_reservation(id).await?),
            None => None,
        };
        self.authorize_session(actor, &session, reservation.as_ref())
            .await?;
        if session.exit_time.is_some() {
            return Ok(session);
        }
        if let Some(r) = &reservation {
            ensure_transition(r, ReservationStatus::Completed)?;
        }

        let (closed, _) = self.finish_session(session, reservation).await?;
        Ok(closed)
    }

    async fn finish_session(
        &self,
        session: ParkingSession,
        reservation: Option<Reservation>,
    ) -> AppResult<(ParkingSession, Option<Reservation>)> {
        let _guard = self.lot_locks.lock(session.lot_id).await;
        let lot = self.load_lot(session.lot_id).await?;
        let now = self.now();
        let exit = now.max(session.entry_time);

        let billed = billed_range(&session, reservation.as_ref(), exit)?;
        let amount = price_reservation(&lot.rates, &billed, &self.config.pricing)?;

        let closed = ParkingSession {
            exit_time: Some(exit),
            amount_due: Some(amount),
            is_paid: false,
            ..session.clone()
        };
        let completed = reservation.map(|r| Reservation {
            status: ReservationStatus::Completed,
            amount,
            updated_at: now,
            ..r
        });

        let event = self.envelope(DomainEvent::SessionCompleted {
            session_id: closed.id,
            reservation_id: closed.reservation_id,
            lot_id: closed.lot_id,
            amount_due: amount,
        });
        let applied = self
            .call("complete_session", || {
                self.store.complete_session(
                    &closed,
                    completed.as_ref(),
                    std::slice::from_ref(&event),
                )
            })
            .await?;
        if !applied {
            // someone else finished it first
            let current = self.load_session(session.id).await?;
            if current.exit_time.is_some() {
                let reservation = match current.reservation_id {
                    Some(id) => Some(self.load_reservation(id).await?),
                    None => None,
                };
                return Ok((current, reservation));
            }
            return Err(match session.reservation_id {
                Some(id) => self.stale_transition(id, ReservationStatus::Completed).await,
                None => AppError::EngineUnavailable(format!(
                    "session {} could not be closed",
                    session.id
                )),
            });
        }

        if let Some(r) = &completed {
            log_transition(r);
        }
        tracing::info!(
            session_id = %closed.id,
            lot_id = %closed.lot_id,
            slot_id = %closed.slot_id,
            amount_due = amount,
            "Session completed"
        );
        self.dispatch(event).await;
        Ok((closed, completed))
    }

    // -------------------------------------------------------------------------
    // CANCEL
    // -------------------------------------------------------------------------
    /// pending/confirmed → cancelled.
    ///
    /// Customers are refused once `now` is past `start - cancellation_lead`;
    /// managers and administrators are not.
    pub async fn cancel_reservation(
        &self,
        actor: &Actor,
        reservation_id: Uuid,
        reason: Option<String>,
    ) -> AppResult<Reservation> {
        let current = self.load_reservation(reservation_id).await?;
        authorize_for(actor, current.user_id)?;
        ensure_transition(&current, ReservationStatus::Cancelled)?;

        let lead = self.config.cancellation_lead;
        if !actor.role.is_privileged() && self.now() > current.range.start - lead {
            return Err(AppError::CancellationWindowExpired {
                lead_minutes: lead.num_minutes(),
            });
        }

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "cancelled by request".to_string());

        let _guard = self.lot_locks.lock(current.lot_id).await;
        self.transition(
            &current,
            ReservationStatus::Cancelled,
            |r| r.cancel_reason = Some(reason.clone()),
            |r| DomainEvent::ReservationCancelled {
                reservation_id,
                lot_id: r.lot_id,
                user_id: r.user_id,
                previous_status: current.status,
                reason: reason.clone(),
            },
        )
        .await
    }

    /// Cancel pending reservations created more than `pending_ttl` ago.
    ///
    /// Returns the reservations that were expired.
    pub async fn expire_pending(&self) -> AppResult<Vec<Reservation>> {
        let cutoff = self.now() - self.config.pending_ttl;
        let stale = self
            .call("pending_created_before", || self.store.pending_created_before(cutoff))
            .await?;

        let mut expired = Vec::new();
        for pending in stale {
            let _guard = self.lot_locks.lock(pending.lot_id).await;
            let cancelled = Reservation {
                status: ReservationStatus::Cancelled,
                cancel_reason: Some("expired".to_string()),
                updated_at: self.now(),
                ..pending.clone()
            };
            let event = self.envelope(DomainEvent::ReservationExpired {
                reservation_id: cancelled.id,
                lot_id: cancelled.lot_id,
                user_id: cancelled.user_id,
            });
            // confirmed in the meantime → false, leave it alone
            let applied = self
                .call("update_reservation", || {
                    self.store.update_reservation(
                        &cancelled,
                        ReservationStatus::Pending,
                        std::slice::from_ref(&event),
                    )
                })
                .await?;
            if !applied {
                continue;
            }
            log_transition(&cancelled);
            self.dispatch(event).await;
            expired.push(cancelled);
        }
        Ok(expired)
    }

    // -------------------------------------------------------------------------
    // WALK-IN SESSIONS
    // -------------------------------------------------------------------------
    /// Vehicle enters without a reservation.
    pub async fn start_session(
        &self,
        actor: &Actor,
        request: StartSessionRequest,
    ) -> AppResult<ParkingSession> {
        let vehicle = self.load_vehicle(request.vehicle_id).await?;
        match vehicle.owner_id {
            Some(owner) => authorize_for(actor, owner)?,
            None => require_staff(actor)?,
        }
        self.load_lot(request.lot_id).await?;
        let slot_id = self.bookable_slot(request.slot_id, request.lot_id).await?.id;

        let _guard = self.lot_locks.lock(request.lot_id).await;
        let now = self.now();
        let window = match request.planned_exit {
            Some(planned) => TimeRange::new(now, planned)
                .map_err(|_| AppError::Validation("planned exit must be in the future".to_string()))?,
            None => TimeRange::open_ended(now),
        };

        let claims = self.claims_for(request.lot_id, &window).await?;
        if !claims.is_free(slot_id, &window, None) || claims.is_occupied(slot_id, now, None) {
            return Err(AppError::SlotConflict { slot_id });
        }

        let session = ParkingSession {
            id: Uuid::new_v4(),
            lot_id: request.lot_id,
            slot_id,
            vehicle_id: vehicle.id,
            reservation_id: None,
            entry_time: now,
            planned_exit: request.planned_exit,
            exit_time: None,
            amount_due: None,
            is_paid: false,
            payment_id: None,
        };
        let event = self.envelope(DomainEvent::SessionStarted {
            session_id: session.id,
            lot_id: session.lot_id,
            slot_id,
            vehicle_id: vehicle.id,
        });
        self.call("insert_session", || {
            self.store
                .insert_session(&session, std::slice::from_ref(&event))
        })
        .await?;

        tracing::info!(
            session_id = %session.id,
            lot_id = %session.lot_id,
            slot_id = %slot_id,
            vehicle_id = %vehicle.id,
            "Walk-in session started"
        );
        self.dispatch(event).await;
        Ok(session)
    }

    /// Apply a payment outcome to a completed session.
    ///
    /// Failed payments leave the session unpaid; repeats are no-ops.
    pub async fn record_payment(
        &self,
        actor: &Actor,
        session_id: Uuid,
        request: RecordPaymentRequest,
    ) -> AppResult<ParkingSession> {
        let payment_id = request.payment_id.trim().to_string();
        if payment_id.is_empty() {
            return Err(AppError::Validation("payment_id must not be empty".to_string()));
        }
        let session = self.load_session(session_id).await?;
        let reservation = match session.reservation_id {
            Some(id) => Some(self.load_reservation(id).await?),
            None => None,
        };
        self.authorize_session(actor, &session, reservation.as_ref())
            .await?;

        if session.amount_due.is_none() {
            return Err(AppError::Validation(format!(
                "session {session_id} has not been completed yet"
            )));
        }
        if session.is_paid {
            return Ok(session);
        }
        if !request.succeeded {
            tracing::info!(session_id = %session_id, payment_id = %payment_id, "Payment failed, session stays unpaid");
            return Ok(session);
        }

        let paid = ParkingSession {
            is_paid: true,
            payment_id: Some(payment_id.clone()),
            ..session
        };
        let event = self.envelope(DomainEvent::PaymentRecorded {
            session_id,
            payment_id: payment_id.clone(),
        });
        self.call("update_session", || {
            self.store
                .update_session(&paid, std::slice::from_ref(&event))
        })
        .await?;

        tracing::info!(session_id = %session_id, payment_id = %payment_id, "Payment recorded");
        self.dispatch(event).await;
        Ok(paid)
    }

    // -------------------------------------------------------------------------
    // READS
    // -------------------------------------------------------------------------
    pub async fn get_reservation(&self, actor: &Actor, reservation_id: Uuid) -> AppResult<Reservation> {
        let reservation = self.load_reservation(reservation_id).await?;
        authorize_for(actor, reservation.user_id)?;
        Ok(reservation)
    }

    pub async fn list_reservations(
        &self,
        actor: &Actor,
        user_id: Option<Uuid>,
    ) -> AppResult<Vec<Reservation>> {
        let user_id = user_id.unwrap_or(actor.user_id);
        authorize_for(actor, user_id)?;
        self.call("list_reservations_for_user", || {
            self.store.list_reservations_for_user(user_id)
        })
        .await
    }

    pub async fn get_session(&self, actor: &Actor, session_id: Uuid) -> AppResult<ParkingSession> {
        let session = self.load_session(session_id).await?;
        let reservation = match session.reservation_id {
            Some(id) => Some(self.load_reservation(id).await?),
            None => None,
        };
        self.authorize_session(actor, &session, reservation.as_ref())
            .await?;
        Ok(session)
    }

    // -------------------------------------------------------------------------
    // HELPERS
    // -------------------------------------------------------------------------

    /// Compare-and-set `current` into `next`, after `apply` edits the record.
    /// The event built by `describe` commits with the update.
    async fn transition(
        &self,
        current: &Reservation,
        next: ReservationStatus,
        apply: impl FnOnce(&mut Reservation),
        describe: impl FnOnce(&Reservation) -> DomainEvent,
    ) -> AppResult<Reservation> {
        ensure_transition(current, next)?;
        let mut updated = Reservation {
            status: next,
            updated_at: self.now(),
            ..current.clone()
        };
        apply(&mut updated);
        let event = self.envelope(describe(&updated));

        let applied = self
            .call("update_reservation", || {
                self.store.update_reservation(
                    &updated,
                    current.status,
                    std::slice::from_ref(&event),
                )
            })
            .await?;
        if !applied {
            return Err(self.stale_transition(current.id, next).await);
        }
        log_transition(&updated);
        self.dispatch(event).await;
        Ok(updated)
    }

    /// Error for a compare-and-set that lost: report the status that won.
    async fn stale_transition(&self, reservation_id: Uuid, next: ReservationStatus) -> AppError {
        match self.load_reservation(reservation_id).await {
            Ok(current) => AppError::InvalidTransition {
                from: current.status.to_string(),
                to: next.to_string(),
            },
            Err(e) => e,
        }
    }

    /// Session access follows the reservation owner, else the vehicle owner.
    async fn authorize_session(
        &self,
        actor: &Actor,
        session: &ParkingSession,
        reservation: Option<&Reservation>,
    ) -> AppResult<()> {
        if actor.role.is_privileged() {
            return Ok(());
        }
        if let Some(r) = reservation {
            return authorize_for(actor, r.user_id);
        }
        match self.load_vehicle(session.vehicle_id).await?.owner_id {
            Some(owner) => authorize_for(actor, owner),
            None => require_staff(actor),
        }
    }
}

fn ensure_transition(current: &Reservation, next: ReservationStatus) -> AppResult<()> {
    if current.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition {
            from: current.status.to_string(),
            to: next.to_string(),
        })
    }
}

/// Billed window on exit.
///
/// Reservations pay for the booked range stretched to cover the actual stay;
/// walk-ins pay for `[entry, exit)`, at least one second.
fn billed_range(
    session: &ParkingSession,
    reservation: Option<&Reservation>,
    exit: DateTime<Utc>,
) -> AppResult<TimeRange> {
    match reservation {
        Some(r) => TimeRange::new(
            r.range.start.min(session.entry_time),
            r.range.end.max(exit),
        ),
        None => TimeRange::new(
            session.entry_time,
            exit.max(session.entry_time + Duration::seconds(1)),
        ),
    }
}

fn log_transition(r: &Reservation) {
    metrics::record_transition(r.status.as_str());
    tracing::info!(
        reservation_id = %r.id,
        lot_id = %r.lot_id,
        slot_id = ?r.slot_id,
        status = %r.status,
        "Reservation status changed"
    );
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::EngineConfig;
    use super::*;
    use crate::models::{Role, SlotStatus};
    use crate::store::Store;
    use std::sync::Arc;

    fn booking(f: &Fixture, range: TimeRange, slot_id: Option<Uuid>) -> CreateReservationRequest {
        CreateReservationRequest {
            lot_id: f.lot.id,
            vehicle_id: f.vehicle.id,
            user_id: None,
            range,
            slot_id,
        }
    }

    #[tokio::test]
    async fn test_inverted_range_is_a_validation_error() {
        let f = fixture(1).await;
        let mut request = booking(&f, range((10, 0), (12, 0)), None);
        request.range = TimeRange {
            start: at(12, 0),
            end: at(12, 0),
        };
        let err = f.engine.create_reservation(&f.driver, request).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut request = booking(&f, range((10, 0), (12, 0)), None);
        request.range = TimeRange {
            start: at(12, 0),
            end: at(11, 0),
        };
        let err = f.engine.create_reservation(&f.driver, request).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_retroactive_booking_rejected() {
        let f = fixture(1).await;
        f.clock.set(at(11, 0));
        let err = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_two_slot_assignment_scenario() {
        let f = fixture(2).await;
        let a = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), Some(f.slots[0].id)))
            .await
            .unwrap();
        assert_eq!(a.slot_id, Some(f.slots[0].id));
        assert_eq!(a.status, ReservationStatus::Pending);
        assert_eq!(a.amount, 2_000);

        let b = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((11, 0), (13, 0)), None))
            .await
            .unwrap();
        assert_eq!(b.slot_id, Some(f.slots[1].id));

        let err = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 30), (11, 30)), None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoAvailability { .. }));

        // touching ranges do not conflict
        let c = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((12, 0), (13, 0)), Some(f.slots[0].id)))
            .await
            .unwrap();
        assert_eq!(c.slot_id, Some(f.slots[0].id));
    }

    #[tokio::test]
    async fn test_preferred_slot_conflict() {
        let f = fixture(2).await;
        f.engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), Some(f.slots[0].id)))
            .await
            .unwrap();
        let err = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((11, 59), (13, 0)), Some(f.slots[0].id)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SlotConflict { slot_id } if slot_id == f.slots[0].id));
    }

    #[tokio::test]
    async fn test_concurrent_bookings_on_single_slot_lot() {
        let f = fixture(1).await;
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let engine = Arc::clone(&f.engine);
            let request = booking(&f, range((10, i), (12, i)), None);
            let driver = f.driver;
            handles.push(tokio::spawn(async move {
                engine.create_reservation(&driver, request).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, AppError::NoAvailability { .. }), "{e:?}"),
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_confirm_only_from_pending() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), None))
            .await
            .unwrap();
        let confirmed = f.engine.confirm_reservation(&f.driver, r.id).await.unwrap();
        assert_eq!(confirmed.status, ReservationStatus::Confirmed);

        let err = f.engine.confirm_reservation(&f.driver, r.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_other_customers_are_forbidden() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), None))
            .await
            .unwrap();
        let stranger = customer();
        let err = f.engine.confirm_reservation(&stranger, r.id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert!(f.engine.confirm_reservation(&admin(), r.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_window() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((14, 0), (16, 0)), None))
            .await
            .unwrap();

        // 3 hours before start
        f.clock.set(at(11, 0));
        let cancelled = f
            .engine
            .cancel_reservation(&f.driver, r.id, None)
            .await
            .unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);

        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((14, 0), (16, 0)), None))
            .await
            .unwrap();
        // 30 minutes before start
        f.clock.set(at(13, 30));
        let err = f
            .engine
            .cancel_reservation(&f.driver, r.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CancellationWindowExpired { lead_minutes: 120 }));

        let manager = Actor::new(Uuid::new_v4(), Role::Manager);
        let cancelled = f
            .engine
            .cancel_reservation(&manager, r.id, Some("lane closed".into()))
            .await
            .unwrap();
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("lane closed"));
    }

    #[tokio::test]
    async fn test_cancel_exactly_at_lead_boundary_allowed() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((14, 0), (16, 0)), None))
            .await
            .unwrap();
        f.clock.set(at(12, 0));
        assert!(f.engine.cancel_reservation(&f.driver, r.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_lead_time_is_configurable() {
        let f = fixture_with(
            1,
            EngineConfig {
                cancellation_lead: Duration::minutes(15),
                ..EngineConfig::default()
            },
        )
        .await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((14, 0), (16, 0)), None))
            .await
            .unwrap();
        f.clock.set(at(13, 30));
        assert!(f.engine.cancel_reservation(&f.driver, r.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_frees_the_slot() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((14, 0), (16, 0)), None))
            .await
            .unwrap();
        f.engine.cancel_reservation(&f.driver, r.id, None).await.unwrap();

        let again = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((14, 0), (16, 0)), None))
            .await
            .unwrap();
        assert_eq!(again.slot_id, r.slot_id);

        let err = f
            .engine
            .cancel_reservation(&f.driver, r.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_full_lifecycle_and_idempotent_completion() {
        let f = fixture(1).await;
        let mut events = f.engine.subscribe_events();
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), None))
            .await
            .unwrap();
        f.engine.confirm_reservation(&f.driver, r.id).await.unwrap();

        f.clock.set(at(9, 55));
        let checked_in = f
            .engine
            .check_in(&f.driver, r.id, CheckInRequest::default())
            .await
            .unwrap();
        assert_eq!(checked_in.status, ReservationStatus::CheckedIn);
        let session_id = checked_in.session_id.unwrap();

        // stays until 12:30: billed 09:55..12:30 → 3 hours
        f.clock.set(at(12, 30));
        let completed = f.engine.complete_reservation(&f.driver, r.id).await.unwrap();
        assert_eq!(completed.status, ReservationStatus::Completed);
        assert_eq!(completed.amount, 3_000);

        let again = f.engine.complete_reservation(&f.driver, r.id).await.unwrap();
        assert_eq!(again, completed);

        let session = f.engine.get_session(&f.driver, session_id).await.unwrap();
        assert_eq!(session.exit_time, Some(at(12, 30)));
        assert_eq!(session.amount_due, Some(3_000));
        assert!(!session.is_paid);

        let mut names = Vec::new();
        for _ in 0..4 {
            names.push(events.recv().await.unwrap().event.name());
        }
        assert_eq!(
            names,
            vec![
                "ReservationCreated",
                "ReservationConfirmed",
                "ReservationCheckedIn",
                "SessionCompleted"
            ]
        );
        assert!(f.store.undelivered_events(at(23, 0), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_in_moves_to_another_free_slot() {
        let f = fixture(2).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), Some(f.slots[0].id)))
            .await
            .unwrap();
        f.engine.confirm_reservation(&f.driver, r.id).await.unwrap();

        f.clock.set(at(10, 0));
        let moved = f
            .engine
            .check_in(&f.driver, r.id, CheckInRequest { slot_id: Some(f.slots[1].id) })
            .await
            .unwrap();
        assert_eq!(moved.slot_id, Some(f.slots[1].id));
        let stored = f.engine.get_reservation(&f.driver, r.id).await.unwrap();
        assert_eq!(stored.slot_id, Some(f.slots[1].id));
        let session = f
            .engine
            .get_session(&f.driver, stored.session_id.unwrap())
            .await
            .unwrap();
        assert_eq!(session.slot_id, f.slots[1].id);

        // the slot left behind is bookable for the rest of the window
        let rebooked = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 30), (11, 30)), Some(f.slots[0].id)))
            .await
            .unwrap();
        assert_eq!(rebooked.slot_id, Some(f.slots[0].id));
        let err = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 30), (11, 30)), Some(f.slots[1].id)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SlotConflict { .. }));
    }

    #[tokio::test]
    async fn test_booking_with_someone_elses_vehicle_is_forbidden() {
        let f = fixture(1).await;
        let stranger = customer();
        let theirs = f
            .engine
            .register_vehicle(
                &stranger,
                crate::models::RegisterVehicleRequest {
                    plate: "D 4242 ZZ".into(),
                    owner_id: None,
                },
            )
            .await
            .unwrap();

        let mut request = booking(&f, range((10, 0), (12, 0)), None);
        request.vehicle_id = theirs.id;
        let err = f
            .engine
            .create_reservation(&f.driver, request.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert!(f.engine.list_reservations(&f.driver, None).await.unwrap().is_empty());

        // staff may book it on the owner's behalf
        request.user_id = Some(stranger.user_id);
        let booked = f.engine.create_reservation(&admin(), request).await.unwrap();
        assert_eq!(booked.user_id, stranger.user_id);
    }

    #[tokio::test]
    async fn test_check_in_requires_confirmation() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), None))
            .await
            .unwrap();
        let err = f
            .engine
            .check_in(&f.driver, r.id, CheckInRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_check_in_rejects_slot_with_parked_vehicle() {
        let f = fixture(2).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), Some(f.slots[0].id)))
            .await
            .unwrap();
        f.engine.confirm_reservation(&f.driver, r.id).await.unwrap();

        // a walk-in parked on slot 2 at 08:00 without a planned exit
        f.engine
            .start_session(
                &f.driver,
                StartSessionRequest {
                    lot_id: f.lot.id,
                    vehicle_id: f.vehicle.id,
                    slot_id: f.slots[1].id,
                    planned_exit: None,
                },
            )
            .await
            .unwrap();

        f.clock.set(at(10, 0));
        let err = f
            .engine
            .check_in(&f.driver, r.id, CheckInRequest { slot_id: Some(f.slots[1].id) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SlotConflict { .. }));

        // the pre-assigned slot still works
        let ok = f
            .engine
            .check_in(&f.driver, r.id, CheckInRequest::default())
            .await
            .unwrap();
        assert_eq!(ok.slot_id, Some(f.slots[0].id));
    }

    #[tokio::test]
    async fn test_walk_in_session_and_payment() {
        let f = fixture(1).await;
        let session = f
            .engine
            .start_session(
                &f.driver,
                StartSessionRequest {
                    lot_id: f.lot.id,
                    vehicle_id: f.vehicle.id,
                    slot_id: f.slots[0].id,
                    planned_exit: Some(at(9, 0)),
                },
            )
            .await
            .unwrap();

        // the slot is claimed for the planned stay
        let err = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((8, 30), (9, 30)), None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoAvailability { .. }));

        let err = f
            .engine
            .record_payment(
                &f.driver,
                session.id,
                RecordPaymentRequest {
                    payment_id: "pay_1".into(),
                    succeeded: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        f.clock.set(at(9, 20));
        let closed = f.engine.complete_session(&f.driver, session.id).await.unwrap();
        assert_eq!(closed.amount_due, Some(2_000));

        let failed = f
            .engine
            .record_payment(
                &f.driver,
                session.id,
                RecordPaymentRequest {
                    payment_id: "pay_1".into(),
                    succeeded: false,
                },
            )
            .await
            .unwrap();
        assert!(!failed.is_paid);

        let paid = f
            .engine
            .record_payment(
                &f.driver,
                session.id,
                RecordPaymentRequest {
                    payment_id: "pay_2".into(),
                    succeeded: true,
                },
            )
            .await
            .unwrap();
        assert!(paid.is_paid);
        assert_eq!(paid.payment_id.as_deref(), Some("pay_2"));

        // repeated outcome is a no-op
        let again = f
            .engine
            .record_payment(
                &f.driver,
                session.id,
                RecordPaymentRequest {
                    payment_id: "pay_2".into(),
                    succeeded: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(again, paid);

        let views = f.engine.lot_slot_statuses(f.lot.id, at(9, 30)).await.unwrap();
        assert_eq!(views[0].status, SlotStatus::Available);
    }

    #[tokio::test]
    async fn test_walk_in_rejected_on_reserved_slot() {
        let f = fixture(1).await;
        let r = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((9, 0), (10, 0)), None))
            .await
            .unwrap();
        let err = f
            .engine
            .start_session(
                &f.driver,
                StartSessionRequest {
                    lot_id: f.lot.id,
                    vehicle_id: f.vehicle.id,
                    slot_id: r.slot_id.unwrap(),
                    planned_exit: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SlotConflict { .. }));
    }

    #[tokio::test]
    async fn test_pending_reservations_expire() {
        let f = fixture(1).await;
        let stale = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (12, 0)), None))
            .await
            .unwrap();
        f.clock.advance(Duration::minutes(10));
        let kept = f
            .engine
            .create_reservation(&f.driver, booking(&f, range((12, 0), (13, 0)), None))
            .await
            .unwrap();
        f.engine.confirm_reservation(&f.driver, kept.id).await.unwrap();

        f.clock.advance(Duration::minutes(6));
        let expired = f.engine.expire_pending().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);

        let reloaded = f.engine.get_reservation(&f.driver, stale.id).await.unwrap();
        assert_eq!(reloaded.status, ReservationStatus::Cancelled);
        assert_eq!(reloaded.cancel_reason.as_deref(), Some("expired"));

        f.clock.advance(Duration::hours(1));
        assert!(f.engine.expire_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_reservations_for_user() {
        let f = fixture(2).await;
        f.engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (11, 0)), None))
            .await
            .unwrap();
        f.engine
            .create_reservation(&f.driver, booking(&f, range((10, 0), (11, 0)), None))
            .await
            .unwrap();
        assert_eq!(f.engine.list_reservations(&f.driver, None).await.unwrap().len(), 2);
        assert!(f
            .engine
            .list_reservations(&customer(), Some(f.driver.user_id))
            .await
            .is_err());
    }

    #[test]
    fn test_billed_range_covers_booking_and_stay() {
        let session = ParkingSession {
            id: Uuid::new_v4(),
            lot_id: Uuid::nil(),
            slot_id: Uuid::nil(),
            vehicle_id: Uuid::nil(),
            reservation_id: None,
            entry_time: at(10, 15),
            planned_exit: None,
            exit_time: None,
            amount_due: None,
            is_paid: false,
            payment_id: None,
        };
        let walk_in = billed_range(&session, None, at(10, 15)).unwrap();
        assert_eq!(walk_in.duration(), Duration::seconds(1));

        let reservation = Reservation {
            id: Uuid::new_v4(),
            lot_id: Uuid::nil(),
            slot_id: None,
            vehicle_id: Uuid::nil(),
            user_id: Uuid::nil(),
            range: range((10, 0), (12, 0)),
            status: ReservationStatus::CheckedIn,
            amount: 0,
            session_id: None,
            cancel_reason: None,
            created_at: at(8, 0),
            updated_at: at(8, 0),
        };
        let early_exit = billed_range(&session, Some(&reservation), at(11, 0)).unwrap();
        assert_eq!(early_exit, range((10, 0), (12, 0)));
    }
}
