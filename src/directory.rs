// =============================================================================
// SLOT DIRECTORY MODULE
// =============================================================================
// Read-side projection over a lot's slots and the reservations/sessions that
// claim them.
//
// NOTES:
// - Slot status is a pure function of (slot, claims, instant); it is
//   recomputed on every read and never written back
// - `AvailableSlots` is a lazy, finite, restartable sequence: iterate it as
//   many times as needed, each pass filters the snapshot again in slot order
// - Every conflict test goes through `timerange::overlaps`
// =============================================================================

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{ParkingSession, Reservation, ReservationStatus, Slot, SlotStatus, SlotView};
use crate::timerange::{overlaps, TimeRange};

// -----------------------------------------------------------------------------
// SLOT CLAIMS
// -----------------------------------------------------------------------------

/// Something that holds (or held) a slot over time.
#[derive(Debug, Clone)]
pub enum SlotClaim {
    Reservation {
        reservation_id: Uuid,
        slot_id: Uuid,
        status: ReservationStatus,
        range: TimeRange,
    },
    Session(ParkingSession),
}

impl SlotClaim {
    /// Claim for a reservation with an assigned slot.
    pub fn from_reservation(reservation: &Reservation) -> Option<Self> {
        reservation.slot_id.map(|slot_id| SlotClaim::Reservation {
            reservation_id: reservation.id,
            slot_id,
            status: reservation.status,
            range: reservation.range,
        })
    }

    pub fn from_session(session: &ParkingSession) -> Self {
        SlotClaim::Session(session.clone())
    }

    pub fn slot_id(&self) -> Uuid {
        match self {
            SlotClaim::Reservation { slot_id, .. } => *slot_id,
            SlotClaim::Session(session) => session.slot_id,
        }
    }

    /// Window during which this claim blocks new bookings.
    ///
    /// `None` once the claim stopped blocking (terminal reservation,
    /// finished session).
    pub fn blocking_range(&self) -> Option<TimeRange> {
        match self {
            SlotClaim::Reservation { status, range, .. } if status.holds_slot() => Some(*range),
            SlotClaim::Reservation { .. } => None,
            SlotClaim::Session(session) if session.is_active() => session.claim_range(),
            SlotClaim::Session(_) => None,
        }
    }

    fn reservation_id(&self) -> Option<Uuid> {
        match self {
            SlotClaim::Reservation { reservation_id, .. } => Some(*reservation_id),
            SlotClaim::Session(session) => session.reservation_id,
        }
    }

    fn is_occupying(&self, at: DateTime<Utc>) -> bool {
        matches!(self, SlotClaim::Session(session) if session.occupies(at))
    }

    fn is_reserving(&self, at: DateTime<Utc>) -> bool {
        matches!(
            self,
            SlotClaim::Reservation { status, range, .. }
                if matches!(status, ReservationStatus::Confirmed | ReservationStatus::CheckedIn)
                    && range.contains(at)
        )
    }
}

/// Claims grouped by slot id.
#[derive(Debug, Clone, Default)]
pub struct ClaimIndex {
    by_slot: HashMap<Uuid, Vec<SlotClaim>>,
}

impl ClaimIndex {
    pub fn new(claims: impl IntoIterator<Item = SlotClaim>) -> Self {
        let mut by_slot: HashMap<Uuid, Vec<SlotClaim>> = HashMap::new();
        for claim in claims {
            by_slot.entry(claim.slot_id()).or_default().push(claim);
        }
        Self { by_slot }
    }

    /// Build from raw reservation and session records.
    pub fn from_records(reservations: &[Reservation], sessions: &[ParkingSession]) -> Self {
        Self::new(
            reservations
                .iter()
                .filter_map(SlotClaim::from_reservation)
                .chain(sessions.iter().map(SlotClaim::from_session)),
        )
    }

    pub fn for_slot(&self, slot_id: Uuid) -> &[SlotClaim] {
        self.by_slot.get(&slot_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First claim on the slot that blocks `range`.
    ///
    /// `ignore` skips claims belonging to one reservation (its own claim and
    /// its session) so a booking can be re-validated against everyone else.
    pub fn conflicting(
        &self,
        slot_id: Uuid,
        range: &TimeRange,
        ignore: Option<Uuid>,
    ) -> Option<&SlotClaim> {
        self.for_slot(slot_id).iter().find(|claim| {
            if ignore.is_some() && claim.reservation_id() == ignore {
                return false;
            }
            claim
                .blocking_range()
                .map_or(false, |blocking| overlaps(&blocking, range))
        })
    }

    pub fn is_free(&self, slot_id: Uuid, range: &TimeRange, ignore: Option<Uuid>) -> bool {
        self.conflicting(slot_id, range, ignore).is_none()
    }

    /// A vehicle other than `ignore`'s is physically parked on the slot at `at`.
    ///
    /// Catches sessions overstaying their planned exit, which no longer block
    /// by range.
    pub fn is_occupied(&self, slot_id: Uuid, at: DateTime<Utc>, ignore: Option<Uuid>) -> bool {
        self.for_slot(slot_id).iter().any(|claim| {
            claim.is_occupying(at) && (ignore.is_none() || claim.reservation_id() != ignore)
        })
    }
}

// -----------------------------------------------------------------------------
// STATUS PROJECTION
// -----------------------------------------------------------------------------

/// Status of a slot at an instant.
///
/// `occupied` if an active session covers `at`, else `reserved` if a
/// confirmed or checked-in reservation covers `at`, else `unavailable` if the
/// slot is disabled, else `available`.
pub fn compute_slot_status(slot: &Slot, claims: &ClaimIndex, at: DateTime<Utc>) -> SlotStatus {
    let slot_claims = claims.for_slot(slot.id);
    if slot_claims.iter().any(|c| c.is_occupying(at)) {
        SlotStatus::Occupied
    } else if slot_claims.iter().any(|c| c.is_reserving(at)) {
        SlotStatus::Reserved
    } else if slot.disabled {
        SlotStatus::Unavailable
    } else {
        SlotStatus::Available
    }
}

pub fn slot_views(slots: &[Slot], claims: &ClaimIndex, at: DateTime<Utc>) -> Vec<SlotView> {
    let mut views: Vec<SlotView> = slots
        .iter()
        .map(|slot| SlotView {
            slot_id: slot.id,
            zone_id: slot.zone_id,
            slot_number: slot.slot_number,
            status: compute_slot_status(slot, claims, at),
        })
        .collect();
    views.sort_by_key(|v| v.slot_number);
    views
}

// -----------------------------------------------------------------------------
// AVAILABLE SLOTS SEQUENCE
// -----------------------------------------------------------------------------

/// Snapshot of a lot's slots and claims, filtered lazily for one window.
#[derive(Debug, Clone)]
pub struct AvailableSlots {
    slots: Vec<Slot>,
    claims: ClaimIndex,
    range: TimeRange,
}

impl AvailableSlots {
    pub fn new(mut slots: Vec<Slot>, claims: ClaimIndex, range: TimeRange) -> Self {
        slots.sort_by_key(|s| (s.slot_number, s.id));
        Self {
            slots,
            claims,
            range,
        }
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn claims(&self) -> &ClaimIndex {
        &self.claims
    }

    /// Starts a fresh pass over the free slots, lowest slot number first.
    pub fn iter(&self) -> AvailableIter<'_> {
        AvailableIter {
            inner: self.slots.iter(),
            claims: &self.claims,
            range: self.range,
        }
    }
}

impl<'a> IntoIterator for &'a AvailableSlots {
    type Item = &'a Slot;
    type IntoIter = AvailableIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct AvailableIter<'a> {
    inner: std::slice::Iter<'a, Slot>,
    claims: &'a ClaimIndex,
    range: TimeRange,
}

impl<'a> Iterator for AvailableIter<'a> {
    type Item = &'a Slot;

    fn next(&mut self) -> Option<Self::Item> {
        let claims = self.claims;
        let range = self.range;
        self.inner
            .by_ref()
            .find(|slot| !slot.disabled && claims.is_free(slot.id, &range, None))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.inner.size_hint().1)
    }
}
