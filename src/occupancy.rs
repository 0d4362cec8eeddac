// =============================================================================
// OCCUPANCY MODULE
// =============================================================================
// Reporting views over the slot directory: how full a lot is at an instant
// and how many vehicles entered/left in a window.
//
// NOTES:
// - Read-only and possibly stale; never consulted for booking decisions
// - `percentage` counts occupied slots only; reserved slots are reported
//   separately
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::directory::{compute_slot_status, ClaimIndex};
use crate::models::{ParkingSession, Slot, SlotStatus, Zone, ZoneCategory};
use crate::timerange::TimeRange;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OccupancyCounts {
    pub total: usize,
    pub occupied: usize,
    pub reserved: usize,
    pub unavailable: usize,
    pub available: usize,
    pub percentage: f64,
}

impl OccupancyCounts {
    fn add(&mut self, status: SlotStatus) {
        self.total += 1;
        match status {
            SlotStatus::Occupied => self.occupied += 1,
            SlotStatus::Reserved => self.reserved += 1,
            SlotStatus::Unavailable => self.unavailable += 1,
            SlotStatus::Available => self.available += 1,
        }
    }

    fn finish(mut self) -> Self {
        self.percentage = percentage(self.occupied, self.total);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneOccupancy {
    pub zone_id: Uuid,
    pub name: String,
    pub category: ZoneCategory,
    #[serde(flatten)]
    pub counts: OccupancyCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancyReport {
    pub lot_id: Uuid,
    pub at: DateTime<Utc>,
    pub total: usize,
    pub occupied: usize,
    pub reserved: usize,
    pub unavailable: usize,
    pub available: usize,
    /// occupied / total × 100, two decimals; 0 for a lot without slots
    pub percentage: f64,
    pub zones: Vec<ZoneOccupancy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficReport {
    pub lot_id: Uuid,
    pub range: TimeRange,
    pub entries: usize,
    pub exits: usize,
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 10_000.0).round() / 100.0
}

/// Count slot statuses at `at`, for the lot and per zone.
pub fn occupancy_report(
    lot_id: Uuid,
    at: DateTime<Utc>,
    zones: &[Zone],
    slots: &[Slot],
    claims: &ClaimIndex,
) -> OccupancyReport {
    let mut lot = OccupancyCounts::default();
    let mut by_zone: HashMap<Uuid, OccupancyCounts> = HashMap::new();

    for slot in slots {
        let status = compute_slot_status(slot, claims, at);
        lot.add(status);
        by_zone.entry(slot.zone_id).or_default().add(status);
    }
    let lot = lot.finish();

    let mut zones: Vec<ZoneOccupancy> = zones
        .iter()
        .map(|zone| ZoneOccupancy {
            zone_id: zone.id,
            name: zone.name.clone(),
            category: zone.category,
            counts: by_zone.get(&zone.id).copied().unwrap_or_default().finish(),
        })
        .collect();
    zones.sort_by(|a, b| a.name.cmp(&b.name));

    OccupancyReport {
        lot_id,
        at,
        total: lot.total,
        occupied: lot.occupied,
        reserved: lot.reserved,
        unavailable: lot.unavailable,
        available: lot.available,
        percentage: lot.percentage,
        zones,
    }
}

/// Entries and exits whose timestamps fall inside `range`.
pub fn traffic_report(lot_id: Uuid, range: &TimeRange, sessions: &[ParkingSession]) -> TrafficReport {
    let entries = sessions
        .iter()
        .filter(|s| s.lot_id == lot_id && range.contains(s.entry_time))
        .count();
    let exits = sessions
        .iter()
        .filter(|s| s.lot_id == lot_id && s.exit_time.map_or(false, |exit| range.contains(exit)))
        .count();
    TrafficReport {
        lot_id,
        range: *range,
        entries,
        exits,
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::SlotClaim;
    use crate::models::ReservationStatus;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    fn zone(name: &str) -> Zone {
        Zone {
            id: Uuid::new_v4(),
            lot_id: Uuid::nil(),
            name: name.into(),
            category: ZoneCategory::Regular,
        }
    }

    fn slot(zone: &Zone, number: i32) -> Slot {
        Slot {
            id: Uuid::new_v4(),
            lot_id: Uuid::nil(),
            zone_id: zone.id,
            slot_number: number,
            disabled: false,
        }
    }

    fn session(slot_id: Uuid, entry: DateTime<Utc>, exit: Option<DateTime<Utc>>) -> ParkingSession {
        ParkingSession {
            id: Uuid::new_v4(),
            lot_id: Uuid::nil(),
            slot_id,
            vehicle_id: Uuid::new_v4(),
            reservation_id: None,
            entry_time: entry,
            planned_exit: None,
            exit_time: exit,
            amount_due: None,
            is_paid: false,
            payment_id: None,
        }
    }

    #[test]
    fn test_occupancy_counts_by_lot_and_zone() {
        let ground = zone("Ground");
        let roof = zone("Roof");
        let mut slots = vec![
            slot(&ground, 1),
            slot(&ground, 2),
            slot(&ground, 3),
            slot(&roof, 4),
        ];
        slots[2].disabled = true;

        let claims = ClaimIndex::new(vec![
            SlotClaim::from_session(&session(slots[0].id, at(9), None)),
            SlotClaim::Reservation {
                reservation_id: Uuid::new_v4(),
                slot_id: slots[3].id,
                status: ReservationStatus::Confirmed,
                range: TimeRange::new(at(9), at(11)).unwrap(),
            },
        ]);

        let report = occupancy_report(Uuid::nil(), at(10), &[roof.clone(), ground.clone()], &slots, &claims);
        assert_eq!(report.total, 4);
        assert_eq!(report.occupied, 1);
        assert_eq!(report.reserved, 1);
        assert_eq!(report.unavailable, 1);
        assert_eq!(report.available, 1);
        assert_eq!(report.percentage, 25.0);

        assert_eq!(report.zones[0].name, "Ground");
        assert_eq!(report.zones[0].counts.total, 3);
        assert_eq!(report.zones[0].counts.percentage, 33.33);
        assert_eq!(report.zones[1].counts.reserved, 1);
    }

    #[test]
    fn test_empty_lot_is_zero_percent() {
        let report = occupancy_report(Uuid::nil(), at(10), &[], &[], &ClaimIndex::default());
        assert_eq!(report.total, 0);
        assert_eq!(report.percentage, 0.0);
    }

    #[test]
    fn test_traffic_counts_entries_and_exits_in_window() {
        let slot_id = Uuid::new_v4();
        let sessions = vec![
            session(slot_id, at(8), Some(at(10))),
            session(slot_id, at(10), None),
            session(slot_id, at(12), Some(at(13))),
        ];
        let window = TimeRange::new(at(9), at(12)).unwrap();
        let report = traffic_report(Uuid::nil(), &window, &sessions);
        assert_eq!(report.entries, 1);
        assert_eq!(report.exits, 1);
    }
}
