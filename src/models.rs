// =============================================================================
// MODELS MODULE
// =============================================================================
// Domain records (lots, zones, slots, vehicles, reservations, sessions,
// subscriptions) and the API request/response shapes built from them.
//
// NOTES:
// - Money is always an integer in the smallest currency unit
// - Slot status and subscription status are computed, never stored
// - Status enums round-trip through `as_str`/`parse` for the SQL layer
// =============================================================================

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timerange::TimeRange;

/// Smallest currency unit (e.g. cents).
pub type Amount = i64;

// =============================================================================
// IDENTITY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Customer,
    Manager,
    Administrator,
}

impl Role {
    /// Managers and administrators bypass customer-facing policies.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Manager | Role::Administrator)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer" => Some(Role::Customer),
            "manager" => Some(Role::Manager),
            "administrator" | "admin" => Some(Role::Administrator),
            _ => None,
        }
    }
}

/// Request-scoped identity handed to every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }
}

// =============================================================================
// CATALOG: LOTS, ZONES, SLOTS
// =============================================================================

/// Rates per billing unit. A lot must offer at least one of hourly/daily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateTable {
    pub hourly_rate: Option<Amount>,
    pub daily_rate: Option<Amount>,
    pub monthly_rate: Option<Amount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHours {
    #[serde(default)]
    pub open_24h: bool,
    pub opens_at: Option<NaiveTime>,
    pub closes_at: Option<NaiveTime>,
}

impl Default for OpeningHours {
    fn default() -> Self {
        Self {
            open_24h: true,
            opens_at: None,
            closes_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkingLot {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    /// Declared number of slots; the directory never holds more
    pub capacity: i32,
    pub opening_hours: OpeningHours,
    pub rates: RateTable,
    pub location: Option<GeoLocation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneCategory {
    Regular,
    Vip,
    Accessibility,
}

impl ZoneCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneCategory::Regular => "regular",
            ZoneCategory::Vip => "vip",
            ZoneCategory::Accessibility => "accessibility",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(ZoneCategory::Regular),
            "vip" => Some(ZoneCategory::Vip),
            "accessibility" => Some(ZoneCategory::Accessibility),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub name: String,
    pub category: ZoneCategory,
}

/// A physical space. Its status is computed by the slot directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub zone_id: Uuid,
    pub slot_number: i32,
    /// Administratively disabled (maintenance, closed lane)
    pub disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
}

// =============================================================================
// VEHICLES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Uuid,
    /// Normalized plate, unique across the system
    pub plate: String,
    /// Lookup key only; the owner record may not be loaded
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Upper-case a plate and strip whitespace and dashes.
pub fn normalize_plate(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_uppercase)
        .collect()
}

// =============================================================================
// RESERVATIONS
// =============================================================================

/// Lifecycle: pending → confirmed → checked_in → completed, with cancelled
/// reachable from pending or confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "checked_in" => Some(ReservationStatus::CheckedIn),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    /// Statuses whose time range blocks the slot for other bookings.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::CheckedIn
        )
    }

    /// Forward-only transition table.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, CheckedIn)
                | (CheckedIn, Completed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub lot_id: Uuid,
    /// Unassigned until check-in when booked without a slot
    pub slot_id: Option<Uuid>,
    pub vehicle_id: Uuid,
    pub user_id: Uuid,
    pub range: TimeRange,
    pub status: ReservationStatus,
    /// Quoted at booking, replaced by the final amount on completion
    pub amount: Amount,
    pub session_id: Option<Uuid>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// PARKING SESSIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingSession {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub slot_id: Uuid,
    pub vehicle_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub entry_time: DateTime<Utc>,
    /// Expected exit; bounds the claim of an active session
    pub planned_exit: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub amount_due: Option<Amount>,
    pub is_paid: bool,
    pub payment_id: Option<String>,
}

impl ParkingSession {
    pub fn is_active(&self) -> bool {
        self.exit_time.is_none()
    }

    /// Window this session keeps the slot claimed for.
    ///
    /// Active sessions claim from entry to planned exit (or indefinitely);
    /// finished sessions claim `[entry, exit)`.
    pub fn claim_range(&self) -> Option<TimeRange> {
        match self.exit_time.or(self.planned_exit) {
            Some(end) => TimeRange::new(self.entry_time, end).ok(),
            None => Some(TimeRange::open_ended(self.entry_time)),
        }
    }

    /// True when the vehicle is physically in the slot at `at`.
    pub fn occupies(&self, at: DateTime<Utc>) -> bool {
        self.entry_time <= at && self.exit_time.map_or(true, |exit| at < exit)
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Basic,
    Premium,
    Vip,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Basic => "basic",
            SubscriptionTier::Premium => "premium",
            SubscriptionTier::Vip => "vip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(SubscriptionTier::Basic),
            "premium" => Some(SubscriptionTier::Premium),
            "vip" => Some(SubscriptionTier::Vip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPeriod {
    Monthly,
    Quarterly,
    Yearly,
}

impl SubscriptionPeriod {
    pub fn months(&self) -> u32 {
        match self {
            SubscriptionPeriod::Monthly => 1,
            SubscriptionPeriod::Quarterly => 3,
            SubscriptionPeriod::Yearly => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPeriod::Monthly => "monthly",
            SubscriptionPeriod::Quarterly => "quarterly",
            SubscriptionPeriod::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(SubscriptionPeriod::Monthly),
            "quarterly" => Some(SubscriptionPeriod::Quarterly),
            "yearly" => Some(SubscriptionPeriod::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub period: SubscriptionPeriod,
    pub start_date: DateTime<Utc>,
    /// Billing anchor; renewals extend from here, never from "now"
    pub end_date: DateTime<Utc>,
    pub auto_renew: bool,
    pub amount: Amount,
    pub payment_id: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub renewal_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn status(&self, now: DateTime<Utc>) -> SubscriptionStatus {
        if self.cancelled_at.is_some() {
            SubscriptionStatus::Cancelled
        } else if now > self.end_date && !self.auto_renew {
            SubscriptionStatus::Expired
        } else {
            SubscriptionStatus::Active
        }
    }
}

// =============================================================================
// API REQUEST STRUCTURES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLotRequest {
    pub name: String,
    #[serde(default)]
    pub address: String,
    pub capacity: i32,
    #[serde(default)]
    pub opening_hours: OpeningHours,
    pub rates: RateTable,
    pub location: Option<GeoLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateZoneRequest {
    pub name: String,
    pub category: ZoneCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSlotRequest {
    pub slot_number: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterVehicleRequest {
    pub plate: String,
    pub owner_id: Option<Uuid>,
}

/// Body of `POST /reservations`.
///
/// # Example JSON
/// ```json
/// {
///   "lot_id": "…",
///   "vehicle_id": "…",
///   "range": { "start": "2026-03-02T10:00:00Z", "end": "2026-03-02T12:00:00Z" },
///   "slot_id": null
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReservationRequest {
    pub lot_id: Uuid,
    pub vehicle_id: Uuid,
    /// Defaults to the calling user
    pub user_id: Option<Uuid>,
    pub range: TimeRange,
    pub slot_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelReservationRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub slot_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub lot_id: Uuid,
    pub vehicle_id: Uuid,
    pub slot_id: Uuid,
    pub planned_exit: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPaymentRequest {
    pub payment_id: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub user_id: Option<Uuid>,
    pub tier: SubscriptionTier,
    pub period: SubscriptionPeriod,
    /// Defaults to now
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
    pub payment_id: Option<String>,
}

fn default_auto_renew() -> bool {
    true
}

// -----------------------------------------------------------------------------
// QUERY PARAMETERS
// -----------------------------------------------------------------------------

/// `?start&end` window
#[derive(Debug, Clone, Deserialize)]
pub struct WindowQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// `?at=` instant, defaulting to now
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AtQuery {
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReservationListQuery {
    pub user_id: Option<Uuid>,
}

// =============================================================================
// API RESPONSE STRUCTURES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub slot_id: Uuid,
    pub zone_id: Uuid,
    pub slot_number: i32,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSlotsResponse {
    pub lot_id: Uuid,
    pub range: TimeRange,
    pub count: usize,
    pub slots: Vec<SlotView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotDetailResponse {
    #[serde(flatten)]
    pub lot: ParkingLot,
    pub zones: Vec<Zone>,
    pub slot_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub status: SubscriptionStatus,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub store: bool,
    /// `None` when no cache is configured
    pub redis: Option<bool>,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable kind
    pub error: String,

    /// Human-readable message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_lifecycle_only_moves_forward() {
        use ReservationStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(CheckedIn));
        assert!(CheckedIn.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));

        assert!(!CheckedIn.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(CheckedIn));
        assert!(!Pending.can_transition_to(CheckedIn));
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            ReservationStatus::CheckedIn,
            ReservationStatus::Completed,
            ReservationStatus::Cancelled,
        ] {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("archived"), None);
    }

    #[test]
    fn test_plate_normalization() {
        assert_eq!(normalize_plate(" b-123 xy "), "B123XY");
    }

    #[test]
    fn test_subscription_status_is_derived() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut sub = Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tier: SubscriptionTier::Basic,
            period: SubscriptionPeriod::Monthly,
            start_date: start,
            end_date: start + Duration::days(31),
            auto_renew: false,
            amount: 50_000,
            payment_id: None,
            cancelled_at: None,
            renewal_count: 0,
            created_at: start,
        };

        assert_eq!(sub.status(start + Duration::days(10)), SubscriptionStatus::Active);
        assert_eq!(sub.status(start + Duration::days(40)), SubscriptionStatus::Expired);

        sub.auto_renew = true;
        assert_eq!(sub.status(start + Duration::days(40)), SubscriptionStatus::Active);

        sub.cancelled_at = Some(start);
        assert_eq!(sub.status(start), SubscriptionStatus::Cancelled);
    }

    #[test]
    fn test_session_claim_range() {
        let entry = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut session = ParkingSession {
            id: Uuid::new_v4(),
            lot_id: Uuid::new_v4(),
            slot_id: Uuid::new_v4(),
            vehicle_id: Uuid::new_v4(),
            reservation_id: None,
            entry_time: entry,
            planned_exit: None,
            exit_time: None,
            amount_due: None,
            is_paid: false,
            payment_id: None,
        };
        assert_eq!(session.claim_range().unwrap().end, DateTime::<Utc>::MAX_UTC);
        assert!(session.occupies(entry + Duration::days(3)));

        session.planned_exit = Some(entry + Duration::hours(2));
        assert_eq!(session.claim_range().unwrap().end, entry + Duration::hours(2));

        session.exit_time = Some(entry + Duration::hours(1));
        assert_eq!(session.claim_range().unwrap().end, entry + Duration::hours(1));
        assert!(!session.occupies(entry + Duration::hours(1)));
    }
}
