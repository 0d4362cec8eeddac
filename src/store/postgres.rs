// =============================================================================
// POSTGRESQL STORE
// =============================================================================
// SQLx-backed implementation of `Store`.
//
// NOTES:
// - Migrations run at startup and are idempotent (IF NOT EXISTS)
// - The `reservations` table carries an exclusion constraint over
//   (slot_id, tstzrange(start, end)) for slot-holding statuses: the second of
//   two racing inserts fails with SQLSTATE 23P01 and maps to
//   `StoreError::Conflict`
// - Multi-row writes (check-in, completion) and every write carrying event
//   envelopes run in one transaction; envelopes land in `event_outbox`
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgConnection, PgPool};
use std::time::Instant;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::events::EventEnvelope;
use crate::metrics;
use crate::models::{
    GeoLocation, OpeningHours, ParkingLot, ParkingSession, RateTable, Reservation,
    ReservationStatus, Slot, Subscription, SubscriptionPeriod, SubscriptionTier, Vehicle, Zone,
    ZoneCategory,
};
use crate::timerange::TimeRange;

// SQLSTATE codes
const EXCLUSION_VIOLATION: &str = "23P01";
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    pub async fn run_migrations(&self) -> Result<()> {
        // gist index over uuid equality
        sqlx::query("CREATE EXTENSION IF NOT EXISTS btree_gist")
            .execute(&self.pool)
            .await
            .context("Failed to enable btree_gist")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parking_lots (
                id UUID PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                address TEXT NOT NULL DEFAULT '',
                capacity INTEGER NOT NULL CHECK (capacity > 0),
                open_24h BOOLEAN NOT NULL DEFAULT TRUE,
                opens_at TIME,
                closes_at TIME,
                hourly_rate BIGINT,
                daily_rate BIGINT,
                monthly_rate BIGINT,
                latitude DOUBLE PRECISION,
                longitude DOUBLE PRECISION,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create parking_lots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS zones (
                id UUID PRIMARY KEY,
                lot_id UUID NOT NULL REFERENCES parking_lots(id),
                name VARCHAR(255) NOT NULL,
                category VARCHAR(32) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create zones table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS slots (
                id UUID PRIMARY KEY,
                lot_id UUID NOT NULL REFERENCES parking_lots(id),
                zone_id UUID NOT NULL REFERENCES zones(id),
                slot_number INTEGER NOT NULL,
                disabled BOOLEAN NOT NULL DEFAULT FALSE,
                CONSTRAINT unique_slot_number UNIQUE (lot_id, slot_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create slots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vehicles (
                id UUID PRIMARY KEY,
                plate VARCHAR(32) UNIQUE NOT NULL,
                owner_id UUID,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create vehicles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                id UUID PRIMARY KEY,
                lot_id UUID NOT NULL REFERENCES parking_lots(id),
                slot_id UUID REFERENCES slots(id),
                vehicle_id UUID NOT NULL REFERENCES vehicles(id),
                user_id UUID NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                status VARCHAR(16) NOT NULL,
                amount BIGINT NOT NULL,
                session_id UUID,
                cancel_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,

                CONSTRAINT valid_range CHECK (end_time > start_time),

                -- No two slot-holding reservations on one slot may overlap
                CONSTRAINT no_double_booking EXCLUDE USING gist (
                    slot_id WITH =,
                    tstzrange(start_time, end_time, '[)') WITH &&
                ) WHERE (slot_id IS NOT NULL AND status IN ('pending', 'confirmed', 'checked_in'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parking_sessions (
                id UUID PRIMARY KEY,
                lot_id UUID NOT NULL REFERENCES parking_lots(id),
                slot_id UUID NOT NULL REFERENCES slots(id),
                vehicle_id UUID NOT NULL REFERENCES vehicles(id),
                reservation_id UUID REFERENCES reservations(id),
                entry_time TIMESTAMPTZ NOT NULL,
                planned_exit TIMESTAMPTZ,
                exit_time TIMESTAMPTZ,
                amount_due BIGINT,
                is_paid BOOLEAN NOT NULL DEFAULT FALSE,
                payment_id VARCHAR(255)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create parking_sessions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                tier VARCHAR(16) NOT NULL,
                period VARCHAR(16) NOT NULL,
                start_date TIMESTAMPTZ NOT NULL,
                end_date TIMESTAMPTZ NOT NULL,
                auto_renew BOOLEAN NOT NULL,
                amount BIGINT NOT NULL,
                payment_id VARCHAR(255),
                cancelled_at TIMESTAMPTZ,
                renewal_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create subscriptions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_outbox (
                sequence BIGSERIAL PRIMARY KEY,
                event_id UUID NOT NULL UNIQUE,
                event_type VARCHAR(64) NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                payload TEXT NOT NULL,
                delivered_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create event_outbox table")?;

        for (name, ddl) in [
            (
                "reservations lot/time index",
                "CREATE INDEX IF NOT EXISTS idx_reservations_lot_time ON reservations(lot_id, start_time, end_time)",
            ),
            (
                "reservations user index",
                "CREATE INDEX IF NOT EXISTS idx_reservations_user ON reservations(user_id)",
            ),
            (
                "reservations pending index",
                "CREATE INDEX IF NOT EXISTS idx_reservations_pending ON reservations(created_at) WHERE status = 'pending'",
            ),
            (
                "sessions lot index",
                "CREATE INDEX IF NOT EXISTS idx_sessions_lot_entry ON parking_sessions(lot_id, entry_time)",
            ),
            (
                "subscriptions due index",
                "CREATE INDEX IF NOT EXISTS idx_subscriptions_due ON subscriptions(end_date) WHERE auto_renew AND cancelled_at IS NULL",
            ),
            (
                "outbox undelivered index",
                "CREATE INDEX IF NOT EXISTS idx_outbox_undelivered ON event_outbox(sequence) WHERE delivered_at IS NULL",
            ),
            (
                "outbox occurred index",
                "CREATE INDEX IF NOT EXISTS idx_outbox_occurred ON event_outbox(occurred_at)",
            ),
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {name}"))?;
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ERROR MAPPING
// -----------------------------------------------------------------------------

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => StoreError::Duplicate(db.message().to_string()),
            Some(FOREIGN_KEY_VIOLATION) => StoreError::NotFound(db.message().to_string()),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE) => {
                StoreError::Transient(db.message().to_string())
            }
            _ => StoreError::Fatal(err.to_string()),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(err.to_string()),
        _ => StoreError::Fatal(err.to_string()),
    }
}

/// Like `map_sqlx`, but an exclusion violation becomes a slot conflict.
fn map_reservation_write(err: sqlx::Error, slot_id: Option<Uuid>) -> StoreError {
    if let (sqlx::Error::Database(db), Some(slot_id)) = (&err, slot_id) {
        if db.code().as_deref() == Some(EXCLUSION_VIOLATION) {
            return StoreError::Conflict { slot_id };
        }
    }
    map_sqlx(err)
}

/// PostgreSQL timestamps stop long before `DateTime::<Utc>::MAX_UTC`.
fn pg_bound(t: DateTime<Utc>) -> DateTime<Utc> {
    match Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).single() {
        Some(max) if t > max => max,
        _ => t,
    }
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Fatal(format!("unrecognised {what} '{value}' in database"))
}

fn observe(operation: &str, started: Instant) {
    metrics::record_db_query(operation, started.elapsed().as_secs_f64());
}

// -----------------------------------------------------------------------------
// ROW TYPES
// -----------------------------------------------------------------------------

#[derive(FromRow)]
struct LotRow {
    id: Uuid,
    name: String,
    address: String,
    capacity: i32,
    open_24h: bool,
    opens_at: Option<NaiveTime>,
    closes_at: Option<NaiveTime>,
    hourly_rate: Option<i64>,
    daily_rate: Option<i64>,
    monthly_rate: Option<i64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    created_at: DateTime<Utc>,
}

impl From<LotRow> for ParkingLot {
    fn from(row: LotRow) -> Self {
        let location = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoLocation {
                latitude,
                longitude,
            }),
            _ => None,
        };
        ParkingLot {
            id: row.id,
            name: row.name,
            address: row.address,
            capacity: row.capacity,
            opening_hours: OpeningHours {
                open_24h: row.open_24h,
                opens_at: row.opens_at,
                closes_at: row.closes_at,
            },
            rates: RateTable {
                hourly_rate: row.hourly_rate,
                daily_rate: row.daily_rate,
                monthly_rate: row.monthly_rate,
            },
            location,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ZoneRow {
    id: Uuid,
    lot_id: Uuid,
    name: String,
    category: String,
}

impl TryFrom<ZoneRow> for Zone {
    type Error = StoreError;

    fn try_from(row: ZoneRow) -> Result<Self, Self::Error> {
        let category =
            ZoneCategory::parse(&row.category).ok_or_else(|| corrupt("zone category", &row.category))?;
        Ok(Zone {
            id: row.id,
            lot_id: row.lot_id,
            name: row.name,
            category,
        })
    }
}

#[derive(FromRow)]
struct SlotRow {
    id: Uuid,
    lot_id: Uuid,
    zone_id: Uuid,
    slot_number: i32,
    disabled: bool,
}

impl From<SlotRow> for Slot {
    fn from(row: SlotRow) -> Self {
        Slot {
            id: row.id,
            lot_id: row.lot_id,
            zone_id: row.zone_id,
            slot_number: row.slot_number,
            disabled: row.disabled,
        }
    }
}

#[derive(FromRow)]
struct VehicleRow {
    id: Uuid,
    plate: String,
    owner_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<VehicleRow> for Vehicle {
    fn from(row: VehicleRow) -> Self {
        Vehicle {
            id: row.id,
            plate: row.plate,
            owner_id: row.owner_id,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ReservationRow {
    id: Uuid,
    lot_id: Uuid,
    slot_id: Option<Uuid>,
    vehicle_id: Uuid,
    user_id: Uuid,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    status: String,
    amount: i64,
    session_id: Option<Uuid>,
    cancel_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let status = ReservationStatus::parse(&row.status)
            .ok_or_else(|| corrupt("reservation status", &row.status))?;
        let range = TimeRange::new(row.start_time, row.end_time)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        Ok(Reservation {
            id: row.id,
            lot_id: row.lot_id,
            slot_id: row.slot_id,
            vehicle_id: row.vehicle_id,
            user_id: row.user_id,
            range,
            status,
            amount: row.amount,
            session_id: row.session_id,
            cancel_reason: row.cancel_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    lot_id: Uuid,
    slot_id: Uuid,
    vehicle_id: Uuid,
    reservation_id: Option<Uuid>,
    entry_time: DateTime<Utc>,
    planned_exit: Option<DateTime<Utc>>,
    exit_time: Option<DateTime<Utc>>,
    amount_due: Option<i64>,
    is_paid: bool,
    payment_id: Option<String>,
}

impl From<SessionRow> for ParkingSession {
    fn from(row: SessionRow) -> Self {
        ParkingSession {
            id: row.id,
            lot_id: row.lot_id,
            slot_id: row.slot_id,
            vehicle_id: row.vehicle_id,
            reservation_id: row.reservation_id,
            entry_time: row.entry_time,
            planned_exit: row.planned_exit,
            exit_time: row.exit_time,
            amount_due: row.amount_due,
            is_paid: row.is_paid,
            payment_id: row.payment_id,
        }
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    tier: String,
    period: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    auto_renew: bool,
    amount: i64,
    payment_id: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
    renewal_count: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let tier =
            SubscriptionTier::parse(&row.tier).ok_or_else(|| corrupt("subscription tier", &row.tier))?;
        let period = SubscriptionPeriod::parse(&row.period)
            .ok_or_else(|| corrupt("subscription period", &row.period))?;
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            tier,
            period,
            start_date: row.start_date,
            end_date: row.end_date,
            auto_renew: row.auto_renew,
            amount: row.amount,
            payment_id: row.payment_id,
            cancelled_at: row.cancelled_at,
            renewal_count: row.renewal_count,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct OutboxRow {
    payload: String,
}

impl TryFrom<OutboxRow> for EventEnvelope {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        serde_json::from_str(&row.payload)
            .map_err(|e| StoreError::Fatal(format!("unreadable event in outbox: {e}")))
    }
}

const LOT_COLUMNS: &str = "id, name, address, capacity, open_24h, opens_at, closes_at, \
     hourly_rate, daily_rate, monthly_rate, latitude, longitude, created_at";
const RESERVATION_COLUMNS: &str = "id, lot_id, slot_id, vehicle_id, user_id, start_time, end_time, \
     status, amount, session_id, cancel_reason, created_at, updated_at";
const SESSION_COLUMNS: &str = "id, lot_id, slot_id, vehicle_id, reservation_id, entry_time, \
     planned_exit, exit_time, amount_due, is_paid, payment_id";
const SUBSCRIPTION_COLUMNS: &str = "id, user_id, tier, period, start_date, end_date, auto_renew, \
     amount, payment_id, cancelled_at, renewal_count, created_at";

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// -----------------------------------------------------------------------------
// STORE IMPLEMENTATION
// -----------------------------------------------------------------------------

#[async_trait]
impl Store for PgStore {
    async fn insert_lot(&self, lot: &ParkingLot) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO parking_lots (id, name, address, capacity, open_24h, opens_at, closes_at,
                hourly_rate, daily_rate, monthly_rate, latitude, longitude, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(lot.id)
        .bind(&lot.name)
        .bind(&lot.address)
        .bind(lot.capacity)
        .bind(lot.opening_hours.open_24h)
        .bind(lot.opening_hours.opens_at)
        .bind(lot.opening_hours.closes_at)
        .bind(lot.rates.hourly_rate)
        .bind(lot.rates.daily_rate)
        .bind(lot.rates.monthly_rate)
        .bind(lot.location.map(|l| l.latitude))
        .bind(lot.location.map(|l| l.longitude))
        .bind(lot.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_lot(&self, lot_id: Uuid) -> StoreResult<Option<ParkingLot>> {
        let row = sqlx::query_as::<_, LotRow>(&format!(
            "SELECT {LOT_COLUMNS} FROM parking_lots WHERE id = $1"
        ))
        .bind(lot_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(ParkingLot::from))
    }

    async fn list_lots(&self) -> StoreResult<Vec<ParkingLot>> {
        let rows = sqlx::query_as::<_, LotRow>(&format!(
            "SELECT {LOT_COLUMNS} FROM parking_lots ORDER BY name ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(ParkingLot::from).collect())
    }

    async fn insert_zone(&self, zone: &Zone) -> StoreResult<()> {
        sqlx::query("INSERT INTO zones (id, lot_id, name, category) VALUES ($1, $2, $3, $4)")
            .bind(zone.id)
            .bind(zone.lot_id)
            .bind(&zone.name)
            .bind(zone.category.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_zone(&self, zone_id: Uuid) -> StoreResult<Option<Zone>> {
        sqlx::query_as::<_, ZoneRow>("SELECT id, lot_id, name, category FROM zones WHERE id = $1")
            .bind(zone_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(Zone::try_from)
            .transpose()
    }

    async fn list_zones(&self, lot_id: Uuid) -> StoreResult<Vec<Zone>> {
        let rows = sqlx::query_as::<_, ZoneRow>(
            "SELECT id, lot_id, name, category FROM zones WHERE lot_id = $1 ORDER BY name ASC",
        )
        .bind(lot_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        convert_all(rows)
    }

    async fn insert_slot(&self, slot: &Slot) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO slots (id, lot_id, zone_id, slot_number, disabled) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(slot.id)
        .bind(slot.lot_id)
        .bind(slot.zone_id)
        .bind(slot.slot_number)
        .bind(slot.disabled)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_slot(&self, slot_id: Uuid) -> StoreResult<Option<Slot>> {
        let row = sqlx::query_as::<_, SlotRow>(
            "SELECT id, lot_id, zone_id, slot_number, disabled FROM slots WHERE id = $1",
        )
        .bind(slot_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Slot::from))
    }

    async fn list_slots(&self, lot_id: Uuid) -> StoreResult<Vec<Slot>> {
        let started = Instant::now();
        let rows = sqlx::query_as::<_, SlotRow>(
            r#"
            SELECT id, lot_id, zone_id, slot_number, disabled
            FROM slots
            WHERE lot_id = $1
            ORDER BY slot_number ASC
            "#,
        )
        .bind(lot_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        observe("list_slots", started);
        Ok(rows.into_iter().map(Slot::from).collect())
    }

    async fn set_slot_disabled(&self, slot_id: Uuid, disabled: bool) -> StoreResult<Slot> {
        sqlx::query_as::<_, SlotRow>(
            r#"
            UPDATE slots SET disabled = $1 WHERE id = $2
            RETURNING id, lot_id, zone_id, slot_number, disabled
            "#,
        )
        .bind(disabled)
        .bind(slot_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(Slot::from)
        .ok_or_else(|| StoreError::NotFound(format!("slot {slot_id}")))
    }

    async fn insert_vehicle(&self, vehicle: &Vehicle) -> StoreResult<()> {
        sqlx::query("INSERT INTO vehicles (id, plate, owner_id, created_at) VALUES ($1, $2, $3, $4)")
            .bind(vehicle.id)
            .bind(&vehicle.plate)
            .bind(vehicle.owner_id)
            .bind(vehicle.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_vehicle(&self, vehicle_id: Uuid) -> StoreResult<Option<Vehicle>> {
        let row = sqlx::query_as::<_, VehicleRow>(
            "SELECT id, plate, owner_id, created_at FROM vehicles WHERE id = $1",
        )
        .bind(vehicle_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Vehicle::from))
    }

    async fn insert_reservation(&self, r: &Reservation, events: &[EventEnvelope]) -> StoreResult<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(
            r#"
            INSERT INTO reservations (id, lot_id, slot_id, vehicle_id, user_id, start_time, end_time,
                status, amount, session_id, cancel_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(r.id)
        .bind(r.lot_id)
        .bind(r.slot_id)
        .bind(r.vehicle_id)
        .bind(r.user_id)
        .bind(r.range.start)
        .bind(r.range.end)
        .bind(r.status.as_str())
        .bind(r.amount)
        .bind(r.session_id)
        .bind(&r.cancel_reason)
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_reservation_write(e, r.slot_id))?;
        append_events(&mut *tx, events).await?;

        tx.commit().await.map_err(map_sqlx)?;
        observe("insert_reservation", started);
        Ok(())
    }

    async fn get_reservation(&self, reservation_id: Uuid) -> StoreResult<Option<Reservation>> {
        sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(Reservation::try_from)
        .transpose()
    }

    async fn list_reservations_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE user_id = $1 ORDER BY start_time ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        convert_all(rows)
    }

    async fn reservations_overlapping(
        &self,
        lot_id: Uuid,
        window: &TimeRange,
    ) -> StoreResult<Vec<Reservation>> {
        let started = Instant::now();
        // existing.start < window.end AND window.start < existing.end
        let rows = sqlx::query_as::<_, ReservationRow>(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM reservations
            WHERE lot_id = $1 AND start_time < $3 AND $2 < end_time
            "#
        ))
        .bind(lot_id)
        .bind(pg_bound(window.start))
        .bind(pg_bound(window.end))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        observe("reservations_overlapping", started);
        convert_all(rows)
    }

    async fn update_reservation(
        &self,
        r: &Reservation,
        expected: ReservationStatus,
        events: &[EventEnvelope],
    ) -> StoreResult<bool> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET slot_id = $3, status = $4, amount = $5, session_id = $6,
                cancel_reason = $7, updated_at = $8
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(r.id)
        .bind(expected.as_str())
        .bind(r.slot_id)
        .bind(r.status.as_str())
        .bind(r.amount)
        .bind(r.session_id)
        .bind(&r.cancel_reason)
        .bind(r.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_reservation_write(e, r.slot_id))?;

        if result.rows_affected() != 1 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(false);
        }
        append_events(&mut *tx, events).await?;

        tx.commit().await.map_err(map_sqlx)?;
        observe("update_reservation", started);
        Ok(true)
    }

    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM reservations
            WHERE status = 'pending' AND created_at <= $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        convert_all(rows)
    }

    async fn insert_session(&self, s: &ParkingSession, events: &[EventEnvelope]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        insert_session_query(s)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        append_events(&mut *tx, events).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<ParkingSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM parking_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(ParkingSession::from))
    }

    async fn update_session(&self, s: &ParkingSession, events: &[EventEnvelope]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let result = update_session_query(s)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Err(StoreError::NotFound(format!("session {}", s.id)));
        }
        append_events(&mut *tx, events).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn sessions_touching(
        &self,
        lot_id: Uuid,
        window: &TimeRange,
    ) -> StoreResult<Vec<ParkingSession>> {
        let started = Instant::now();
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM parking_sessions
            WHERE lot_id = $1
              AND entry_time < $3
              AND (exit_time IS NULL OR exit_time >= $2)
            "#
        ))
        .bind(lot_id)
        .bind(pg_bound(window.start))
        .bind(pg_bound(window.end))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        observe("sessions_touching", started);
        Ok(rows.into_iter().map(ParkingSession::from).collect())
    }

    async fn check_in(
        &self,
        r: &Reservation,
        expected: ReservationStatus,
        session: &ParkingSession,
        events: &[EventEnvelope],
    ) -> StoreResult<bool> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // session first so the reservation can reference it
        insert_session_query(session)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let updated = sqlx::query(
            r#"
            UPDATE reservations
            SET slot_id = $3, status = $4, session_id = $5, updated_at = $6
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(r.id)
        .bind(expected.as_str())
        .bind(r.slot_id)
        .bind(r.status.as_str())
        .bind(r.session_id)
        .bind(r.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_reservation_write(e, r.slot_id))?;

        if updated.rows_affected() != 1 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(false);
        }
        append_events(&mut *tx, events).await?;

        tx.commit().await.map_err(map_sqlx)?;
        observe("check_in", started);
        Ok(true)
    }

    async fn complete_session(
        &self,
        session: &ParkingSession,
        reservation: Option<&Reservation>,
        events: &[EventEnvelope],
    ) -> StoreResult<bool> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let closed = sqlx::query(
            r#"
            UPDATE parking_sessions
            SET exit_time = $2, amount_due = $3, is_paid = $4, payment_id = $5
            WHERE id = $1 AND exit_time IS NULL
            "#,
        )
        .bind(session.id)
        .bind(session.exit_time)
        .bind(session.amount_due)
        .bind(session.is_paid)
        .bind(&session.payment_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if closed.rows_affected() != 1 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(false);
        }

        if let Some(r) = reservation {
            let completed = sqlx::query(
                r#"
                UPDATE reservations
                SET status = $2, amount = $3, updated_at = $4
                WHERE id = $1 AND status = 'checked_in'
                "#,
            )
            .bind(r.id)
            .bind(r.status.as_str())
            .bind(r.amount)
            .bind(r.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            if completed.rows_affected() != 1 {
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(false);
            }
        }
        append_events(&mut *tx, events).await?;

        tx.commit().await.map_err(map_sqlx)?;
        observe("complete_session", started);
        Ok(true)
    }

    async fn insert_subscription(&self, s: &Subscription, events: &[EventEnvelope]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, user_id, tier, period, start_date, end_date, auto_renew,
                amount, payment_id, cancelled_at, renewal_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(s.id)
        .bind(s.user_id)
        .bind(s.tier.as_str())
        .bind(s.period.as_str())
        .bind(s.start_date)
        .bind(s.end_date)
        .bind(s.auto_renew)
        .bind(s.amount)
        .bind(&s.payment_id)
        .bind(s.cancelled_at)
        .bind(s.renewal_count)
        .bind(s.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        append_events(&mut *tx, events).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> StoreResult<Option<Subscription>> {
        sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(Subscription::try_from)
        .transpose()
    }

    async fn update_subscription(&self, s: &Subscription, events: &[EventEnvelope]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET end_date = $2, auto_renew = $3, amount = $4, payment_id = $5,
                cancelled_at = $6, renewal_count = $7
            WHERE id = $1
            "#,
        )
        .bind(s.id)
        .bind(s.end_date)
        .bind(s.auto_renew)
        .bind(s.amount)
        .bind(&s.payment_id)
        .bind(s.cancelled_at)
        .bind(s.renewal_count)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Err(StoreError::NotFound(format!("subscription {}", s.id)));
        }
        append_events(&mut *tx, events).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn subscriptions_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE auto_renew AND cancelled_at IS NULL AND end_date <= $1
            ORDER BY end_date ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        convert_all(rows)
    }

    async fn undelivered_events(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<EventEnvelope>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT payload
            FROM event_outbox
            WHERE delivered_at IS NULL AND occurred_at <= $1
            ORDER BY sequence ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        convert_all(rows)
    }

    async fn mark_events_delivered(&self, event_ids: &[Uuid]) -> StoreResult<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE event_outbox SET delivered_at = NOW() WHERE event_id = ANY($1) AND delivered_at IS NULL",
        )
        .bind(event_ids.to_vec())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<EventEnvelope>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            "SELECT payload FROM event_outbox WHERE occurred_at >= $1 ORDER BY sequence ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        convert_all(rows)
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

/// Append envelopes inside the caller's transaction; replays are no-ops.
async fn append_events(conn: &mut PgConnection, events: &[EventEnvelope]) -> StoreResult<()> {
    for envelope in events {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| StoreError::Fatal(format!("failed to encode event: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO event_outbox (event_id, event_type, occurred_at, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(envelope.event_id)
        .bind(envelope.event.name())
        .bind(envelope.occurred_at)
        .bind(payload)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;
    }
    Ok(())
}

fn insert_session_query(
    s: &ParkingSession,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO parking_sessions (id, lot_id, slot_id, vehicle_id, reservation_id, entry_time,
            planned_exit, exit_time, amount_due, is_paid, payment_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(s.id)
    .bind(s.lot_id)
    .bind(s.slot_id)
    .bind(s.vehicle_id)
    .bind(s.reservation_id)
    .bind(s.entry_time)
    .bind(s.planned_exit)
    .bind(s.exit_time)
    .bind(s.amount_due)
    .bind(s.is_paid)
    .bind(&s.payment_id)
}

fn update_session_query(
    s: &ParkingSession,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        UPDATE parking_sessions
        SET planned_exit = $2, exit_time = $3, amount_due = $4, is_paid = $5, payment_id = $6
        WHERE id = $1
        "#,
    )
    .bind(s.id)
    .bind(s.planned_exit)
    .bind(s.exit_time)
    .bind(s.amount_due)
    .bind(s.is_paid)
    .bind(&s.payment_id)
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_bound_clamps_open_ended_windows() {
        let open = TimeRange::open_ended(Utc::now());
        let bounded = pg_bound(open.end);
        assert!(bounded < open.end);
        assert_eq!(bounded, Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap());

        let now = Utc::now();
        assert_eq!(pg_bound(now), now);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(map_sqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!map_sqlx(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_outbox_rows_decode_to_envelopes() {
        use crate::events::DomainEvent;

        let envelope = EventEnvelope::new(
            Utc::now(),
            DomainEvent::SubscriptionCancelled {
                subscription_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            },
        );
        let row = OutboxRow {
            payload: serde_json::to_string(&envelope).unwrap(),
        };
        assert_eq!(EventEnvelope::try_from(row).unwrap(), envelope);

        let garbled = OutboxRow {
            payload: "{\"type\":\"Nope\"}".into(),
        };
        assert!(matches!(
            EventEnvelope::try_from(garbled),
            Err(StoreError::Fatal(_))
        ));
    }
}
