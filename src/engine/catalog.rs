// =============================================================================
// CATALOG OPERATIONS
// =============================================================================
// Parking lots, zones, slots and vehicles. Mutations other than vehicle
// registration are staff-only.
// =============================================================================

use uuid::Uuid;

use super::{authorize_for, require_staff, ReservationEngine};
use crate::error::{AppError, AppResult};
use crate::models::{
    normalize_plate, Actor, CreateLotRequest, CreateSlotRequest, CreateZoneRequest,
    LotDetailResponse, ParkingLot, RegisterVehicleRequest, Slot, Vehicle, Zone,
};

impl ReservationEngine {
    // -------------------------------------------------------------------------
    // LOTS
    // -------------------------------------------------------------------------
    pub async fn create_lot(&self, actor: &Actor, request: CreateLotRequest) -> AppResult<ParkingLot> {
        require_staff(actor)?;
        validate_lot(&request)?;

        let lot = ParkingLot {
            id: Uuid::new_v4(),
            name: request.name.trim().to_string(),
            address: request.address.trim().to_string(),
            capacity: request.capacity,
            opening_hours: request.opening_hours,
            rates: request.rates,
            location: request.location,
            created_at: self.now(),
        };
        self.call("insert_lot", || self.store.insert_lot(&lot)).await?;

        tracing::info!(lot_id = %lot.id, name = %lot.name, capacity = lot.capacity, "Parking lot created");
        Ok(lot)
    }

    pub async fn get_lot(&self, lot_id: Uuid) -> AppResult<LotDetailResponse> {
        let lot = self.load_lot(lot_id).await?;
        let zones = self.call("list_zones", || self.store.list_zones(lot_id)).await?;
        let slots = self.call("list_slots", || self.store.list_slots(lot_id)).await?;
        Ok(LotDetailResponse {
            lot,
            zones,
            slot_count: slots.len(),
        })
    }

    pub async fn list_lots(&self) -> AppResult<Vec<ParkingLot>> {
        self.call("list_lots", || self.store.list_lots()).await
    }

    // -------------------------------------------------------------------------
    // ZONES & SLOTS
    // -------------------------------------------------------------------------
    pub async fn create_zone(
        &self,
        actor: &Actor,
        lot_id: Uuid,
        request: CreateZoneRequest,
    ) -> AppResult<Zone> {
        require_staff(actor)?;
        if request.name.trim().is_empty() {
            return Err(AppError::Validation("zone name must not be empty".to_string()));
        }
        self.load_lot(lot_id).await?;

        let zone = Zone {
            id: Uuid::new_v4(),
            lot_id,
            name: request.name.trim().to_string(),
            category: request.category,
        };
        self.call("insert_zone", || self.store.insert_zone(&zone)).await?;

        tracing::info!(zone_id = %zone.id, lot_id = %lot_id, category = zone.category.as_str(), "Zone created");
        Ok(zone)
    }

    /// Adds a slot to the zone's lot, never beyond the lot's declared capacity.
    pub async fn create_slot(
        &self,
        actor: &Actor,
        zone_id: Uuid,
        request: CreateSlotRequest,
    ) -> AppResult<Slot> {
        require_staff(actor)?;
        if request.slot_number <= 0 {
            return Err(AppError::Validation("slot number must be positive".to_string()));
        }
        let zone = self
            .call("get_zone", || self.store.get_zone(zone_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("zone {zone_id} not found")))?;
        let lot = self.load_lot(zone.lot_id).await?;

        // capacity check and insert must not interleave with another insert
        let _guard = self.lot_locks.lock(lot.id).await;
        let existing = self.call("list_slots", || self.store.list_slots(lot.id)).await?;
        if existing.len() >= usize::try_from(lot.capacity).unwrap_or(0) {
            return Err(AppError::Validation(format!(
                "parking lot {} already has its {} slots",
                lot.id, lot.capacity
            )));
        }
        if existing.iter().any(|s| s.slot_number == request.slot_number) {
            return Err(AppError::AlreadyExists(format!(
                "slot number {} already exists in lot {}",
                request.slot_number, lot.id
            )));
        }

        let slot = Slot {
            id: Uuid::new_v4(),
            lot_id: lot.id,
            zone_id,
            slot_number: request.slot_number,
            disabled: false,
        };
        self.call("insert_slot", || self.store.insert_slot(&slot)).await?;

        tracing::info!(slot_id = %slot.id, lot_id = %lot.id, slot_number = slot.slot_number, "Slot created");
        Ok(slot)
    }

    /// Disabled slots keep their claims but are never offered for booking.
    pub async fn set_slot_disabled(
        &self,
        actor: &Actor,
        slot_id: Uuid,
        disabled: bool,
    ) -> AppResult<Slot> {
        require_staff(actor)?;
        let slot = self
            .call("set_slot_disabled", || self.store.set_slot_disabled(slot_id, disabled))
            .await?;
        tracing::info!(slot_id = %slot_id, lot_id = %slot.lot_id, disabled, "Slot availability changed");
        Ok(slot)
    }

    // -------------------------------------------------------------------------
    // VEHICLES
    // -------------------------------------------------------------------------
    pub async fn register_vehicle(
        &self,
        actor: &Actor,
        request: RegisterVehicleRequest,
    ) -> AppResult<Vehicle> {
        let plate = normalize_plate(&request.plate);
        if plate.is_empty() {
            return Err(AppError::Validation("plate must not be empty".to_string()));
        }
        let owner_id = request.owner_id.unwrap_or(actor.user_id);
        authorize_for(actor, owner_id)?;

        let vehicle = Vehicle {
            id: Uuid::new_v4(),
            plate,
            owner_id: Some(owner_id),
            created_at: self.now(),
        };
        self.call("insert_vehicle", || self.store.insert_vehicle(&vehicle))
            .await?;

        tracing::info!(vehicle_id = %vehicle.id, plate = %vehicle.plate, "Vehicle registered");
        Ok(vehicle)
    }

    pub async fn get_vehicle(&self, vehicle_id: Uuid) -> AppResult<Vehicle> {
        self.load_vehicle(vehicle_id).await
    }
}

fn validate_lot(request: &CreateLotRequest) -> AppResult<()> {
    if request.name.trim().is_empty() {
        return Err(AppError::Validation("lot name must not be empty".to_string()));
    }
    if request.capacity <= 0 {
        return Err(AppError::Validation("capacity must be positive".to_string()));
    }
    let rates = &request.rates;
    if rates.hourly_rate.is_none() && rates.daily_rate.is_none() {
        return Err(AppError::Validation(
            "a lot needs an hourly or a daily rate".to_string(),
        ));
    }
    if [rates.hourly_rate, rates.daily_rate, rates.monthly_rate]
        .into_iter()
        .flatten()
        .any(|rate| rate < 0)
    {
        return Err(AppError::Validation("rates must not be negative".to_string()));
    }
    let hours = &request.opening_hours;
    if !hours.open_24h && (hours.opens_at.is_none() || hours.closes_at.is_none()) {
        return Err(AppError::Validation(
            "opening and closing times are required unless the lot is open 24h".to_string(),
        ));
    }
    Ok(())
}
