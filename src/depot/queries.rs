use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Depot, DepotError};

impl Depot {
    pub async fn get_booking(&self, tenant_id: Ulid, booking_id: Ulid) -> Result<Booking, DepotError> {
        let arc = self
            .get_booking_shared(&booking_id)
            .ok_or(DepotError::NotFound("booking", booking_id))?;
        let booking = arc.read().await.clone();
        let customer = self
            .customers
            .get(&booking.customer_id)
            .map(|e| e.value().clone())
            .ok_or(DepotError::NotFound("customer", booking.customer_id))?;
        if customer.tenant_id != tenant_id {
            return Err(DepotError::Unauthorized("booking", booking_id));
        }
        Ok(booking)
    }

    pub async fn get_unit(&self, tenant_id: Ulid, unit_id: Ulid) -> Result<StorageUnit, DepotError> {
        let arc = self
            .get_unit_shared(&unit_id)
            .ok_or(DepotError::NotFound("unit", unit_id))?;
        let unit = arc.read().await.clone();
        let warehouse = self
            .warehouses
            .get(&unit.warehouse_id)
            .map(|e| e.value().clone())
            .ok_or(DepotError::NotFound("warehouse", unit.warehouse_id))?;
        if warehouse.tenant_id != tenant_id {
            return Err(DepotError::Unauthorized("unit", unit_id));
        }
        Ok(unit)
    }

    /// Active bookings ending on or before `end_by`, optionally narrowed to
    /// one notification status, sorted by end date with the booking id as
    /// tie-breaker so pagination is stable.
    pub(super) async fn matching_expiring(
        &self,
        filter: Option<NotificationStatus>,
        end_by: NaiveDate,
    ) -> Vec<Booking> {
        // Collect the Arcs first; awaiting a lock while iterating a DashMap
        // would hold a shard lock across the await.
        let arcs: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut matched = Vec::new();
        for arc in arcs {
            let b = arc.read().await;
            if b.status != BookingStatus::Active || b.end_date > end_by {
                continue;
            }
            if let Some(want) = filter
                && b.notification_status != want {
                    continue;
                }
            matched.push(b.clone());
        }
        matched.sort_by(|a, b| (a.end_date, a.id).cmp(&(b.end_date, b.id)));
        matched
    }

    /// Denormalize one booking into the view the dispatcher works from.
    /// Records are never deleted, so the joins cannot dangle; a `None` here
    /// means the store is corrupt and the row is dropped.
    async fn join_expiring(&self, b: &Booking) -> Option<ExpiringBooking> {
        let customer = self.customers.get(&b.customer_id).map(|e| e.value().clone())?;
        let unit_arc = self.get_unit_shared(&b.unit_id)?;
        let unit = unit_arc.read().await.clone();
        let warehouse = self.warehouses.get(&unit.warehouse_id).map(|e| e.value().clone())?;
        Some(ExpiringBooking {
            booking_id: b.id,
            tenant_id: customer.tenant_id,
            customer_company: customer.company_name,
            customer_email: customer.contact_email,
            warehouse_name: warehouse.name,
            unit_number: unit.unit_number,
            capacity_kg: unit.capacity_kg,
            start_date: b.start_date,
            end_date: b.end_date,
            monthly_rate: b.monthly_rate,
            notification_status: b.notification_status,
            retry_count: b.retry_count,
            booking_version: b.version,
        })
    }

    /// Paged, cross-tenant scan feeding the notification pipeline.
    pub async fn scan_expiring(
        &self,
        filter: Option<NotificationStatus>,
        end_by: NaiveDate,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ExpiringBooking>, DepotError> {
        if limit == 0 {
            return Err(DepotError::InvalidState("scan limit must be positive"));
        }
        if limit > MAX_SCAN_LIMIT {
            return Err(DepotError::LimitExceeded("scan limit too large"));
        }
        let matched = self.matching_expiring(filter, end_by).await;
        let mut rows = Vec::new();
        for b in matched.into_iter().skip(offset).take(limit) {
            if let Some(row) = self.join_expiring(&b).await {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Tenant-facing view of that tenant's bookings ending by `end_by`.
    pub async fn expiring_bookings(
        &self,
        tenant_id: Ulid,
        end_by: NaiveDate,
    ) -> Result<Vec<ExpiringBooking>, DepotError> {
        if !self.tenants.contains_key(&tenant_id) {
            return Err(DepotError::NotFound("tenant", tenant_id));
        }
        let matched = self.matching_expiring(None, end_by).await;
        let mut rows = Vec::new();
        for b in matched {
            if let Some(row) = self.join_expiring(&b).await
                && row.tenant_id == tenant_id {
                    rows.push(row);
                }
        }
        Ok(rows)
    }

    /// Units a tenant could allocate right now, smallest first so the
    /// tightest fit sorts to the top.
    pub async fn available_units(
        &self,
        tenant_id: Ulid,
        min_capacity_kg: Option<u32>,
    ) -> Result<Vec<AvailableUnit>, DepotError> {
        if !self.tenants.contains_key(&tenant_id) {
            return Err(DepotError::NotFound("tenant", tenant_id));
        }
        let warehouse_ids: Vec<Ulid> = self
            .tenant_warehouses
            .get(&tenant_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut rows = Vec::new();
        for wid in warehouse_ids {
            let Some(warehouse) = self.warehouses.get(&wid).map(|e| e.value().clone()) else {
                continue;
            };
            let unit_ids: Vec<Ulid> = self
                .warehouse_units
                .get(&wid)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            for uid in unit_ids {
                let Some(arc) = self.get_unit_shared(&uid) else {
                    continue;
                };
                let unit = arc.read().await;
                if unit.status != UnitStatus::Available {
                    continue;
                }
                if let Some(min) = min_capacity_kg
                    && unit.capacity_kg < min {
                        continue;
                    }
                rows.push(AvailableUnit {
                    id: unit.id,
                    warehouse_id: wid,
                    warehouse_name: warehouse.name.clone(),
                    unit_number: unit.unit_number.clone(),
                    capacity_kg: unit.capacity_kg,
                });
            }
        }
        rows.sort_by(|a, b| {
            a.capacity_kg
                .cmp(&b.capacity_kg)
                .then_with(|| a.unit_number.cmp(&b.unit_number))
        });
        Ok(rows)
    }

    /// Occupancy counts per warehouse, sorted by warehouse name.
    pub async fn warehouse_utilization(
        &self,
        tenant_id: Ulid,
    ) -> Result<Vec<WarehouseUtilization>, DepotError> {
        if !self.tenants.contains_key(&tenant_id) {
            return Err(DepotError::NotFound("tenant", tenant_id));
        }
        let warehouse_ids: Vec<Ulid> = self
            .tenant_warehouses
            .get(&tenant_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut rows = Vec::new();
        for wid in warehouse_ids {
            let Some(warehouse) = self.warehouses.get(&wid).map(|e| e.value().clone()) else {
                continue;
            };
            let unit_ids: Vec<Ulid> = self
                .warehouse_units
                .get(&wid)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            let mut row = WarehouseUtilization {
                warehouse_id: wid,
                name: warehouse.name,
                total_units: 0,
                available_units: 0,
                occupied_units: 0,
                booked_units: 0,
            };
            for uid in unit_ids {
                let Some(arc) = self.get_unit_shared(&uid) else {
                    continue;
                };
                let unit = arc.read().await;
                row.total_units += 1;
                match unit.status {
                    UnitStatus::Available => row.available_units += 1,
                    UnitStatus::Occupied => row.occupied_units += 1,
                    UnitStatus::Booked => row.booked_units += 1,
                }
            }
            rows.push(row);
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}
