use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{apply_to_booking, apply_to_unit, Depot, DepotError, WalCommand};

/// Creation-time date rules. `end < start` is never valid; an end date in
/// the past would create a booking already due for expiry notices.
pub(super) fn validate_booking_dates(
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
) -> Result<(), DepotError> {
    if end < start {
        return Err(DepotError::InvalidState("end date before start date"));
    }
    if end < today {
        return Err(DepotError::InvalidState("end date is in the past"));
    }
    if (end - start).num_days() > MAX_BOOKING_SPAN_DAYS {
        return Err(DepotError::LimitExceeded("booking span too long"));
    }
    Ok(())
}

impl Depot {
    pub async fn create_tenant(
        &self,
        company_name: String,
        contact_email: String,
    ) -> Result<Tenant, DepotError> {
        if company_name.trim().is_empty() || contact_email.trim().is_empty() {
            return Err(DepotError::InvalidState("tenant fields must not be empty"));
        }
        if company_name.len() > MAX_NAME_LEN || contact_email.len() > MAX_NAME_LEN {
            return Err(DepotError::LimitExceeded("tenant field too long"));
        }

        let id = Ulid::new();
        let event = Event::TenantCreated {
            id,
            company_name: company_name.clone(),
            contact_email: contact_email.clone(),
        };
        let _commit = self.commit_barrier.read().await;
        self.wal_append(vec![event]).await?;
        let tenant = Tenant { id, company_name, contact_email };
        self.tenants.insert(id, tenant.clone());
        Ok(tenant)
    }

    pub async fn create_warehouse(
        &self,
        tenant_id: Ulid,
        name: String,
        location: String,
    ) -> Result<Warehouse, DepotError> {
        if name.trim().is_empty() || location.trim().is_empty() {
            return Err(DepotError::InvalidState("warehouse fields must not be empty"));
        }
        if name.len() > MAX_NAME_LEN || location.len() > MAX_NAME_LEN {
            return Err(DepotError::LimitExceeded("warehouse field too long"));
        }
        if !self.tenants.contains_key(&tenant_id) {
            return Err(DepotError::NotFound("tenant", tenant_id));
        }
        if let Some(owned) = self.tenant_warehouses.get(&tenant_id)
            && owned.len() >= MAX_WAREHOUSES_PER_TENANT {
                return Err(DepotError::LimitExceeded("too many warehouses for tenant"));
            }

        let id = Ulid::new();
        let event = Event::WarehouseCreated {
            id,
            tenant_id,
            name: name.clone(),
            location: location.clone(),
        };
        let _commit = self.commit_barrier.read().await;
        self.wal_append(vec![event]).await?;
        let warehouse = Warehouse { id, tenant_id, name, location };
        self.warehouses.insert(id, warehouse.clone());
        self.tenant_warehouses.entry(tenant_id).or_default().push(id);
        Ok(warehouse)
    }

    pub async fn create_customer(
        &self,
        tenant_id: Ulid,
        company_name: String,
        contact_email: String,
    ) -> Result<Customer, DepotError> {
        if company_name.trim().is_empty() || contact_email.trim().is_empty() {
            return Err(DepotError::InvalidState("customer fields must not be empty"));
        }
        if company_name.len() > MAX_NAME_LEN || contact_email.len() > MAX_NAME_LEN {
            return Err(DepotError::LimitExceeded("customer field too long"));
        }
        if !self.tenants.contains_key(&tenant_id) {
            return Err(DepotError::NotFound("tenant", tenant_id));
        }

        let id = Ulid::new();
        let event = Event::CustomerCreated {
            id,
            tenant_id,
            company_name: company_name.clone(),
            contact_email: contact_email.clone(),
        };
        let _commit = self.commit_barrier.read().await;
        self.wal_append(vec![event]).await?;
        let customer = Customer { id, tenant_id, company_name, contact_email };
        self.customers.insert(id, customer.clone());
        Ok(customer)
    }

    pub async fn create_unit(
        &self,
        tenant_id: Ulid,
        warehouse_id: Ulid,
        unit_number: String,
        capacity_kg: u32,
    ) -> Result<StorageUnit, DepotError> {
        if unit_number.trim().is_empty() {
            return Err(DepotError::InvalidState("unit number must not be empty"));
        }
        if unit_number.len() > MAX_NAME_LEN {
            return Err(DepotError::LimitExceeded("unit number too long"));
        }
        if capacity_kg == 0 {
            return Err(DepotError::InvalidState("capacity must be positive"));
        }
        if capacity_kg > MAX_CAPACITY_KG {
            return Err(DepotError::LimitExceeded("capacity too large"));
        }
        let warehouse = self
            .warehouses
            .get(&warehouse_id)
            .map(|e| e.value().clone())
            .ok_or(DepotError::NotFound("warehouse", warehouse_id))?;
        if warehouse.tenant_id != tenant_id {
            return Err(DepotError::Unauthorized("warehouse", warehouse_id));
        }
        if let Some(units) = self.warehouse_units.get(&warehouse_id)
            && units.len() >= MAX_UNITS_PER_WAREHOUSE {
                return Err(DepotError::LimitExceeded("too many units in warehouse"));
            }

        let id = Ulid::new();
        let event = Event::UnitCreated {
            id,
            warehouse_id,
            unit_number: unit_number.clone(),
            capacity_kg,
        };
        let _commit = self.commit_barrier.read().await;
        self.wal_append(vec![event]).await?;
        let unit = StorageUnit::new(id, warehouse_id, unit_number, capacity_kg);
        self.units.insert(id, Arc::new(RwLock::new(unit.clone())));
        self.warehouse_units.entry(warehouse_id).or_default().push(id);
        metrics::gauge!(crate::observability::UNITS_TOTAL).increment(1.0);
        Ok(unit)
    }

    /// Conflict-safe booking allocation.
    ///
    /// Phase A reads the unit and captures the version the commit must find;
    /// phase B re-acquires the unit for write and commits only if the version
    /// is untouched. The booking insert and the unit flip to `Occupied` go to
    /// the WAL as one commit frame, so they land together or not at all.
    ///
    /// A racer that loses phase B gets `Conflict`; a racer that starts after
    /// the winner committed sees the unit already occupied and gets
    /// `InvalidState`. Either way exactly one attempt wins.
    pub async fn allocate_booking(
        &self,
        tenant_id: Ulid,
        customer_id: Ulid,
        unit_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        monthly_rate: Decimal,
    ) -> Result<Booking, DepotError> {
        validate_booking_dates(start_date, end_date, Utc::now().date_naive())?;
        if monthly_rate <= Decimal::ZERO {
            return Err(DepotError::InvalidState("monthly rate must be positive"));
        }

        let customer = self
            .customers
            .get(&customer_id)
            .map(|e| e.value().clone())
            .ok_or(DepotError::NotFound("customer", customer_id))?;
        if customer.tenant_id != tenant_id {
            return Err(DepotError::Unauthorized("customer", customer_id));
        }

        // Phase A: snapshot the unit and capture the version to condition on.
        let unit_arc = self
            .get_unit_shared(&unit_id)
            .ok_or(DepotError::NotFound("unit", unit_id))?;
        let (expected_version, warehouse_id) = {
            let guard = unit_arc.read().await;
            if guard.status != UnitStatus::Available {
                return Err(DepotError::InvalidState("unit is not available"));
            }
            (guard.version, guard.warehouse_id)
        };
        let warehouse = self
            .warehouses
            .get(&warehouse_id)
            .map(|e| e.value().clone())
            .ok_or(DepotError::NotFound("warehouse", warehouse_id))?;
        if warehouse.tenant_id != tenant_id {
            return Err(DepotError::Unauthorized("unit", unit_id));
        }

        // Phase B: commit under the write lock, conditioned on the version.
        let _commit = self.commit_barrier.read().await;
        let mut guard = unit_arc.write().await;
        if guard.version != expected_version {
            metrics::counter!(crate::observability::ALLOCATION_CONFLICTS_TOTAL).increment(1);
            return Err(DepotError::Conflict("unit", unit_id));
        }

        let booking = Booking::new(
            Ulid::new(),
            customer_id,
            unit_id,
            start_date,
            end_date,
            monthly_rate,
            Utc::now(),
        );
        let events = vec![
            Event::BookingCreated {
                id: booking.id,
                customer_id,
                unit_id,
                start_date,
                end_date,
                monthly_rate,
                created_at: booking.created_at,
            },
            Event::UnitUpdated {
                id: unit_id,
                capacity_kg: guard.capacity_kg,
                status: UnitStatus::Occupied,
                version: guard.version + 1,
            },
        ];
        self.wal_append(events.clone()).await?;
        self.bookings.insert(booking.id, Arc::new(RwLock::new(booking.clone())));
        apply_to_unit(&mut guard, &events[1]);

        metrics::counter!(crate::observability::BOOKINGS_ALLOCATED_TOTAL).increment(1);
        metrics::gauge!(crate::observability::BOOKINGS_ACTIVE).increment(1.0);
        Ok(booking)
    }

    /// Version-conditioned management update of a unit's capacity and status.
    /// Capacity may never shrink while the unit backs a booking.
    pub async fn update_unit(
        &self,
        tenant_id: Ulid,
        unit_id: Ulid,
        expected_version: u64,
        capacity_kg: u32,
        status: UnitStatus,
    ) -> Result<StorageUnit, DepotError> {
        if capacity_kg == 0 {
            return Err(DepotError::InvalidState("capacity must be positive"));
        }
        if capacity_kg > MAX_CAPACITY_KG {
            return Err(DepotError::LimitExceeded("capacity too large"));
        }
        let unit_arc = self
            .get_unit_shared(&unit_id)
            .ok_or(DepotError::NotFound("unit", unit_id))?;
        let _commit = self.commit_barrier.read().await;
        let mut guard = unit_arc.write().await;
        let warehouse = self
            .warehouses
            .get(&guard.warehouse_id)
            .map(|e| e.value().clone())
            .ok_or(DepotError::NotFound("warehouse", guard.warehouse_id))?;
        if warehouse.tenant_id != tenant_id {
            return Err(DepotError::Unauthorized("unit", unit_id));
        }
        if guard.version != expected_version {
            return Err(DepotError::Conflict("unit", unit_id));
        }
        if capacity_kg < guard.capacity_kg && guard.status.is_held() {
            return Err(DepotError::InvalidState("cannot reduce capacity while unit is occupied"));
        }

        let event = Event::UnitUpdated {
            id: unit_id,
            capacity_kg,
            status,
            version: guard.version + 1,
        };
        self.persist_and_apply_unit(&mut guard, event).await?;
        Ok(guard.clone())
    }

    /// Version-conditioned lifecycle update of a booking. Moving to a
    /// terminal status releases the unit back to `Available` in the same
    /// commit frame.
    pub async fn update_booking(
        &self,
        tenant_id: Ulid,
        booking_id: Ulid,
        expected_version: u64,
        status: BookingStatus,
        end_date: NaiveDate,
        monthly_rate: Decimal,
    ) -> Result<Booking, DepotError> {
        if monthly_rate <= Decimal::ZERO {
            return Err(DepotError::InvalidState("monthly rate must be positive"));
        }
        let booking_arc = self
            .get_booking_shared(&booking_id)
            .ok_or(DepotError::NotFound("booking", booking_id))?;
        let _commit = self.commit_barrier.read().await;
        let mut booking = booking_arc.write().await;

        let customer = self
            .customers
            .get(&booking.customer_id)
            .map(|e| e.value().clone())
            .ok_or(DepotError::NotFound("customer", booking.customer_id))?;
        if customer.tenant_id != tenant_id {
            return Err(DepotError::Unauthorized("booking", booking_id));
        }
        if booking.version != expected_version {
            return Err(DepotError::Conflict("booking", booking_id));
        }
        if booking.status.is_terminal() {
            return Err(DepotError::InvalidState("booking is not active"));
        }
        if end_date < booking.start_date {
            return Err(DepotError::InvalidState("end date before start date"));
        }

        let booking_event = Event::BookingUpdated {
            id: booking_id,
            status,
            end_date,
            monthly_rate,
            version: booking.version + 1,
        };

        if status.is_terminal() {
            // Booking and unit release must land in one commit frame.
            // Lock order is always booking → unit; the allocator only ever
            // holds the unit lock, so this cannot deadlock.
            let unit_arc = self
                .get_unit_shared(&booking.unit_id)
                .ok_or(DepotError::NotFound("unit", booking.unit_id))?;
            let mut unit = unit_arc.write().await;
            let events = vec![
                booking_event,
                Event::UnitUpdated {
                    id: unit.id,
                    capacity_kg: unit.capacity_kg,
                    status: UnitStatus::Available,
                    version: unit.version + 1,
                },
            ];
            self.wal_append(events.clone()).await?;
            apply_to_booking(&mut booking, &events[0]);
            apply_to_unit(&mut unit, &events[1]);
            metrics::gauge!(crate::observability::BOOKINGS_ACTIVE).decrement(1.0);
        } else {
            self.persist_and_apply_booking(&mut booking, booking_event).await?;
        }

        Ok(booking.clone())
    }

    /// Advance a booking's notification status. The transition must be a
    /// legal forward edge and the caller must hold the current version.
    /// `bump_retry` is set only by retry-run failures.
    pub async fn mark_notification(
        &self,
        booking_id: Ulid,
        expected_version: u64,
        next: NotificationStatus,
        bump_retry: bool,
    ) -> Result<Booking, DepotError> {
        let booking_arc = self
            .get_booking_shared(&booking_id)
            .ok_or(DepotError::NotFound("booking", booking_id))?;
        let _commit = self.commit_barrier.read().await;
        let mut booking = booking_arc.write().await;

        if booking.version != expected_version {
            return Err(DepotError::Conflict("booking", booking_id));
        }
        if !booking.notification_status.can_advance_to(next) {
            return Err(DepotError::InvalidState("notification status cannot advance"));
        }

        let retry_count = booking.retry_count + u32::from(bump_retry);
        let event = Event::NotificationMarked {
            id: booking_id,
            status: next,
            retry_count,
            version: booking.version + 1,
        };
        self.persist_and_apply_booking(&mut booking, event).await?;
        Ok(booking.clone())
    }

    /// Compact the WAL by rewriting it with only the commits needed to
    /// recreate the current state: one commit per record. Commit traffic is
    /// held out for the whole snapshot + rewrite.
    pub async fn compact_wal(&self) -> Result<(), DepotError> {
        // Exclusive: in-flight commits finish their apply before the
        // snapshot is taken, and none start until the rewrite is on disk.
        let _quiesce = self.commit_barrier.write().await;
        let mut commits: Vec<Vec<Event>> = Vec::new();

        for entry in self.tenants.iter() {
            let t = entry.value();
            commits.push(vec![Event::TenantCreated {
                id: t.id,
                company_name: t.company_name.clone(),
                contact_email: t.contact_email.clone(),
            }]);
        }
        for entry in self.warehouses.iter() {
            let w = entry.value();
            commits.push(vec![Event::WarehouseCreated {
                id: w.id,
                tenant_id: w.tenant_id,
                name: w.name.clone(),
                location: w.location.clone(),
            }]);
        }
        for entry in self.customers.iter() {
            let c = entry.value();
            commits.push(vec![Event::CustomerCreated {
                id: c.id,
                tenant_id: c.tenant_id,
                company_name: c.company_name.clone(),
                contact_email: c.contact_email.clone(),
            }]);
        }

        // Collect the Arcs first; awaiting a lock while iterating a DashMap
        // would hold a shard lock across the await.
        let unit_arcs: Vec<_> = self.units.iter().map(|e| e.value().clone()).collect();
        for arc in unit_arcs {
            let u = arc.read().await.clone();
            let mut events = vec![Event::UnitCreated {
                id: u.id,
                warehouse_id: u.warehouse_id,
                unit_number: u.unit_number.clone(),
                capacity_kg: u.capacity_kg,
            }];
            if u.version > 0 {
                events.push(Event::UnitUpdated {
                    id: u.id,
                    capacity_kg: u.capacity_kg,
                    status: u.status,
                    version: u.version,
                });
            }
            commits.push(events);
        }

        let booking_arcs: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for arc in booking_arcs {
            let b = arc.read().await.clone();
            let mut events = vec![Event::BookingCreated {
                id: b.id,
                customer_id: b.customer_id,
                unit_id: b.unit_id,
                start_date: b.start_date,
                end_date: b.end_date,
                monthly_rate: b.monthly_rate,
                created_at: b.created_at,
            }];
            if b.version > 0 {
                events.push(Event::BookingUpdated {
                    id: b.id,
                    status: b.status,
                    end_date: b.end_date,
                    monthly_rate: b.monthly_rate,
                    version: b.version,
                });
            }
            if b.notification_status != NotificationStatus::Pending || b.retry_count > 0 {
                events.push(Event::NotificationMarked {
                    id: b.id,
                    status: b.notification_status,
                    retry_count: b.retry_count,
                    version: b.version,
                });
            }
            commits.push(events);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| DepotError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| DepotError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| DepotError::WalError(e.to_string()))
    }

    pub async fn wal_commits_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::CommitsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
