use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Occupancy status of a storage unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Available,
    Occupied,
    Booked,
}

impl UnitStatus {
    /// A unit that currently backs a booking cannot shrink or be handed out.
    pub fn is_held(self) -> bool {
        matches!(self, UnitStatus::Occupied | UnitStatus::Booked)
    }
}

/// Lifecycle status of a booking. Only `Active` bookings feed the
/// expiry-notification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Active)
    }
}

/// Where a booking sits in the expiry-notification state machine.
///
/// Edges: `Pending → {Processed, Failed}`, `Failed → {Processed, Failed,
/// Abandoned}`. `Processed` and `Abandoned` are terminal; the status never
/// regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Pending,
    Processed,
    Failed,
    Abandoned,
}

impl NotificationStatus {
    pub fn can_advance_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Processed)
                | (Pending, Failed)
                | (Failed, Processed)
                | (Failed, Failed)
                | (Failed, Abandoned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NotificationStatus::Processed | NotificationStatus::Abandoned)
    }
}

// ── Records ──────────────────────────────────────────────────────

/// A paying operator of warehouses. Directory record, written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Ulid,
    pub company_name: String,
    pub contact_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: String,
    pub location: String,
}

/// A customer of a tenant. Every booking joins through one for the tenancy
/// check and for notice addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub company_name: String,
    pub contact_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnit {
    pub id: Ulid,
    pub warehouse_id: Ulid,
    /// Human label, e.g. "A-101".
    pub unit_number: String,
    pub capacity_kg: u32,
    pub status: UnitStatus,
    /// Bumped by exactly 1 on every committed update. Conditional writes
    /// name the version they read; a mismatch is a conflict.
    pub version: u64,
}

impl StorageUnit {
    pub fn new(id: Ulid, warehouse_id: Ulid, unit_number: String, capacity_kg: u32) -> Self {
        Self {
            id,
            warehouse_id,
            unit_number,
            capacity_kg,
            status: UnitStatus::Available,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub unit_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub monthly_rate: Decimal,
    pub status: BookingStatus,
    pub version: u64,
    pub notification_status: NotificationStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(
        id: Ulid,
        customer_id: Ulid,
        unit_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        monthly_rate: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            customer_id,
            unit_id,
            start_date,
            end_date,
            monthly_rate,
            status: BookingStatus::Active,
            version: 0,
            notification_status: NotificationStatus::Pending,
            retry_count: 0,
            created_at,
        }
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
///
/// A WAL frame carries one commit (`Vec<Event>`); an allocation commits the
/// booking insert and the unit flip in a single frame so a crash can never
/// persist one without the other. Update events carry the absolute
/// post-state (including the new version) so replay is mechanical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TenantCreated {
        id: Ulid,
        company_name: String,
        contact_email: String,
    },
    WarehouseCreated {
        id: Ulid,
        tenant_id: Ulid,
        name: String,
        location: String,
    },
    CustomerCreated {
        id: Ulid,
        tenant_id: Ulid,
        company_name: String,
        contact_email: String,
    },
    UnitCreated {
        id: Ulid,
        warehouse_id: Ulid,
        unit_number: String,
        capacity_kg: u32,
    },
    UnitUpdated {
        id: Ulid,
        capacity_kg: u32,
        status: UnitStatus,
        version: u64,
    },
    BookingCreated {
        id: Ulid,
        customer_id: Ulid,
        unit_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        monthly_rate: Decimal,
        created_at: DateTime<Utc>,
    },
    BookingUpdated {
        id: Ulid,
        status: BookingStatus,
        end_date: NaiveDate,
        monthly_rate: Decimal,
        version: u64,
    },
    NotificationMarked {
        id: Ulid,
        status: NotificationStatus,
        retry_count: u32,
        version: u64,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One row of the expiry scan: everything the dispatcher needs to compose a
/// notice and conditionally mark its outcome, with no further reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringBooking {
    pub booking_id: Ulid,
    pub tenant_id: Ulid,
    pub customer_company: String,
    pub customer_email: String,
    pub warehouse_name: String,
    pub unit_number: String,
    pub capacity_kg: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub monthly_rate: Decimal,
    pub notification_status: NotificationStatus,
    pub retry_count: u32,
    /// Version of the booking at scan time; status writes are conditioned
    /// on it.
    pub booking_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableUnit {
    pub id: Ulid,
    pub warehouse_id: Ulid,
    pub warehouse_name: String,
    pub unit_number: String,
    pub capacity_kg: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseUtilization {
    pub warehouse_id: Ulid,
    pub name: String,
    pub total_units: usize,
    pub available_units: usize,
    pub occupied_units: usize,
    pub booked_units: usize,
}
