//! Hard caps on inputs. Everything that crosses the public API is checked
//! against these before it can touch the WAL.

/// Max length of any free-text field (names, emails, locations, unit numbers).
pub const MAX_NAME_LEN: usize = 256;

/// Max warehouses a single tenant may own.
pub const MAX_WAREHOUSES_PER_TENANT: usize = 1_000;

/// Max storage units in a single warehouse.
pub const MAX_UNITS_PER_WAREHOUSE: usize = 10_000;

/// Max unit capacity in kilograms.
pub const MAX_CAPACITY_KG: u32 = 1_000_000;

/// Max rows a single scan page may request.
pub const MAX_SCAN_LIMIT: usize = 500;

/// Max days a booking may span end-to-end.
pub const MAX_BOOKING_SPAN_DAYS: i64 = 3_650;
