mod error;
mod mutations;
mod queries;

pub use error::DepotError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedUnit = Arc<RwLock<StorageUnit>>;
pub type SharedBooking = Arc<RwLock<Booking>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Vec<Event>>,
        response: oneshot::Sender<io::Result<()>>,
    },
    CommitsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn flush_batch(wal: &mut Wal, batch: &mut [PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::CommitsSinceCompact { response } => {
            let _ = response.send(wal.commits_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking engine: all tables, the WAL writer handle, and the tenancy
/// indexes. One per process, one WAL file.
pub struct Depot {
    pub(super) tenants: DashMap<Ulid, Tenant>,
    pub(super) warehouses: DashMap<Ulid, Warehouse>,
    pub(super) customers: DashMap<Ulid, Customer>,
    pub(super) units: DashMap<Ulid, SharedUnit>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    /// Tenant → warehouse ids, for tenant-scoped queries.
    pub(super) tenant_warehouses: DashMap<Ulid, Vec<Ulid>>,
    /// Warehouse → unit ids.
    pub(super) warehouse_units: DashMap<Ulid, Vec<Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Every commit holds this shared across its WAL append + apply;
    /// compaction holds it exclusively across snapshot + rewrite, so the
    /// rewritten WAL can never miss or tear an acked commit. Always acquired
    /// before any record lock.
    pub(super) commit_barrier: RwLock<()>,
}

/// Apply an update event to a unit (no locking — caller holds the lock).
fn apply_to_unit(unit: &mut StorageUnit, event: &Event) {
    if let Event::UnitUpdated { capacity_kg, status, version, .. } = event {
        unit.capacity_kg = *capacity_kg;
        unit.status = *status;
        unit.version = *version;
    }
}

/// Apply an update event to a booking (no locking — caller holds the lock).
fn apply_to_booking(booking: &mut Booking, event: &Event) {
    match event {
        Event::BookingUpdated { status, end_date, monthly_rate, version, .. } => {
            booking.status = *status;
            booking.end_date = *end_date;
            booking.monthly_rate = *monthly_rate;
            booking.version = *version;
        }
        Event::NotificationMarked { status, retry_count, version, .. } => {
            booking.notification_status = *status;
            booking.retry_count = *retry_count;
            booking.version = *version;
        }
        _ => {}
    }
}

impl Depot {
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let depot = Self {
            tenants: DashMap::new(),
            warehouses: DashMap::new(),
            customers: DashMap::new(),
            units: DashMap::new(),
            bookings: DashMap::new(),
            tenant_warehouses: DashMap::new(),
            warehouse_units: DashMap::new(),
            wal_tx,
            commit_barrier: RwLock::new(()),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for commit in &commits {
            for event in commit {
                depot.apply_replayed(event);
            }
        }

        // Gauges restart at zero on boot; reseed them from the replayed
        // tables so the exporter doesn't report an empty engine.
        metrics::gauge!(crate::observability::UNITS_TOTAL).set(depot.units.len() as f64);
        let active = depot
            .bookings
            .iter()
            .filter(|entry| {
                entry.value().try_read().expect("replay: uncontended read").status
                    == BookingStatus::Active
            })
            .count();
        metrics::gauge!(crate::observability::BOOKINGS_ACTIVE).set(active as f64);

        Ok(depot)
    }

    fn apply_replayed(&self, event: &Event) {
        match event {
            Event::TenantCreated { id, company_name, contact_email } => {
                self.tenants.insert(
                    *id,
                    Tenant {
                        id: *id,
                        company_name: company_name.clone(),
                        contact_email: contact_email.clone(),
                    },
                );
            }
            Event::WarehouseCreated { id, tenant_id, name, location } => {
                self.warehouses.insert(
                    *id,
                    Warehouse {
                        id: *id,
                        tenant_id: *tenant_id,
                        name: name.clone(),
                        location: location.clone(),
                    },
                );
                self.tenant_warehouses.entry(*tenant_id).or_default().push(*id);
            }
            Event::CustomerCreated { id, tenant_id, company_name, contact_email } => {
                self.customers.insert(
                    *id,
                    Customer {
                        id: *id,
                        tenant_id: *tenant_id,
                        company_name: company_name.clone(),
                        contact_email: contact_email.clone(),
                    },
                );
            }
            Event::UnitCreated { id, warehouse_id, unit_number, capacity_kg } => {
                let unit = StorageUnit::new(*id, *warehouse_id, unit_number.clone(), *capacity_kg);
                self.units.insert(*id, Arc::new(RwLock::new(unit)));
                self.warehouse_units.entry(*warehouse_id).or_default().push(*id);
            }
            Event::UnitUpdated { id, .. } => {
                if let Some(entry) = self.units.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_unit(&mut guard, event);
                }
            }
            Event::BookingCreated {
                id,
                customer_id,
                unit_id,
                start_date,
                end_date,
                monthly_rate,
                created_at,
            } => {
                let booking = Booking::new(
                    *id,
                    *customer_id,
                    *unit_id,
                    *start_date,
                    *end_date,
                    *monthly_rate,
                    *created_at,
                );
                self.bookings.insert(*id, Arc::new(RwLock::new(booking)));
            }
            Event::BookingUpdated { id, .. } | Event::NotificationMarked { id, .. } => {
                if let Some(entry) = self.bookings.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_booking(&mut guard, event);
                }
            }
        }
    }

    /// Write a commit to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, events: Vec<Event>) -> Result<(), DepotError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| DepotError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| DepotError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| DepotError::WalError(e.to_string()))
    }

    pub(super) fn get_unit_shared(&self, id: &Ulid) -> Option<SharedUnit> {
        self.units.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_booking_shared(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// WAL-append a single-event commit + apply to a locked unit. The
    /// caller holds a shared `commit_barrier` permit.
    pub(super) async fn persist_and_apply_unit(
        &self,
        unit: &mut StorageUnit,
        event: Event,
    ) -> Result<(), DepotError> {
        self.wal_append(vec![event.clone()]).await?;
        apply_to_unit(unit, &event);
        Ok(())
    }

    /// WAL-append a single-event commit + apply to a locked booking. The
    /// caller holds a shared `commit_barrier` permit.
    pub(super) async fn persist_and_apply_booking(
        &self,
        booking: &mut Booking,
        event: Event,
    ) -> Result<(), DepotError> {
        self.wal_append(vec![event.clone()]).await?;
        apply_to_booking(booking, &event);
        Ok(())
    }
}
