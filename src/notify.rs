//! Notice delivery seam.
//!
//! The pipeline emits expiry notices through the [`Notifier`] trait so the
//! transport stays swappable: structured log lines by default, a JSONL
//! outbox file for a downstream mailer to tail, and a scripted mock for
//! tests.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use ulid::Ulid;

use crate::model::ExpiringBooking;

/// Transient delivery failure. The pipeline absorbs these into the
/// booking's notification status; they never abort a batch.
#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notice delivery failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_expiry_notice(&self, notice: &ExpiringBooking) -> Result<(), NotifyError>;
}

// ── log transport ───────────────────────────────────────────────────────────

/// Writes each notice as a structured log line. The default transport.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_expiry_notice(&self, notice: &ExpiringBooking) -> Result<(), NotifyError> {
        tracing::info!(
            target: "stowage::notify",
            booking_id = %notice.booking_id,
            customer = %notice.customer_company,
            email = %notice.customer_email,
            warehouse = %notice.warehouse_name,
            unit = %notice.unit_number,
            end_date = %notice.end_date,
            retry_count = notice.retry_count,
            "expiry notice"
        );
        Ok(())
    }
}

// ── JSONL outbox ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct NoticeRecord<'a> {
    emitted_at: String,
    booking_id: String,
    tenant_id: String,
    customer_company: &'a str,
    customer_email: &'a str,
    warehouse_name: &'a str,
    unit_number: &'a str,
    capacity_kg: u32,
    start_date: NaiveDate,
    end_date: NaiveDate,
    monthly_rate: Decimal,
    retry_count: u32,
}

/// Appends one JSON line per notice to an outbox file. Flushed per notice so
/// a crash never loses an emitted line.
pub struct JsonlNotifier {
    out: Mutex<BufWriter<File>>,
}

impl JsonlNotifier {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn send_expiry_notice(&self, notice: &ExpiringBooking) -> Result<(), NotifyError> {
        let record = NoticeRecord {
            emitted_at: Utc::now().to_rfc3339(),
            booking_id: notice.booking_id.to_string(),
            tenant_id: notice.tenant_id.to_string(),
            customer_company: &notice.customer_company,
            customer_email: &notice.customer_email,
            warehouse_name: &notice.warehouse_name,
            unit_number: &notice.unit_number,
            capacity_kg: notice.capacity_kg,
            start_date: notice.start_date,
            end_date: notice.end_date,
            monthly_rate: notice.monthly_rate,
            retry_count: notice.retry_count,
        };
        let line = serde_json::to_string(&record).map_err(|e| NotifyError(e.to_string()))?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| NotifyError("outbox lock poisoned".into()))?;
        writeln!(out, "{line}").map_err(|e| NotifyError(e.to_string()))?;
        out.flush().map_err(|e| NotifyError(e.to_string()))?;
        Ok(())
    }
}

// ── scripted mock ───────────────────────────────────────────────────────────

/// Scripted notifier for tests. Outcomes are consumed in FIFO order; once
/// the script runs out every send succeeds. Every attempt is recorded,
/// successful or not.
#[derive(Default)]
pub struct MockNotifier {
    script: Mutex<VecDeque<Result<(), NotifyError>>>,
    attempts: Mutex<Vec<Ulid>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(Err(NotifyError("scripted failure".into())));
        }
    }

    pub fn succeed_next(&self, n: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(Ok(()));
        }
    }

    /// Booking ids of every attempted send, in order.
    pub fn attempts(&self) -> Vec<Ulid> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send_expiry_notice(&self, notice: &ExpiringBooking) -> Result<(), NotifyError> {
        self.attempts.lock().unwrap().push(notice.booking_id);
        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(()),
        }
    }
}
