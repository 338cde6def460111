// Leaf services
pub mod sequence;
pub mod stock_ledger;

// Inventory units and catalogue
pub mod products;
pub mod units;

// Order fulfillment
pub mod orders;
pub mod settlement;

// Procurement
pub mod purchase_orders;
pub mod raw_materials;
pub mod suppliers;

use crate::db::{bounded, DbPool};
use crate::errors::ServiceError;
use crate::events::EventSender;
use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseTransaction, TransactionTrait};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Handles every service shares: the pool, the notification channel and the
/// upper bound for a single store round-trip.
///
/// On SQLite every write goes through `write_gate`. SQLite has no row locks and a
/// transaction that read before another connection committed cannot upgrade to a
/// writer, so writers take turns in-process instead. Postgres relies on the
/// `FOR UPDATE` row locks taken inside the transactions.
#[derive(Clone, Debug)]
pub struct ServiceContext {
    pub db: Arc<DbPool>,
    pub events: EventSender,
    pub store_timeout: Duration,
    write_gate: Option<Arc<Mutex<()>>>,
}

impl ServiceContext {
    pub fn new(db: Arc<DbPool>, events: EventSender, store_timeout: Duration) -> Self {
        let write_gate = (db.get_database_backend() == DatabaseBackend::Sqlite)
            .then(|| Arc::new(Mutex::new(())));
        Self {
            db,
            events,
            store_timeout,
            write_gate,
        }
    }

    /// Runs `f` in a transaction bounded by the store timeout. Nothing else may use
    /// the pool or the write gate while the closure runs; allocate sequence ids
    /// before calling this.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, ServiceError>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            )
                -> Pin<Box<dyn Future<Output = Result<T, ServiceError>> + Send + 'c>>
            + Send,
        T: Send,
    {
        let db = self.db.clone();
        self.write(async move {
            db.transaction::<_, T, ServiceError>(f)
                .await
                .map_err(ServiceError::from)
        })
        .await
    }

    /// Bounds a single-statement write, queueing behind the write gate when there is one.
    pub async fn write<T, F>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        let gate = self.write_gate.clone();
        bounded(self.store_timeout, async move {
            let _turn = match &gate {
                Some(gate) => Some(gate.lock().await),
                None => None,
            };
            fut.await
        })
        .await
    }

    /// Bounds a non-transactional store call.
    pub async fn bounded<T, F>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        bounded(self.store_timeout, fut).await
    }
}

/// Removes duplicates, keeping first-seen order.
pub fn dedup_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(Into::into)
        .filter(|id: &String| seen.insert(id.clone()))
        .collect()
}

pub(crate) fn ensure_non_negative(field: &str, value: Decimal) -> Result<(), ServiceError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ServiceError::ValidationError(format!(
            "{} must not be negative",
            field
        )));
    }
    Ok(())
}

/// Page/limit pair used by the list operations.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u64,
    pub per_page: u64,
}

impl PageRequest {
    pub const MAX_PER_PAGE: u64 = 100;

    pub fn new(page: u64, per_page: u64) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    /// Zero-based page index as used by sea-orm paginators.
    pub fn index(&self) -> u64 {
        self.page - 1
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let ids = dedup_ids(["QR-2", "QR-1", "QR-2", "QR-3", "QR-1"]);
        assert_eq!(ids, vec!["QR-2", "QR-1", "QR-3"]);
    }

    #[test]
    fn page_request_is_clamped() {
        let page = PageRequest::new(0, 1000);
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, PageRequest::MAX_PER_PAGE);
        assert_eq!(page.index(), 0);
    }
}
