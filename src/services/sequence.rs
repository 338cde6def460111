use crate::entities::id_sequence;
use crate::errors::ServiceError;
use crate::services::ServiceContext;
use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{EntityTrait, Set};
use tracing::{debug, instrument, warn};

/// Whether a counter restarts every UTC day or runs forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceScope {
    Daily,
    Global,
}

impl SequenceScope {
    /// `YYMMDD` for daily counters, the literal `global` otherwise.
    pub fn key(self, now: DateTime<Utc>) -> String {
        match self {
            Self::Daily => now.format("%y%m%d").to_string(),
            Self::Global => "global".to_string(),
        }
    }
}

/// Identifier families handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Product,
    Unit,
    Order,
    PurchaseOrder,
    StockMovement,
    OrderItem,
    RawMaterial,
    Supplier,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Product => "PRO",
            Self::Unit => "QR",
            Self::Order => "ORD",
            Self::PurchaseOrder => "PO",
            Self::StockMovement => "MOV",
            Self::OrderItem => "ITEM",
            Self::RawMaterial => "RM",
            Self::Supplier => "SUP",
        }
    }

    pub fn scope(self) -> SequenceScope {
        match self {
            Self::OrderItem | Self::RawMaterial | Self::Supplier => SequenceScope::Global,
            _ => SequenceScope::Daily,
        }
    }
}

/// `PREFIX-SCOPE-NNN`, zero-padded to three digits; wider numbers print in full.
pub fn format_id(prefix: &str, scope_key: &str, sequence: i64) -> String {
    format!("{}-{}-{:03}", prefix, scope_key, sequence)
}

/// Used when the counter store is unavailable: `PREFIX-<unix millis>-<4 random digits>`.
pub fn fallback_id(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{}-{}-{:04}", prefix, now.timestamp_millis(), suffix)
}

#[derive(Clone, Debug)]
pub struct SequenceService {
    ctx: ServiceContext,
}

impl SequenceService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Next identifier of the given family.
    pub async fn next(&self, kind: IdKind) -> String {
        self.next_id(kind.prefix(), kind.scope()).await
    }

    /// Allocates `count` identifiers, one counter increment each.
    pub async fn next_many(&self, kind: IdKind, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.next(kind).await);
        }
        ids
    }

    /// Never fails: store errors and timeouts degrade to [`fallback_id`].
    #[instrument(skip(self))]
    pub async fn next_id(&self, prefix: &str, scope: SequenceScope) -> String {
        let now = Utc::now();
        let scope_key = scope.key(now);

        match self.allocate(prefix, &scope_key, now).await {
            Ok(sequence) => {
                let id = format_id(prefix, &scope_key, sequence);
                debug!(%id, "Allocated sequential id");
                id
            }
            Err(e) => {
                let id = fallback_id(prefix, now);
                counter!("carpet_inventory.sequence.fallback", 1, "prefix" => prefix.to_string());
                warn!(error = %e, %id, "Sequence allocation failed; using fallback id");
                id
            }
        }
    }

    /// One atomic upsert-with-increment; the returned row carries the new value.
    async fn allocate(
        &self,
        prefix: &str,
        scope_key: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, ServiceError> {
        let row = id_sequence::ActiveModel {
            prefix: Set(prefix.to_string()),
            scope: Set(scope_key.to_string()),
            last_sequence: Set(1),
            updated_at: Set(now),
        };

        let on_conflict = OnConflict::columns([
            id_sequence::Column::Prefix,
            id_sequence::Column::Scope,
        ])
        .value(
            id_sequence::Column::LastSequence,
            Expr::col((id_sequence::Entity, id_sequence::Column::LastSequence)).add(1),
        )
        .update_column(id_sequence::Column::UpdatedAt)
        .to_owned();

        let db = self.ctx.db.clone();
        let model = self
            .ctx
            .write(async move {
                id_sequence::Entity::insert(row)
                    .on_conflict(on_conflict)
                    .exec_with_returning(db.as_ref())
                    .await
                    .map_err(|e| ServiceError::TransientStore(e.to_string()))
            })
            .await?;

        Ok(model.last_sequence)
    }
}
