//! Reservation invariant audit
//!
//! Active reservations against a lot must never exceed its physical stock.
//! The audit reads every lot balance and reports the ones that break this.

use issue_shared::LotBalance;
use serde::Serialize;
use tracing::{error, info};

use crate::error::AppResult;
use crate::store::{InventoryStore, LedgerTx, StoreTx};

/// Outcome of one audit run
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub lots_checked: usize,
    pub oversubscribed: Vec<LotBalance>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.oversubscribed.is_empty()
    }
}

/// Audit service
#[derive(Clone)]
pub struct AuditService<S> {
    store: S,
}

impl<S: InventoryStore> AuditService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Check every lot
    pub async fn audit_reservations(&self) -> AppResult<AuditReport> {
        let mut tx = self.store.begin().await?;
        let balances = tx.lot_balances(None).await?;
        tx.rollback().await?;

        let lots_checked = balances.len();
        let oversubscribed: Vec<LotBalance> = balances
            .into_iter()
            .filter(LotBalance::is_oversubscribed)
            .collect();

        for lot in &oversubscribed {
            error!(
                material_id = %lot.material_id,
                lot_number = %lot.lot_number,
                physical = %lot.physical_stock,
                reserved = %lot.reserved,
                "Lot is oversubscribed"
            );
        }
        info!(lots_checked, violations = oversubscribed.len(), "Reservation audit finished");

        Ok(AuditReport {
            lots_checked,
            oversubscribed,
        })
    }
}
