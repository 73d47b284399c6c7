//! FEFO allocation engine
//!
//! Turns a demand vector into reservations against specific lots, earliest
//! expiry first. Runs inside the caller's transaction:
//!
//! 1. Cancel whatever the request already holds, so retries never stack.
//! 2. Walk materials in ascending id order; that order is the lock order every
//!    allocator shares, which keeps concurrent allocations deadlock free.
//! 3. For each lot, lock the row, then compute
//!    `available = physical_stock - active_reserved` with a running total kept
//!    for this pass, and take what is needed.
//! 4. Save the batch only if every material was covered.
//!
//! On `InsufficientStock` the transaction already holds the step-1
//! cancellations, so callers must discard it rather than commit.

use std::collections::HashMap;

use issue_shared::{Actor, AvailableLot, DemandVector, Reservation, Shortage};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::StoreTx;

/// Reason stamped on reservations released by a re-allocation
pub const REALLOCATION_REASON: &str = "Released for re-allocation";

/// Reserved quantity per (material, lot) as seen by the current pass
type ReservedCache = HashMap<(Uuid, String), Decimal>;

/// FEFO allocation engine
#[derive(Debug, Clone)]
pub struct AllocationEngine {
    reset_reason: String,
}

impl Default for AllocationEngine {
    fn default() -> Self {
        Self::new(REALLOCATION_REASON)
    }
}

impl AllocationEngine {
    pub fn new(reset_reason: impl Into<String>) -> Self {
        Self {
            reset_reason: reset_reason.into(),
        }
    }

    /// Reserve the full demand of one request or fail without saving anything.
    ///
    /// # Errors
    ///
    /// `AppError::InsufficientStock` listing every material that could not be
    /// covered. Store errors propagate unchanged.
    pub async fn allocate<T: StoreTx>(
        &self,
        tx: &mut T,
        request_id: Uuid,
        demand: &DemandVector,
        actor: Actor,
        note: Option<&str>,
    ) -> AppResult<Vec<Reservation>> {
        let released = tx.cancel_active(request_id, &self.reset_reason, actor).await?;
        if released > 0 {
            debug!(%request_id, released, "Released previous reservations");
        }

        let mut cache = ReservedCache::new();
        let mut batch = Vec::new();
        let mut shortages = Vec::new();

        // DemandVector iterates in ascending material id
        for (&material_id, &needed) in demand {
            if needed <= Decimal::ZERO {
                continue;
            }

            let lots = tx.list_available_lots(material_id).await?;
            let mut scan = LotScan {
                request_id,
                material_id,
                actor,
                note,
                cache: &mut cache,
                batch: &mut batch,
            };
            let remaining = scan.reserve(tx, &lots, needed).await?;

            if remaining > Decimal::ZERO {
                shortages.push(Shortage {
                    material_id,
                    needed,
                    available: needed - remaining,
                });
            }
        }

        if !shortages.is_empty() {
            for shortage in &shortages {
                debug!(
                    %request_id,
                    material_id = %shortage.material_id,
                    shortfall = %shortage.shortfall(),
                    "Material short"
                );
            }
            warn!(%request_id, short_materials = shortages.len(), "Allocation failed");
            return Err(AppError::InsufficientStock(shortages));
        }

        tx.save_batch(&batch).await?;
        info!(%request_id, reservations = batch.len(), "Allocated stock");

        Ok(batch)
    }
}

/// Lot walk for a single material
struct LotScan<'a> {
    request_id: Uuid,
    material_id: Uuid,
    actor: Actor,
    note: Option<&'a str>,
    cache: &'a mut ReservedCache,
    batch: &'a mut Vec<Reservation>,
}

impl LotScan<'_> {
    /// Reserve up to `needed` across `lots` in order; returns what is still missing
    async fn reserve<T: StoreTx>(
        &mut self,
        tx: &mut T,
        lots: &[AvailableLot],
        needed: Decimal,
    ) -> AppResult<Decimal> {
        let mut remaining = needed;

        for lot in lots {
            if remaining <= Decimal::ZERO {
                break;
            }

            let physical_stock = match tx.lock_lot(self.material_id, &lot.lot_number).await {
                Ok(stock) => stock,
                Err(AppError::LotNotFound { .. }) => {
                    debug!(
                        material_id = %self.material_id,
                        lot_number = %lot.lot_number,
                        "Lot disappeared before it could be locked, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let key = (self.material_id, lot.lot_number.clone());
            let reserved = match self.cache.get(&key) {
                Some(reserved) => *reserved,
                None => {
                    let reserved = tx
                        .sum_active_reserved(self.material_id, &lot.lot_number)
                        .await?;
                    self.cache.insert(key.clone(), reserved);
                    reserved
                }
            };

            let available = physical_stock - reserved;
            if available <= Decimal::ZERO {
                continue;
            }

            let take = available.min(remaining);
            self.cache.insert(key, reserved + take);
            self.batch.push(Reservation::active(
                self.request_id,
                self.material_id,
                lot.lot_number.clone(),
                take,
                self.actor,
                self.note.map(str::to_string),
            ));
            remaining -= take;

            debug!(
                material_id = %self.material_id,
                lot_number = %lot.lot_number,
                %take,
                %remaining,
                "Reserved from lot"
            );
        }

        Ok(remaining)
    }
}
