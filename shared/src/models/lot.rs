//! Inventory lot models and FEFO ordering

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A received batch of one material, identified by (material_id, lot_number)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryLot {
    pub material_id: Uuid,
    pub lot_number: String,
    /// Running balance; raised by receipts, lowered only when a reservation is consumed
    pub physical_stock: Decimal,
    pub expiry_date: Option<NaiveDate>,
    pub received_at: DateTime<Utc>,
}

impl InventoryLot {
    pub fn as_available(&self) -> AvailableLot {
        AvailableLot {
            lot_number: self.lot_number.clone(),
            physical_stock: self.physical_stock,
            expiry_date: self.expiry_date,
        }
    }
}

/// Lot row as listed for allocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailableLot {
    pub lot_number: String,
    pub physical_stock: Decimal,
    pub expiry_date: Option<NaiveDate>,
}

/// First-expiry-first-out comparison.
///
/// Earlier expiry first, lots without an expiry date last, ties by lot number.
pub fn fefo_cmp(
    a_expiry: Option<NaiveDate>,
    a_lot: &str,
    b_expiry: Option<NaiveDate>,
    b_lot: &str,
) -> Ordering {
    let by_expiry = match (a_expiry, b_expiry) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_expiry.then_with(|| a_lot.cmp(b_lot))
}

/// Keep lots with positive stock and sort them FEFO
pub fn fefo_order(lots: impl IntoIterator<Item = AvailableLot>) -> Vec<AvailableLot> {
    let mut lots: Vec<AvailableLot> = lots
        .into_iter()
        .filter(|lot| lot.physical_stock > Decimal::ZERO)
        .collect();
    lots.sort_by(|a, b| fefo_cmp(a.expiry_date, &a.lot_number, b.expiry_date, &b.lot_number));
    lots
}

/// Physical vs reserved quantity of one lot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotBalance {
    pub material_id: Uuid,
    pub lot_number: String,
    pub expiry_date: Option<NaiveDate>,
    pub physical_stock: Decimal,
    /// Sum of active reservations against the lot
    pub reserved: Decimal,
}

impl LotBalance {
    pub fn available(&self) -> Decimal {
        (self.physical_stock - self.reserved).max(Decimal::ZERO)
    }

    /// True when active reservations exceed physical stock
    pub fn is_oversubscribed(&self) -> bool {
        self.reserved > self.physical_stock
    }
}
