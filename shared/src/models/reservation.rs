//! Stock reservation models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Actor;

/// Lifecycle of a reservation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Cancelled,
    /// Set by the physical issue step
    Consumed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Consumed => "consumed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ReservationStatus::Active),
            "cancelled" => Some(ReservationStatus::Cancelled),
            "consumed" => Some(ReservationStatus::Consumed),
            _ => None,
        }
    }
}

/// A hold against one lot's physical stock on behalf of one request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub request_id: Uuid,
    pub material_id: Uuid,
    pub lot_number: String,
    pub quantity_reserved: Decimal,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: Actor,
    pub note: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Actor>,
    pub cancel_reason: Option<String>,
}

impl Reservation {
    /// A fresh active reservation
    pub fn active(
        request_id: Uuid,
        material_id: Uuid,
        lot_number: impl Into<String>,
        quantity_reserved: Decimal,
        created_by: Actor,
        note: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            material_id,
            lot_number: lot_number.into(),
            quantity_reserved,
            status: ReservationStatus::Active,
            created_at: Utc::now(),
            created_by,
            note,
            cancelled_at: None,
            cancelled_by: None,
            cancel_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Mark as cancelled; only active reservations change
    pub fn cancel(&mut self, reason: &str, actor: Actor, at: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = ReservationStatus::Cancelled;
        self.cancelled_at = Some(at);
        self.cancelled_by = Some(actor);
        self.cancel_reason = Some(reason.to_string());
        true
    }
}

/// Total active quantity held against one lot
pub fn active_total<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    material_id: Uuid,
    lot_number: &str,
) -> Decimal {
    reservations
        .into_iter()
        .filter(|r| r.is_active() && r.material_id == material_id && r.lot_number == lot_number)
        .map(|r| r.quantity_reserved)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_cancel_only_touches_active() {
        let mut reservation =
            Reservation::active(Uuid::nil(), Uuid::nil(), "L1", dec!(2), Actor::System, None);
        let admin = Actor::User(Uuid::new_v4());

        assert!(reservation.cancel("rejected", admin, Utc::now()));
        assert_eq!(reservation.status, ReservationStatus::Cancelled);
        assert_eq!(reservation.cancelled_by, Some(admin));
        assert!(!reservation.cancel("again", admin, Utc::now()));
        assert_eq!(reservation.cancel_reason.as_deref(), Some("rejected"));
    }

    #[test]
    fn test_active_total_ignores_other_lots_and_statuses() {
        let material = Uuid::new_v4();
        let mut cancelled =
            Reservation::active(Uuid::nil(), material, "L1", dec!(4), Actor::System, None);
        cancelled.cancel("x", Actor::System, Utc::now());
        let reservations = vec![
            Reservation::active(Uuid::nil(), material, "L1", dec!(1.5), Actor::System, None),
            Reservation::active(Uuid::nil(), material, "L2", dec!(3), Actor::System, None),
            cancelled,
        ];
        assert_eq!(active_total(&reservations, material, "L1"), dec!(1.5));
    }
}
