//! Common types used across the engine

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-material quantity a request needs, aggregated across its lines.
///
/// A `BTreeMap` keyed by material id, so iteration is always ascending by id.
/// The allocation engine relies on that order for lock acquisition.
pub type DemandVector = BTreeMap<Uuid, Decimal>;

/// Who performed a mutation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// The engine itself (auto-approval)
    System,
    User(Uuid),
}

impl Actor {
    const SYSTEM_LABEL: &'static str = "system";

    /// Parse the persisted label form (`"system"` or a user uuid)
    pub fn parse(label: &str) -> Option<Self> {
        if label == Self::SYSTEM_LABEL {
            return Some(Actor::System);
        }
        Uuid::parse_str(label).ok().map(Actor::User)
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::System => write!(f, "{}", Self::SYSTEM_LABEL),
            Actor::User(id) => write!(f, "{}", id),
        }
    }
}

impl From<Uuid> for Actor {
    fn from(id: Uuid) -> Self {
        Actor::User(id)
    }
}

/// One material that could not be fully reserved
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shortage {
    pub material_id: Uuid,
    pub needed: Decimal,
    /// Total quantity that was reservable across all lots
    pub available: Decimal,
}

impl Shortage {
    pub fn shortfall(&self) -> Decimal {
        self.needed - self.available
    }
}

impl std::fmt::Display for Shortage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "material {} needs {} but only {} is available",
            self.material_id, self.needed, self.available
        )
    }
}

/// Render a list of shortages as a single human readable line
pub fn describe_shortages(shortages: &[Shortage]) -> String {
    shortages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
