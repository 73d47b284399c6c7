//! Catalog material models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A catalog entry that requests and lots refer to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Material {
    pub id: Uuid,
    /// Unique catalog code (e.g., "CHEM-0042")
    pub code: String,
    pub name: String,
    pub unit: String,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to catalogue a new material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMaterial {
    pub code: String,
    pub name: String,
    pub unit: String,
    pub category: Option<String>,
}

impl NewMaterial {
    pub fn into_material(self, id: Uuid, created_at: DateTime<Utc>) -> Material {
        Material {
            id,
            code: self.code,
            name: self.name,
            unit: self.unit,
            category: self.category,
            created_at,
        }
    }
}
