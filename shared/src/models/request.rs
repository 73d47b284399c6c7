//! Material issue request models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{NewMaterial, Reservation};
use crate::types::{DemandVector, Shortage};
use crate::validation::{
    max_quantity, validate_has_lines, validate_line_target, validate_positive_quantity,
};

/// Approval status of an issue request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "Pending"),
            RequestStatus::Approved => write!(f, "Approved"),
            RequestStatus::Rejected => write!(f, "Rejected"),
        }
    }
}

/// How a request left the pending state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Manual,
    Automatic,
    /// Administrative override after approval
    Override,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalMode::Manual => "manual",
            ApprovalMode::Automatic => "automatic",
            ApprovalMode::Override => "override",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(ApprovalMode::Manual),
            "automatic" => Some(ApprovalMode::Automatic),
            "override" => Some(ApprovalMode::Override),
            _ => None,
        }
    }
}

/// Header of an issue request.
///
/// Detail lines and reservations are separate rows referencing the header id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestHeader {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub department: Option<String>,
    pub status: RequestStatus,
    /// None while pending, and for automatic approvals
    pub approver_id: Option<Uuid>,
    pub approval_mode: Option<ApprovalMode>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_note: Option<String>,
    /// Why the creation-time auto-approval did not go through
    pub auto_approval_note: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Proposed catalog fields for a material that is not catalogued yet
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct MaterialPlaceholder {
    #[validate(length(min = 1, max = 50))]
    pub code: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[validate(length(max = 100))]
    pub category: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub unit: Option<String>,
}

impl MaterialPlaceholder {
    /// Catalog fields, when the placeholder carries enough to create a material
    pub fn to_new_material(&self) -> Option<NewMaterial> {
        let code = self.code.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
        let name = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
        let unit = self.unit.as_deref().map(str::trim).filter(|u| !u.is_empty())?;

        Some(NewMaterial {
            code: code.to_string(),
            name: name.to_string(),
            unit: unit.to_string(),
            category: self.category.clone(),
        })
    }
}

/// One requested material line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestDetail {
    pub id: Uuid,
    pub request_id: Uuid,
    pub line_no: i32,
    /// Set once the line is mapped to a catalog material
    pub material_id: Option<Uuid>,
    pub placeholder: Option<MaterialPlaceholder>,
    pub quantity: Decimal,
    pub note: Option<String>,
}

impl RequestDetail {
    pub fn is_mapped(&self) -> bool {
        self.material_id.is_some()
    }

    pub fn proposed_code(&self) -> Option<&str> {
        self.placeholder
            .as_ref()
            .and_then(|p| p.code.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Why a request's lines cannot be turned into a demand vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemandError {
    /// Ids of the lines that have no catalog material yet
    Unmapped(Vec<Uuid>),
    /// The summed demand for one material is larger than a stock column holds
    Overflow { material_id: Uuid },
}

/// Aggregate mapped lines into a per-material demand.
///
/// Totals are checked before mapping so an oversized request is refused even
/// while some of its lines still wait for a material.
pub fn demand_vector(details: &[RequestDetail]) -> Result<DemandVector, DemandError> {
    let mut demand = DemandVector::new();
    let mut unmapped = Vec::new();
    for detail in details {
        let Some(material_id) = detail.material_id else {
            unmapped.push(detail.id);
            continue;
        };
        let total = demand.entry(material_id).or_insert(Decimal::ZERO);
        *total = total
            .checked_add(detail.quantity)
            .filter(|sum| *sum <= max_quantity())
            .ok_or(DemandError::Overflow { material_id })?;
    }

    if !unmapped.is_empty() {
        return Err(DemandError::Unmapped(unmapped));
    }
    Ok(demand)
}

/// Input for one request line
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_line_target"))]
pub struct RequestLineInput {
    pub material_id: Option<Uuid>,
    #[validate]
    pub placeholder: Option<MaterialPlaceholder>,
    #[validate(custom = "validate_positive_quantity")]
    pub quantity: Decimal,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

/// Input for submitting an issue request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_has_lines"))]
pub struct CreateRequestInput {
    #[validate(length(max = 100))]
    pub department: Option<String>,
    #[validate(length(max = 1000))]
    pub note: Option<String>,
    #[validate]
    pub lines: Vec<RequestLineInput>,
}

/// A request with its lines and active reservations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestView {
    pub header: RequestHeader,
    pub details: Vec<RequestDetail>,
    pub reservations: Vec<Reservation>,
}

impl RequestView {
    pub fn status(&self) -> RequestStatus {
        self.header.status
    }
}

/// Result of the creation-time approval attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoApproval {
    Approved,
    /// Not attempted (unmapped lines or auto-approval switched off)
    Skipped { reason: String },
    /// Attempted and declined; the request waits for manual review
    Declined {
        reason: String,
        shortages: Vec<Shortage>,
    },
}

/// What `create_request` reports back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCreated {
    pub request: RequestView,
    pub auto_approval: AutoApproval,
}

impl RequestCreated {
    pub fn is_auto_approved(&self) -> bool {
        matches!(self.auto_approval, AutoApproval::Approved)
    }
}
