//! Error handling for the Material Issue Engine
//!
//! Every error carries a stable machine code so callers can report exactly
//! which material and quantity fell short.

use issue_shared::{describe_shortages, DemandError, RequestStatus, Role, Shortage};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Lookup errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Lot {lot_number} of material {material_id} not found")]
    LotNotFound { material_id: Uuid, lot_number: String },

    // Workflow errors
    #[error("Request {request_id} was already processed (status: {status})")]
    AlreadyProcessed {
        request_id: Uuid,
        status: RequestStatus,
    },

    #[error("Request has {} unmapped material line(s)", .detail_ids.len())]
    UnmappedMaterial { detail_ids: Vec<Uuid> },

    #[error("Insufficient stock: {}", describe_shortages(.0))]
    InsufficientStock(Vec<Shortage>),

    // Authorization errors
    #[error("User {user_id} lacks role {role}")]
    NotAuthorized { user_id: Uuid, role: Role },

    // Validation errors
    #[error("Validation error: {message}")]
    Validation { field: String, message: String },

    #[error("Validation error: {0}")]
    ValidationErrors(#[from] validator::ValidationErrors),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::LotNotFound { .. } => "LOT_NOT_FOUND",
            AppError::AlreadyProcessed { .. } => "ALREADY_PROCESSED",
            AppError::UnmappedMaterial { .. } => "UNMAPPED_MATERIAL",
            AppError::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            AppError::NotAuthorized { .. } => "NOT_AUTHORIZED",
            AppError::Validation { .. } | AppError::ValidationErrors(_) => "VALIDATION_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::DatabaseError(_) | AppError::MigrationError(_) => "DATABASE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Shortages carried by an insufficiency error
    pub fn shortages(&self) -> &[Shortage] {
        match self {
            AppError::InsufficientStock(shortages) => shortages,
            _ => &[],
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build the serializable response for a caller
    pub fn to_response(&self) -> ErrorResponse {
        let (message, field) = match self {
            AppError::Validation { field, message } => (message.clone(), Some(field.clone())),
            // Do not leak driver details
            AppError::DatabaseError(_) | AppError::MigrationError(_) => {
                ("A database error occurred".to_string(), None)
            }
            other => (other.to_string(), None),
        };

        if matches!(
            self,
            AppError::DatabaseError(_) | AppError::MigrationError(_) | AppError::Internal(_)
        ) {
            tracing::error!("Error: {:?}", self);
        }

        ErrorResponse {
            error: ErrorDetail {
                code: self.code().to_string(),
                message,
                field,
                shortages: self.shortages().to_vec(),
            },
        }
    }
}

impl From<DemandError> for AppError {
    fn from(err: DemandError) -> Self {
        match err {
            DemandError::Unmapped(detail_ids) => AppError::UnmappedMaterial { detail_ids },
            DemandError::Overflow { material_id } => AppError::validation(
                "lines",
                format!(
                    "Total quantity for material {} exceeds the largest storable amount",
                    material_id
                ),
            ),
        }
    }
}

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub shortages: Vec<Shortage>,
}

/// Result type alias for services
pub type AppResult<T> = Result<T, AppError>;
