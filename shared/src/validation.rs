//! Validation utilities for the Material Issue Engine

use rust_decimal::Decimal;
use validator::ValidationError;

use crate::models::{CreateRequestInput, RequestLineInput};

// ============================================================================
// Quantity Validations
// ============================================================================

/// Maximum number of decimal places accepted on a requested quantity
pub const MAX_QUANTITY_SCALE: u32 = 4;

/// Largest quantity a stock column holds (`NUMERIC(18, 4)`)
pub fn max_quantity() -> Decimal {
    Decimal::new(999_999_999_999_999_999, MAX_QUANTITY_SCALE)
}

/// Validate a requested or reserved quantity
pub fn validate_quantity(quantity: Decimal) -> Result<(), &'static str> {
    if quantity <= Decimal::ZERO {
        return Err("Quantity must be positive");
    }
    if quantity > max_quantity() {
        return Err("Quantity exceeds the largest storable amount");
    }
    if quantity.normalize().scale() > MAX_QUANTITY_SCALE {
        return Err("Quantity has too many decimal places");
    }
    Ok(())
}

// ============================================================================
// Catalog Validations
// ============================================================================

/// Validate material code format (2-50 uppercase alphanumeric, '-' or '_')
pub fn validate_material_code(code: &str) -> Result<(), &'static str> {
    if code.len() < 2 {
        return Err("Material code must be at least 2 characters");
    }
    if code.len() > 50 {
        return Err("Material code must be at most 50 characters");
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err("Material code must be uppercase alphanumeric, '-' or '_'");
    }
    Ok(())
}

/// Validate lot number (non-blank, at most 50 characters)
pub fn validate_lot_number(lot_number: &str) -> Result<(), &'static str> {
    if lot_number.trim().is_empty() {
        return Err("Lot number must not be blank");
    }
    if lot_number.chars().count() > 50 {
        return Err("Lot number must be at most 50 characters");
    }
    Ok(())
}

// ============================================================================
// `validator` hooks
// ============================================================================

pub(crate) fn validate_positive_quantity(quantity: &Decimal) -> Result<(), ValidationError> {
    validate_quantity(*quantity).map_err(|msg| {
        let mut err = ValidationError::new("quantity");
        err.message = Some(msg.into());
        err
    })
}

pub(crate) fn validate_line_target(line: &RequestLineInput) -> Result<(), ValidationError> {
    if line.material_id.is_some() {
        return Ok(());
    }
    let Some(placeholder) = &line.placeholder else {
        let mut err = ValidationError::new("material");
        err.message = Some("Line needs a material id or a proposed material".into());
        return Err(err);
    };
    match placeholder.code.as_deref() {
        Some(code) => validate_material_code(code.trim()).map_err(|msg| {
            let mut err = ValidationError::new("material_code");
            err.message = Some(msg.into());
            err
        }),
        None if placeholder.name.is_some() => Ok(()),
        None => {
            let mut err = ValidationError::new("material");
            err.message = Some("Proposed material needs a code or a name".into());
            Err(err)
        }
    }
}

pub(crate) fn validate_has_lines(input: &CreateRequestInput) -> Result<(), ValidationError> {
    if input.lines.is_empty() {
        let mut err = ValidationError::new("lines");
        err.message = Some("A request needs at least one line".into());
        return Err(err);
    }
    Ok(())
}
