//! Shared types and models for the Material Issue Engine
//!
//! This crate contains the domain vocabulary used by the reservation and
//! approval engine: catalog materials, inventory lots, issue requests and
//! reservations. It performs no I/O.

pub mod models;
pub mod types;
pub mod validation;

pub use models::*;
pub use types::*;
pub use validation::*;
