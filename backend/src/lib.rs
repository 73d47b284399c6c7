//! Material Issue Engine
//!
//! Stock reservation and approval for material issue requests: FEFO
//! allocation over per-lot stock, a reservation ledger guarded by row locks,
//! and the Pending/Approved/Rejected workflow on top of it.

pub mod config;
pub mod error;
pub mod services;
pub mod store;

pub use config::Config;
pub use error::{AppError, AppResult};
