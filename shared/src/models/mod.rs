//! Domain models for the Material Issue Engine

mod lot;
mod material;
mod request;
mod reservation;
mod user;

pub use lot::*;
pub use material::*;
pub use request::*;
pub use reservation::*;
pub use user::*;
