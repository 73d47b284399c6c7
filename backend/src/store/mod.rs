//! Transactional storage seams for the reservation engine
//!
//! The engine never touches a connection directly. It begins a transaction
//! from an [`InventoryStore`] and works through the operation traits below,
//! which the Postgres store and the in-memory store both implement with the
//! same row locking semantics:
//!
//! - [`RequestTx::lock_request`] and [`LedgerTx::lock_lot`] take exclusive row
//!   locks that are held until the transaction commits or rolls back.
//! - Writes become visible to other transactions only on [`StoreTx::commit`].
//! - Dropping a transaction without committing rolls it back.

use std::future::Future;

use issue_shared::{
    Actor, AvailableLot, LotBalance, Material, NewMaterial, RequestDetail, RequestHeader,
    Reservation,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::AppResult;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, MemoryTx};
pub use postgres::{PgStore, PgTx};

/// A store that hands out transactions
pub trait InventoryStore: Send + Sync {
    type Tx: StoreTx + 'static;

    /// Begin a new transaction
    fn begin(&self) -> impl Future<Output = AppResult<Self::Tx>> + Send;
}

/// Per-lot physical stock
pub trait LedgerTx: Send {
    /// Lots with positive stock for a material, in FEFO order
    fn list_available_lots(
        &mut self,
        material_id: Uuid,
    ) -> impl Future<Output = AppResult<Vec<AvailableLot>>> + Send;

    /// Lock a lot row and return its physical stock.
    ///
    /// # Errors
    ///
    /// `AppError::LotNotFound` when the lot does not exist.
    fn lock_lot(
        &mut self,
        material_id: Uuid,
        lot_number: &str,
    ) -> impl Future<Output = AppResult<Decimal>> + Send;

    /// Physical and actively reserved quantity per lot, optionally for one material
    fn lot_balances(
        &mut self,
        material_id: Option<Uuid>,
    ) -> impl Future<Output = AppResult<Vec<LotBalance>>> + Send;
}

/// Reservation records
pub trait ReservationTx: Send {
    /// Sum of active reservations against a lot; zero when there are none
    fn sum_active_reserved(
        &mut self,
        material_id: Uuid,
        lot_number: &str,
    ) -> impl Future<Output = AppResult<Decimal>> + Send;

    fn list_active(
        &mut self,
        request_id: Uuid,
    ) -> impl Future<Output = AppResult<Vec<Reservation>>> + Send;

    /// Persist a batch of new active reservations
    fn save_batch(
        &mut self,
        reservations: &[Reservation],
    ) -> impl Future<Output = AppResult<()>> + Send;

    /// Cancel every active reservation of a request; returns how many changed
    fn cancel_active(
        &mut self,
        request_id: Uuid,
        reason: &str,
        actor: Actor,
    ) -> impl Future<Output = AppResult<u64>> + Send;
}

/// Request headers and detail lines
pub trait RequestTx: Send {
    fn insert_request(
        &mut self,
        header: &RequestHeader,
        details: &[RequestDetail],
    ) -> impl Future<Output = AppResult<()>> + Send;

    /// Lock a header row and return it.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` when the request does not exist.
    fn lock_request(
        &mut self,
        request_id: Uuid,
    ) -> impl Future<Output = AppResult<RequestHeader>> + Send;

    /// Read a header without locking it
    fn find_request(
        &mut self,
        request_id: Uuid,
    ) -> impl Future<Output = AppResult<Option<RequestHeader>>> + Send;

    /// Detail lines ordered by line number
    fn load_details(
        &mut self,
        request_id: Uuid,
    ) -> impl Future<Output = AppResult<Vec<RequestDetail>>> + Send;

    /// Persist status and decision fields of a header
    fn update_request(&mut self, header: &RequestHeader)
        -> impl Future<Output = AppResult<()>> + Send;

    /// Attach a catalog material to a detail line
    fn map_detail(
        &mut self,
        detail_id: Uuid,
        material_id: Uuid,
    ) -> impl Future<Output = AppResult<()>> + Send;
}

/// Material catalog, living in the same store as the requests
pub trait CatalogTx: Send {
    fn find_material_by_id(
        &mut self,
        material_id: Uuid,
    ) -> impl Future<Output = AppResult<Option<Material>>> + Send;

    fn find_material_by_code(
        &mut self,
        code: &str,
    ) -> impl Future<Output = AppResult<Option<Material>>> + Send;

    fn create_material(
        &mut self,
        material: &NewMaterial,
    ) -> impl Future<Output = AppResult<Material>> + Send;
}

/// One open transaction over every table the engine touches
pub trait StoreTx: LedgerTx + ReservationTx + RequestTx + CatalogTx + Sized {
    fn commit(self) -> impl Future<Output = AppResult<()>> + Send;

    fn rollback(self) -> impl Future<Output = AppResult<()>> + Send;
}
