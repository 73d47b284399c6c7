//! In-memory store with the same transactional semantics as Postgres.
//!
//! Committed state sits behind one mutex. A transaction buffers its writes and
//! reads through them, so it sees its own changes while other transactions
//! only see them after commit. Row locks are per-key async mutexes whose
//! guards the transaction owns until it is committed or dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use issue_shared::{
    active_total, fefo_order, max_quantity, validate_lot_number, Actor, AvailableLot,
    InventoryLot, LotBalance, Material, NewMaterial, RequestDetail, RequestHeader, Reservation,
};
use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{CatalogTx, InventoryStore, LedgerTx, RequestTx, ReservationTx, StoreTx};
use crate::error::{AppError, AppResult};

#[derive(Debug, Default)]
struct MemoryState {
    materials: HashMap<Uuid, Material>,
    lots: BTreeMap<(Uuid, String), InventoryLot>,
    requests: HashMap<Uuid, RequestHeader>,
    details: HashMap<Uuid, RequestDetail>,
    reservations: Vec<Reservation>,
}

/// A buffered mutation, applied to committed state on commit
#[derive(Debug, Clone)]
enum Write {
    InsertRequest(RequestHeader, Vec<RequestDetail>),
    UpdateRequest(RequestHeader),
    MapDetail { detail_id: Uuid, material_id: Uuid },
    CreateMaterial(Material),
    SaveReservations(Vec<Reservation>),
    CancelActive {
        request_id: Uuid,
        reason: String,
        actor: Actor,
        at: DateTime<Utc>,
    },
}

impl MemoryState {
    fn apply(&mut self, write: &Write) {
        match write {
            Write::InsertRequest(header, details) => {
                self.requests.insert(header.id, header.clone());
                for detail in details {
                    self.details.insert(detail.id, detail.clone());
                }
            }
            Write::UpdateRequest(header) => {
                self.requests.insert(header.id, header.clone());
            }
            Write::MapDetail {
                detail_id,
                material_id,
            } => {
                if let Some(detail) = self.details.get_mut(detail_id) {
                    detail.material_id = Some(*material_id);
                }
            }
            Write::CreateMaterial(material) => {
                self.materials.insert(material.id, material.clone());
            }
            Write::SaveReservations(batch) => {
                self.reservations.extend(batch.iter().cloned());
            }
            Write::CancelActive {
                request_id,
                reason,
                actor,
                at,
            } => {
                for reservation in self
                    .reservations
                    .iter_mut()
                    .filter(|r| r.request_id == *request_id)
                {
                    reservation.cancel(reason, *actor, *at);
                }
            }
        }
    }

    fn lots_of(&self, material_id: Uuid) -> impl Iterator<Item = &InventoryLot> {
        self.lots
            .range((material_id, String::new())..)
            .take_while(move |((id, _), _)| *id == material_id)
            .map(|(_, lot)| lot)
    }

    fn lot(&self, material_id: Uuid, lot_number: &str) -> Option<&InventoryLot> {
        self.lots.get(&(material_id, lot_number.to_string()))
    }
}

fn balance_of(lot: &InventoryLot, reservations: &[Reservation]) -> LotBalance {
    LotBalance {
        material_id: lot.material_id,
        lot_number: lot.lot_number.clone(),
        expiry_date: lot.expiry_date,
        physical_stock: lot.physical_stock,
        reserved: active_total(reservations, lot.material_id, &lot.lot_number),
    }
}

/// Committed state as one transaction sees it, with its buffered writes on top.
///
/// Reads clone only the rows they return.
struct Overlay<'a> {
    state: &'a MemoryState,
    writes: &'a [Write],
}

impl Overlay<'_> {
    fn request(&self, request_id: Uuid) -> Option<RequestHeader> {
        self.writes
            .iter()
            .rev()
            .find_map(|write| match write {
                Write::InsertRequest(header, _) | Write::UpdateRequest(header)
                    if header.id == request_id =>
                {
                    Some(header)
                }
                _ => None,
            })
            .or_else(|| self.state.requests.get(&request_id))
            .cloned()
    }

    fn details(&self, request_id: Uuid) -> Vec<RequestDetail> {
        let mut details: Vec<RequestDetail> = self
            .state
            .details
            .values()
            .filter(|d| d.request_id == request_id)
            .cloned()
            .collect();
        for write in self.writes {
            match write {
                Write::InsertRequest(header, inserted) if header.id == request_id => {
                    details.extend(inserted.iter().cloned());
                }
                Write::MapDetail {
                    detail_id,
                    material_id,
                } => {
                    if let Some(detail) = details.iter_mut().find(|d| d.id == *detail_id) {
                        detail.material_id = Some(*material_id);
                    }
                }
                _ => {}
            }
        }
        details.sort_by_key(|d| d.line_no);
        details
    }

    fn has_detail(&self, detail_id: Uuid) -> bool {
        self.state.details.contains_key(&detail_id)
            || self.writes.iter().any(|write| match write {
                Write::InsertRequest(_, details) => details.iter().any(|d| d.id == detail_id),
                _ => false,
            })
    }

    fn material(&self, wanted: impl Fn(&Material) -> bool) -> Option<Material> {
        self.writes
            .iter()
            .find_map(|write| match write {
                Write::CreateMaterial(material) if wanted(material) => Some(material),
                _ => None,
            })
            .or_else(|| self.state.materials.values().find(|m| wanted(m)))
            .cloned()
    }

    /// Reservations selected by `keep`, with this transaction's saves and
    /// cancellations applied in order
    fn reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut selected: Vec<Reservation> = self
            .state
            .reservations
            .iter()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        for write in self.writes {
            match write {
                Write::SaveReservations(batch) => {
                    selected.extend(batch.iter().filter(|r| keep(r)).cloned());
                }
                Write::CancelActive {
                    request_id,
                    reason,
                    actor,
                    at,
                } => {
                    for reservation in selected.iter_mut().filter(|r| r.request_id == *request_id) {
                        reservation.cancel(reason, *actor, *at);
                    }
                }
                _ => {}
            }
        }
        selected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Request(Uuid),
    Lot(Uuid, String),
}

/// Lock table. An entry lives only while some transaction holds or waits on it.
#[derive(Debug, Default)]
struct RowLocks {
    rows: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl RowLocks {
    fn row(&self, key: &RowKey) -> AppResult<Arc<tokio::sync::Mutex<()>>> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| AppError::Internal("row lock table poisoned".to_string()))?;
        Ok(Arc::clone(rows.entry(key.clone()).or_default()))
    }

    /// Drop entries nobody holds or waits on. Handles are only cloned under
    /// the table mutex, so a count of one cannot race with a new locker.
    fn release_idle(&self) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.retain(|_, row| Arc::strong_count(row) > 1);
        }
    }
}

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<RowLocks>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> AppResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AppError::Internal("memory store poisoned".to_string()))?;
        Ok(f(&mut state))
    }

    // Seeding and inspection happen outside any transaction and take no row locks.

    /// Catalogue a material directly
    pub fn add_material(&self, material: NewMaterial) -> AppResult<Material> {
        let material = material.into_material(Uuid::new_v4(), Utc::now());
        self.with_state(|state| {
            state.materials.insert(material.id, material.clone());
        })?;
        Ok(material)
    }

    /// Add stock to a lot, creating the lot on first receipt
    pub fn receive_stock(
        &self,
        material_id: Uuid,
        lot_number: &str,
        quantity: Decimal,
        expiry_date: Option<NaiveDate>,
    ) -> AppResult<()> {
        validate_lot_number(lot_number).map_err(|msg| AppError::validation("lot_number", msg))?;
        // Zero records an empty lot
        if quantity < Decimal::ZERO {
            return Err(AppError::validation("quantity", "Received quantity must not be negative"));
        }

        self.with_state(|state| -> AppResult<()> {
            let key = (material_id, lot_number.to_string());
            let stock = state.lots.get(&key).map_or(Decimal::ZERO, |lot| lot.physical_stock);
            let total = stock
                .checked_add(quantity)
                .filter(|total| *total <= max_quantity())
                .ok_or_else(|| {
                    AppError::validation(
                        "quantity",
                        "Lot stock would exceed the largest storable amount",
                    )
                })?;

            state
                .lots
                .entry(key)
                .and_modify(|lot| lot.physical_stock = total)
                .or_insert_with(|| InventoryLot {
                    material_id,
                    lot_number: lot_number.to_string(),
                    physical_stock: total,
                    expiry_date,
                    received_at: Utc::now(),
                });
            Ok(())
        })?
    }

    /// Committed balance of one lot
    pub fn lot_balance(&self, material_id: Uuid, lot_number: &str) -> AppResult<Option<LotBalance>> {
        self.with_state(|state| {
            state
                .lot(material_id, lot_number)
                .map(|lot| balance_of(lot, &state.reservations))
        })
    }

    /// Every committed request header, oldest first
    pub fn requests(&self) -> AppResult<Vec<RequestHeader>> {
        self.with_state(|state| {
            let mut requests: Vec<RequestHeader> = state.requests.values().cloned().collect();
            requests.sort_by_key(|r| r.created_at);
            requests
        })
    }

    /// Every committed reservation, in insertion order
    pub fn reservations(&self) -> AppResult<Vec<Reservation>> {
        self.with_state(|state| state.reservations.clone())
    }
}

impl InventoryStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> AppResult<MemoryTx> {
        Ok(MemoryTx {
            state: Arc::clone(&self.state),
            locks: Arc::clone(&self.locks),
            held: HashMap::new(),
            writes: Vec::new(),
        })
    }
}

/// An open in-memory transaction
pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<RowLocks>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    writes: Vec<Write>,
}

impl MemoryTx {
    /// Acquire a row lock unless this transaction already holds it
    async fn lock_row(&mut self, key: RowKey) -> AppResult<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let row = self.locks.row(&key)?;
        let guard = row.lock_owned().await;
        self.held.insert(key, guard);
        Ok(())
    }

    /// Run a read against committed state plus this transaction's writes
    fn read<T>(&self, f: impl FnOnce(&Overlay<'_>) -> T) -> AppResult<T> {
        let state = self
            .state
            .lock()
            .map_err(|_| AppError::Internal("memory store poisoned".to_string()))?;
        Ok(f(&Overlay {
            state: &state,
            writes: &self.writes,
        }))
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.held.clear();
        self.locks.release_idle();
    }
}

impl LedgerTx for MemoryTx {
    async fn list_available_lots(&mut self, material_id: Uuid) -> AppResult<Vec<AvailableLot>> {
        self.read(|view| fefo_order(view.state.lots_of(material_id).map(InventoryLot::as_available)))
    }

    async fn lock_lot(&mut self, material_id: Uuid, lot_number: &str) -> AppResult<Decimal> {
        self.lock_row(RowKey::Lot(material_id, lot_number.to_string()))
            .await?;
        self.read(|view| view.state.lot(material_id, lot_number).map(|lot| lot.physical_stock))?
            .ok_or_else(|| AppError::LotNotFound {
                material_id,
                lot_number: lot_number.to_string(),
            })
    }

    async fn lot_balances(&mut self, material_id: Option<Uuid>) -> AppResult<Vec<LotBalance>> {
        let mut balances = self.read(|view| {
            let reservations =
                view.reservations(|r| material_id.map_or(true, |id| r.material_id == id));
            view.state
                .lots
                .values()
                .filter(|lot| material_id.map_or(true, |id| lot.material_id == id))
                .map(|lot| balance_of(lot, &reservations))
                .collect::<Vec<_>>()
        })?;
        balances.sort_by(|a, b| {
            a.material_id.cmp(&b.material_id).then_with(|| {
                issue_shared::fefo_cmp(a.expiry_date, &a.lot_number, b.expiry_date, &b.lot_number)
            })
        });
        Ok(balances)
    }
}

impl ReservationTx for MemoryTx {
    async fn sum_active_reserved(&mut self, material_id: Uuid, lot_number: &str) -> AppResult<Decimal> {
        self.read(|view| {
            let held = view.reservations(|r| r.material_id == material_id && r.lot_number == lot_number);
            active_total(&held, material_id, lot_number)
        })
    }

    async fn list_active(&mut self, request_id: Uuid) -> AppResult<Vec<Reservation>> {
        self.read(|view| {
            let mut held = view.reservations(|r| r.request_id == request_id);
            held.retain(Reservation::is_active);
            held
        })
    }

    async fn save_batch(&mut self, reservations: &[Reservation]) -> AppResult<()> {
        self.writes.push(Write::SaveReservations(reservations.to_vec()));
        Ok(())
    }

    async fn cancel_active(&mut self, request_id: Uuid, reason: &str, actor: Actor) -> AppResult<u64> {
        let active = self.list_active(request_id).await?.len();
        if active > 0 {
            self.writes.push(Write::CancelActive {
                request_id,
                reason: reason.to_string(),
                actor,
                at: Utc::now(),
            });
        }
        Ok(active as u64)
    }
}

impl RequestTx for MemoryTx {
    async fn insert_request(&mut self, header: &RequestHeader, details: &[RequestDetail]) -> AppResult<()> {
        if self.read(|view| view.request(header.id).is_some())? {
            return Err(AppError::Internal(format!("Request {} already exists", header.id)));
        }
        self.writes
            .push(Write::InsertRequest(header.clone(), details.to_vec()));
        Ok(())
    }

    async fn lock_request(&mut self, request_id: Uuid) -> AppResult<RequestHeader> {
        self.lock_row(RowKey::Request(request_id)).await?;
        self.read(|view| view.request(request_id))?
            .ok_or_else(|| AppError::NotFound("Request".to_string()))
    }

    async fn find_request(&mut self, request_id: Uuid) -> AppResult<Option<RequestHeader>> {
        self.read(|view| view.request(request_id))
    }

    async fn load_details(&mut self, request_id: Uuid) -> AppResult<Vec<RequestDetail>> {
        self.read(|view| view.details(request_id))
    }

    async fn update_request(&mut self, header: &RequestHeader) -> AppResult<()> {
        if !self.read(|view| view.request(header.id).is_some())? {
            return Err(AppError::NotFound("Request".to_string()));
        }
        self.writes.push(Write::UpdateRequest(header.clone()));
        Ok(())
    }

    async fn map_detail(&mut self, detail_id: Uuid, material_id: Uuid) -> AppResult<()> {
        if !self.read(|view| view.has_detail(detail_id))? {
            return Err(AppError::NotFound("Request detail".to_string()));
        }
        self.writes.push(Write::MapDetail {
            detail_id,
            material_id,
        });
        Ok(())
    }
}

impl CatalogTx for MemoryTx {
    async fn find_material_by_id(&mut self, material_id: Uuid) -> AppResult<Option<Material>> {
        self.read(|view| view.material(|m| m.id == material_id))
    }

    async fn find_material_by_code(&mut self, code: &str) -> AppResult<Option<Material>> {
        self.read(|view| view.material(|m| m.code == code))
    }

    async fn create_material(&mut self, material: &NewMaterial) -> AppResult<Material> {
        if self.find_material_by_code(&material.code).await?.is_some() {
            return Err(AppError::validation(
                "code",
                format!("Material code {} already exists", material.code),
            ));
        }
        let material = material.clone().into_material(Uuid::new_v4(), Utc::now());
        self.writes.push(Write::CreateMaterial(material.clone()));
        Ok(material)
    }
}

impl StoreTx for MemoryTx {
    async fn commit(self) -> AppResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AppError::Internal("memory store poisoned".to_string()))?;
        for write in &self.writes {
            state.apply(write);
        }
        // Row locks are released when the transaction drops
        Ok(())
    }

    async fn rollback(self) -> AppResult<()> {
        Ok(())
    }
}
