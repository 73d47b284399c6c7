//! PostgreSQL store: row locks via `SELECT ... FOR UPDATE`

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use issue_shared::{
    Actor, ApprovalMode, AvailableLot, LotBalance, Material, MaterialPlaceholder, NewMaterial,
    RequestDetail, RequestHeader, RequestStatus, Reservation, ReservationStatus,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{CatalogTx, InventoryStore, LedgerTx, RequestTx, ReservationTx, StoreTx};
use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
    lock_timeout_ms: u64,
}

impl PgStore {
    /// Create a new PgStore over an existing pool
    pub fn new(db: PgPool, lock_timeout_ms: u64) -> Self {
        Self { db, lock_timeout_ms }
    }

    /// Open a connection pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let db = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        Ok(Self::new(db, config.lock_timeout_ms))
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }
}

impl InventoryStore for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> AppResult<PgTx> {
        let mut tx = self.db.begin().await?;

        if self.lock_timeout_ms > 0 {
            // SET does not take bind parameters
            sqlx::query(&format!("SET LOCAL lock_timeout = {}", self.lock_timeout_ms))
                .execute(&mut *tx)
                .await?;
        }

        Ok(PgTx { tx })
    }
}

/// An open Postgres transaction
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct MaterialRow {
    id: Uuid,
    code: String,
    name: String,
    unit: String,
    category: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<MaterialRow> for Material {
    fn from(row: MaterialRow) -> Self {
        Material {
            id: row.id,
            code: row.code,
            name: row.name,
            unit: row.unit,
            category: row.category,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct LotRow {
    lot_number: String,
    physical_stock: Decimal,
    expiry_date: Option<NaiveDate>,
}

#[derive(Debug, FromRow)]
struct LotBalanceRow {
    material_id: Uuid,
    lot_number: String,
    expiry_date: Option<NaiveDate>,
    physical_stock: Decimal,
    reserved: Decimal,
}

#[derive(Debug, FromRow)]
struct RequestRow {
    id: Uuid,
    requester_id: Uuid,
    department: Option<String>,
    status: String,
    approver_id: Option<Uuid>,
    approval_mode: Option<String>,
    decided_at: Option<DateTime<Utc>>,
    decision_note: Option<String>,
    auto_approval_note: Option<String>,
    note: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RequestRow> for RequestHeader {
    type Error = AppError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let status = RequestStatus::from_str(&row.status)
            .ok_or_else(|| AppError::Internal(format!("Unknown request status '{}'", row.status)))?;
        let approval_mode = match row.approval_mode.as_deref() {
            Some(mode) => Some(ApprovalMode::from_str(mode).ok_or_else(|| {
                AppError::Internal(format!("Unknown approval mode '{}'", mode))
            })?),
            None => None,
        };

        Ok(RequestHeader {
            id: row.id,
            requester_id: row.requester_id,
            department: row.department,
            status,
            approver_id: row.approver_id,
            approval_mode,
            decided_at: row.decided_at,
            decision_note: row.decision_note,
            auto_approval_note: row.auto_approval_note,
            note: row.note,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DetailRow {
    id: Uuid,
    request_id: Uuid,
    line_no: i32,
    material_id: Option<Uuid>,
    proposed_code: Option<String>,
    proposed_name: Option<String>,
    proposed_category: Option<String>,
    proposed_unit: Option<String>,
    quantity: Decimal,
    note: Option<String>,
}

impl From<DetailRow> for RequestDetail {
    fn from(row: DetailRow) -> Self {
        let has_placeholder = row.proposed_code.is_some()
            || row.proposed_name.is_some()
            || row.proposed_category.is_some()
            || row.proposed_unit.is_some();

        RequestDetail {
            id: row.id,
            request_id: row.request_id,
            line_no: row.line_no,
            material_id: row.material_id,
            placeholder: has_placeholder.then(|| MaterialPlaceholder {
                code: row.proposed_code,
                name: row.proposed_name,
                category: row.proposed_category,
                unit: row.proposed_unit,
            }),
            quantity: row.quantity,
            note: row.note,
        }
    }
}

#[derive(Debug, FromRow)]
struct ReservationRow {
    id: Uuid,
    request_id: Uuid,
    material_id: Uuid,
    lot_number: String,
    quantity_reserved: Decimal,
    status: String,
    created_at: DateTime<Utc>,
    created_by: String,
    note: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
    cancelled_by: Option<String>,
    cancel_reason: Option<String>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = AppError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let parse_actor = |label: &str| {
            Actor::parse(label)
                .ok_or_else(|| AppError::Internal(format!("Unknown actor '{}'", label)))
        };
        let status = ReservationStatus::from_str(&row.status).ok_or_else(|| {
            AppError::Internal(format!("Unknown reservation status '{}'", row.status))
        })?;

        Ok(Reservation {
            id: row.id,
            request_id: row.request_id,
            material_id: row.material_id,
            lot_number: row.lot_number,
            quantity_reserved: row.quantity_reserved,
            status,
            created_at: row.created_at,
            created_by: parse_actor(&row.created_by)?,
            note: row.note,
            cancelled_at: row.cancelled_at,
            cancelled_by: row.cancelled_by.as_deref().map(parse_actor).transpose()?,
            cancel_reason: row.cancel_reason,
        })
    }
}

// ============================================================================
// Inventory ledger
// ============================================================================

impl LedgerTx for PgTx {
    async fn list_available_lots(&mut self, material_id: Uuid) -> AppResult<Vec<AvailableLot>> {
        let rows = sqlx::query_as::<_, LotRow>(
            r#"
            SELECT lot_number, physical_stock, expiry_date
            FROM inventory_lots
            WHERE material_id = $1 AND physical_stock > 0
            ORDER BY expiry_date ASC NULLS LAST, lot_number ASC
            "#,
        )
        .bind(material_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AvailableLot {
                lot_number: r.lot_number,
                physical_stock: r.physical_stock,
                expiry_date: r.expiry_date,
            })
            .collect())
    }

    async fn lock_lot(&mut self, material_id: Uuid, lot_number: &str) -> AppResult<Decimal> {
        sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT physical_stock
            FROM inventory_lots
            WHERE material_id = $1 AND lot_number = $2
            FOR UPDATE
            "#,
        )
        .bind(material_id)
        .bind(lot_number)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| AppError::LotNotFound {
            material_id,
            lot_number: lot_number.to_string(),
        })
    }

    async fn lot_balances(&mut self, material_id: Option<Uuid>) -> AppResult<Vec<LotBalance>> {
        let rows = sqlx::query_as::<_, LotBalanceRow>(
            r#"
            SELECT l.material_id, l.lot_number, l.expiry_date, l.physical_stock,
                   COALESCE(SUM(r.quantity_reserved) FILTER (WHERE r.status = 'active'), 0) AS reserved
            FROM inventory_lots l
            LEFT JOIN stock_reservations r
                   ON r.material_id = l.material_id AND r.lot_number = l.lot_number
            WHERE $1::uuid IS NULL OR l.material_id = $1
            GROUP BY l.material_id, l.lot_number, l.expiry_date, l.physical_stock
            ORDER BY l.material_id, l.expiry_date ASC NULLS LAST, l.lot_number ASC
            "#,
        )
        .bind(material_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| LotBalance {
                material_id: r.material_id,
                lot_number: r.lot_number,
                expiry_date: r.expiry_date,
                physical_stock: r.physical_stock,
                reserved: r.reserved,
            })
            .collect())
    }
}

// ============================================================================
// Reservation store
// ============================================================================

impl ReservationTx for PgTx {
    async fn sum_active_reserved(&mut self, material_id: Uuid, lot_number: &str) -> AppResult<Decimal> {
        let sum = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(quantity_reserved), 0)
            FROM stock_reservations
            WHERE material_id = $1 AND lot_number = $2 AND status = 'active'
            "#,
        )
        .bind(material_id)
        .bind(lot_number)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(sum)
    }

    async fn list_active(&mut self, request_id: Uuid) -> AppResult<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(
            r#"
            SELECT id, request_id, material_id, lot_number, quantity_reserved, status,
                   created_at, created_by, note, cancelled_at, cancelled_by, cancel_reason
            FROM stock_reservations
            WHERE request_id = $1 AND status = 'active'
            ORDER BY created_at ASC, material_id ASC, lot_number ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(Reservation::try_from).collect()
    }

    async fn save_batch(&mut self, reservations: &[Reservation]) -> AppResult<()> {
        for reservation in reservations {
            sqlx::query(
                r#"
                INSERT INTO stock_reservations (
                    id, request_id, material_id, lot_number, quantity_reserved, status,
                    created_at, created_by, note
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(reservation.id)
            .bind(reservation.request_id)
            .bind(reservation.material_id)
            .bind(&reservation.lot_number)
            .bind(reservation.quantity_reserved)
            .bind(reservation.status.as_str())
            .bind(reservation.created_at)
            .bind(reservation.created_by.to_string())
            .bind(&reservation.note)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn cancel_active(&mut self, request_id: Uuid, reason: &str, actor: Actor) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stock_reservations
            SET status = 'cancelled', cancelled_at = NOW(), cancelled_by = $2, cancel_reason = $3
            WHERE request_id = $1 AND status = 'active'
            "#,
        )
        .bind(request_id)
        .bind(actor.to_string())
        .bind(reason)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Requests
// ============================================================================

const REQUEST_COLUMNS: &str = "id, requester_id, department, status, approver_id, approval_mode, \
     decided_at, decision_note, auto_approval_note, note, created_at, updated_at";

impl RequestTx for PgTx {
    async fn insert_request(&mut self, header: &RequestHeader, details: &[RequestDetail]) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO issue_requests (
                id, requester_id, department, status, note, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(header.id)
        .bind(header.requester_id)
        .bind(&header.department)
        .bind(header.status.as_str())
        .bind(&header.note)
        .bind(header.created_at)
        .bind(header.updated_at)
        .execute(&mut *self.tx)
        .await?;

        for detail in details {
            let placeholder = detail.placeholder.clone().unwrap_or_default();
            sqlx::query(
                r#"
                INSERT INTO issue_request_details (
                    id, request_id, line_no, material_id, proposed_code, proposed_name,
                    proposed_category, proposed_unit, quantity, note
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(detail.id)
            .bind(detail.request_id)
            .bind(detail.line_no)
            .bind(detail.material_id)
            .bind(placeholder.code)
            .bind(placeholder.name)
            .bind(placeholder.category)
            .bind(placeholder.unit)
            .bind(detail.quantity)
            .bind(&detail.note)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn lock_request(&mut self, request_id: Uuid) -> AppResult<RequestHeader> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM issue_requests WHERE id = $1 FOR UPDATE",
            REQUEST_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Request".to_string()))?;

        row.try_into()
    }

    async fn find_request(&mut self, request_id: Uuid) -> AppResult<Option<RequestHeader>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM issue_requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(RequestHeader::try_from).transpose()
    }

    async fn load_details(&mut self, request_id: Uuid) -> AppResult<Vec<RequestDetail>> {
        let rows = sqlx::query_as::<_, DetailRow>(
            r#"
            SELECT id, request_id, line_no, material_id, proposed_code, proposed_name,
                   proposed_category, proposed_unit, quantity, note
            FROM issue_request_details
            WHERE request_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_request(&mut self, header: &RequestHeader) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE issue_requests
            SET status = $2, approver_id = $3, approval_mode = $4, decided_at = $5,
                decision_note = $6, auto_approval_note = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(header.id)
        .bind(header.status.as_str())
        .bind(header.approver_id)
        .bind(header.approval_mode.map(|m| m.as_str()))
        .bind(header.decided_at)
        .bind(&header.decision_note)
        .bind(&header.auto_approval_note)
        .bind(header.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Request".to_string()));
        }
        Ok(())
    }

    async fn map_detail(&mut self, detail_id: Uuid, material_id: Uuid) -> AppResult<()> {
        let result = sqlx::query("UPDATE issue_request_details SET material_id = $2 WHERE id = $1")
            .bind(detail_id)
            .bind(material_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Request detail".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

impl CatalogTx for PgTx {
    async fn find_material_by_id(&mut self, material_id: Uuid) -> AppResult<Option<Material>> {
        let row = sqlx::query_as::<_, MaterialRow>(
            "SELECT id, code, name, unit, category, created_at FROM materials WHERE id = $1",
        )
        .bind(material_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_material_by_code(&mut self, code: &str) -> AppResult<Option<Material>> {
        let row = sqlx::query_as::<_, MaterialRow>(
            "SELECT id, code, name, unit, category, created_at FROM materials WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn create_material(&mut self, material: &NewMaterial) -> AppResult<Material> {
        let row = sqlx::query_as::<_, MaterialRow>(
            r#"
            INSERT INTO materials (id, code, name, unit, category)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, code, name, unit, category, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&material.code)
        .bind(&material.name)
        .bind(&material.unit)
        .bind(&material.category)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.into())
    }
}

impl StoreTx for PgTx {
    async fn commit(self) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
