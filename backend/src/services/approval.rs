//! Approval workflow for material issue requests
//!
//! Requests move `Pending -> Approved` or `Pending -> Rejected`. Every
//! transition locks the header row first and re-reads its status under the
//! lock, so two approvers (or the automatic approver and a manual one) can
//! never both act on the same request. Any error drops the transaction, which
//! rolls back every write made during the transition.

use chrono::Utc;
use issue_shared::{
    demand_vector, Actor, ApprovalMode, AutoApproval, CreateRequestInput, DemandError,
    DemandVector, LotBalance, RequestCreated, RequestDetail, RequestHeader, RequestStatus,
    RequestView, Reservation, Role,
};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::WorkflowConfig;
use crate::error::{AppError, AppResult};
use crate::services::allocation::AllocationEngine;
use crate::services::authorization::Authorizer;
use crate::services::notification::Notifier;
use crate::store::{
    CatalogTx, InventoryStore, LedgerTx, RequestTx, ReservationTx, StoreTx,
};

/// Approval workflow service
///
/// Wired against Postgres:
///
/// ```no_run
/// use issue_engine::services::{ApprovalService, PgAuthorizer, QueueNotifier};
/// use issue_engine::store::PgStore;
/// use issue_engine::Config;
///
/// # async fn run(material_id: uuid::Uuid) -> issue_engine::AppResult<()> {
/// let config = Config::load()?;
/// let store = PgStore::connect(&config.database).await?;
/// let pool = store.pool().clone();
/// let service = ApprovalService::new(
///     store,
///     PgAuthorizer::new(pool.clone()),
///     QueueNotifier::new(pool),
///     config.workflow,
/// );
/// let lots = service.available_stock(material_id).await?;
/// # let _ = lots;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApprovalService<S, A, N> {
    store: S,
    authorizer: A,
    notifier: N,
    engine: AllocationEngine,
    workflow: WorkflowConfig,
}

fn ensure_pending(header: &RequestHeader) -> AppResult<()> {
    if header.status.is_terminal() {
        return Err(AppError::AlreadyProcessed {
            request_id: header.id,
            status: header.status,
        });
    }
    Ok(())
}

fn non_blank(note: Option<String>) -> Option<String> {
    note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

impl<S, A, N> ApprovalService<S, A, N>
where
    S: InventoryStore,
    A: Authorizer,
    N: Notifier,
{
    /// Create a new ApprovalService instance
    pub fn new(store: S, authorizer: A, notifier: N, workflow: WorkflowConfig) -> Self {
        Self {
            store,
            authorizer,
            notifier,
            engine: AllocationEngine::default(),
            workflow,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Submit a request, then try to approve it automatically.
    ///
    /// The request is committed as Pending first. The automatic attempt runs
    /// in a separate transaction, and its failure is reported in the result
    /// rather than as an error. Once the request is committed this never
    /// returns an error.
    #[tracing::instrument(skip(self, input), fields(lines = input.lines.len()))]
    pub async fn create_request(
        &self,
        creator_id: Uuid,
        input: CreateRequestInput,
    ) -> AppResult<RequestCreated> {
        let creator = self.authorizer.require_role(creator_id, Role::Requester).await?;
        input.validate()?;

        let now = Utc::now();
        let header = RequestHeader {
            id: Uuid::new_v4(),
            requester_id: creator.id,
            department: non_blank(input.department).or(creator.department),
            status: RequestStatus::Pending,
            approver_id: None,
            approval_mode: None,
            decided_at: None,
            decision_note: None,
            auto_approval_note: None,
            note: non_blank(input.note),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.store.begin().await?;
        let mut details = Vec::with_capacity(input.lines.len());
        for (idx, line) in input.lines.into_iter().enumerate() {
            if let Some(material_id) = line.material_id {
                if tx.find_material_by_id(material_id).await?.is_none() {
                    return Err(AppError::NotFound(format!("Material {}", material_id)));
                }
            }
            details.push(RequestDetail {
                id: Uuid::new_v4(),
                request_id: header.id,
                line_no: idx as i32 + 1,
                material_id: line.material_id,
                placeholder: line.placeholder,
                quantity: line.quantity,
                note: non_blank(line.note),
            });
        }
        // Oversized totals are refused before anything is stored
        let demand = match demand_vector(&details) {
            Err(overflow @ DemandError::Overflow { .. }) => return Err(overflow.into()),
            other => other,
        };
        tx.insert_request(&header, &details).await?;
        tx.commit().await?;

        info!(request_id = %header.id, %creator_id, "Issue request created");

        let submitted = RequestView {
            header,
            details,
            reservations: Vec::new(),
        };
        let (auto_approval, view) = self.auto_approve(submitted, demand).await;

        let delivery = if view.header.status == RequestStatus::Approved {
            self.notifier
                .notify_result(&view.header, true, view.header.decision_note.as_deref())
                .await
        } else {
            self.notifier.notify_for_approval(&view.header).await
        };
        self.log_delivery(view.header.id, delivery);

        Ok(RequestCreated {
            request: view,
            auto_approval,
        })
    }

    /// Approve a pending request, mapping placeholder lines and reserving stock.
    ///
    /// # Errors
    ///
    /// - `AlreadyProcessed` when the request is no longer Pending
    /// - `UnmappedMaterial` when a line can be neither matched nor catalogued
    /// - `InsufficientStock` listing every short material
    #[tracing::instrument(skip(self, note))]
    pub async fn approve(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        note: Option<String>,
    ) -> AppResult<RequestView> {
        let approver = self.authorizer.require_role(approver_id, Role::Approver).await?;
        let note = non_blank(note);

        let mut tx = self.store.begin().await?;
        let mut header = tx.lock_request(request_id).await?;
        ensure_pending(&header)?;

        let details = resolve_materials(&mut tx, request_id).await?;
        let demand = demand_vector(&details)?;

        let reservations = self
            .engine
            .allocate(&mut tx, request_id, &demand, Actor::User(approver.id), note.as_deref())
            .await?;

        let now = Utc::now();
        header.status = RequestStatus::Approved;
        header.approver_id = Some(approver.id);
        header.approval_mode = Some(ApprovalMode::Manual);
        header.decided_at = Some(now);
        header.decision_note = note;
        header.updated_at = now;
        tx.update_request(&header).await?;
        tx.commit().await?;

        info!(%request_id, %approver_id, reservations = reservations.len(), "Request approved");

        let delivery = self
            .notifier
            .notify_result(&header, true, header.decision_note.as_deref())
            .await;
        self.log_delivery(request_id, delivery);

        Ok(RequestView {
            header,
            details,
            reservations,
        })
    }

    /// Reject a pending request and release anything it holds
    #[tracing::instrument(skip(self, note))]
    pub async fn reject(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        note: Option<String>,
    ) -> AppResult<RequestView> {
        let approver = self.authorizer.require_role(approver_id, Role::Approver).await?;

        let mut tx = self.store.begin().await?;
        let header = tx.lock_request(request_id).await?;
        ensure_pending(&header)?;

        let view = self
            .close_as_rejected(tx, header, approver.id, ApprovalMode::Manual, non_blank(note))
            .await?;
        info!(%request_id, %approver_id, "Request rejected");

        Ok(view)
    }

    /// Administrative rejection, allowed after approval as well.
    ///
    /// Active reservations are cancelled, so their stock becomes available
    /// again. Consumed reservations are left alone.
    #[tracing::instrument(skip(self, note))]
    pub async fn override_reject(
        &self,
        request_id: Uuid,
        admin_id: Uuid,
        note: Option<String>,
    ) -> AppResult<RequestView> {
        let admin = self
            .authorizer
            .require_role(admin_id, Role::Administrator)
            .await?;

        let mut tx = self.store.begin().await?;
        let header = tx.lock_request(request_id).await?;
        if header.status == RequestStatus::Rejected {
            return Err(AppError::AlreadyProcessed {
                request_id,
                status: header.status,
            });
        }

        let previous = header.status;
        let view = self
            .close_as_rejected(tx, header, admin.id, ApprovalMode::Override, non_blank(note))
            .await?;
        warn!(%request_id, %admin_id, previous = %previous, "Request rejected by override");

        Ok(view)
    }

    /// Ask the requester for changes. The request stays Pending.
    #[tracing::instrument(skip(self, note))]
    pub async fn request_adjustment(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
        note: Option<String>,
    ) -> AppResult<RequestView> {
        self.authorizer.require_role(approver_id, Role::Approver).await?;
        let note = non_blank(note);

        let mut tx = self.store.begin().await?;
        let header = tx.lock_request(request_id).await?;
        ensure_pending(&header)?;
        let details = tx.load_details(request_id).await?;
        let reservations = tx.list_active(request_id).await?;
        tx.commit().await?;

        info!(%request_id, %approver_id, "Adjustment requested");

        let delivery = self
            .notifier
            .notify_adjustment_requested(&header, note.as_deref())
            .await;
        self.log_delivery(request_id, delivery);

        Ok(RequestView {
            header,
            details,
            reservations,
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// A request with its lines and active reservations
    pub async fn get_request(&self, request_id: Uuid) -> AppResult<RequestView> {
        let mut tx = self.store.begin().await?;
        let header = tx
            .find_request(request_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Request {}", request_id)))?;
        let details = tx.load_details(request_id).await?;
        let reservations = tx.list_active(request_id).await?;
        tx.rollback().await?;

        Ok(RequestView {
            header,
            details,
            reservations,
        })
    }

    /// Per-lot physical, reserved and available quantity of one material, FEFO ordered
    pub async fn available_stock(&self, material_id: Uuid) -> AppResult<Vec<LotBalance>> {
        let mut tx = self.store.begin().await?;
        let balances = tx.lot_balances(Some(material_id)).await?;
        tx.rollback().await?;
        Ok(balances)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Creation-time approval attempt. Never fails the creation.
    ///
    /// Returns the outcome with the submitted view brought up to date.
    async fn auto_approve(
        &self,
        mut view: RequestView,
        demand: Result<DemandVector, DemandError>,
    ) -> (AutoApproval, RequestView) {
        let request_id = view.header.id;
        if !self.workflow.auto_approve {
            let outcome = AutoApproval::Skipped {
                reason: "Automatic approval is disabled".to_string(),
            };
            return (outcome, view);
        }

        let demand = match demand {
            Ok(demand) => demand,
            Err(DemandError::Unmapped(unmapped)) => {
                info!(%request_id, unmapped = unmapped.len(), "Auto-approval skipped");
                let outcome = AutoApproval::Skipped {
                    reason: format!(
                        "{} line(s) need a catalog material before approval",
                        unmapped.len()
                    ),
                };
                return (outcome, view);
            }
            Err(e) => {
                let reason = AppError::from(e).to_string();
                return (AutoApproval::Skipped { reason }, view);
            }
        };

        match self.try_auto_approve(request_id, &demand).await {
            Ok((header, reservations)) => {
                info!(%request_id, "Request approved automatically");
                view.header = header;
                view.reservations = reservations;
                (AutoApproval::Approved, view)
            }
            Err(AppError::AlreadyProcessed { status, .. }) => {
                // Someone else decided first; what we hold is stale
                match self.get_request(request_id).await {
                    Ok(current) => view = current,
                    Err(e) => warn!(%request_id, error = %e, "Failed to reload request"),
                }
                let outcome = AutoApproval::Skipped {
                    reason: format!("Request was already {}", status),
                };
                (outcome, view)
            }
            Err(e) => {
                warn!(%request_id, code = e.code(), error = %e, "Auto-approval declined");
                let reason = e.to_string();
                if let Some(header) = self.record_auto_approval_note(request_id, &reason).await {
                    view.header = header;
                }
                let outcome = AutoApproval::Declined {
                    reason,
                    shortages: e.shortages().to_vec(),
                };
                (outcome, view)
            }
        }
    }

    async fn try_auto_approve(
        &self,
        request_id: Uuid,
        demand: &DemandVector,
    ) -> AppResult<(RequestHeader, Vec<Reservation>)> {
        let mut tx = self.store.begin().await?;
        let mut header = tx.lock_request(request_id).await?;
        ensure_pending(&header)?;

        let note = self.workflow.auto_approve_note.as_str();
        let reservations = self
            .engine
            .allocate(&mut tx, request_id, demand, Actor::System, Some(note))
            .await?;

        let now = Utc::now();
        header.status = RequestStatus::Approved;
        header.approver_id = None;
        header.approval_mode = Some(ApprovalMode::Automatic);
        header.decided_at = Some(now);
        header.decision_note = Some(note.to_string());
        header.auto_approval_note = None;
        header.updated_at = now;
        tx.update_request(&header).await?;
        tx.commit().await?;

        Ok((header, reservations))
    }

    /// Best effort: keep why auto-approval declined on the header.
    ///
    /// Returns the stored header when the note was recorded.
    async fn record_auto_approval_note(&self, request_id: Uuid, reason: &str) -> Option<RequestHeader> {
        let result: AppResult<Option<RequestHeader>> = async {
            let mut tx = self.store.begin().await?;
            let mut header = tx.lock_request(request_id).await?;
            if header.status != RequestStatus::Pending {
                return Ok(None);
            }
            header.auto_approval_note = Some(reason.to_string());
            header.updated_at = Utc::now();
            tx.update_request(&header).await?;
            tx.commit().await?;
            Ok(Some(header))
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(%request_id, error = %e, "Failed to record auto-approval note");
            None
        })
    }

    /// Cancel active reservations, mark Rejected, commit, notify
    async fn close_as_rejected(
        &self,
        mut tx: S::Tx,
        mut header: RequestHeader,
        decided_by: Uuid,
        mode: ApprovalMode,
        note: Option<String>,
    ) -> AppResult<RequestView> {
        let request_id = header.id;
        let reason = note
            .clone()
            .unwrap_or_else(|| self.workflow.default_reject_reason.clone());
        let released = tx
            .cancel_active(request_id, &reason, Actor::User(decided_by))
            .await?;

        let now = Utc::now();
        header.status = RequestStatus::Rejected;
        header.approver_id = Some(decided_by);
        header.approval_mode = Some(mode);
        header.decided_at = Some(now);
        header.decision_note = note;
        header.updated_at = now;
        tx.update_request(&header).await?;
        let details = tx.load_details(request_id).await?;
        tx.commit().await?;

        if released > 0 {
            info!(%request_id, released, "Released reservations");
        }

        let delivery = self
            .notifier
            .notify_result(&header, false, header.decision_note.as_deref())
            .await;
        self.log_delivery(request_id, delivery);

        Ok(RequestView {
            header,
            details,
            reservations: Vec::new(),
        })
    }

    fn log_delivery(&self, request_id: Uuid, delivery: AppResult<()>) {
        if let Err(e) = delivery {
            warn!(%request_id, error = %e, "Notification delivery failed");
        }
    }
}

/// Map every unmapped line to a catalog material, creating materials from
/// placeholders when no code matches. Returns the refreshed lines.
async fn resolve_materials<T: StoreTx>(
    tx: &mut T,
    request_id: Uuid,
) -> AppResult<Vec<RequestDetail>> {
    let mut details = tx.load_details(request_id).await?;

    for detail in details.iter_mut().filter(|d| !d.is_mapped()) {
        let existing = match detail.proposed_code() {
            Some(code) => tx.find_material_by_code(code).await?,
            None => None,
        };

        let material = match existing {
            Some(material) => Some(material),
            None => match detail.placeholder.as_ref().and_then(|p| p.to_new_material()) {
                Some(new_material) => {
                    let material = tx.create_material(&new_material).await?;
                    info!(code = %material.code, material_id = %material.id, "Catalogued new material");
                    Some(material)
                }
                None => None,
            },
        };

        if let Some(material) = material {
            tx.map_detail(detail.id, material.id).await?;
            detail.material_id = Some(material.id);
        }
    }

    Ok(details)
}
