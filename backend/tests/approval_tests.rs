//! Approval workflow tests
//!
//! Tests for the request lifecycle including:
//! - Automatic approval at creation and its gate on mapped lines
//! - Idempotent approval under retries and races
//! - Rejection and override releasing reserved stock
//! - Notifications after commit

use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDate, Utc};
use issue_engine::config::WorkflowConfig;
use issue_engine::services::{
    ApprovalService, Notification, NotificationKind, Notifier, StaticAuthorizer,
};
use issue_engine::store::MemoryStore;
use issue_engine::{AppError, AppResult};
use issue_shared::{
    ApprovalMode, AutoApproval, CreateRequestInput, Material, MaterialPlaceholder, NewMaterial,
    RequestLineInput, RequestStatus, Role, User,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::str::FromStr;
use uuid::Uuid;

// Helper to create Decimal from string
fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn expiry_in(days: i64) -> Option<NaiveDate> {
    Some((Utc::now() + Duration::days(days)).date_naive())
}

/// Notifier that keeps what it was asked to send
#[derive(Clone, Default)]
struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    fail: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn kinds(&self) -> Vec<NotificationKind> {
        self.sent.lock().unwrap().iter().map(|n| n.kind).collect()
    }
}

impl Notifier for RecordingNotifier {
    async fn deliver(&self, notification: Notification) -> AppResult<()> {
        self.sent.lock().unwrap().push(notification);
        if self.fail {
            return Err(AppError::Internal("mail relay unavailable".to_string()));
        }
        Ok(())
    }
}

type Service = ApprovalService<MemoryStore, StaticAuthorizer, RecordingNotifier>;

struct Harness {
    service: Arc<Service>,
    store: MemoryStore,
    notifier: RecordingNotifier,
    requester: Uuid,
    approver: Uuid,
    second_approver: Uuid,
    admin: Uuid,
}

fn user(name: &str, roles: Vec<Role>) -> User {
    User {
        id: Uuid::new_v4(),
        name: name.to_string(),
        department: Some("Production".to_string()),
        roles,
    }
}

fn harness_with(auto_approve: bool, notifier: RecordingNotifier) -> Harness {
    let requester = user("Requester", vec![Role::Requester]);
    let approver = user("Approver", vec![Role::Approver]);
    let second_approver = user("Second approver", vec![Role::Approver]);
    let admin = user("Admin", vec![Role::Administrator]);
    let authorizer = StaticAuthorizer::new([
        requester.clone(),
        approver.clone(),
        second_approver.clone(),
        admin.clone(),
    ]);

    let store = MemoryStore::new();
    let workflow = WorkflowConfig {
        auto_approve,
        ..WorkflowConfig::default()
    };
    let service = ApprovalService::new(store.clone(), authorizer, notifier.clone(), workflow);

    Harness {
        service: Arc::new(service),
        store,
        notifier,
        requester: requester.id,
        approver: approver.id,
        second_approver: second_approver.id,
        admin: admin.id,
    }
}

fn harness(auto_approve: bool) -> Harness {
    harness_with(auto_approve, RecordingNotifier::default())
}

impl Harness {
    fn material(&self, code: &str, lots: &[(&str, &str, Option<NaiveDate>)]) -> Material {
        let material = self
            .store
            .add_material(NewMaterial {
                code: code.to_string(),
                name: format!("Material {}", code),
                unit: "kg".to_string(),
                category: None,
            })
            .unwrap();
        for (lot, qty, expiry) in lots {
            self.store.receive_stock(material.id, lot, dec(qty), *expiry).unwrap();
        }
        material
    }

    fn reserved(&self, material: &Material, lot: &str) -> Decimal {
        self.store.lot_balance(material.id, lot).unwrap().unwrap().reserved
    }
}

fn line(material: &Material, qty: &str) -> RequestLineInput {
    RequestLineInput {
        material_id: Some(material.id),
        placeholder: None,
        quantity: dec(qty),
        note: None,
    }
}

fn unmapped_line(code: &str, qty: &str) -> RequestLineInput {
    RequestLineInput {
        material_id: None,
        placeholder: Some(MaterialPlaceholder {
            code: Some(code.to_string()),
            name: Some("New consumable".to_string()),
            category: Some("consumables".to_string()),
            unit: Some("box".to_string()),
        }),
        quantity: dec(qty),
        note: None,
    }
}

fn input(lines: Vec<RequestLineInput>) -> CreateRequestInput {
    CreateRequestInput {
        department: None,
        note: Some("Weekly production run".to_string()),
        lines,
    }
}

// ============================================================================
// Creation
// ============================================================================

#[cfg(test)]
mod creation_tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_approves_when_stock_is_available() {
        let h = harness(true);
        let sugar = h.material("SUGAR", &[("S-1", "20", expiry_in(10))]);

        let created = h
            .service
            .create_request(h.requester, input(vec![line(&sugar, "5")]))
            .await
            .unwrap();

        assert!(created.is_auto_approved());
        let header = &created.request.header;
        assert_eq!(header.status, RequestStatus::Approved);
        assert_eq!(header.approval_mode, Some(ApprovalMode::Automatic));
        assert_eq!(header.approver_id, None);
        assert!(header.decision_note.is_some());
        assert_eq!(created.request.reservations.len(), 1);
        assert_eq!(h.reserved(&sugar, "S-1"), dec("5"));
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::Approved]);
    }

    #[tokio::test]
    async fn test_shortage_keeps_request_pending_with_reason() {
        let h = harness(true);
        let flour = h.material("FLOUR", &[("F-1", "2", expiry_in(10))]);

        let created = h
            .service
            .create_request(h.requester, input(vec![line(&flour, "5")]))
            .await
            .unwrap();

        assert_eq!(created.request.status(), RequestStatus::Pending);
        assert!(created.request.reservations.is_empty());
        assert!(created.request.header.auto_approval_note.is_some());
        match &created.auto_approval {
            AutoApproval::Declined { shortages, .. } => {
                assert_eq!(shortages.len(), 1);
                assert_eq!(shortages[0].material_id, flour.id);
                assert_eq!(shortages[0].needed, dec("5"));
                assert_eq!(shortages[0].available, dec("2"));
            }
            other => panic!("expected Declined, got {:?}", other),
        }
        assert_eq!(h.reserved(&flour, "F-1"), Decimal::ZERO);
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::ApprovalNeeded]);
    }

    /// One unmapped line blocks auto-approval even when the rest is in stock
    #[tokio::test]
    async fn test_unmapped_line_never_auto_approves() {
        let h = harness(true);
        let salt = h.material("SALT", &[("SA-1", "100", None)]);

        let created = h
            .service
            .create_request(
                h.requester,
                input(vec![line(&salt, "1"), unmapped_line("YEAST-01", "2")]),
            )
            .await
            .unwrap();

        assert_eq!(created.request.status(), RequestStatus::Pending);
        assert!(matches!(created.auto_approval, AutoApproval::Skipped { .. }));
        assert!(created.request.reservations.is_empty());
        assert!(h.store.reservations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_approval_switch() {
        let h = harness(false);
        let salt = h.material("SALT", &[("SA-1", "100", None)]);

        let created = h
            .service
            .create_request(h.requester, input(vec![line(&salt, "1")]))
            .await
            .unwrap();

        assert_eq!(created.request.status(), RequestStatus::Pending);
        assert!(h.store.reservations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let h = harness(true);
        let salt = h.material("SALT", &[("SA-1", "100", None)]);

        let err = h
            .service
            .create_request(h.requester, input(vec![line(&salt, "-1")]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = h
            .service
            .create_request(h.requester, input(vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_duplicate_lines_are_aggregated() {
        let h = harness(true);
        let oil = h.material("OIL", &[("O-1", "3", expiry_in(3)), ("O-2", "3", expiry_in(9))]);

        let created = h
            .service
            .create_request(h.requester, input(vec![line(&oil, "2"), line(&oil, "2")]))
            .await
            .unwrap();

        assert!(created.is_auto_approved());
        assert_eq!(h.reserved(&oil, "O-1"), dec("3"));
        assert_eq!(h.reserved(&oil, "O-2"), dec("1"));
    }

    /// Quantities a stock column cannot hold are refused before anything is stored
    #[tokio::test]
    async fn test_oversized_quantities_are_refused_before_storing() {
        let h = harness(true);
        let salt = h.material("SALT", &[("SA-1", "100", None)]);

        let huge = RequestLineInput {
            quantity: Decimal::MAX,
            ..line(&salt, "1")
        };
        let err = h
            .service
            .create_request(h.requester, input(vec![huge.clone(), huge]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        // each line fits, their total for one material does not
        let at_cap = line(&salt, "99999999999999.9999");
        let err = h
            .service
            .create_request(
                h.requester,
                input(vec![at_cap.clone(), unmapped_line("YEAST-01", "1"), at_cap]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.to_response().error.field.as_deref(), Some("lines"));

        assert!(h.store.requests().unwrap().is_empty());
        assert!(h.notifier.kinds().is_empty());
        assert_eq!(h.reserved(&salt, "SA-1"), Decimal::ZERO);
    }

    /// The returned view is the stored request, and a failed delivery does
    /// not turn a committed creation into an error
    #[tokio::test]
    async fn test_created_view_matches_stored_request() {
        let h = harness_with(true, RecordingNotifier::failing());
        let sugar = h.material("SUGAR", &[("S-1", "20", expiry_in(10))]);
        let flour = h.material("FLOUR", &[("F-1", "2", None)]);

        let cases = [
            vec![line(&sugar, "5")],
            vec![line(&flour, "5")],
            vec![line(&sugar, "1"), unmapped_line("YEAST-01", "2")],
        ];
        for lines in cases {
            let created = h
                .service
                .create_request(h.requester, input(lines))
                .await
                .unwrap();
            let stored = h.service.get_request(created.request.header.id).await.unwrap();
            assert_eq!(created.request.header, stored.header);
            assert_eq!(created.request.details, stored.details);
            assert_eq!(created.request.reservations, stored.reservations);
        }
        assert_eq!(h.store.requests().unwrap().len(), 3);
        assert_eq!(h.notifier.kinds().len(), 3);
    }
}

// ============================================================================
// Transitions
// ============================================================================

#[cfg(test)]
mod transition_tests {
    use super::*;

    /// A second approval is refused and reserves nothing more
    #[tokio::test]
    async fn test_approve_is_idempotent() {
        let h = harness(false);
        let milk = h.material("MILK", &[("M-1", "10", expiry_in(2))]);
        let created = h
            .service
            .create_request(h.requester, input(vec![line(&milk, "4")]))
            .await
            .unwrap();
        let id = created.request.header.id;

        let approved = h.service.approve(id, h.approver, None).await.unwrap();
        assert_eq!(approved.status(), RequestStatus::Approved);
        assert_eq!(approved.header.approver_id, Some(h.approver));

        let err = h.service.approve(id, h.approver, None).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::AlreadyProcessed { status: RequestStatus::Approved, .. }
        ));
        assert_eq!(h.store.reservations().unwrap().len(), 1);
        assert_eq!(h.reserved(&milk, "M-1"), dec("4"));
    }

    /// Two approvers racing on one request: exactly one wins
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_approvers_one_wins() {
        let h = harness(false);
        let milk = h.material("MILK", &[("M-1", "10", expiry_in(2))]);
        let id = h
            .service
            .create_request(h.requester, input(vec![line(&milk, "4")]))
            .await
            .unwrap()
            .request
            .header
            .id;

        let first = {
            let service = Arc::clone(&h.service);
            let approver = h.approver;
            tokio::spawn(async move { service.approve(id, approver, None).await })
        };
        let second = {
            let service = Arc::clone(&h.service);
            let approver = h.second_approver;
            tokio::spawn(async move { service.approve(id, approver, None).await })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let already = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::AlreadyProcessed { .. })))
            .count();

        assert_eq!(wins, 1);
        assert_eq!(already, 1);
        assert_eq!(h.reserved(&milk, "M-1"), dec("4"));
    }

    /// Two materials, one short: approval fails and nothing changes
    #[tokio::test]
    async fn test_approve_all_or_nothing() {
        let h = harness(false);
        let eggs = h.material("EGGS", &[("E-1", "30", expiry_in(4))]);
        let cream = h.material("CREAM", &[("C-1", "1", expiry_in(4))]);
        let id = h
            .service
            .create_request(h.requester, input(vec![line(&eggs, "12"), line(&cream, "2")]))
            .await
            .unwrap()
            .request
            .header
            .id;

        let err = h.service.approve(id, h.approver, None).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");
        assert_eq!(err.shortages().len(), 1);
        assert_eq!(err.shortages()[0].material_id, cream.id);

        let view = h.service.get_request(id).await.unwrap();
        assert_eq!(view.status(), RequestStatus::Pending);
        assert!(view.reservations.is_empty());
        assert_eq!(h.reserved(&eggs, "E-1"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_approve_without_resolvable_material() {
        let h = harness(false);
        let mut line = unmapped_line("MYSTERY", "1");
        if let Some(placeholder) = line.placeholder.as_mut() {
            placeholder.unit = None;
        }
        let id = h
            .service
            .create_request(h.requester, input(vec![line]))
            .await
            .unwrap()
            .request
            .header
            .id;

        let err = h.service.approve(id, h.approver, None).await.unwrap_err();
        match err {
            AppError::UnmappedMaterial { detail_ids } => assert_eq!(detail_ids.len(), 1),
            other => panic!("expected UnmappedMaterial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reject_pending_request() {
        let h = harness(false);
        let milk = h.material("MILK", &[("M-1", "10", None)]);
        let id = h
            .service
            .create_request(h.requester, input(vec![line(&milk, "4")]))
            .await
            .unwrap()
            .request
            .header
            .id;

        let view = h
            .service
            .reject(id, h.approver, Some("Not in this week's plan".into()))
            .await
            .unwrap();
        assert_eq!(view.status(), RequestStatus::Rejected);
        assert_eq!(view.header.decision_note.as_deref(), Some("Not in this week's plan"));

        let err = h.service.reject(id, h.approver, None).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_PROCESSED");
        let err = h.service.approve(id, h.approver, None).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_PROCESSED");
    }

    /// Override after approval returns reserved stock to its prior level
    #[tokio::test]
    async fn test_override_releases_stock() {
        let h = harness(true);
        let butter = h.material("BUTTER", &[("B-1", "8", expiry_in(6))]);

        let before = h.service.available_stock(butter.id).await.unwrap();
        let created = h
            .service
            .create_request(h.requester, input(vec![line(&butter, "6")]))
            .await
            .unwrap();
        assert!(created.is_auto_approved());
        assert_eq!(h.reserved(&butter, "B-1"), dec("6"));

        let id = created.request.header.id;
        let err = h.service.reject(id, h.approver, None).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_PROCESSED");

        let view = h
            .service
            .override_reject(id, h.admin, Some("Production cancelled".into()))
            .await
            .unwrap();
        assert_eq!(view.status(), RequestStatus::Rejected);
        assert_eq!(view.header.approval_mode, Some(ApprovalMode::Override));

        let after = h.service.available_stock(butter.id).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(h.reserved(&butter, "B-1"), Decimal::ZERO);

        let err = h.service.override_reject(id, h.admin, None).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_PROCESSED");
    }

    #[tokio::test]
    async fn test_override_requires_administrator() {
        let h = harness(true);
        let butter = h.material("BUTTER", &[("B-1", "8", None)]);
        let id = h
            .service
            .create_request(h.requester, input(vec![line(&butter, "1")]))
            .await
            .unwrap()
            .request
            .header
            .id;

        let err = h.service.override_reject(id, h.approver, None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");
    }

    #[tokio::test]
    async fn test_request_adjustment_keeps_pending() {
        let h = harness(false);
        let milk = h.material("MILK", &[("M-1", "10", None)]);
        let id = h
            .service
            .create_request(h.requester, input(vec![line(&milk, "4")]))
            .await
            .unwrap()
            .request
            .header
            .id;

        let view = h
            .service
            .request_adjustment(id, h.approver, Some("Split into two requests".into()))
            .await
            .unwrap();
        assert_eq!(view.status(), RequestStatus::Pending);
        assert!(view.reservations.is_empty());
        assert_eq!(
            h.notifier.kinds(),
            vec![NotificationKind::ApprovalNeeded, NotificationKind::AdjustmentRequested]
        );

        h.service.approve(id, h.approver, None).await.unwrap();
        let err = h.service.request_adjustment(id, h.approver, None).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_PROCESSED");
    }

    #[tokio::test]
    async fn test_missing_request() {
        let h = harness(false);
        let err = h.service.approve(Uuid::new_v4(), h.approver, None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = h.service.get_request(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    /// A failed delivery never undoes the committed transition
    #[tokio::test]
    async fn test_notification_failure_does_not_roll_back() {
        let h = harness_with(false, RecordingNotifier::failing());
        let milk = h.material("MILK", &[("M-1", "10", None)]);
        let id = h
            .service
            .create_request(h.requester, input(vec![line(&milk, "4")]))
            .await
            .unwrap()
            .request
            .header
            .id;

        let view = h.service.approve(id, h.approver, None).await.unwrap();
        assert_eq!(view.status(), RequestStatus::Approved);
        let stored = h.service.get_request(id).await.unwrap();
        assert_eq!(stored.status(), RequestStatus::Approved);
        assert_eq!(h.notifier.kinds().len(), 2);
    }

    #[tokio::test]
    async fn test_available_stock_in_fefo_order() {
        let h = harness(false);
        let rice = h.material(
            "RICE",
            &[("R-LATE", "5", expiry_in(40)), ("R-NONE", "5", None), ("R-SOON", "5", expiry_in(2))],
        );

        let lots: Vec<String> = h
            .service
            .available_stock(rice.id)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.lot_number)
            .collect();
        assert_eq!(lots, vec!["R-SOON", "R-LATE", "R-NONE"]);
    }
}

// ============================================================================
// Property Tests
// ============================================================================

#[cfg(test)]
mod property_tests {
    use super::*;

    /// Workflow actions applied in random order
    #[derive(Debug, Clone, Copy)]
    enum Action {
        Approve,
        Reject,
        Adjust,
        Override,
    }

    fn action_strategy() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::Approve),
            Just(Action::Reject),
            Just(Action::Adjust),
            Just(Action::Override),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Property: once a request leaves Pending it only ever moves to
        /// Rejected by override, and reservations exist only while Approved
        #[test]
        fn prop_status_transitions_are_monotonic(
            actions in prop::collection::vec(action_strategy(), 1..8),
            quantity in (1i64..=60i64).prop_map(|n| Decimal::new(n, 1))
        ) {
            let h = harness(false);
            let tea = h.material("TEA", &[("T-1", "3", expiry_in(5)), ("T-2", "3", None)]);

            tokio_test::block_on(async {
                let id = h
                    .service
                    .create_request(h.requester, input(vec![RequestLineInput {
                        material_id: Some(tea.id),
                        placeholder: None,
                        quantity,
                        note: None,
                    }]))
                    .await
                    .unwrap()
                    .request
                    .header
                    .id;

                let mut previous = RequestStatus::Pending;
                for action in &actions {
                    let _ = match action {
                        Action::Approve => h.service.approve(id, h.approver, None).await,
                        Action::Reject => h.service.reject(id, h.approver, None).await,
                        Action::Adjust => h.service.request_adjustment(id, h.approver, None).await,
                        Action::Override => h.service.override_reject(id, h.admin, None).await,
                    };

                    let view = h.service.get_request(id).await.unwrap();
                    let status = view.status();
                    let allowed = match previous {
                        RequestStatus::Pending => true,
                        RequestStatus::Approved => {
                            matches!(status, RequestStatus::Approved | RequestStatus::Rejected)
                        }
                        RequestStatus::Rejected => status == RequestStatus::Rejected,
                    };
                    assert!(allowed, "{:?} -> {:?}", previous, status);

                    let reserved: Decimal = view.reservations.iter().map(|r| r.quantity_reserved).sum();
                    if status == RequestStatus::Approved {
                        assert_eq!(reserved, quantity);
                    } else {
                        assert_eq!(reserved, Decimal::ZERO);
                    }
                    previous = status;
                }
            });

            let balances = tokio_test::block_on(h.service.available_stock(tea.id)).unwrap();
            for balance in balances {
                prop_assert!(balance.reserved <= balance.physical_stock);
            }
        }
    }
}
