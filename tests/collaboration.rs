use chrono::NaiveDate;
use cosheet::cell::CellPos;
use cosheet::inventory::ledger_column_names;
use cosheet::{
    CapturingTransport, CollabConfig, CommitOutcome, EditRequestStatus, HubTransport, InboundEvent,
    LocalHub, LockOutcome, MemoryGateway, MemoryServer, PersistenceGateway, ReconcileOutcome, Role,
    SheetError, SheetId, SheetSession, SheetTemplate, User,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

type HubSession = SheetSession<MemoryGateway, HubTransport>;

fn ledger_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

fn alice() -> User {
    User::new(1, "alice", Role::Admin).with_display_name("Alice")
}

fn bob() -> User {
    User::new(2, "bob", Role::Editor).with_display_name("Bob")
}

fn carol() -> User {
    User::new(3, "carol", Role::Editor)
}

struct Office {
    server: MemoryServer,
    hub: LocalHub,
    sheet_id: SheetId,
}

impl Office {
    /// An inventory sheet created on `ledger_day`.
    async fn new() -> Office {
        let server = MemoryServer::new(CollabConfig::default());
        server.set_today(ledger_day());
        let hub = LocalHub::with_server(&server);
        let sheet_id = server
            .connect(alice())
            .create_sheet("Stock", SheetTemplate::Inventory)
            .await
            .unwrap();
        Office { server, hub, sheet_id }
    }

    async fn open(&self, user: User, today: NaiveDate) -> HubSession {
        let mut session = SheetSession::open(
            self.server.connect(user.clone()),
            self.hub.connect(user.clone()),
            user,
            self.sheet_id,
            CollabConfig::default(),
        )
        .await
        .unwrap();
        session.set_today(today);
        session
    }
}

async fn settle(sessions: &mut [&mut HubSession]) {
    for session in sessions.iter_mut() {
        session.process_pending().await;
    }
}

#[tokio::test]
async fn test_edits_reach_the_other_session_with_derived_total() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;
    settle(&mut [&mut a, &mut b]).await;
    let (in_col, _) = ledger_column_names(ledger_day());

    let outcome = b.commit_cell_edit(0, &in_col, "12").await.unwrap();
    assert!(matches!(outcome, CommitOutcome::Applied { .. }));
    assert_eq!(b.sheet().get_cell(0, "Total").unwrap(), "52");

    let outcomes = a.process_pending().await;
    assert!(outcomes.iter().any(|o| matches!(o, ReconcileOutcome::Applied { .. })));
    assert_eq!(a.sheet().get_cell(0, &in_col).unwrap(), "12");
    assert_eq!(a.sheet().get_cell(0, "Total").unwrap(), "52");

    // the receiver applied without echoing anything back
    b.flush_autosave().await;
    assert_eq!(office.server.save_count(), 1);
    let outcomes = b.process_pending().await;
    assert!(outcomes.iter().all(|o| !matches!(o, ReconcileOutcome::Applied { .. })));
}

#[tokio::test]
async fn test_presence_blocks_a_focused_cell() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(a.coordinator().presence().len(), 2);

    b.begin_cell_edit(1, "Item").await.unwrap();
    a.process_pending().await;
    let bob_record = a.coordinator().presence().get(2).unwrap();
    assert_eq!(bob_record.current_cell.as_deref(), Some("A2"));
    assert!(matches!(a.begin_cell_edit(1, "Item").await, Err(SheetError::CellBusy { .. })));

    b.cancel_cell_edit().await;
    a.process_pending().await;
    assert_eq!(a.begin_cell_edit(1, "Item").await.unwrap(), CellPos::new(1, 0));
}

#[tokio::test]
async fn test_lock_is_exclusive() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;
    let mut c = office.open(carol(), ledger_day()).await;

    assert_eq!(b.lock().await.unwrap(), LockOutcome::Acquired);
    assert_eq!(b.lock().await.unwrap(), LockOutcome::AlreadyHeld);
    settle(&mut [&mut a, &mut b, &mut c]).await;

    assert_eq!(c.coordinator().lock_holder().map(|h| h.user_id), Some(2));
    assert!(matches!(c.commit_cell_edit(0, "Unit", "crate").await, Err(SheetError::LockedBy { .. })));
    assert_eq!(c.sheet().get_cell(0, "Unit").unwrap(), "box");
    assert!(matches!(c.unlock().await, Err(SheetError::NotLockHolder)));
    // no preemption, even for an admin
    assert!(matches!(a.lock().await, Err(SheetError::LockedBy { .. })));
    // but the admin may still write
    a.commit_cell_edit(0, "Unit", "case").await.unwrap();

    b.unlock().await.unwrap();
    settle(&mut [&mut a, &mut b, &mut c]).await;
    assert!(!c.coordinator().is_locked());
    c.commit_cell_edit(0, "Unit", "crate").await.unwrap();
}

#[tokio::test]
async fn test_failed_lock_refreshes_a_stale_view() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;

    b.lock().await.unwrap();
    // alice has not processed the lock notice yet
    assert!(!a.coordinator().is_locked());
    assert!(matches!(a.lock().await, Err(SheetError::LockedBy { .. })));
    assert_eq!(a.coordinator().lock_holder().map(|h| h.user_id), Some(2));
}

#[tokio::test]
async fn test_viewer_is_read_only() {
    let office = Office::new().await;
    let mut v = office.open(User::new(9, "vic", Role::Viewer), ledger_day()).await;
    assert!(matches!(v.commit_cell_edit(0, "Unit", "x").await, Err(SheetError::ReadOnly { .. })));
    assert!(matches!(v.add_column("Extra"), Err(SheetError::ReadOnly { .. })));
    assert!(matches!(v.lock().await, Err(SheetError::ReadOnly { .. })));
}

#[tokio::test]
async fn test_historical_cells_go_through_approval() {
    let office = Office::new().await;
    let next_day = ledger_day().succ_opt().unwrap();
    let mut a = office.open(alice(), next_day).await;
    let mut b = office.open(bob(), next_day).await;
    settle(&mut [&mut a, &mut b]).await;
    let (in_col, _) = ledger_column_names(ledger_day());

    let outcome = b.commit_cell_edit(0, &in_col, "5").await.unwrap();
    let CommitOutcome::RequestSubmitted(request) = outcome else {
        panic!("expected an edit request");
    };
    assert_eq!(request.cell_ref, "D1");
    assert_eq!(b.sheet().get_cell(0, &in_col).unwrap(), "");
    assert!(!b.autosave_pending());

    a.process_pending().await;
    assert_eq!(a.coordinator().pending_requests(), 1);
    let pending = a.list_edit_requests(Some(EditRequestStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);

    // only elevated users resolve
    assert!(matches!(
        b.resolve_edit_request(request.id, true, None).await,
        Err(SheetError::NotElevated)
    ));

    let resolved = a.resolve_edit_request(request.id, true, None).await.unwrap();
    assert_eq!(resolved.status, EditRequestStatus::Approved);
    assert_eq!(a.sheet().get_cell(0, &in_col).unwrap(), "5");
    assert_eq!(a.sheet().get_cell(0, "Total").unwrap(), "45");
    a.process_pending().await;
    assert_eq!(a.coordinator().pending_requests(), 0);

    b.process_pending().await;
    assert_eq!(b.sheet().get_cell(0, &in_col).unwrap(), "5");
    assert_eq!(b.sheet().get_cell(0, "Total").unwrap(), "45");
    let cell = CellPos::new(0, 3);
    assert!(b.coordinator().has_grant(cell));

    // the grant covers exactly one further edit
    let outcome = b.commit_cell_edit(0, &in_col, "6").await.unwrap();
    assert_eq!(outcome, CommitOutcome::Applied { cell, used_grant: true });
    let outcome = b.commit_cell_edit(0, &in_col, "7").await.unwrap();
    assert!(matches!(outcome, CommitOutcome::RequestSubmitted(_)));
    assert_eq!(b.sheet().get_cell(0, &in_col).unwrap(), "6");
}

#[tokio::test]
async fn test_rejection_leaves_the_cell() {
    let office = Office::new().await;
    let next_day = ledger_day().succ_opt().unwrap();
    let mut a = office.open(alice(), next_day).await;
    let mut b = office.open(bob(), next_day).await;
    let (_, out_col) = ledger_column_names(ledger_day());

    let CommitOutcome::RequestSubmitted(request) = b.commit_cell_edit(1, &out_col, "3").await.unwrap() else {
        panic!("expected an edit request");
    };
    let resolved = a
        .resolve_edit_request(request.id, false, Some("count again"))
        .await
        .unwrap();
    assert_eq!(resolved.status, EditRequestStatus::Rejected);
    assert_eq!(resolved.reject_reason.as_deref(), Some("count again"));
    assert!(matches!(
        a.resolve_edit_request(request.id, true, None).await,
        Err(SheetError::AlreadyResolved(_))
    ));

    b.process_pending().await;
    assert_eq!(b.sheet().get_cell(1, &out_col).unwrap(), "");
    assert!(!b.coordinator().has_grant(CellPos::new(1, 4)));
}

#[tokio::test]
async fn test_update_beyond_the_grid_grows_rows() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;
    assert_eq!(b.sheet().row_count(), 100);

    while a.sheet().row_count() < 150 {
        a.add_row().unwrap();
    }
    a.commit_cell_edit(149, "Item", "Masks").await.unwrap();

    b.process_pending().await;
    assert_eq!(b.sheet().row_count(), 150);
    assert_eq!(b.sheet().get_cell(149, "Item").unwrap(), "Masks");
}

#[tokio::test]
async fn test_remote_save_reloads_unless_editing() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;
    settle(&mut [&mut a, &mut b]).await;

    a.add_column("Supplier").unwrap();
    a.save_now().await.unwrap();
    let outcomes = b.process_pending().await;
    assert!(outcomes.contains(&ReconcileOutcome::ReloadRequired));
    assert!(b.sheet().has_column("Supplier"));

    b.begin_cell_edit(2, "Unit").await.unwrap();
    a.remove_column("Supplier").unwrap();
    a.save_now().await.unwrap();
    let outcomes = b.process_pending().await;
    assert!(outcomes.contains(&ReconcileOutcome::ReloadSkipped));
    assert!(b.sheet().has_column("Supplier"));
}

#[tokio::test]
async fn test_remote_save_keeps_unsaved_local_edits() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;
    settle(&mut [&mut a, &mut b]).await;

    b.commit_cell_edit(0, "Unit", "pair").await.unwrap();
    assert!(b.autosave_pending());
    // alice saves before hearing about bob's edit
    a.add_column("Supplier").unwrap();
    a.save_now().await.unwrap();

    let outcomes = b.process_pending().await;
    assert!(outcomes.contains(&ReconcileOutcome::ReloadSkipped));
    assert!(!outcomes.contains(&ReconcileOutcome::ReloadRequired));
    assert_eq!(b.sheet().get_cell(0, "Unit").unwrap(), "pair");

    b.flush_autosave().await;
    assert!(!b.autosave_pending());
    let stored = office.server.snapshot(office.sheet_id).unwrap();
    assert_eq!(stored.rows[0].get("Unit").map(String::as_str), Some("pair"));
}

#[tokio::test]
async fn test_reconnect_rejoins_the_room() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(office.hub.room_members(office.sheet_id), vec![1, 2]);

    b.transport().disconnect();
    a.process_pending().await;
    assert_eq!(office.hub.room_members(office.sheet_id), vec![1]);
    assert_eq!(a.coordinator().presence().len(), 1);

    b.transport().reconnect();
    let outcomes = b.process_pending().await;
    assert!(outcomes.contains(&ReconcileOutcome::Reannounce));
    assert_eq!(office.hub.room_members(office.sheet_id), vec![1, 2]);
    a.process_pending().await;
    assert_eq!(a.coordinator().presence().len(), 2);
}

#[tokio::test]
async fn test_delete_waits_for_the_lock_holder() {
    let office = Office::new().await;
    let mut a = office.open(alice(), ledger_day()).await;
    let mut b = office.open(bob(), ledger_day()).await;

    b.lock().await.unwrap();
    assert!(matches!(a.delete_sheet().await, Err(SheetError::SheetBusy { .. })));
    assert!(!a.is_closed());

    b.unlock().await.unwrap();
    a.delete_sheet().await.unwrap();
    assert!(a.is_closed());
    assert!(office.server.sheet_ids().is_empty());
    assert!(matches!(b.reload().await, Err(SheetError::SheetNotFound(_))));
}

#[tokio::test]
async fn test_ledger_day_is_shared_after_save() {
    let office = Office::new().await;
    let next_day = ledger_day().succ_opt().unwrap();
    let mut a = office.open(alice(), next_day).await;
    let mut b = office.open(bob(), next_day).await;

    a.add_ledger_day(next_day).unwrap();
    assert!(matches!(a.add_ledger_day(next_day), Err(SheetError::LedgerDayExists(_))));
    a.flush_autosave().await;
    b.process_pending().await;

    let (in_col, out_col) = ledger_column_names(next_day);
    let total = b.sheet().column_index("Total").unwrap();
    assert_eq!(b.sheet().column_index(&in_col), Some(total - 2));
    assert_eq!(b.sheet().column_index(&out_col), Some(total - 1));
    // today's columns are open to editors
    let outcome = b.commit_cell_edit(2, &out_col, "10").await.unwrap();
    assert!(matches!(outcome, CommitOutcome::Applied { .. }));
    assert_eq!(b.sheet().get_cell(2, "Total").unwrap(), "50");
}

async fn capturing_session(server: &MemoryServer, sheet_id: SheetId) -> (SheetSession<MemoryGateway, CapturingTransport>, CapturingTransport) {
    let transport = CapturingTransport::new();
    let session = SheetSession::open(
        server.connect(bob()),
        transport.clone(),
        bob(),
        sheet_id,
        CollabConfig::default(),
    )
    .await
    .unwrap();
    (session, transport)
}

#[tokio::test(start_paused = true)]
async fn test_autosave_waits_for_a_quiet_period() {
    let office = Office::new().await;
    let (mut session, _transport) = capturing_session(&office.server, office.sheet_id).await;

    session.commit_cell_edit(0, "Unit", "pair").await.unwrap();
    tokio::time::advance(Duration::from_millis(1000)).await;
    // a second edit restarts the two second window
    session.commit_cell_edit(1, "Unit", "box").await.unwrap();

    let server = office.server.clone();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let observer = async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let early = server.save_count();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let late = server.save_count();
        let _ = tx.send(());
        (early, late)
    };
    let (result, (early, late)) = tokio::join!(
        session.run(async {
            let _ = rx.await;
        }),
        observer
    );
    result.unwrap();
    assert_eq!((early, late), (0, 1));
    assert!(session.is_closed());

    let stored = office.server.snapshot(office.sheet_id).unwrap();
    assert_eq!(stored.rows[0].get("Unit").map(String::as_str), Some("pair"));
    assert_eq!(stored.rows[1].get("Unit").map(String::as_str), Some("box"));
}

#[tokio::test(start_paused = true)]
async fn test_run_applies_inbound_events() {
    let office = Office::new().await;
    let (mut session, transport) = capturing_session(&office.server, office.sheet_id).await;
    let sheet_id = office.sheet_id;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let feeder = async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.push(InboundEvent::CellUpdated {
            sheet_id,
            row_index: 2,
            column_name: "Item".to_string(),
            value: "Gauze".to_string(),
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = tx.send(());
        transport
    };
    let (result, transport) = tokio::join!(
        session.run(async {
            let _ = rx.await;
        }),
        feeder
    );
    result.unwrap();
    assert_eq!(session.sheet().get_cell(1, "Item").unwrap(), "Gauze");
    assert!(!transport.is_attached());
}
