use super::*;
use crate::testing::{FakeClient, FakeClientFactory, InitBehavior, RecordingReporter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use waengine_protocol::{BackendReport, ReportStatus, SessionState, ViewerEvent};

struct Harness {
    manager: SessionManager,
    factory: Arc<FakeClientFactory>,
    reporter: Arc<RecordingReporter>,
    store: FsCredentialStore,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(Timeouts::default())
}

fn harness_with(timeouts: Timeouts) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = FsCredentialStore::new(dir.path().join("auth"));
    store.ensure_root().unwrap();

    let factory = Arc::new(FakeClientFactory::new());
    let reporter = Arc::new(RecordingReporter::new());
    let dispatcher = Dispatcher::new(Arc::new(ViewerHub::new()), reporter.clone());

    let manager = SessionManager::new(Services {
        factory: factory.clone(),
        credentials: Arc::new(store.clone()),
        dispatcher,
        timeouts,
    });

    Harness {
        manager,
        factory,
        reporter,
        store,
        _dir: dir,
    }
}

fn seed_credentials(store: &FsCredentialStore, id: &str) {
    std::fs::create_dir_all(store.entry_path(id).join("Default")).unwrap();
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

impl Harness {
    async fn wait_for(&self, id: &str, state: SessionState) {
        let session = self.manager.session(id).expect("session exists");
        within(session.wait_for_state(state))
            .await
            .expect("worker alive");
    }

    async fn connected(&self, id: &str, account: &str) -> Arc<FakeClient> {
        self.manager.connect(id).await.unwrap();
        let client = self.factory.client(id).expect("client created");
        client
            .emit(ClientEvent::Ready {
                account: account.to_string(),
            })
            .await;
        self.wait_for(id, SessionState::Connected).await;

        // The state is published before its effects run; the report is the
        // last of them.
        let expected = BackendReport::connected(id, account);
        within(async {
            while !self.reporter.reports().contains(&expected) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        client
    }
}

#[tokio::test]
async fn repeated_connect_creates_one_client() {
    let h = harness();

    assert_eq!(h.manager.connect("A").await.unwrap(), ConnectOutcome::Started);
    assert_eq!(
        h.manager.connect("A").await.unwrap(),
        ConnectOutcome::AlreadyInitializing
    );
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.manager.snapshot("A").unwrap().state, SessionState::Initializing);

    let client = h.factory.client("A").unwrap();
    client.emit(ClientEvent::PairingCode("QR-1".into())).await;
    h.wait_for("A", SessionState::AwaitingPairing).await;
    assert_eq!(
        h.manager.connect("A").await.unwrap(),
        ConnectOutcome::AlreadyInitializing
    );

    client
        .emit(ClientEvent::Ready {
            account: "6281".into(),
        })
        .await;
    h.wait_for("A", SessionState::Connected).await;
    assert_eq!(
        h.manager.connect("A").await.unwrap(),
        ConnectOutcome::AlreadyConnected
    );
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn concurrent_connects_start_a_single_client() {
    let h = Arc::new(harness());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = Arc::clone(&h);
        tasks.push(tokio::spawn(async move { h.manager.connect("A").await.unwrap() }));
    }
    let mut started = 0;
    for task in tasks {
        if task.await.unwrap() == ConnectOutcome::Started {
            started += 1;
        }
    }

    assert_eq!(started, 1);
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.manager.list().len(), 1);
}

#[tokio::test]
async fn connect_rejects_invalid_instance_ids() {
    let h = harness();

    for bad in ["", "has space", "../etc", "x".repeat(65).as_str()] {
        let err = h.manager.connect(bad).await.unwrap_err();
        assert_eq!(err.to_error_kind().0, ErrorKind::Invalid, "id {bad:?}");
    }
    assert!(h.manager.list().is_empty());
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn instances_are_independent() {
    let h = harness();

    h.connected("A", "6281").await;
    h.manager.connect("B").await.unwrap();

    assert_eq!(h.manager.snapshot("A").unwrap().state, SessionState::Connected);
    assert_eq!(h.manager.snapshot("B").unwrap().state, SessionState::Initializing);
    assert_eq!(h.factory.created(), 2);

    let ids: Vec<_> = h.manager.list().into_iter().map(|s| s.instance_id).collect();
    assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn pairing_ready_and_send() {
    let h = harness();
    let mut viewer = h.manager.subscribe("A");

    h.manager.connect("A").await.unwrap();
    let client = h.factory.client("A").unwrap();

    client.emit(ClientEvent::PairingCode("QR-1".into())).await;
    match within(viewer.recv()).await.unwrap() {
        ViewerEvent::PairingCode { image } => {
            assert!(image.starts_with("data:image/svg+xml;base64,"));
        }
        other => panic!("expected pairing code, got {other:?}"),
    }

    client
        .emit(ClientEvent::Ready {
            account: "6281".into(),
        })
        .await;
    assert_eq!(
        within(viewer.recv()).await.unwrap(),
        ViewerEvent::Ready {
            status: ReportStatus::Connected,
            phone: "6281".into(),
        }
    );

    let reports = within(h.reporter.wait_for_reports(1)).await;
    assert_eq!(reports, vec![BackendReport::connected("A", "6281")]);

    let snapshot = h.manager.snapshot("A").unwrap();
    assert_eq!(snapshot.state, SessionState::Connected);
    assert_eq!(snapshot.account_identifier.as_deref(), Some("6281"));

    h.manager
        .send_message("A", "6281234567892", "hello")
        .await
        .unwrap();
    h.manager
        .send_message("A", "6281234567893@c.us", "again")
        .await
        .unwrap();
    assert_eq!(
        client.sent(),
        vec![
            ("6281234567892@c.us".to_string(), "hello".to_string()),
            ("6281234567893@c.us".to_string(), "again".to_string()),
        ]
    );
}

#[tokio::test]
async fn pairing_code_after_ready_is_not_shown() {
    let h = harness();
    let client = h.connected("A", "6281").await;
    let mut viewer = h.manager.subscribe("A");

    client.emit(ClientEvent::PairingCode("late".into())).await;
    client
        .emit(ClientEvent::Disconnected {
            reason: "logout".into(),
        })
        .await;
    // Events from one client are handled in order, so once the disconnect
    // has been reported the late code has been seen and dropped.
    within(h.reporter.wait_for_reports(2)).await;

    assert!(matches!(viewer.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn inbound_messages_do_not_change_state() {
    let h = harness();
    let client = h.connected("A", "6281").await;

    client
        .emit(ClientEvent::Message {
            from: "6282@c.us".into(),
            body: "hi".into(),
        })
        .await;
    h.manager.send_message("A", "6282", "hello").await.unwrap();

    assert_eq!(h.manager.snapshot("A").unwrap().state, SessionState::Connected);
    assert_eq!(client.sent().len(), 1);
}

#[tokio::test]
async fn send_to_unknown_instance_is_not_connected() {
    let h = harness();

    let err = h.manager.send_message("B", "6281", "hi").await.unwrap_err();
    assert!(matches!(err, EngineError::NotConnected(ref id) if id == "B"));
    assert_eq!(err.to_error_kind(), (ErrorKind::NotConnected, "Not connected".to_string()));

    // Sending never creates a session.
    assert!(h.manager.session("B").is_none());
    assert!(h.manager.list().is_empty());
}

#[tokio::test]
async fn send_before_ready_is_not_connected() {
    let h = harness();
    h.manager.connect("A").await.unwrap();
    let client = h.factory.client("A").unwrap();
    client.emit(ClientEvent::PairingCode("QR".into())).await;
    h.wait_for("A", SessionState::AwaitingPairing).await;

    let err = h.manager.send_message("A", "6281", "hi").await.unwrap_err();
    assert!(matches!(err, EngineError::NotConnected(_)));
    assert!(client.sent().is_empty());
}

#[tokio::test]
async fn send_validates_fields() {
    let h = harness();
    h.connected("A", "6281").await;

    for (number, message) in [("", "hi"), ("   ", "hi"), ("6281", "")] {
        let err = h.manager.send_message("A", number, message).await.unwrap_err();
        assert_eq!(err.to_error_kind().0, ErrorKind::Invalid);
    }
    let err = h.manager.send_message("", "6281", "hi").await.unwrap_err();
    assert_eq!(err.to_error_kind().0, ErrorKind::Invalid);
}

#[tokio::test]
async fn client_send_error_is_upstream() {
    let h = harness();
    let client = h.connected("A", "6281").await;
    client.fail_sends("chat not found");

    let err = h.manager.send_message("A", "6282", "hi").await.unwrap_err();
    let (kind, message) = err.to_error_kind();
    assert_eq!(kind, ErrorKind::Upstream);
    assert!(message.contains("chat not found"));
    // A failed send does not disconnect the session.
    assert_eq!(h.manager.snapshot("A").unwrap().state, SessionState::Connected);
}

#[tokio::test]
async fn disconnect_cleans_up_and_reconnect_uses_fresh_client() {
    let h = harness();
    seed_credentials(&h.store, "A");
    let first = h.connected("A", "6281").await;

    first
        .emit(ClientEvent::Disconnected {
            reason: "NAVIGATION".into(),
        })
        .await;
    let reports = within(h.reporter.wait_for_reports(2)).await;
    assert_eq!(
        reports,
        vec![
            BackendReport::connected("A", "6281"),
            BackendReport::disconnected("A"),
        ]
    );

    let snapshot = h.manager.snapshot("A").unwrap();
    assert_eq!(snapshot.state, SessionState::Disconnected);
    assert_eq!(snapshot.account_identifier, None);
    assert!(!h.store.entry_path("A").exists());
    assert_eq!(first.destroy_count(), 1);

    let err = h.manager.send_message("A", "6282", "hi").await.unwrap_err();
    assert!(matches!(err, EngineError::NotConnected(_)));

    assert_eq!(h.manager.connect("A").await.unwrap(), ConnectOutcome::Started);
    assert_eq!(h.factory.created(), 2);
    let second = h.factory.client("A").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(h.manager.snapshot("A").unwrap().state, SessionState::Initializing);
}

#[tokio::test]
async fn events_from_a_replaced_client_are_ignored() {
    let h = harness();
    let first = h.connected("A", "old").await;
    first
        .emit(ClientEvent::Disconnected {
            reason: "logout".into(),
        })
        .await;
    within(h.reporter.wait_for_reports(2)).await;
    assert_eq!(first.destroy_count(), 1);

    h.manager.connect("A").await.unwrap();
    let second = h.factory.client("A").unwrap();

    first
        .emit(ClientEvent::Ready {
            account: "old".into(),
        })
        .await;
    first.emit(ClientEvent::PairingCode("old-qr".into())).await;
    second
        .emit(ClientEvent::Ready {
            account: "new".into(),
        })
        .await;
    h.wait_for("A", SessionState::Connected).await;

    let reports = within(h.reporter.wait_for_reports(3)).await;
    assert_eq!(reports[2], BackendReport::connected("A", "new"));
    assert_eq!(
        h.manager.snapshot("A").unwrap().account_identifier.as_deref(),
        Some("new")
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.reporter.reports().len(), 3);
}

#[tokio::test]
async fn failed_initialize_disconnects() {
    let h = harness();
    seed_credentials(&h.store, "A");
    h.factory.set_init(InitBehavior::Fail("browser crashed".into()));

    assert_eq!(h.manager.connect("A").await.unwrap(), ConnectOutcome::Started);
    let reports = within(h.reporter.wait_for_reports(1)).await;
    assert_eq!(reports, vec![BackendReport::disconnected("A")]);

    assert_eq!(h.manager.snapshot("A").unwrap().state, SessionState::Disconnected);
    assert_eq!(h.factory.client("A").unwrap().destroy_count(), 1);
    assert!(!h.store.entry_path("A").exists());
}

#[tokio::test]
async fn hung_initialize_times_out() {
    let h = harness_with(Timeouts {
        startup: Duration::from_millis(50),
        destroy: Duration::from_secs(1),
    });
    h.factory.set_init(InitBehavior::Hang);

    h.manager.connect("A").await.unwrap();
    h.wait_for("A", SessionState::Disconnected).await;
    let reports = within(h.reporter.wait_for_reports(1)).await;
    assert_eq!(reports, vec![BackendReport::disconnected("A")]);
}

#[tokio::test]
async fn startup_timeout_after_ready_keeps_session() {
    let h = harness_with(Timeouts {
        startup: Duration::from_millis(200),
        destroy: Duration::from_secs(1),
    });
    seed_credentials(&h.store, "A");
    h.factory.set_init(InitBehavior::Hang);

    let client = h.connected("A", "6281").await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let snapshot = h.manager.snapshot("A").unwrap();
    assert_eq!(snapshot.state, SessionState::Connected);
    assert_eq!(snapshot.account_identifier.as_deref(), Some("6281"));
    assert_eq!(client.destroy_count(), 0);
    assert!(h.store.entry_path("A").exists());
    assert_eq!(h.reporter.reports(), vec![BackendReport::connected("A", "6281")]);
    h.manager.send_message("A", "6282", "still here").await.unwrap();
}

#[tokio::test]
async fn client_creation_failure_allows_retry() {
    let h = harness();
    h.factory.fail_next_create();

    assert_eq!(h.manager.connect("A").await.unwrap(), ConnectOutcome::Started);
    // The failure is handled before the connect reply is sent.
    assert_eq!(h.manager.snapshot("A").unwrap().state, SessionState::Disconnected);
    assert_eq!(h.factory.created(), 0);
    within(h.reporter.wait_for_reports(1)).await;

    assert_eq!(h.manager.connect("A").await.unwrap(), ConnectOutcome::Started);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn backend_failure_does_not_block_transitions() {
    let h = harness();
    h.reporter.set_failing(true);

    let client = h.connected("A", "6281").await;
    h.manager.send_message("A", "6282", "hi").await.unwrap();
    assert_eq!(client.sent().len(), 1);
    assert_eq!(within(h.reporter.wait_for_reports(1)).await.len(), 1);
}

#[tokio::test]
async fn slow_backend_does_not_delay_repeated_connect() {
    let h = harness();
    h.reporter.set_delay(Duration::from_secs(3));

    h.manager.connect("A").await.unwrap();
    let client = h.factory.client("A").unwrap();
    client
        .emit(ClientEvent::Ready {
            account: "6281".into(),
        })
        .await;
    h.wait_for("A", SessionState::Connected).await;
    // The worker is now held inside the connected report.
    within(h.reporter.wait_for_reports(1)).await;

    let outcome = tokio::time::timeout(Duration::from_millis(500), h.manager.connect("A"))
        .await
        .expect("connect answered while the report is in flight")
        .unwrap();
    assert_eq!(outcome, ConnectOutcome::AlreadyConnected);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn reconcile_reports_every_saved_session() {
    let h = harness();
    for id in ["A", "B", "C"] {
        seed_credentials(&h.store, id);
    }
    std::fs::write(h.store.root().join("session-file"), b"not a dir").unwrap();
    std::fs::create_dir_all(h.store.root().join("unrelated")).unwrap();

    assert_eq!(h.manager.reconcile().await.unwrap(), 3);

    let reports = h.reporter.reports();
    assert_eq!(
        reports,
        vec![
            BackendReport::disconnected("A"),
            BackendReport::disconnected("B"),
            BackendReport::disconnected("C"),
        ]
    );
    for id in ["A", "B", "C"] {
        assert!(!h.store.entry_path(id).exists());
        assert_eq!(h.manager.snapshot(id).unwrap().state, SessionState::Disconnected);
    }
    assert!(h.store.root().join("unrelated").exists());
    assert_eq!(h.factory.created(), 0);

    // A reconciled instance connects normally.
    assert_eq!(h.manager.connect("B").await.unwrap(), ConnectOutcome::Started);
}

#[tokio::test]
async fn reconcile_removes_entries_with_unusable_ids() {
    let h = harness();
    let long_id = "x".repeat(80);
    seed_credentials(&h.store, &long_id);
    seed_credentials(&h.store, "with space");
    seed_credentials(&h.store, "A");

    assert_eq!(h.manager.reconcile().await.unwrap(), 1);

    assert!(!h.store.entry_path(&long_id).exists());
    assert!(!h.store.entry_path("with space").exists());
    assert!(!h.store.entry_path("A").exists());
    assert_eq!(h.reporter.reports(), vec![BackendReport::disconnected("A")]);
    assert_eq!(h.manager.list().len(), 1);

    // Nothing is left for the next start.
    assert_eq!(h.manager.reconcile().await.unwrap(), 0);
}

#[tokio::test]
async fn reconcile_with_nothing_saved_is_silent() {
    let h = harness();
    assert_eq!(h.manager.reconcile().await.unwrap(), 0);
    assert!(h.reporter.reports().is_empty());
    assert!(h.manager.list().is_empty());
}

#[tokio::test]
async fn shutdown_destroys_live_clients_and_keeps_credentials() {
    let h = harness();
    seed_credentials(&h.store, "A");
    let a = h.connected("A", "6281").await;
    h.manager.connect("B").await.unwrap();
    let b = h.factory.client("B").unwrap();

    h.manager.shutdown().await;

    assert_eq!(a.destroy_count(), 1);
    assert_eq!(b.destroy_count(), 1);
    assert_eq!(h.manager.snapshot("A").unwrap().state, SessionState::Disconnected);
    assert!(h.store.entry_path("A").exists());
    // Only the connect report; shutdown does not tell the backend.
    assert_eq!(h.reporter.reports(), vec![BackendReport::connected("A", "6281")]);
}
