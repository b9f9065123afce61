//! In-memory fakes for the protocol client and the backend reporter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use waengine_protocol::{BackendReport, InstanceId};

use crate::client::{ClientEvent, ClientEvents, ClientFactory, ProtocolClient};
use crate::error::{ClientError, ReportError};
use crate::report::BackendReporter;

/// How [`FakeClient::initialize`] behaves.
#[derive(Debug, Clone, Default)]
pub enum InitBehavior {
    #[default]
    Succeed,
    Fail(String),
    /// Never completes, to exercise the start-up timeout.
    Hang,
}

pub struct FakeClient {
    instance_id: InstanceId,
    events: mpsc::Sender<ClientEvent>,
    init: InitBehavior,
    sent: Mutex<Vec<(String, String)>>,
    send_error: Mutex<Option<String>>,
    destroys: AtomicUsize,
}

impl FakeClient {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Push an event as if the protocol layer had produced it.
    pub async fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }

    /// `(chat_id, body)` pairs passed to `send_message`, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make subsequent sends fail with `message`.
    pub fn fail_sends(&self, message: &str) {
        *self
            .send_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        match &self.init {
            InitBehavior::Succeed => Ok(()),
            InitBehavior::Fail(message) => Err(ClientError::Remote(message.clone())),
            InitBehavior::Hang => std::future::pending().await,
        }
    }

    async fn send_message(&self, chat_id: &str, body: &str) -> Result<(), ClientError> {
        let failure = self
            .send_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(message) = failure {
            return Err(ClientError::Remote(message));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((chat_id.to_string(), body.to_string()));
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`FakeClient`]s and remembers the latest one per instance.
#[derive(Default)]
pub struct FakeClientFactory {
    created: AtomicUsize,
    clients: Mutex<HashMap<InstanceId, Arc<FakeClient>>>,
    init: Mutex<InitBehavior>,
    fail_next_create: AtomicBool,
}

impl FakeClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of clients created across all instances.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// The most recently created client for `instance_id`.
    pub fn client(&self, instance_id: &str) -> Option<Arc<FakeClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    /// Behavior of `initialize` for clients created from now on.
    pub fn set_init(&self, behavior: InitBehavior) {
        *self.init.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }
}

impl ClientFactory for FakeClientFactory {
    fn create(
        &self,
        instance_id: &str,
    ) -> Result<(Arc<dyn ProtocolClient>, ClientEvents), ClientError> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Spawn("fake create failure".to_string()));
        }

        let (events, rx) = mpsc::channel(16);
        let client = Arc::new(FakeClient {
            instance_id: instance_id.to_string(),
            events,
            init: self
                .init
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            sent: Mutex::default(),
            send_error: Mutex::default(),
            destroys: AtomicUsize::new(0),
        });

        self.created.fetch_add(1, Ordering::SeqCst);
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_string(), Arc::clone(&client));
        Ok((client, rx))
    }
}

/// Records every report it receives.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<BackendReport>>,
    notify: Notify,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<BackendReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reject reports (after recording them) while `fail` is set.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold each report for `delay` after recording it, like a slow backend.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Wait until at least `count` reports have arrived.
    pub async fn wait_for_reports(&self, count: usize) -> Vec<BackendReport> {
        loop {
            let notified = self.notify.notified();
            let reports = self.reports();
            if reports.len() >= count {
                return reports;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl BackendReporter for RecordingReporter {
    async fn report(&self, report: &BackendReport) -> Result<(), ReportError> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        self.notify.notify_waiters();
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ReportError::Rejected("503 Service Unavailable: down".to_string()));
        }
        Ok(())
    }
}
