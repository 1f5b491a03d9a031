//! In-memory transport and credential source for tests.
//!
//! [`MockTransport`] records every call, can be scripted to fail opens or
//! individual joins, and lets a test inject transport events (drops and
//! group messages) as if they came from the service.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use questline_core::{
    AccessToken, ConnectionId, CredentialError, CredentialSource, SendOptions, Transport,
    TransportError, TransportEvent,
};

/// One recorded transport call.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    /// `open(url)`.
    Open(String),
    /// `close()`.
    Close,
    /// `join_group(group)`.
    Join(String),
    /// `leave_group(group)`.
    Leave(String),
    /// `send_to_group(group, payload, options)`.
    Send {
        /// Target group.
        group: String,
        /// Payload sent.
        payload: Value,
        /// Send options.
        options: SendOptions,
    },
}

/// Scriptable in-memory [`Transport`].
pub struct MockTransport {
    events: broadcast::Sender<TransportEvent>,
    open: AtomicBool,
    opens: AtomicU32,
    open_failures: AtomicU32,
    send_failures: AtomicU32,
    open_delay: Mutex<Option<Duration>>,
    join_scripts: Mutex<HashMap<String, VecDeque<Result<(), TransportError>>>>,
    calls: Mutex<Vec<TransportCall>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport whose operations all succeed.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            open: AtomicBool::new(false),
            opens: AtomicU32::new(0),
            open_failures: AtomicU32::new(0),
            send_failures: AtomicU32::new(0),
            open_delay: Mutex::new(None),
            join_scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` opens with a connect error.
    pub fn fail_next_opens(&self, n: u32) {
        self.open_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` sends with [`TransportError::Closed`].
    pub fn fail_next_sends(&self, n: u32) {
        self.send_failures.store(n, Ordering::SeqCst);
    }

    /// Make every open take `delay` before completing.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    /// Queue results for successive joins of `group`. Unscripted joins succeed.
    pub fn script_join(&self, group: &str, results: impl IntoIterator<Item = Result<(), TransportError>>) {
        self.join_scripts
            .lock()
            .entry(group.to_string())
            .or_default()
            .extend(results);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Number of join calls for `group`.
    pub fn join_count(&self, group: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, TransportCall::Join(g) if g == group))
            .count()
    }

    /// Payloads sent to `group`.
    pub fn sent_to(&self, group: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Send { group: g, payload, .. } if g == group => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Emit an arbitrary event to subscribers.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Simulate the service dropping the session.
    pub fn drop_connection(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Simulate a message published to `group`.
    pub fn deliver(&self, group: &str, data: Value) {
        self.emit(TransportEvent::GroupMessage {
            group: group.to_string(),
            data,
        });
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Open(url.to_string()));
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.open_failures) {
            return Err(TransportError::Connect("scripted open failure".into()));
        }
        self.open.store(true, Ordering::SeqCst);
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(TransportEvent::Connected {
            connection_id: ConnectionId::from_raw(format!("mock-{n}")),
        });
        Ok(())
    }

    async fn close(&self) {
        self.record(TransportCall::Close);
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn join_group(&self, group: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Join(group.to_string()));
        self.ensure_open()?;
        let scripted = self
            .join_scripts
            .lock()
            .get_mut(group)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or(Ok(()))
    }

    async fn leave_group(&self, group: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Leave(group.to_string()));
        self.ensure_open()
    }

    async fn send_to_group(
        &self,
        group: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Send {
            group: group.to_string(),
            payload,
            options,
        });
        self.ensure_open()?;
        if take_one(&self.send_failures) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Decrement a failure budget, returning whether one was available.
fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Credential source handing out a fixed URL.
pub struct MockCredentials {
    url: String,
    failures: AtomicU32,
    fetches: AtomicU32,
}

impl MockCredentials {
    /// Always return `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            failures: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` fetches.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of fetches so far, failed ones included.
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for MockCredentials {
    async fn fetch(&self) -> Result<AccessToken, CredentialError> {
        let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures) {
            Err(CredentialError::Request("scripted fetch failure".into()))
        } else {
            Ok(AccessToken::new(self.url.clone()))
        }
    }
}
