//! The base connection client.
//!
//! Owns the single transport session. Each connection sequence fetches a
//! fresh credential and opens the transport, retrying a bounded number of
//! times with a fixed delay. Once established, two supervisor tasks keep it
//! that way: one reconnects (indefinitely) when the transport drops, the
//! other replaces the session with a freshly credentialed one before the
//! token expires.
//!
//! The established flag is published through a `watch` channel. Only this
//! type writes it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use questline_core::{ConnectionId, CredentialSource, Transport, TransportEvent};

use crate::config::ConnectionConfig;
use crate::errors::{ConnectCause, ConnectionError};

/// Lifecycle notifications for listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connection sequence started.
    Connecting,
    /// The session is established.
    Connected,
    /// The session went away (drop, refresh, or stop).
    Disconnected,
    /// A connection sequence exhausted its attempts.
    Failed,
}

/// Owner of the single transport session.
pub struct ConnectionClient {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    config: ConnectionConfig,
    established: watch::Sender<bool>,
    generation: watch::Sender<u64>,
    state_tx: broadcast::Sender<ConnectionState>,
    connection_id: RwLock<Option<ConnectionId>>,
    /// Held for the whole of a connection sequence.
    sequence: Mutex<()>,
    retry_count: AtomicU32,
    stopped: AtomicBool,
}

impl ConnectionClient {
    /// Create a client. Nothing connects until [`start`](Self::start).
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        config: ConnectionConfig,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            transport,
            credentials,
            config,
            established: watch::Sender::new(false),
            generation: watch::Sender::new(0),
            state_tx,
            connection_id: RwLock::new(None),
            sequence: Mutex::new(()),
            retry_count: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether the base connection is established.
    pub fn is_established(&self) -> bool {
        *self.established.borrow()
    }

    /// A read-only view of the established flag.
    pub fn established_receiver(&self) -> watch::Receiver<bool> {
        self.established.subscribe()
    }

    /// Lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of successful connection sequences so far.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Failed attempts in the current (or last) sequence.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Service-assigned id of the current session, when known.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.read().clone()
    }

    /// The transport this client drives.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run a connection sequence unless already established.
    ///
    /// Concurrent callers queue behind the running sequence and then return
    /// immediately when it succeeded.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.stopped.store(false, Ordering::SeqCst);
        self.connect().await
    }

    /// Replace the current session with a freshly credentialed one.
    pub async fn refresh(&self) -> Result<(), ConnectionError> {
        let _sequence = self.sequence.lock().await;
        self.transport.close().await;
        self.mark_down();
        self.run_sequence().await
    }

    /// Close the session and stop reconnecting.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _sequence = self.sequence.lock().await;
        self.transport.close().await;
        self.mark_down();
        info!("connection stopped");
    }

    /// Retry [`start`](Self::start)'s sequence after the fixed delay until it
    /// succeeds or the client is stopped.
    pub async fn reconnect_until_established(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            sleep(self.config.retry_delay).await;
            if self.is_stopped() {
                return;
            }
            match self.connect().await {
                Ok(()) => return,
                Err(e) => warn!(error = %e, "reconnection failed, will retry"),
            }
        }
    }

    /// Spawn the transport watcher and the token refresh timer.
    pub fn spawn_supervisor(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let events = self.transport.subscribe();
        let generation = self.generation.subscribe();
        vec![
            tokio::spawn(Arc::clone(self).watch_transport(events)),
            tokio::spawn(Arc::clone(self).run_refresh_timer(generation)),
        ]
    }

    // ── Sequence ────────────────────────────────────────────────────────

    async fn connect(&self) -> Result<(), ConnectionError> {
        let _sequence = self.sequence.lock().await;
        if self.is_established() {
            debug!("already established, skipping connection sequence");
            return Ok(());
        }
        self.run_sequence().await
    }

    async fn run_sequence(&self) -> Result<(), ConnectionError> {
        self.notify(ConnectionState::Connecting);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt().await {
                Ok(()) => {
                    self.retry_count.store(0, Ordering::Relaxed);
                    let _ = self.established.send_replace(true);
                    self.generation.send_modify(|g| *g += 1);
                    info!(attempt, generation = self.generation(), "base connection established");
                    self.notify(ConnectionState::Connected);
                    return Ok(());
                }
                Err(cause) => {
                    self.retry_count.store(attempt, Ordering::Relaxed);
                    if attempt >= max_attempts {
                        error!(attempts = attempt, error = %cause, "connection attempts exhausted");
                        self.notify(ConnectionState::Failed);
                        return Err(ConnectionError::Exhausted {
                            attempts: attempt,
                            last: cause,
                        });
                    }
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(self.config.retry_delay.as_millis()).unwrap_or(u64::MAX),
                        error = %cause,
                        "connection attempt failed"
                    );
                    sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    async fn attempt(&self) -> Result<(), ConnectCause> {
        let token = self.credentials.fetch().await?;
        debug!(?token, "credential obtained");
        self.transport.open(token.url()).await?;
        Ok(())
    }

    fn mark_down(&self) {
        *self.connection_id.write() = None;
        if self.established.send_replace(false) {
            self.notify(ConnectionState::Disconnected);
        }
    }

    fn notify(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ── Supervisor tasks ────────────────────────────────────────────────

    async fn watch_transport(self: Arc<Self>, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Disconnected { reason }) => {
                    if self.is_stopped() || !self.is_established() {
                        debug!(%reason, "ignoring disconnect outside an established session");
                        continue;
                    }
                    warn!(%reason, "base connection lost");
                    self.mark_down();
                    self.reconnect_until_established().await;
                }
                Ok(TransportEvent::Connected { connection_id }) => {
                    debug!(connection_id = %connection_id, "transport session confirmed");
                    *self.connection_id.write() = Some(connection_id);
                }
                Ok(TransportEvent::GroupMessage { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport event stream lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn run_refresh_timer(self: Arc<Self>, mut generation: watch::Receiver<u64>) {
        // Arm on the first successful sequence.
        if *generation.borrow_and_update() == 0 && generation.changed().await.is_err() {
            return;
        }
        loop {
            generation.mark_unchanged();
            tokio::select! {
                () = sleep(self.config.token_refresh_interval) => {
                    if self.is_stopped() {
                        return;
                    }
                    if !self.is_established() {
                        // The reconnect loop owns the session right now.
                        continue;
                    }
                    info!("refreshing access token");
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "token refresh failed, reconnecting");
                        self.reconnect_until_established().await;
                    }
                }
                changed = generation.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
