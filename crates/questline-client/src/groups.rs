//! Per-channel join orchestration over the shared base connection.
//!
//! Every channel has its own small state machine:
//!
//! ```text
//! unregistered -> disconnected -> connecting -> connected
//!                      ^              |             |
//!                      |              v             |
//!                      |            error           |
//!                      +----------------------------+
//!                         explicit leave or base drop
//! ```
//!
//! Joins never start before the base connection is established. A failed
//! join is retried with exponential backoff until the attempt cap, after
//! which the channel stays in `error` until someone calls
//! [`GroupConnectionManager::handle_group_connection`] again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use questline_core::{GroupStatus, TransportError};

use crate::config::GroupConfig;
use crate::connection::{ConnectionClient, ConnectionState};
use crate::errors::GroupError;

/// Delay before the attempt following failed attempt number `attempt`
/// (1-based): `base * 2^(attempt - 1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1_u32 << exponent)
}

/// A status transition, broadcast to UI listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStatusChange {
    /// Channel name.
    pub group: String,
    /// New status.
    pub status: GroupStatus,
    /// Retry count after the transition.
    pub retry_count: u32,
}

/// Point-in-time view of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Channel name.
    pub name: String,
    /// Current status.
    pub status: GroupStatus,
    /// Failed attempts in the current cycle.
    pub retry_count: u32,
    /// When the last join attempt started.
    pub last_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct GroupState {
    status: GroupStatus,
    retry_count: u32,
    last_attempt: Option<DateTime<Utc>>,
    /// Membership is desired (cleared on explicit leave).
    wanted: bool,
    /// A join sequence is running.
    in_flight: bool,
}

/// Tracks and drives channel memberships.
pub struct GroupConnectionManager {
    groups: DashMap<String, GroupState>,
    established: watch::Receiver<bool>,
    config: GroupConfig,
    changes: broadcast::Sender<GroupStatusChange>,
}

impl GroupConnectionManager {
    /// Create a manager gated on `established`.
    pub fn new(established: watch::Receiver<bool>, config: GroupConfig) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            groups: DashMap::new(),
            established,
            config,
            changes,
        }
    }

    /// Create a manager gated on `connection`'s established flag.
    pub fn for_connection(connection: &ConnectionClient, config: GroupConfig) -> Self {
        Self::new(connection.established_receiver(), config)
    }

    /// Start tracking `name`. Returns `false` if it was already tracked.
    pub fn register_group(&self, name: &str) -> bool {
        match self.groups.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let _ = slot.insert(GroupState::default());
                debug!(group = name, "group registered");
                true
            }
        }
    }

    /// Current status of `name`, if tracked.
    pub fn status(&self, name: &str) -> Option<GroupStatus> {
        self.groups.get(name).map(|s| s.status)
    }

    /// Current retry count of `name`, if tracked.
    pub fn retry_count(&self, name: &str) -> Option<u32> {
        self.groups.get(name).map(|s| s.retry_count)
    }

    /// Number of tracked channels.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no channel is tracked.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Snapshot of every tracked channel, sorted by name.
    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        let mut all: Vec<GroupSnapshot> = self
            .groups
            .iter()
            .map(|entry| GroupSnapshot {
                name: entry.key().clone(),
                status: entry.status,
                retry_count: entry.retry_count,
                last_attempt: entry.last_attempt,
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Status transitions of every channel.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupStatusChange> {
        self.changes.subscribe()
    }

    /// Join `name` by calling `join` until it succeeds or attempts run out.
    ///
    /// Each attempt first waits (bounded) for the base connection. Fails
    /// with [`GroupError::JoinInProgress`] if a sequence for `name` is
    /// already running.
    pub async fn handle_group_connection<F, Fut>(&self, name: &str, join: F) -> Result<(), GroupError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let _ = self.register_group(name);
        let _in_flight = self.begin(name)?;
        self.join_with_retry(name, join).await
    }

    /// Forget the membership of `name` locally.
    ///
    /// Resets status and retry count. The remote subscription is left to the
    /// caller.
    pub fn disconnect_group(&self, name: &str) {
        let _ = self.register_group(name);
        self.update(name, |s| {
            s.status = GroupStatus::Disconnected;
            s.retry_count = 0;
            s.wanted = false;
        });
        debug!(group = name, "group disconnected");
    }

    /// Mark wanted, idle, connected channels as disconnected after the base
    /// connection dropped. Returns how many were marked.
    pub fn mark_all_at_risk(&self) -> usize {
        let at_risk: Vec<String> = self
            .groups
            .iter()
            .filter(|e| e.wanted && !e.in_flight && e.status == GroupStatus::Connected)
            .map(|e| e.key().clone())
            .collect();
        for name in &at_risk {
            self.update(name, |s| s.status = GroupStatus::Disconnected);
        }
        at_risk.len()
    }

    /// Channels that should be re-joined once the base connection is back.
    pub fn rejoin_candidates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .iter()
            .filter(|e| e.wanted && !e.in_flight && e.status == GroupStatus::Disconnected)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Watch `connection` and re-join wanted channels after every reconnect.
    ///
    /// Per-channel rejoins run inside the returned task, so aborting it
    /// cancels them as well.
    pub fn spawn_rejoin_task(self: &Arc<Self>, connection: &ConnectionClient) -> JoinHandle<()> {
        let mut states = connection.subscribe();
        let transport = Arc::clone(connection.transport());
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut rejoins = JoinSet::new();
            loop {
                while rejoins.try_join_next().is_some() {}
                match states.recv().await {
                    Ok(ConnectionState::Disconnected) => {
                        let marked = manager.mark_all_at_risk();
                        if marked > 0 {
                            info!(groups = marked, "base connection lost, groups will rejoin");
                        }
                    }
                    Ok(ConnectionState::Connected) => {
                        for group in manager.rejoin_candidates() {
                            let manager = Arc::clone(&manager);
                            let transport = Arc::clone(&transport);
                            let _ = rejoins.spawn(async move {
                                let result = manager
                                    .handle_group_connection(&group, || transport.join_group(&group))
                                    .await;
                                match result {
                                    Ok(()) => info!(group = %group, "group rejoined"),
                                    Err(GroupError::JoinInProgress(_)) => {}
                                    Err(e) => warn!(group = %group, error = %e, "group rejoin failed"),
                                }
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection state stream lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn begin(&self, name: &str) -> Result<InFlight<'_>, GroupError> {
        let mut state = self.groups.entry(name.to_string()).or_default();
        if state.in_flight {
            return Err(GroupError::JoinInProgress(name.to_string()));
        }
        state.in_flight = true;
        state.wanted = true;
        Ok(InFlight {
            groups: &self.groups,
            name: name.to_string(),
        })
    }

    async fn join_with_retry<F, Fut>(&self, name: &str, join: F) -> Result<(), GroupError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            self.wait_for_base_connection(name).await?;

            attempt += 1;
            self.update(name, |s| {
                s.status = GroupStatus::Connecting;
                s.last_attempt = Some(Utc::now());
            });
            debug!(group = name, attempt, "joining group");

            let mut session = self.established.clone();
            session.mark_unchanged();
            let result = join().await;
            if result.is_ok() && session.has_changed().unwrap_or(false) {
                // The ack belongs to a session that has since been replaced.
                self.update(name, |s| s.status = GroupStatus::Disconnected);
                info!(group = name, attempt, "base connection changed during join, joining again");
                attempt -= 1;
                continue;
            }

            match result {
                Ok(()) => {
                    self.update(name, |s| {
                        s.status = GroupStatus::Connected;
                        s.retry_count = 0;
                    });
                    info!(group = name, attempt, "group joined");
                    return Ok(());
                }
                Err(e) if attempt >= max_attempts => {
                    self.update(name, |s| {
                        s.status = GroupStatus::Error;
                        s.retry_count = attempt;
                    });
                    error!(group = name, attempts = attempt, error = %e, "group join attempts exhausted");
                    return Err(GroupError::RetriesExhausted {
                        group: name.to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    self.update(name, |s| s.retry_count = attempt);
                    let delay = backoff_delay(self.config.base_delay, attempt);
                    warn!(
                        group = name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        kind = e.error_kind(),
                        "group join failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn wait_for_base_connection(&self, name: &str) -> Result<(), GroupError> {
        let mut established = self.established.clone();
        let wait = self.config.base_wait_timeout;
        let up = matches!(timeout(wait, established.wait_for(|up| *up)).await, Ok(Ok(_)));
        if up {
            return Ok(());
        }
        self.update(name, |s| s.status = GroupStatus::Disconnected);
        warn!(
            group = name,
            timeout_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "base connection not established"
        );
        Err(GroupError::BaseConnectionTimeout(wait))
    }

    /// Apply `f` to the state of `name` and broadcast if status or retry
    /// count changed.
    fn update(&self, name: &str, f: impl FnOnce(&mut GroupState)) {
        let change = {
            let Some(mut state) = self.groups.get_mut(name) else {
                return;
            };
            let before = (state.status, state.retry_count);
            f(&mut *state);
            ((state.status, state.retry_count) != before).then(|| GroupStatusChange {
                group: name.to_string(),
                status: state.status,
                retry_count: state.retry_count,
            })
        };
        if let Some(change) = change {
            let _ = self.changes.send(change);
        }
    }
}

/// Clears the in-flight flag when a join sequence ends, including when its
/// future is dropped.
struct InFlight<'a> {
    groups: &'a DashMap<String, GroupState>,
    name: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.groups.get_mut(&self.name) {
            state.in_flight = false;
        }
    }
}
