//! Content responder.
//!
//! Joins `navigation` and one channel per stored file, then answers every
//! `content_request` on the channel it arrived on with `markdown_content`.
//! Requests on `navigation` get the index of all files. Each request is
//! handled in its own task so a slow delivery never holds up the rest.
//!
//! Every time the responder's session comes up it pushes the index as
//! `initial_navigation`, and each connect and disconnect is logged as a
//! `system_event`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use questline_client::{
    ClientConfig, ConnectionClient, ConnectionError, ConnectionState, GroupConnectionManager,
    backoff_delay,
};
use questline_core::groups::NAVIGATION;
use questline_core::{
    ContentMessage, CredentialSource, SendOptions, Transport, TransportError, TransportEvent,
    channel_for_file,
};
use questline_settings::ServerSettings;

use crate::error::StoreError;
use crate::store::ContentStore;

/// Delivery retry policy.
#[derive(Clone, Debug)]
pub struct ResponderConfig {
    /// Send attempts per response.
    pub delivery_attempts: u32,
    /// Delay after the first failed send; doubled for each further one.
    pub delivery_base_delay: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            delivery_attempts: 3,
            delivery_base_delay: Duration::from_secs(1),
        }
    }
}

impl ResponderConfig {
    /// Build from the `server` settings section.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            delivery_attempts: settings.delivery_attempts.max(1),
            delivery_base_delay: Duration::from_millis(settings.delivery_base_delay_ms),
        }
    }
}

/// Answers content requests from a [`ContentStore`].
pub struct ContentResponder {
    transport: Arc<dyn Transport>,
    groups: Arc<GroupConnectionManager>,
    store: Arc<dyn ContentStore>,
    config: ResponderConfig,
}

impl ContentResponder {
    /// Create a responder sending on `transport` and joining through `groups`.
    pub fn new(
        transport: Arc<dyn Transport>,
        groups: Arc<GroupConnectionManager>,
        store: Arc<dyn ContentStore>,
        config: ResponderConfig,
    ) -> Self {
        Self {
            transport,
            groups,
            store,
            config,
        }
    }

    /// Channels the responder serves: `navigation` first, then one per file.
    pub async fn channels(&self) -> Result<Vec<String>, StoreError> {
        let mut channels = vec![NAVIGATION.to_string()];
        for file in self.store.list().await? {
            match channel_for_file(&file) {
                Some(channel) if !channels.contains(&channel) => channels.push(channel),
                Some(_) => {}
                None => warn!(file = %file, "content file maps to no channel, skipping"),
            }
        }
        Ok(channels)
    }

    /// Join every served channel concurrently. Returns the ones joined.
    pub async fn join_channels(&self) -> Result<Vec<String>, StoreError> {
        let channels = self.channels().await?;
        let transport = &self.transport;
        let joins = channels.iter().map(|name| async move {
            let result = self
                .groups
                .handle_group_connection(name, || transport.join_group(name))
                .await;
            (name, result)
        });

        let mut joined = Vec::new();
        for (name, result) in join_all(joins).await {
            match result {
                Ok(()) => joined.push(name.clone()),
                Err(e) => warn!(group = %name, error = %e, "responder failed to join channel"),
            }
        }
        info!(joined = joined.len(), total = channels.len(), "responder channels joined");
        Ok(joined)
    }

    /// Listen for requests. Subscribes before returning.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.transport.subscribe();
        let responder = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::GroupMessage { group, data }) => {
                        let Some(ContentMessage::ContentRequest { filename }) = ContentMessage::decode(&data)
                        else {
                            continue;
                        };
                        let responder = Arc::clone(&responder);
                        let _ = tokio::spawn(async move {
                            let _ = responder.handle_request(&group, &filename).await;
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "responder lagged, content requests dropped");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// Log connection system events and publish the navigation index after
    /// every connect. Subscribes before returning.
    pub fn spawn_connection_events(self: &Arc<Self>, connection: &Arc<ConnectionClient>) -> JoinHandle<()> {
        let mut states = connection.subscribe();
        let connection = Arc::clone(connection);
        let responder = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_id: Option<String> = None;
            loop {
                match states.recv().await {
                    Ok(ConnectionState::Connected) => {
                        last_id = connection.connection_id().map(|id| id.to_string());
                        info!(
                            system_event = "connect",
                            connection_id = last_id.as_deref(),
                            generation = connection.generation(),
                            "responder connected"
                        );
                        let _ = responder.publish_navigation().await;
                    }
                    Ok(ConnectionState::Disconnected) => {
                        let previous = last_id.take();
                        info!(
                            system_event = "disconnect",
                            connection_id = previous.as_deref(),
                            generation = connection.generation(),
                            "responder disconnected"
                        );
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "responder connection events lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// Publish the navigation index as `initial_navigation`. Returns whether
    /// it was delivered.
    pub async fn publish_navigation(&self) -> bool {
        let content = match self.store.navigation_index().await {
            Ok(content) => content,
            Err(e) => {
                warn!(group = NAVIGATION, error = %e, "navigation index unavailable");
                return false;
            }
        };
        let message = ContentMessage::InitialNavigation { content };
        match self.deliver(NAVIGATION, message.to_value()).await {
            Ok(()) => {
                info!(group = NAVIGATION, "initial navigation published");
                true
            }
            Err(e) => {
                error!(group = NAVIGATION, error = %e, "initial navigation delivery failed");
                false
            }
        }
    }

    /// Answer one request. Returns whether a response was delivered.
    pub async fn handle_request(&self, group: &str, filename: &str) -> bool {
        debug!(group, filename, "content request received");
        let lookup = if group == NAVIGATION {
            self.store.navigation_index().await.map(Some)
        } else if channel_for_file(filename).as_deref() == Some(group) {
            self.store.get(filename).await
        } else {
            warn!(group, filename, "requested file does not belong to this channel");
            return false;
        };

        let content = match lookup {
            Ok(Some(content)) => content,
            Ok(None) => {
                warn!(group, filename, "no content for requested file");
                return false;
            }
            Err(e) => {
                warn!(group, filename, error = %e, "content lookup failed");
                return false;
            }
        };

        let response = ContentMessage::MarkdownContent {
            filename: filename.to_string(),
            content,
        };
        match self.deliver(group, response.to_value()).await {
            Ok(()) => {
                info!(group, filename, "content delivered");
                true
            }
            Err(e) => {
                error!(group, filename, error = %e, "content delivery failed");
                false
            }
        }
    }

    async fn deliver(&self, group: &str, payload: Value) -> Result<(), TransportError> {
        let attempts = self.config.delivery_attempts.max(1);
        let mut attempt = 1;
        loop {
            let sent = self
                .transport
                .send_to_group(group, payload.clone(), SendOptions::json_no_echo())
                .await;
            match sent {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    let delay = backoff_delay(self.config.delivery_base_delay, attempt);
                    warn!(
                        group,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "delivery attempt failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// A running responder and its connection.
pub struct ResponderHandle {
    connection: Arc<ConnectionClient>,
    responder: Arc<ContentResponder>,
    tasks: Vec<JoinHandle<()>>,
}

impl ResponderHandle {
    /// The responder's connection client.
    pub fn connection(&self) -> &Arc<ConnectionClient> {
        &self.connection
    }

    /// The responder.
    pub fn responder(&self) -> &Arc<ContentResponder> {
        &self.responder
    }

    /// Stop listening and close the session.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.connection.stop().await;
        info!("content responder stopped");
    }
}

/// Connect a responder over `transport` and join its channels.
///
/// Memberships are restored after reconnects by the group manager's rejoin
/// task, the same way client memberships are.
pub async fn start_responder(
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    client: &ClientConfig,
    store: Arc<dyn ContentStore>,
    config: ResponderConfig,
) -> Result<ResponderHandle, ConnectionError> {
    let connection = Arc::new(ConnectionClient::new(
        Arc::clone(&transport),
        credentials,
        client.connection.clone(),
    ));
    let groups = Arc::new(GroupConnectionManager::for_connection(&connection, client.groups.clone()));
    let responder = Arc::new(ContentResponder::new(transport, Arc::clone(&groups), store, config));

    let mut tasks = connection.spawn_supervisor();
    tasks.push(groups.spawn_rejoin_task(&connection));
    tasks.push(responder.spawn());
    tasks.push(responder.spawn_connection_events(&connection));

    if let Err(e) = connection.start().await {
        for task in &tasks {
            task.abort();
        }
        return Err(e);
    }
    if let Err(e) = responder.join_channels().await {
        error!(error = %e, "could not list content, responder serves navigation only");
        let transport = Arc::clone(connection.transport());
        if let Err(e) = groups
            .handle_group_connection(NAVIGATION, || transport.join_group(NAVIGATION))
            .await
        {
            warn!(error = %e, "responder failed to join navigation");
        }
    }

    Ok(ResponderHandle {
        connection,
        responder,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::watch;
    use tokio::time::Instant;

    use questline_client::GroupConfig;
    use questline_client::mock::{MockCredentials, MockTransport};
    use questline_core::GroupStatus;

    use super::*;
    use crate::store::DirectoryContentStore;

    struct Harness {
        transport: Arc<MockTransport>,
        groups: Arc<GroupConnectionManager>,
        responder: Arc<ContentResponder>,
        _dir: tempfile::TempDir,
        _established: watch::Sender<bool>,
    }

    fn content_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("quests")).unwrap();
        std::fs::write(dir.path().join("intro.md"), "# Intro").unwrap();
        std::fs::write(dir.path().join("quests/dragon.md"), "# Dragon").unwrap();
        dir
    }

    async fn harness() -> Harness {
        let dir = content_dir();
        let transport = Arc::new(MockTransport::new());
        transport.open("wss://mock").await.unwrap();
        let (established, rx) = watch::channel(true);
        let groups = Arc::new(GroupConnectionManager::new(rx, GroupConfig::default()));
        let responder = Arc::new(ContentResponder::new(
            transport.clone(),
            Arc::clone(&groups),
            Arc::new(DirectoryContentStore::new(dir.path())),
            ResponderConfig::default(),
        ));
        Harness {
            transport,
            groups,
            responder,
            _dir: dir,
            _established: established,
        }
    }

    async fn wait_for_send(transport: &MockTransport, group: &str) -> Vec<Value> {
        for _ in 0..100 {
            let sent = transport.sent_to(group);
            if !sent.is_empty() {
                return sent;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("nothing sent to {group}");
    }

    #[tokio::test(start_paused = true)]
    async fn joins_navigation_and_one_channel_per_file() {
        let h = harness().await;

        let joined = h.responder.join_channels().await.unwrap();

        assert_eq!(joined, vec!["navigation", "intro.md", "quests_dragon.md"]);
        assert_eq!(h.groups.status("quests_dragon.md"), Some(GroupStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn answers_requests_on_the_channel_they_arrived_on() {
        let h = harness().await;
        let _listener = h.responder.spawn();

        h.transport.deliver(
            "quests_dragon.md",
            json!({"type": "content_request", "filename": "quests/dragon.md"}),
        );

        let sent = wait_for_send(&h.transport, "quests_dragon.md").await;
        assert_eq!(
            sent,
            vec![json!({"type": "markdown_content", "filename": "quests/dragon.md", "content": "# Dragon"})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_requests_get_the_index() {
        let h = harness().await;
        let _listener = h.responder.spawn();

        h.transport
            .deliver("navigation", json!({"type": "content_request", "filename": "navigation"}));

        let sent = wait_for_send(&h.transport, "navigation").await;
        let content = sent[0]["content"].as_str().unwrap();
        assert!(content.contains("- [intro.md](intro.md)"));
        assert!(content.contains("- [quests/dragon.md](quests/dragon.md)"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_request_messages_are_ignored() {
        let h = harness().await;
        let _listener = h.responder.spawn();

        h.transport.deliver(
            "intro.md",
            json!({"type": "markdown_content", "filename": "intro.md", "content": "echo"}),
        );
        sleep(Duration::from_secs(1)).await;

        assert!(h.transport.sent_to("intro.md").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_content_is_skipped() {
        let h = harness().await;
        assert!(!h.responder.handle_request("missing.md", "missing.md").await);
        assert!(h.transport.sent_to("missing.md").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn requests_for_another_channels_file_are_refused() {
        let h = harness().await;
        assert!(!h.responder.handle_request("intro.md", "quests/dragon.md").await);
        assert!(h.transport.sent_to("intro.md").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_retries_with_doubling_backoff() {
        let h = harness().await;
        h.transport.fail_next_sends(2);
        let started = Instant::now();

        assert!(h.responder.handle_request("intro.md", "intro.md").await);

        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(h.transport.sent_to("intro.md").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_gives_up_after_the_attempt_cap() {
        let h = harness().await;
        h.transport.fail_next_sends(5);

        assert!(!h.responder.handle_request("intro.md", "intro.md").await);

        assert_eq!(h.transport.sent_to("intro.md").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn start_responder_connects_and_joins() {
        let dir = content_dir();
        let transport = Arc::new(MockTransport::new());

        let handle = start_responder(
            transport.clone(),
            Arc::new(MockCredentials::new("wss://mock")),
            &ClientConfig::default(),
            Arc::new(DirectoryContentStore::new(dir.path())),
            ResponderConfig::default(),
        )
        .await
        .unwrap();

        assert!(handle.connection().is_established());
        assert_eq!(transport.join_count("navigation"), 1);
        assert_eq!(transport.join_count("intro.md"), 1);

        transport.drop_connection("network");
        sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.join_count("quests_dragon.md"), 2);

        handle.shutdown().await;
        assert!(!transport.is_open());
    }

    fn initial_navigation(transport: &MockTransport) -> Vec<Value> {
        transport
            .sent_to("navigation")
            .into_iter()
            .filter(|v| v["type"] == "initial_navigation")
            .collect()
    }

    async fn wait_for_initial_navigation(transport: &MockTransport, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            let sent = initial_navigation(transport);
            if sent.len() >= count {
                return sent;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("initial navigation was not published {count} times");
    }

    #[tokio::test(start_paused = true)]
    async fn initial_navigation_follows_every_connect() {
        let dir = content_dir();
        let transport = Arc::new(MockTransport::new());
        let handle = start_responder(
            transport.clone(),
            Arc::new(MockCredentials::new("wss://mock")),
            &ClientConfig::default(),
            Arc::new(DirectoryContentStore::new(dir.path())),
            ResponderConfig::default(),
        )
        .await
        .unwrap();

        let sent = wait_for_initial_navigation(&transport, 1).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0]["content"].as_str().unwrap().contains("- [quests/dragon.md](quests/dragon.md)"));

        transport.drop_connection("network");
        sleep(Duration::from_secs(6)).await;
        assert_eq!(wait_for_initial_navigation(&transport, 2).await.len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn publish_navigation_retries_failed_sends() {
        let h = harness().await;
        h.transport.fail_next_sends(1);

        assert!(h.responder.publish_navigation().await);

        assert_eq!(initial_navigation(&h.transport).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_disconnects_are_recorded_as_system_events() {
        use questline_telemetry::{LogQuery, SqliteLogLayer, SqliteLogSink};
        use tracing_subscriber::layer::SubscriberExt;

        let logs = tempfile::tempdir().unwrap();
        let sink = Arc::new(SqliteLogSink::new(&logs.path().join("logs.db")).unwrap());
        let _default = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink))),
        );

        let dir = content_dir();
        let transport = Arc::new(MockTransport::new());
        let handle = start_responder(
            transport.clone(),
            Arc::new(MockCredentials::new("wss://mock")),
            &ClientConfig::default(),
            Arc::new(DirectoryContentStore::new(dir.path())),
            ResponderConfig::default(),
        )
        .await
        .unwrap();
        let _ = wait_for_initial_navigation(&transport, 1).await;
        transport.drop_connection("network");
        sleep(Duration::from_secs(6)).await;
        let _ = wait_for_initial_navigation(&transport, 2).await;

        let kinds: Vec<String> = sink
            .query(&LogQuery::default())
            .unwrap()
            .into_iter()
            .filter_map(|r| r.system_event)
            .collect();
        assert_eq!(kinds, vec!["connect", "disconnect", "connect"]);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_responder_fails_when_the_connection_cannot_be_made() {
        let dir = content_dir();
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_opens(3);

        let result = start_responder(
            transport.clone(),
            Arc::new(MockCredentials::new("wss://mock")),
            &ClientConfig::default(),
            Arc::new(DirectoryContentStore::new(dir.path())),
            ResponderConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(ConnectionError::Exhausted { attempts: 3, .. })));
    }
}
