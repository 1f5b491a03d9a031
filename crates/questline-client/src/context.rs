//! Application-lifetime owner of the sync core.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use questline_core::groups::WELL_KNOWN;
use questline_core::{ContentUpdate, CredentialSource, Transport};

use crate::config::ClientConfig;
use crate::connection::ConnectionClient;
use crate::content::ContentService;
use crate::errors::{ConnectionError, GroupError};
use crate::groups::GroupConnectionManager;

/// Owns the connection client, group manager, content service, and their
/// background tasks. Cloned handles are handed out as `Arc`s.
///
/// Must be created inside a tokio runtime. Dropping the context aborts its
/// tasks; call [`shutdown`](Self::shutdown) to also close the session.
pub struct SyncContext {
    connection: Arc<ConnectionClient>,
    groups: Arc<GroupConnectionManager>,
    content: Arc<ContentService>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
    /// Wire everything up and spawn the supervisor, rejoin, and update pump
    /// tasks. Returns the queue of content updates.
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        config: ClientConfig,
    ) -> (Self, mpsc::Receiver<ContentUpdate>) {
        let connection = Arc::new(ConnectionClient::new(
            Arc::clone(&transport),
            credentials,
            config.connection,
        ));
        let groups = Arc::new(GroupConnectionManager::for_connection(&connection, config.groups));
        let content = Arc::new(ContentService::new(transport, Arc::clone(&groups)));

        let mut tasks = connection.spawn_supervisor();
        tasks.push(groups.spawn_rejoin_task(&connection));
        let (updates, pump) = content.spawn_update_pump(config.update_buffer);
        tasks.push(pump);

        let context = Self {
            connection,
            groups,
            content,
            tasks: Mutex::new(tasks),
        };
        (context, updates)
    }

    /// Establish the base connection.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.connection.start().await
    }

    /// Join the well-known channels concurrently. Returns each outcome.
    pub async fn join_well_known(&self) -> Vec<(&'static str, Result<(), GroupError>)> {
        let joins = WELL_KNOWN.iter().map(|name| async move { (*name, self.content.join_channel(name).await) });
        join_all(joins).await
    }

    /// The connection client.
    pub fn connection(&self) -> &Arc<ConnectionClient> {
        &self.connection
    }

    /// The group connection manager.
    pub fn groups(&self) -> &Arc<GroupConnectionManager> {
        &self.groups
    }

    /// The content service.
    pub fn content(&self) -> &Arc<ContentService> {
        &self.content
    }

    /// Abort background tasks and close the session.
    pub async fn shutdown(&self) {
        self.abort_tasks();
        self.connection.stop().await;
        info!("sync context shut down");
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use questline_core::GroupStatus;

    use super::*;
    use crate::mock::{MockCredentials, MockTransport};

    fn context() -> (Arc<MockTransport>, SyncContext, mpsc::Receiver<ContentUpdate>) {
        let transport = Arc::new(MockTransport::new());
        let (ctx, updates) = SyncContext::new(
            transport.clone(),
            Arc::new(MockCredentials::new("wss://mock")),
            ClientConfig::default(),
        );
        (transport, ctx, updates)
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_selection_and_updates() {
        let (transport, ctx, mut updates) = context();
        ctx.start().await.unwrap();
        for (name, result) in ctx.join_well_known().await {
            assert!(result.is_ok(), "{name}: {result:?}");
        }

        let channel = ctx.content().select_file("quests/dragon.md").await.unwrap();
        transport.deliver(
            &channel,
            json!({"type": "markdown_content", "filename": "quests/dragon.md", "content": "# Dragon"}),
        );

        let update = tokio::time::timeout(Duration::from_secs(1), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(update, ContentUpdate::Content { ref content, .. } if content == "# Dragon"));
        assert_eq!(ctx.content().joined_channels().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn joins_before_start_wait_for_the_connection() {
        let (_transport, ctx, _updates) = context();

        let (joined, started) = tokio::join!(ctx.content().join_channel("story"), async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            ctx.start().await
        });

        started.unwrap();
        joined.unwrap();
        assert_eq!(ctx.groups().status("story"), Some(GroupStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_and_reconnect_restores_memberships() {
        let (transport, ctx, _updates) = context();
        ctx.start().await.unwrap();
        let _ = ctx.content().select_file("a.md").await.unwrap();
        ctx.content().join_channel("navigation").await.unwrap();

        transport.drop_connection("network");
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(transport.join_count("a.md"), 2);
        assert_eq!(transport.join_count("navigation"), 2);
        assert_eq!(
            ctx.content().joined_channels(),
            vec!["a.md".to_string(), "navigation".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_and_stays_down() {
        let (transport, ctx, _updates) = context();
        ctx.start().await.unwrap();

        ctx.shutdown().await;
        transport.drop_connection("after shutdown");
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!ctx.connection().is_established());
        assert_eq!(transport.open_count(), 1);
    }
}
