//! Content selection and typed update delivery.
//!
//! At most one channel is tied to the selected content file at a time.
//! Explicitly joined channels (`navigation`, `events`, ...) are independent
//! of the selection.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use questline_core::{
    ContentMessage, ContentUpdate, GroupStatus, SendOptions, Transport, TransportError,
    TransportEvent, channel_for_file,
};

use crate::errors::{ContentError, GroupError};
use crate::groups::GroupConnectionManager;

/// Maps selected content to channels and pumps updates to the UI layer.
pub struct ContentService {
    transport: Arc<dyn Transport>,
    groups: Arc<GroupConnectionManager>,
    /// Channel of the selected file. Held for the whole of a selection.
    current: Mutex<Option<String>>,
    /// Channels joined through [`join_channel`](Self::join_channel).
    explicit: parking_lot::Mutex<HashSet<String>>,
}

impl ContentService {
    /// Create a service over `transport`, joining through `groups`.
    pub fn new(transport: Arc<dyn Transport>, groups: Arc<GroupConnectionManager>) -> Self {
        Self {
            transport,
            groups,
            current: Mutex::new(None),
            explicit: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Select `filename`: switch the selection channel and request its
    /// content. Returns the channel name.
    ///
    /// The previous selection channel is left when it differs from the new
    /// one, unless it was also joined explicitly. Each failing step is returned with the channel it concerned.
    pub async fn select_file(&self, filename: &str) -> Result<String, ContentError> {
        let target =
            channel_for_file(filename).ok_or_else(|| ContentError::InvalidFile(filename.to_string()))?;
        let mut current = self.current.lock().await;

        if let Some(previous) = current.clone().filter(|p| *p != target) {
            info!(from = %previous, to = %target, "switching content channel");
            if !self.explicit.lock().contains(&previous) {
                self.leave(&previous)
                    .await
                    .map_err(|source| ContentError::Leave {
                        group: previous.clone(),
                        source,
                    })?;
            }
            *current = None;
        }

        if self.groups.status(&target) != Some(GroupStatus::Connected) {
            self.join(&target)
                .await
                .map_err(|source| ContentError::Join {
                    group: target.clone(),
                    source,
                })?;
        }
        *current = Some(target.clone());

        let request = ContentMessage::ContentRequest {
            filename: filename.to_string(),
        };
        self.transport
            .send_to_group(&target, request.to_value(), SendOptions::json_no_echo())
            .await
            .map_err(|source| ContentError::Request {
                group: target.clone(),
                source,
            })?;
        debug!(group = %target, filename, "content requested");
        Ok(target)
    }

    /// Join a channel independently of the selection.
    pub async fn join_channel(&self, name: &str) -> Result<(), GroupError> {
        let _ = self.explicit.lock().insert(name.to_string());
        self.join(name).await
    }

    /// Leave a channel. Clears the selection when it was the selected one.
    pub async fn leave_channel(&self, name: &str) -> Result<(), TransportError> {
        let mut current = self.current.lock().await;
        self.leave(name).await?;
        let _ = self.explicit.lock().remove(name);
        if current.as_deref() == Some(name) {
            *current = None;
        }
        Ok(())
    }

    /// Channel of the selected file, if any.
    pub async fn current_channel(&self) -> Option<String> {
        self.current.lock().await.clone()
    }

    /// Channels currently in `connected`, sorted.
    pub fn joined_channels(&self) -> Vec<String> {
        self.groups
            .snapshot()
            .into_iter()
            .filter(|g| g.status == GroupStatus::Connected)
            .map(|g| g.name)
            .collect()
    }

    /// Forward decodable group messages as [`ContentUpdate`]s.
    ///
    /// Subscribes before returning, so no message published after this call
    /// is missed. The task ends when the receiver is dropped.
    pub fn spawn_update_pump(&self, buffer: usize) -> (mpsc::Receiver<ContentUpdate>, JoinHandle<()>) {
        let mut events = self.transport.subscribe();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::GroupMessage { group, data }) => {
                        let Some(update) =
                            ContentMessage::decode(&data).and_then(|m| m.into_update(&group))
                        else {
                            debug!(group = %group, "skipping non-content group message");
                            continue;
                        };
                        if tx.send(update).await.is_err() {
                            debug!("update receiver dropped, stopping pump");
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "content updates lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
        (rx, handle)
    }

    async fn join(&self, name: &str) -> Result<(), GroupError> {
        let transport = &self.transport;
        self.groups
            .handle_group_connection(name, || transport.join_group(name))
            .await
    }

    async fn leave(&self, name: &str) -> Result<(), TransportError> {
        self.transport.leave_group(name).await?;
        self.groups.disconnect_group(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::watch;

    use super::*;
    use crate::config::GroupConfig;
    use crate::mock::{MockTransport, TransportCall};

    struct Harness {
        transport: Arc<MockTransport>,
        groups: Arc<GroupConnectionManager>,
        service: ContentService,
        _established: watch::Sender<bool>,
    }

    async fn harness() -> Harness {
        let transport = Arc::new(MockTransport::new());
        transport.open("wss://mock").await.unwrap();
        let (established, rx) = watch::channel(true);
        let groups = Arc::new(GroupConnectionManager::new(rx, GroupConfig::default()));
        let service = ContentService::new(transport.clone(), Arc::clone(&groups));
        Harness {
            transport,
            groups,
            service,
            _established: established,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn select_joins_and_requests_on_the_mapped_channel() {
        let h = harness().await;

        let channel = h.service.select_file("quests/dragon.md").await.unwrap();

        assert_eq!(channel, "quests_dragon.md");
        assert_eq!(h.service.current_channel().await.as_deref(), Some("quests_dragon.md"));
        assert_eq!(h.groups.status("quests_dragon.md"), Some(GroupStatus::Connected));
        assert_eq!(
            h.transport.sent_to("quests_dragon.md"),
            vec![json!({"type": "content_request", "filename": "quests/dragon.md"})]
        );
        let send = h
            .transport
            .calls()
            .into_iter()
            .find_map(|c| match c {
                TransportCall::Send { options, .. } => Some(options),
                _ => None,
            })
            .unwrap();
        assert_eq!(send, SendOptions::json_no_echo());
    }

    #[tokio::test(start_paused = true)]
    async fn switching_files_leaves_the_previous_channel() {
        let h = harness().await;

        let _ = h.service.select_file("quests/dragon.md").await.unwrap();
        let _ = h.service.select_file("quests/troll.md").await.unwrap();

        assert_eq!(h.service.joined_channels(), vec!["quests_troll.md".to_string()]);
        assert_eq!(h.groups.status("quests_dragon.md"), Some(GroupStatus::Disconnected));
        let membership: Vec<TransportCall> = h
            .transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::Join(_) | TransportCall::Leave(_)))
            .collect();
        assert_eq!(
            membership,
            vec![
                TransportCall::Join("quests_dragon.md".into()),
                TransportCall::Leave("quests_dragon.md".into()),
                TransportCall::Join("quests_troll.md".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reselecting_the_same_file_only_requests_again() {
        let h = harness().await;

        let _ = h.service.select_file("intro.md").await.unwrap();
        let _ = h.service.select_file("intro.md").await.unwrap();

        assert_eq!(h.transport.join_count("intro.md"), 1);
        assert_eq!(h.transport.sent_to("intro.md").len(), 2);
        assert!(!h.transport.calls().iter().any(|c| matches!(c, TransportCall::Leave(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_channels_survive_selection_changes() {
        let h = harness().await;
        h.service.join_channel("navigation").await.unwrap();

        let _ = h.service.select_file("a.md").await.unwrap();
        let _ = h.service.select_file("b.md").await.unwrap();

        assert_eq!(
            h.service.joined_channels(),
            vec!["b.md".to_string(), "navigation".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_away_from_an_explicit_channel_keeps_it_joined() {
        let h = harness().await;
        h.service.join_channel("navigation").await.unwrap();
        let _ = h.service.select_file("navigation").await.unwrap();

        let _ = h.service.select_file("a.md").await.unwrap();

        assert!(!h.transport.calls().contains(&TransportCall::Leave("navigation".to_string())));
        assert_eq!(h.groups.status("navigation"), Some(GroupStatus::Connected));
        assert_eq!(h.service.current_channel().await.as_deref(), Some("a.md"));
    }

    #[tokio::test(start_paused = true)]
    async fn left_explicit_channels_are_left_again_on_selection_changes() {
        let h = harness().await;
        h.service.join_channel("navigation").await.unwrap();
        h.service.leave_channel("navigation").await.unwrap();
        let _ = h.service.select_file("navigation").await.unwrap();

        let _ = h.service.select_file("a.md").await.unwrap();

        assert_eq!(h.groups.status("navigation"), Some(GroupStatus::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_identifier_is_rejected_without_side_effects() {
        let h = harness().await;
        let err = h.service.select_file("//").await.unwrap_err();
        assert!(matches!(err, ContentError::InvalidFile(_)));
        assert_eq!(h.transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn join_failure_is_wrapped_with_the_channel() {
        let h = harness().await;
        h.transport
            .script_join("a.md", std::iter::repeat_n(Err(TransportError::Closed), 3));

        let err = h.service.select_file("a.md").await.unwrap_err();

        assert!(
            matches!(&err, ContentError::Join { group, source: GroupError::RetriesExhausted { .. } } if group == "a.md"),
            "got: {err:?}"
        );
        assert_eq!(h.service.current_channel().await, None);
        assert!(h.transport.sent_to("a.md").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_failure_is_wrapped_and_keeps_the_selection() {
        let h = harness().await;
        let _ = h.service.select_file("a.md").await.unwrap();
        h.transport.drop_connection("network");

        let err = h.service.select_file("b.md").await.unwrap_err();

        assert!(matches!(&err, ContentError::Leave { group, source: TransportError::NotOpen } if group == "a.md"));
        assert_eq!(h.service.current_channel().await.as_deref(), Some("a.md"));
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_the_selected_channel_clears_the_selection() {
        let h = harness().await;
        let _ = h.service.select_file("a.md").await.unwrap();

        h.service.leave_channel("a.md").await.unwrap();

        assert_eq!(h.service.current_channel().await, None);
        assert!(h.service.joined_channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_pump_forwards_typed_updates() {
        let h = harness().await;
        let (mut updates, _pump) = h.service.spawn_update_pump(8);

        h.transport.deliver("chat", json!({"type": "chat", "text": "ignored"}));
        h.transport.deliver(
            "quests_dragon.md",
            json!({"type": "markdown_content", "filename": "quests/dragon.md", "content": "# Dragon"}),
        );
        h.transport.deliver(
            "details",
            json!({"type": "skill_summary", "summary": {"title": "Archery", "markdown": "Aim."}}),
        );

        let first = tokio::time::timeout(Duration::from_secs(1), updates.recv()).await.unwrap();
        assert_eq!(
            first,
            Some(ContentUpdate::Content {
                group: "quests_dragon.md".into(),
                filename: "quests/dragon.md".into(),
                content: "# Dragon".into(),
            })
        );
        let second = tokio::time::timeout(Duration::from_secs(1), updates.recv()).await.unwrap();
        assert!(matches!(second, Some(ContentUpdate::Skills(s)) if s.title == "Archery"));
    }

    #[tokio::test(start_paused = true)]
    async fn update_pump_stops_when_receiver_drops() {
        let h = harness().await;
        let (updates, pump) = h.service.spawn_update_pump(1);
        drop(updates);
        h.transport.deliver("story", json!({"type": "events", "events": []}));
        tokio::time::timeout(Duration::from_secs(1), pump).await.unwrap().unwrap();
    }
}
