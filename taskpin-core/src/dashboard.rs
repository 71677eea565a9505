//! Pinned-dashboard synchronization.
//!
//! [`DashboardSync`] owns the single message that mirrors the task list in
//! a chat channel. Each cycle fetches tasks, classifies and renders them,
//! and then edits the known message, or sends and pins a new one when no
//! message is known. Nothing is sent before one history scan has succeeded,
//! so a failed startup scan cannot produce a second dashboard. Only one cycle runs at a time; a tick that arrives
//! while a cycle is in flight is dropped.
//!
//! State transitions:
//!
//! ```text
//! Unknown --locate(found)--> Located --edit ok--> Synced
//! Unknown --tick--> Creating --send ok--> Synced
//! Located/Synced --edit: message missing--> Unknown
//! ```

use crate::channels::ChatChannel;
use crate::clock::Clock;
use crate::error::{ChannelError, ErrorClass, TaskListError};
use crate::tasks::{Locale, TaskListService, classify, find_list_by_title, render};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the dashboard stands relative to the chat surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardState {
    /// No message id known.
    Unknown,
    /// Found an existing pinned dashboard, not yet edited by this process.
    Located,
    /// A send is in flight.
    Creating,
    /// The message shows the last applied render.
    Synced,
}

impl fmt::Display for DashboardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DashboardState::Unknown => "unknown",
            DashboardState::Located => "located",
            DashboardState::Creating => "creating",
            DashboardState::Synced => "synced",
        };
        f.write_str(s)
    }
}

/// The result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another cycle was already running.
    Skipped,
    /// The render matched the last applied text; nothing was sent.
    Unchanged,
    Edited {
        message_id: String,
    },
    Created {
        message_id: String,
        pinned: bool,
    },
    /// The known message is gone. The next tick creates a new one.
    MessageMissing {
        message_id: String,
    },
    Failed {
        class: ErrorClass,
        message: String,
    },
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Skipped => write!(f, "skipped (cycle already running)"),
            SyncOutcome::Unchanged => write!(f, "unchanged"),
            SyncOutcome::Edited { message_id } => write!(f, "edited message {}", message_id),
            SyncOutcome::Created { message_id, pinned } => {
                if *pinned {
                    write!(f, "created and pinned message {}", message_id)
                } else {
                    write!(f, "created message {} (pin failed)", message_id)
                }
            }
            SyncOutcome::MessageMissing { message_id } => {
                write!(f, "message {} is gone; will recreate", message_id)
            }
            SyncOutcome::Failed { class, message } => write!(f, "{} failure: {}", class, message),
        }
    }
}

/// Static settings for one monitored channel.
#[derive(Debug, Clone)]
pub struct DashboardSettings {
    pub channel_id: String,
    pub list_title: String,
    pub locale: Locale,
    pub history_scan_limit: usize,
}

#[derive(Debug)]
struct Handle {
    state: DashboardState,
    message_id: Option<String>,
    last_applied: Option<String>,
    list_id: Option<String>,
    /// A history scan has completed. Until then no new message is sent.
    scanned: bool,
}

/// Keeps one pinned message in sync with the task list.
pub struct DashboardSync {
    channel: Arc<dyn ChatChannel>,
    tasks: Arc<dyn TaskListService>,
    clock: Arc<dyn Clock>,
    settings: DashboardSettings,
    handle: Mutex<Handle>,
}

enum CycleError {
    Tasks(TaskListError),
    Channel(ChannelError),
}

impl CycleError {
    fn into_outcome(self) -> SyncOutcome {
        let (class, message) = match self {
            CycleError::Tasks(e) => (e.class(), e.to_string()),
            CycleError::Channel(e) => (e.class(), e.to_string()),
        };
        SyncOutcome::Failed { class, message }
    }
}

impl DashboardSync {
    pub fn new(
        channel: Arc<dyn ChatChannel>,
        tasks: Arc<dyn TaskListService>,
        clock: Arc<dyn Clock>,
        settings: DashboardSettings,
    ) -> Self {
        Self {
            channel,
            tasks,
            clock,
            settings,
            handle: Mutex::new(Handle {
                state: DashboardState::Unknown,
                message_id: None,
                last_applied: None,
                list_id: None,
                scanned: false,
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.settings.channel_id
    }

    pub async fn state(&self) -> DashboardState {
        self.handle.lock().await.state
    }

    pub async fn message_id(&self) -> Option<String> {
        self.handle.lock().await.message_id.clone()
    }

    /// Scan recent history for a pinned dashboard this process posted
    /// earlier. Only runs from `Unknown`; returns the id in use afterwards.
    pub async fn locate(&self) -> Result<Option<String>, ChannelError> {
        let mut handle = self.handle.lock().await;
        self.scan(&mut handle).await
    }

    async fn scan(&self, handle: &mut Handle) -> Result<Option<String>, ChannelError> {
        if handle.state != DashboardState::Unknown {
            return Ok(handle.message_id.clone());
        }

        let self_id = self.channel.self_id().await?;
        let header = self.settings.locale.header();
        let history = self
            .channel
            .fetch_history(&self.settings.channel_id, self.settings.history_scan_limit)
            .await?;
        handle.scanned = true;

        let found = history
            .into_iter()
            .find(|m| m.pinned && m.author_id == self_id && m.content.starts_with(header));

        match found {
            Some(message) => {
                info!(
                    channel_id = %self.settings.channel_id,
                    message_id = %message.id,
                    "Located existing dashboard"
                );
                handle.state = DashboardState::Located;
                handle.message_id = Some(message.id.clone());
                Ok(Some(message.id))
            }
            None => {
                debug!(
                    channel_id = %self.settings.channel_id,
                    scanned = self.settings.history_scan_limit,
                    "No pinned dashboard in recent history"
                );
                Ok(None)
            }
        }
    }

    /// Run one sync cycle unless one is already in flight.
    pub async fn tick(&self) -> SyncOutcome {
        let Ok(mut handle) = self.handle.try_lock() else {
            debug!(channel_id = %self.settings.channel_id, "Sync cycle already running; tick dropped");
            return SyncOutcome::Skipped;
        };

        let outcome = match self.cycle(&mut handle).await {
            Ok(outcome) => outcome,
            Err(e) => e.into_outcome(),
        };
        self.log_outcome(&outcome, handle.state);
        outcome
    }

    async fn resolve_list(&self, handle: &mut Handle) -> Result<String, TaskListError> {
        if let Some(id) = &handle.list_id {
            return Ok(id.clone());
        }
        let list = find_list_by_title(self.tasks.as_ref(), &self.settings.list_title).await?;
        debug!(list_id = %list.id, title = %list.title, "Resolved task list");
        handle.list_id = Some(list.id.clone());
        Ok(list.id)
    }

    async fn cycle(&self, handle: &mut Handle) -> Result<SyncOutcome, CycleError> {
        let list_id = self
            .resolve_list(handle)
            .await
            .map_err(CycleError::Tasks)?;
        let tasks = match self.tasks.list_tasks(&list_id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                if matches!(e, TaskListError::NotFound { .. }) {
                    handle.list_id = None;
                }
                return Err(CycleError::Tasks(e));
            }
        };

        let now = self.clock.now();
        let classified = classify(&tasks, now);
        let snapshot = render(
            &classified.pending,
            &classified.passed,
            self.settings.locale,
            now,
        );
        let text = snapshot.text_within(self.channel.max_message_len());

        if handle.message_id.is_none() && !handle.scanned {
            self.scan(handle).await.map_err(CycleError::Channel)?;
        }

        if let Some(message_id) = handle.message_id.clone() {
            if handle.last_applied.as_deref() == Some(text.as_str()) {
                return Ok(SyncOutcome::Unchanged);
            }
            return match self
                .channel
                .edit(&self.settings.channel_id, &message_id, &text)
                .await
            {
                Ok(()) => {
                    handle.last_applied = Some(text);
                    handle.state = DashboardState::Synced;
                    Ok(SyncOutcome::Edited { message_id })
                }
                Err(ChannelError::MessageMissing { .. }) => {
                    handle.message_id = None;
                    handle.last_applied = None;
                    handle.state = DashboardState::Unknown;
                    Ok(SyncOutcome::MessageMissing { message_id })
                }
                Err(e) => Err(CycleError::Channel(e)),
            };
        }

        handle.state = DashboardState::Creating;
        let message_id = match self.channel.send(&self.settings.channel_id, &text).await {
            Ok(id) => id,
            Err(e) => {
                handle.state = DashboardState::Unknown;
                return Err(CycleError::Channel(e));
            }
        };

        // A visible but unpinned dashboard beats a duplicate, so the id is
        // kept even when pinning fails.
        let pinned = match self.channel.pin(&self.settings.channel_id, &message_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    channel_id = %self.settings.channel_id,
                    message_id = %message_id,
                    error = %e,
                    "Failed to pin dashboard"
                );
                false
            }
        };

        handle.message_id = Some(message_id.clone());
        handle.last_applied = Some(text);
        handle.state = DashboardState::Synced;
        Ok(SyncOutcome::Created { message_id, pinned })
    }

    fn log_outcome(&self, outcome: &SyncOutcome, state: DashboardState) {
        let channel_id = self.settings.channel_id.as_str();
        match outcome {
            SyncOutcome::Skipped | SyncOutcome::Unchanged => {
                debug!(channel_id, %state, %outcome, "Sync cycle finished")
            }
            SyncOutcome::Edited { message_id } | SyncOutcome::Created { message_id, .. } => {
                info!(channel_id, message_id = %message_id, %state, %outcome, "Dashboard updated")
            }
            SyncOutcome::MessageMissing { message_id } => {
                warn!(channel_id, message_id = %message_id, "Dashboard message was deleted")
            }
            SyncOutcome::Failed {
                class: ErrorClass::Transient,
                message,
            } => warn!(channel_id, error = %message, "Sync failed; retrying next tick"),
            SyncOutcome::Failed { message, .. } => {
                error!(channel_id, error = %message, "Sync failed")
            }
        }
    }

    /// Locate an existing dashboard, then tick every `interval` until
    /// cancelled. Each tick runs on its own task so a slow cycle causes
    /// later ticks to be dropped rather than queued.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        if let Err(e) = self.locate().await {
            warn!(
                channel_id = %self.settings.channel_id,
                error = %e,
                "Dashboard scan failed; retrying before the first send"
            );
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            channel_id = %self.settings.channel_id,
            interval_secs = interval.as_secs(),
            "Dashboard sync started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sync = Arc::clone(&self);
                    tokio::spawn(async move {
                        sync.tick().await;
                    });
                }
            }
        }
        info!(channel_id = %self.settings.channel_id, "Dashboard sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelOp, InMemoryChannel};
    use crate::clock::FixedClock;
    use crate::tasks::{InMemoryTaskList, Task, TaskOp, TaskStatus};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        channel: Arc<InMemoryChannel>,
        tasks: Arc<InMemoryTaskList>,
        clock: Arc<FixedClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let tasks = InMemoryTaskList::new();
            tasks.add_list("list-1", "Schule");
            Self {
                channel: Arc::new(InMemoryChannel::with_channel("c1", "hausaufgaben")),
                tasks: Arc::new(tasks),
                clock: Arc::new(FixedClock::new(
                    Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap(),
                )),
            }
        }

        fn sync(&self) -> DashboardSync {
            DashboardSync::new(
                self.channel.clone(),
                self.tasks.clone(),
                self.clock.clone(),
                DashboardSettings {
                    channel_id: "c1".into(),
                    list_title: "Schule".into(),
                    locale: Locale::En,
                    history_scan_limit: 10,
                },
            )
        }

        fn add_task(&self, id: &str, title: &str, day: u32) {
            self.tasks.push_task(
                "list-1",
                Task {
                    id: id.into(),
                    title: title.into(),
                    due: Some(Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()),
                    status: TaskStatus::NeedsAction,
                    notes: None,
                },
            );
        }
    }

    #[tokio::test]
    async fn test_first_tick_creates_and_pins() {
        let fx = Fixture::new();
        fx.add_task("t1", "Essay", 8);
        let sync = fx.sync();

        let outcome = sync.tick().await;
        let SyncOutcome::Created { message_id, pinned } = outcome else {
            panic!("expected Created, got {:?}", outcome);
        };
        assert!(pinned);
        assert_eq!(sync.state().await, DashboardState::Synced);
        let msg = fx.channel.message(&message_id).unwrap();
        assert!(msg.pinned);
        assert!(msg.content.contains("- **Essay** (Due: 2024-03-08)"));
    }

    #[tokio::test]
    async fn test_unchanged_tick_issues_no_edit() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.tick().await;
        assert_eq!(sync.tick().await, SyncOutcome::Unchanged);
        assert_eq!(fx.channel.count(ChannelOp::Edit), 0);
        assert_eq!(fx.channel.count(ChannelOp::Send), 1);
    }

    #[tokio::test]
    async fn test_change_triggers_edit() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.tick().await;
        fx.add_task("t2", "Lab report", 9);
        assert!(matches!(sync.tick().await, SyncOutcome::Edited { .. }));
        assert_eq!(fx.channel.count(ChannelOp::Edit), 1);
    }

    #[tokio::test]
    async fn test_deleted_message_is_recreated() {
        let fx = Fixture::new();
        let sync = fx.sync();
        let SyncOutcome::Created { message_id, .. } = sync.tick().await else {
            panic!("expected Created");
        };
        fx.channel.remove_message(&message_id);
        fx.add_task("t3", "Vocab", 10);

        assert_eq!(
            sync.tick().await,
            SyncOutcome::MessageMissing {
                message_id: message_id.clone()
            }
        );
        assert_eq!(sync.state().await, DashboardState::Unknown);

        let SyncOutcome::Created {
            message_id: fresh, ..
        } = sync.tick().await
        else {
            panic!("expected Created");
        };
        assert_ne!(fresh, message_id);
    }

    #[tokio::test]
    async fn test_pin_failure_still_records_id() {
        let fx = Fixture::new();
        fx.channel.fail_next(
            ChannelOp::Pin,
            ChannelError::Forbidden {
                action: "pin".into(),
                message: "missing permission".into(),
            },
        );
        let sync = fx.sync();
        let outcome = sync.tick().await;
        assert!(matches!(outcome, SyncOutcome::Created { pinned: false, .. }));
        assert!(sync.message_id().await.is_some());

        // Next change edits rather than sending a duplicate.
        fx.add_task("t1", "Essay", 8);
        assert!(matches!(sync.tick().await, SyncOutcome::Edited { .. }));
        assert_eq!(fx.channel.count(ChannelOp::Send), 1);
    }

    #[tokio::test]
    async fn test_locate_finds_own_pinned_dashboard() {
        let fx = Fixture::new();
        fx.channel
            .seed_message("c1", "someone", "### Tasks Overview\nfake", true);
        let own = fx.channel.seed_message(
            "c1",
            InMemoryChannel::BOT_ID,
            "### Tasks Overview\n**Pending Tasks:**\nold",
            true,
        );
        fx.channel
            .seed_message("c1", InMemoryChannel::BOT_ID, "### Tasks Overview\nunpinned", false);

        let sync = fx.sync();
        assert_eq!(sync.locate().await.unwrap(), Some(own.clone()));
        assert_eq!(sync.state().await, DashboardState::Located);

        assert_eq!(
            sync.tick().await,
            SyncOutcome::Edited {
                message_id: own.clone()
            }
        );
        assert_eq!(fx.channel.count(ChannelOp::Send), 0);
    }

    #[tokio::test]
    async fn test_locate_ignores_messages_beyond_scan_limit() {
        let fx = Fixture::new();
        fx.channel
            .seed_message("c1", InMemoryChannel::BOT_ID, "### Tasks Overview\nold", true);
        for i in 0..10 {
            fx.channel.post_as_user("c1", "u1", &format!("msg {}", i));
        }
        let sync = fx.sync();
        assert_eq!(sync.locate().await.unwrap(), None);
        assert_eq!(sync.state().await, DashboardState::Unknown);
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_leaves_state() {
        let fx = Fixture::new();
        fx.tasks.fail_next(
            TaskOp::ListTasks,
            TaskListError::Network {
                message: "reset".into(),
            },
        );
        let sync = fx.sync();
        let outcome = sync.tick().await;
        assert!(matches!(
            outcome,
            SyncOutcome::Failed {
                class: ErrorClass::Transient,
                ..
            }
        ));
        assert_eq!(sync.state().await, DashboardState::Unknown);
        assert!(fx.channel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_list_is_permanent() {
        let fx = Fixture::new();
        let sync = DashboardSync::new(
            fx.channel.clone(),
            fx.tasks.clone(),
            fx.clock.clone(),
            DashboardSettings {
                channel_id: "c1".into(),
                list_title: "Uni".into(),
                locale: Locale::En,
                history_scan_limit: 10,
            },
        );
        let SyncOutcome::Failed { class, message } = sync.tick().await else {
            panic!("expected Failed");
        };
        assert_eq!(class, ErrorClass::Permanent);
        assert_eq!(message, "Task list 'Uni' not found");
    }

    #[tokio::test]
    async fn test_list_id_is_cached() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.tick().await;
        sync.tick().await;
        assert_eq!(fx.tasks.count(TaskOp::ListTaskLists), 1);
        assert_eq!(fx.tasks.count(TaskOp::ListTasks), 2);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_dropped() {
        let fx = Fixture::new();
        let sync = fx.sync();
        let _held = sync.handle.lock().await;
        assert_eq!(sync.tick().await, SyncOutcome::Skipped);
        assert_eq!(fx.tasks.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let fx = Fixture::new();
        let sync = Arc::new(fx.sync());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&sync).run(Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(sync.message_id().await.is_some());
        assert_eq!(fx.channel.count(ChannelOp::Send), 1);
    }
}
