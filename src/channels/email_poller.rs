//! Mail poller: turns unseen, allowed mail into dispatched tasks.
//!
//! Each cycle:
//! 1. Fetches unseen mail from the `MailSource`
//! 2. Drops self-sent, disallowed and already-seen messages
//! 3. Derives a `TaskContext` and hands it to the `Dispatcher`
//! 4. Marks every fetched message `\Seen`, dispatched or not

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::email::{EmailConfig, MailSource, Rejection, rejection};
use crate::channels::email_types::clean_body;
use crate::config::AgentConfig;
use crate::error::ChannelError;
use crate::pipeline::derive::task_from_email;
use crate::service::Dispatcher;

/// Counts for one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub dispatched: usize,
    pub rejected: usize,
    pub duplicates: usize,
}

/// Message-IDs remembered for deduplication.
const MAX_REMEMBERED_IDS: usize = 4096;

/// Bounded set of recently dispatched Message-IDs; the oldest is evicted
/// first once `capacity` is reached.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    index: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            index: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `id`. Returns `false` when it is already known.
    fn insert(&mut self, id: &str) -> bool {
        if self.index.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.index.insert(id.to_string());
        true
    }
}

pub struct MailPoller {
    source: Arc<dyn MailSource>,
    email: EmailConfig,
    agent: Arc<AgentConfig>,
    dispatcher: Dispatcher,
    /// Message-IDs already dispatched by this process.
    seen_ids: Mutex<RecentIds>,
}

impl MailPoller {
    pub fn new(
        source: Arc<dyn MailSource>,
        email: EmailConfig,
        agent: Arc<AgentConfig>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            source,
            email,
            agent,
            dispatcher,
            seen_ids: Mutex::new(RecentIds::new(MAX_REMEMBERED_IDS)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.email.poll_interval
    }

    /// Run a single poll cycle.
    pub async fn poll_once(&self) -> Result<PollReport, ChannelError> {
        let messages = self.source.fetch_unseen().await?;
        let mut report = PollReport {
            fetched: messages.len(),
            ..PollReport::default()
        };
        if messages.is_empty() {
            return Ok(report);
        }
        debug!(count = messages.len(), "Fetched unseen emails");

        let mut uids = Vec::with_capacity(messages.len());
        for mut email in messages {
            uids.push(email.uid);

            match rejection(&self.email, &email.from) {
                Some(Rejection::SelfSent) => {
                    debug!(sender = %email.from, "Skipping self-sent email");
                    report.rejected += 1;
                    continue;
                }
                Some(Rejection::NotAllowed) => {
                    debug!(sender = %email.from, "Dropping email from sender not in allowlist");
                    report.rejected += 1;
                    continue;
                }
                None => {}
            }

            let fresh = self
                .seen_ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(&email.message_id);
            if !fresh {
                debug!(message_id = %email.message_id, "Skipping duplicate email");
                report.duplicates += 1;
                continue;
            }

            email.body = clean_body(&email.body);
            let ctx = task_from_email(&email, &self.agent);
            info!(
                task_id = %ctx.id(),
                sender = %email.from,
                subject = %ctx.subject(),
                "Accepted email"
            );
            self.dispatcher.spawn(ctx).await;
            report.dispatched += 1;
        }

        if let Err(e) = self.source.mark_seen(&uids).await {
            warn!(error = %e, "Failed to mark emails as seen");
        }
        Ok(report)
    }
}

/// Spawn a background task that polls on the configured interval.
///
/// Returns a `JoinHandle` and a shutdown sender. Send `true` (or drop the
/// sender) to stop polling; a cycle already in progress runs to completion,
/// including marking its mail seen, before the task exits.
pub fn spawn_mail_poller(poller: Arc<MailPoller>) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let interval = poller.poll_interval();
        info!(interval_secs = interval.as_secs(), "Mail poller started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }

            match poller.poll_once().await {
                Ok(report) if report.dispatched > 0 => {
                    info!(
                        fetched = report.fetched,
                        dispatched = report.dispatched,
                        rejected = report.rejected,
                        "Poll cycle finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Mail poll failed: {e}"),
            }
        }
        info!("Mail poller shutting down");
    });

    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::email_types::FetchedEmail;
    use crate::error::{NotificationError, RunnerError};
    use crate::notify::NotificationSink;
    use crate::pipeline::{TaskContext, TaskPipeline};
    use crate::process::{CommandSpec, OutputSink, ProcessRunner, StepKind, StepResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    struct FakeSource {
        inbox: Vec<FetchedEmail>,
        marked: Mutex<Vec<u32>>,
        /// Time a fetch takes once it has started.
        latency: Duration,
        fetching: Notify,
    }

    impl FakeSource {
        fn new(inbox: Vec<FetchedEmail>) -> Self {
            Self {
                inbox,
                marked: Mutex::new(Vec::new()),
                latency: Duration::ZERO,
                fetching: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl MailSource for FakeSource {
        async fn fetch_unseen(&self) -> Result<Vec<FetchedEmail>, ChannelError> {
            self.fetching.notify_one();
            tokio::time::sleep(self.latency).await;
            Ok(self.inbox.clone())
        }

        async fn mark_seen(&self, uids: &[u32]) -> Result<(), ChannelError> {
            self.marked.lock().unwrap().extend_from_slice(uids);
            Ok(())
        }
    }

    /// Assistant succeeds, tree stays clean.
    struct QuietRunner {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessRunner for QuietRunner {
        async fn run(&self, spec: &CommandSpec, _sink: &dyn OutputSink) -> Result<StepResult, RunnerError> {
            if spec.args.first().map(String::as_str) == Some("-p") {
                self.prompts.lock().unwrap().push(spec.args[1].clone());
            }
            Ok(StepResult {
                command: spec.display(),
                kind: StepKind::Success,
                stdout: String::new(),
                stderr: String::new(),
                flushed: true,
                elapsed: Duration::ZERO,
            })
        }
    }

    struct Silent;

    #[async_trait]
    impl NotificationSink for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn notify(&self, _ctx: &TaskContext, _message: &str) -> Result<(), NotificationError> {
            Ok(())
        }
    }

    fn mail(uid: u32, from: &str, id: &str, subject: &str) -> FetchedEmail {
        FetchedEmail {
            message_id: id.into(),
            uid,
            from: from.into(),
            subject: subject.into(),
            body: "Body text\n-- \nsig".into(),
            received_at: Utc::now(),
        }
    }

    fn email_config() -> EmailConfig {
        let mut email = EmailConfig::from_lookup(|key| match key {
            "IMAP_HOST" => Some("imap.example.com".into()),
            "EMAIL_FROM_ADDRESS" => Some("agent@example.com".into()),
            _ => None,
        })
        .unwrap()
        .unwrap();
        email.allowed_senders = vec!["notifications@github.com".into()];
        email
    }

    struct Harness {
        _dir: tempfile::TempDir,
        runner: Arc<QuietRunner>,
        dispatcher: Dispatcher,
        poller: MailPoller,
    }

    fn harness(source: Arc<FakeSource>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = AgentConfig::default();
        agent.project_folder = Some(dir.path().to_path_buf());
        let agent = Arc::new(agent);

        let runner = Arc::new(QuietRunner {
            prompts: Mutex::new(Vec::new()),
        });
        let pipeline = TaskPipeline::new(Arc::clone(&agent), runner.clone(), Arc::new(Silent));
        let dispatcher = Dispatcher::new(pipeline);
        let poller = MailPoller::new(source, email_config(), agent, dispatcher.clone());
        Harness {
            _dir: dir,
            runner,
            dispatcher,
            poller,
        }
    }

    #[test]
    fn recent_ids_evict_oldest_first() {
        let mut ids = RecentIds::new(2);
        assert!(ids.insert("a"));
        assert!(ids.insert("b"));
        assert!(!ids.insert("a"));

        assert!(ids.insert("c"));
        assert_eq!(ids.order.len(), 2);
        assert_eq!(ids.index.len(), 2);
        // "a" fell out, "b" and "c" are still known
        assert!(!ids.insert("c"));
        assert!(!ids.insert("b"));
        assert!(ids.insert("a"));
    }

    #[tokio::test]
    async fn poll_filters_dedups_and_marks_everything_seen() {
        let source = Arc::new(FakeSource::new(vec![
            mail(1, "notifications@github.com", "a@gh", "[o/r] Fix crash (Issue #1)"),
            mail(2, "stranger@example.net", "b@x", "Buy now"),
            mail(3, "agent@example.com", "c@self", "Re: done"),
            mail(4, "notifications@github.com", "a@gh", "[o/r] Fix crash (Issue #1)"),
        ]));
        let Harness {
            _dir,
            runner,
            dispatcher,
            poller,
        } = harness(source.clone());

        let report = poller.poll_once().await.unwrap();
        assert_eq!(
            report,
            PollReport {
                fetched: 4,
                dispatched: 1,
                rejected: 2,
                duplicates: 1,
            }
        );
        assert_eq!(*source.marked.lock().unwrap(), vec![1, 2, 3, 4]);

        let outcomes = dispatcher.wait_idle().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].subject, "[o/r] Fix crash (Issue #1)");
        assert_eq!(
            *runner.prompts.lock().unwrap(),
            vec!["[o/r] Fix crash (Issue #1)".to_string()]
        );

        // next cycle sees the same ids again and dispatches nothing
        let again = poller.poll_once().await.unwrap();
        assert_eq!(again.dispatched, 0);
        assert_eq!(again.duplicates, 2);
    }

    #[tokio::test]
    async fn shutdown_during_a_cycle_still_marks_its_mail_seen() {
        let mut source = FakeSource::new(vec![
            mail(5, "notifications@github.com", "e@gh", "[o/r] Fix typo (Issue #5)"),
            mail(6, "notifications@github.com", "f@gh", "[o/r] Bump deps (PR #6)"),
        ]);
        source.latency = Duration::from_millis(200);
        let source = Arc::new(source);
        let h = harness(source.clone());

        let (handle, shutdown) = spawn_mail_poller(Arc::new(h.poller));
        timeout(Duration::from_secs(5), source.fetching.notified())
            .await
            .expect("poller never fetched");
        shutdown.send(true).unwrap();

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
        assert_eq!(*source.marked.lock().unwrap(), vec![5, 6]);

        let outcomes = h.dispatcher.wait_idle().await;
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_stops_poller() {
        let h = harness(Arc::new(FakeSource::new(Vec::new())));
        let (handle, shutdown) = spawn_mail_poller(Arc::new(h.poller));
        drop(shutdown);
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
    }
}
