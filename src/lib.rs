// websift - privacy-preserving client-side web telemetry core
//
// Consumes a stream of observed page/request events and emits anonymized
// reports about public pages and tracking parameters. Nothing is shared
// before it passes the privacy gates: an anonymous re-fetch must return
// the same public content, enough independent clients must have seen the
// same URL (quorum), URLs are redacted by the sanitizer, and every
// message is deduplicated before it reaches the transport.
//
// Architecture:
// - Scheduler: persisted job queue chaining doublefetch -> quorum check
//   -> send-message
// - Telemetry: per-request extraction into batched token/key pipelines
// - Probes: bloom-backed private-page memory and exact dedup hashes
// - Collaborators behind traits: KV storage, transport, clock

pub mod activity;
pub mod alive;
pub mod clock;
pub mod config;
pub mod country;
pub mod dedup;
pub mod digest;
pub mod error;
pub mod events;
pub mod lazyvar;
pub mod logging;
pub mod pages;
pub mod probe;
pub mod quorum;
pub mod sanitizer;
pub mod scheduler;
pub mod selfcheck;
pub mod seqexec;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod util;
pub mod whitelist;

pub use config::Options;
pub use error::{Error, Result};
pub use events::{EventQueue, ObservedEvent};
pub use storage::{KvStorage, MemoryStorage, SqliteStorage};
pub use transport::Transport;

use activity::ActivityEstimator;
use alive::AliveCheck;
use clock::Clock;
use country::CountryProvider;
use dedup::{DuplicateDetector, MessageSender, SEND_MESSAGE_JOB};
use pages::doublefetch::{DoublefetchHandler, DOUBLEFETCH_JOB};
use pages::quorum_check::{PageQuorumCheckHandler, PAGE_QUORUM_CHECK_JOB};
use probe::{NewPageApprover, PersistedHashes};
use quorum::QuorumClient;
use scheduler::{JobConfig, JobScheduler};
use selfcheck::{Check, CheckStatus, SelfCheckReport};
use std::sync::Arc;
use telemetry::db::TelemetryDb;
use telemetry::RequestTelemetry;
use tokio::sync::Mutex;
use transport::OutboundMessage;
use whitelist::QsWhitelist;

const ACTIVITY_STATE_KEY: &str = "activity|state";

/// The assembled telemetry core.
pub struct Sift {
    options: Options,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn KvStorage>,
    scheduler: Arc<JobScheduler>,
    telemetry: Arc<RequestTelemetry>,
    quorum: Arc<QuorumClient>,
    country: Arc<CountryProvider>,
    whitelist: Arc<QsWhitelist>,
    approver: Arc<NewPageApprover>,
    hashes: Arc<PersistedHashes>,
    activity: Mutex<ActivityEstimator>,
    alive: AliveCheck,
    events: EventQueue,
    /// Day of the last whitelist update attempt.
    whitelist_updated_day: Mutex<Option<String>>,
}

impl Sift {
    /// Wire up all components and restore persisted state. The caller
    /// provides the collaborators; everything else is owned here.
    pub async fn new(
        options: Options,
        storage: Arc<dyn KvStorage>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        db: Arc<TelemetryDb>,
    ) -> Result<Arc<Self>> {
        let approver = Arc::new(NewPageApprover::new(storage.clone())?);
        let whitelist = Arc::new(QsWhitelist::new(&options, storage.clone(), clock.clone()));
        let quorum = Arc::new(QuorumClient::new(
            &options,
            transport.clone(),
            storage.clone(),
            clock.clone(),
        )?);
        let country = Arc::new(CountryProvider::new(&options, storage.clone(), clock.clone()));
        let hashes = Arc::new(PersistedHashes::new(
            "sent-messages",
            storage.clone(),
            clock.clone(),
        ));
        let telemetry = Arc::new(RequestTelemetry::new(
            &options,
            whitelist.clone(),
            db,
            storage.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(JobScheduler::new(storage.clone(), clock.clone()));

        scheduler.register_handler(
            DOUBLEFETCH_JOB,
            Arc::new(DoublefetchHandler::new(&options, approver.clone())?),
            JobConfig {
                priority: 0,
                ready_in_ms: (2_000, 25_000),
                cooldown_ms: 30_000,
                max_jobs_total: 100,
                max_attempts: 3,
            },
        )?;
        scheduler.register_handler(
            PAGE_QUORUM_CHECK_JOB,
            Arc::new(PageQuorumCheckHandler::new(
                options.clone(),
                quorum.clone(),
                country.clone(),
            )),
            JobConfig {
                priority: 1,
                ready_in_ms: (0, 5_000),
                cooldown_ms: 1_000,
                max_jobs_total: 100,
                max_attempts: 3,
            },
        )?;
        scheduler.register_handler(
            SEND_MESSAGE_JOB,
            Arc::new(MessageSender::new(
                options.clone(),
                DuplicateDetector::new(hashes.clone()),
                transport.clone(),
                clock.clone(),
            )),
            JobConfig {
                priority: 2,
                ready_in_ms: (0, 2_000),
                cooldown_ms: 0,
                max_jobs_total: 1_000,
                max_attempts: 5,
            },
        )?;

        let alive = AliveCheck::new(
            options.clone(),
            transport.clone(),
            clock.clone(),
            country.clone(),
        );

        let sift = Arc::new(Self {
            options,
            clock,
            storage,
            scheduler,
            telemetry,
            quorum,
            country,
            whitelist,
            approver,
            hashes,
            activity: Mutex::new(ActivityEstimator::new()),
            alive,
            events: EventQueue::new(),
            whitelist_updated_day: Mutex::new(None),
        });
        sift.restore().await;
        Ok(sift)
    }

    /// Restore all persisted state; corrupted pieces start fresh.
    async fn restore(&self) {
        self.scheduler.restore().await;
        if let Err(err) = self.hashes.load().await {
            tracing::warn!("failed to restore dedup hashes: {err}");
        }
        self.country.load().await;
        self.whitelist.load().await;
        self.telemetry.load().await;

        match self.storage.get(ACTIVITY_STATE_KEY).await {
            Ok(Some(value)) => match ActivityEstimator::restore(value) {
                Ok(estimator) => *self.activity.lock().await = estimator,
                Err(err) => {
                    tracing::warn!("dropping corrupted activity state: {err}");
                    let _ = self.storage.remove(ACTIVITY_STATE_KEY).await;
                }
            },
            Ok(None) => {}
            Err(err) => tracing::warn!("failed to read activity state: {err:#}"),
        }
    }

    /// Intake queue for the browser adapter.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Dispatch one observed event into the pipelines.
    pub async fn handle_event(&self, event: ObservedEvent) {
        match event {
            ObservedEvent::PageObserved { mut page } => {
                self.alive.ping().await;
                let now = self.clock.now_ms();
                {
                    let mut activity = self.activity.lock().await;
                    activity.page_load(&page.url, now);
                    page.activity = activity.estimate(&page.url, now);
                }
                page.truncate_redirect_chain();
                if let Err(err) = page.validate() {
                    tracing::debug!(url = %page.url, "dropping page observation: {err}");
                    return;
                }
                let args = match serde_json::to_value(&page) {
                    Ok(args) => args,
                    Err(err) => {
                        tracing::warn!("failed to serialize page observation: {err}");
                        return;
                    }
                };
                if let Err(err) = self.scheduler.register_job(DOUBLEFETCH_JOB, args).await {
                    tracing::debug!(url = %page.url, "doublefetch not scheduled: {err}");
                }
            }
            ObservedEvent::RequestObserved {
                url,
                tab_url,
                is_private,
                ..
            } => {
                self.alive.ping().await;
                self.telemetry
                    .observe_request(&url, &tab_url, is_private)
                    .await;
            }
            ObservedEvent::Click { url, .. } => {
                let now = self.clock.now_ms();
                self.activity.lock().await.update_active_url(Some(&url), now);
            }
            ObservedEvent::Navigation { url, .. } => {
                let now = self.clock.now_ms();
                self.activity.lock().await.page_load(&url, now);
            }
        }
    }

    /// Hand finished telemetry messages to the send-message job.
    async fn dispatch_messages(&self, messages: Vec<OutboundMessage>) {
        for message in messages {
            let args = match serde_json::to_value(&message) {
                Ok(args) => args,
                Err(err) => {
                    tracing::warn!("failed to serialize outbound message: {err}");
                    continue;
                }
            };
            if let Err(err) = self.scheduler.register_job(SEND_MESSAGE_JOB, args).await {
                tracing::warn!(action = %message.action, "message not scheduled: {err}");
            }
        }
    }

    /// One scheduler pass. Exposed for embedders that drive time
    /// themselves; `spawn` calls it periodically.
    pub async fn process_jobs(&self) -> usize {
        self.scheduler.process_pending_jobs().await
    }

    /// One telemetry batch tick (the 10 s buffer drain).
    pub async fn process_telemetry_buffer(&self) -> usize {
        self.telemetry.process_buffer().await
    }

    /// One token/key send tick.
    pub async fn run_send_cycles(&self) {
        match self.telemetry.send_tokens().await {
            Ok(messages) => self.dispatch_messages(messages).await,
            Err(err) => tracing::warn!("token send cycle failed: {err}"),
        }
        match self.telemetry.send_keys().await {
            Ok(messages) => self.dispatch_messages(messages).await,
            Err(err) => tracing::warn!("key send cycle failed: {err}"),
        }
    }

    /// One maintenance tick: clean cycles, state flushes, country and
    /// whitelist refreshes. Failures are logged, never fatal.
    pub async fn run_maintenance(&self) {
        if let Err(err) = self.telemetry.clean().await {
            tracing::warn!("telemetry clean cycle failed: {err}");
        }

        self.hashes.expire().await;
        if let Err(err) = self.hashes.flush().await {
            tracing::warn!("dedup hash flush failed: {err}");
        }
        if let Err(err) = self.approver.flush().await {
            tracing::warn!("approver flush failed: {err}");
        }
        if let Err(err) = self.quorum.flush().await {
            tracing::warn!("quorum vote flush failed: {err}");
        }
        if let Err(err) = self.scheduler.flush().await {
            tracing::warn!("job queue flush failed: {err}");
        }

        {
            let mut activity = self.activity.lock().await;
            if activity.take_dirty() {
                let snapshot = activity.serialize();
                drop(activity);
                if let Err(err) = self.storage.set(ACTIVITY_STATE_KEY, snapshot).await {
                    tracing::warn!("activity state flush failed: {err:#}");
                }
            }
        }

        if let Err(err) = self.country.update_if_due().await {
            tracing::debug!("country update skipped: {err}");
        }

        // At most one whitelist update attempt per day.
        let today = self.clock.day();
        let due = {
            let mut last = self.whitelist_updated_day.lock().await;
            if last.as_deref() == Some(today.as_str()) {
                false
            } else {
                *last = Some(today);
                true
            }
        };
        if due {
            if let Err(err) = self.whitelist.update().await {
                tracing::debug!("whitelist update failed: {err}");
            }
        }
    }

    /// Run the event loop and all periodic ticks until the intake side
    /// is dropped.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = self.events.connect();
            let mut buffer_tick = tokio::time::interval(self.options.token_buffer_interval);
            let mut token_tick = tokio::time::interval(self.options.token_batch_interval);
            let mut clean_tick = tokio::time::interval(self.options.clean_interval);
            let mut jobs_tick = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    maybe_event = events.recv() => match maybe_event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    },
                    _ = jobs_tick.tick() => {
                        self.process_jobs().await;
                    }
                    _ = buffer_tick.tick() => {
                        self.process_telemetry_buffer().await;
                    }
                    _ = token_tick.tick() => {
                        self.run_send_cycles().await;
                    }
                    _ = clean_tick.tick() => {
                        self.run_maintenance().await;
                    }
                }
            }
            tracing::info!("event intake closed, core loop exiting");
        })
    }

    /// Aggregated component health.
    pub fn self_checks(&self) -> SelfCheckReport {
        let mut report = SelfCheckReport::default();
        report.extend_from(self.quorum.as_ref());
        report.extend_from(self.country.as_ref());
        report.extend_from(self.telemetry.as_ref());
        if self.events.detected_errors() {
            report.checks.push(Check {
                name: "event-queue",
                status: CheckStatus::Warn,
                reason: Some("events were dropped at intake".into()),
            });
        } else {
            report.checks.push(Check::pass("event-queue"));
        }
        report
    }
}
