//! Dispatcher core: admission, queueing, per-job lifecycle, message routing.
//!
//! One `Dispatcher` owns the active-job table, the admission queue, the
//! seen-set, and the accept rate limiter. Each job that reaches `ready`
//! gets a dedicated worker task consuming its buyer turns from an
//! unbounded channel — the single consumer per job is what enforces the
//! one-in-flight-sandbox-request rule while keeping turns in arrival
//! order. No lock is held across container, marketplace, or chat I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use vap_runtime::attestation::{
    self, CreationAttestation, DeletionAttestation, ResourceLimits, CREATION_FILE, DELETION_FILE,
    TYPE_CREATED, TYPE_DESTROYED, TYPE_DESTROYED_TIMEOUT,
};
use vap_runtime::{
    AcceptRateLimiter, DispatcherConfig, DispatcherError, Identity, Job, JobLog, JobState,
    JobStatus, MarketplaceClient, RetireReason,
};

use crate::chat::{self, ChatEvent, ChatHandle};
use crate::container::{ContainerManager, HEALTH_TIMEOUT};
use crate::router;

const LIFETIME_ENFORCE_INTERVAL: Duration = Duration::from_secs(30);

struct BuyerTurn {
    sender: String,
    content: String,
}

struct ActiveJob {
    job: Job,
    identity: Arc<Identity>,
    state: JobState,
    port: Option<u16>,
    created_at: DateTime<Utc>,
    log: Arc<JobLog>,
    ghost_timer: Option<JoinHandle<()>>,
    turn_tx: Option<mpsc::UnboundedSender<BuyerTurn>>,
    worker: Option<JoinHandle<()>>,
}

enum Disposition {
    Handled,
    Reply { text: String, agent_id: String },
    OnDemand,
}

pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    identities: Vec<Arc<Identity>>,
    identity_names: Vec<String>,
    markets: HashMap<String, Arc<MarketplaceClient>>,
    containers: Arc<ContainerManager>,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    queue: Mutex<VecDeque<String>>,
    seen: Mutex<HashSet<String>>,
    /// Jobs rediscovered at startup whose rooms we rejoined; a buyer turn
    /// for one of these triggers an on-demand container start.
    known_jobs: Mutex<HashMap<String, (Job, String)>>,
    rate: AcceptRateLimiter,
    chat: Mutex<HashMap<String, ChatHandle>>,
    accepting: AtomicBool,
    events_tx: mpsc::Sender<ChatEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChatEvent>>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<DispatcherConfig>,
        identities: Vec<Arc<Identity>>,
        containers: Arc<ContainerManager>,
    ) -> Result<Arc<Self>, DispatcherError> {
        let mut markets = HashMap::new();
        for identity in &identities {
            markets.insert(
                identity.agent_id().to_string(),
                Arc::new(MarketplaceClient::new(&config.api_base, identity.clone())?),
            );
        }
        let identity_names =
            identities.iter().map(|i| i.identity_name().to_string()).collect();
        let rate = AcceptRateLimiter::new(config.max_accepts_per_min);
        let (events_tx, events_rx) = mpsc::channel(256);

        Ok(Arc::new(Self {
            config,
            identities,
            identity_names,
            markets,
            containers,
            jobs: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashSet::new()),
            known_jobs: Mutex::new(HashMap::new()),
            rate,
            chat: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }))
    }

    /// Parallel-job cap: bounded by both the identity pool and the port
    /// range.
    pub fn pool_size(&self) -> usize {
        self.identities.len().min(self.config.port_pool_size())
    }

    fn market_for(&self, agent_id: &str) -> Option<Arc<MarketplaceClient>> {
        self.markets.get(agent_id).cloned()
    }

    async fn chat_for(&self, agent_id: &str) -> Option<ChatHandle> {
        self.chat.lock().await.get(agent_id).cloned()
    }

    /// Reconcile, run the poll / lifetime / routing loops until `shutdown`
    /// resolves, then retire everything.
    pub async fn run_until(
        self: &Arc<Self>,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        self.reconcile().await;

        let poller = tokio::spawn(poll_loop(self.clone()));
        let enforcer = tokio::spawn(lifetime_loop(self.clone()));
        let router_task = match self.events_rx.lock().await.take() {
            Some(rx) => Some(tokio::spawn(event_loop(self.clone(), rx))),
            None => None,
        };

        shutdown.await;
        tracing::info!("shutdown signal received, stopping admission");
        self.accepting.store(false, Ordering::SeqCst);
        poller.abort();
        enforcer.abort();
        if let Some(task) = router_task {
            task.abort();
        }
        self.shutdown().await;
    }

    /// Startup reconciliation: authenticate each identity, rejoin rooms of
    /// jobs the marketplace still considers ours, and mark them seen.
    /// Previous containers are assumed gone; a buyer turn brings up a
    /// fresh sandbox on demand.
    pub(crate) async fn reconcile(self: &Arc<Self>) {
        for identity in &self.identities {
            let Some(market) = self.market_for(identity.agent_id()) else {
                continue;
            };
            if let Err(e) = market.login().await {
                tracing::error!(identity = identity.identity_name(), error = %e, "startup login failed");
            }

            let handle = chat::spawn_transport(market.clone(), self.events_tx.clone());
            self.chat.lock().await.insert(identity.agent_id().to_string(), handle.clone());

            for status in [JobStatus::Accepted, JobStatus::InProgress] {
                let jobs = match market.seller_jobs(status).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        tracing::warn!(identity = identity.identity_name(), error = %e, "active job query failed");
                        continue;
                    }
                };
                for job in jobs {
                    tracing::info!(job_id = %job.job_id, "rejoining room for active job");
                    self.seen.lock().await.insert(job.job_id.clone());
                    handle.join(&job.job_id);

                    let log = JobLog::new(&self.config.jobs_path, &job.job_id);
                    if log.exists() {
                        let _ = log.lifecycle(
                            "dispatcher restarted, previous container not recovered",
                            json!({}),
                        );
                    }
                    self.known_jobs
                        .lock()
                        .await
                        .insert(job.job_id.clone(), (job, identity.agent_id().to_string()));
                }
            }
        }
    }

    /// One poll pass over every identity's requested jobs.
    pub(crate) async fn poll_once(self: &Arc<Self>) {
        for identity in self.identities.clone() {
            let Some(market) = self.market_for(identity.agent_id()) else {
                continue;
            };
            let jobs = match market.seller_jobs(JobStatus::Requested).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(identity = identity.identity_name(), error = %e, "job poll failed");
                    continue;
                }
            };
            for job in jobs {
                if self.seen.lock().await.contains(&job.job_id) {
                    continue;
                }
                self.admit(job, identity.clone()).await;
            }
        }
    }

    /// Admission: capacity pre-check, rate limit, signed acceptance, room
    /// join, then container start or queue. Rate-limited jobs are left
    /// unseen so the next poll reconsiders them.
    pub(crate) async fn admit(self: &Arc<Self>, job: Job, identity: Arc<Identity>) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        let (active, queued) = self.load().await;
        let pool = self.pool_size();
        if active >= pool && queued >= self.config.max_queued_jobs {
            tracing::debug!(job_id = %job.job_id, "pool and queue full, leaving job unclaimed");
            return;
        }
        if !self.rate.try_acquire() {
            tracing::debug!(job_id = %job.job_id, "accept rate limit reached, deferring to next poll");
            return;
        }

        self.seen.lock().await.insert(job.job_id.clone());

        let Some(market) = self.market_for(identity.agent_id()) else {
            return;
        };
        if let Err(e) = market.accept_job(&job).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "acceptance failed");
            return;
        }

        if let Some(chat) = self.chat_for(identity.agent_id()).await {
            chat.join(&job.job_id);
        }

        let log = Arc::new(JobLog::new(&self.config.jobs_path, &job.job_id));
        if let Err(e) = log.ensure_job_dir(&job) {
            tracing::warn!(job_id = %job.job_id, error = %e, "failed writing job directory");
        }
        let _ = log.lifecycle(
            "job accepted",
            json!({"identity": identity.identity_name(), "jobHash": job.job_hash}),
        );

        let job_id = job.job_id.clone();
        let agent_id = identity.agent_id().to_string();
        // Entries taking the start path count as active immediately, so a
        // burst of admissions in one poll cannot oversubscribe the pool.
        let starting = active < pool;
        self.jobs.lock().await.insert(
            job_id.clone(),
            ActiveJob {
                job,
                identity,
                state: if starting { JobState::Starting } else { JobState::Queued },
                port: None,
                created_at: Utc::now(),
                log: log.clone(),
                ghost_timer: None,
                turn_tx: None,
                worker: None,
            },
        );

        if starting {
            let d = self.clone();
            let id = job_id.clone();
            tokio::spawn(async move { d.start_job(id).await });
        } else {
            let position = {
                let mut queue = self.queue.lock().await;
                queue.push_back(job_id.clone());
                queue.len()
            };
            let _ = log.lifecycle("job queued", json!({"position": position}));
            if let Some(chat) = self.chat_for(&agent_id).await {
                chat.send_message(&job_id, &router::queue_position_reply(position));
            }
        }
    }

    /// Bring a container up for an admitted job: start, health-probe,
    /// mark ready, attest, arm the ghost timer.
    pub(crate) fn start_job(
        self: Arc<Self>,
        job_id: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.start_job_inner(job_id))
    }

    async fn start_job_inner(self: Arc<Self>, job_id: String) {
        let (identity, log) = {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = jobs.get_mut(&job_id) else {
                return;
            };
            entry.state = JobState::Starting;
            (entry.identity.clone(), entry.log.clone())
        };

        let started = match self.containers.start(&job_id, &identity).await {
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "container start failed, dropping admission");
                let _ = log.lifecycle("container start failed", json!({"error": e.to_string()}));
                self.jobs.lock().await.remove(&job_id);
                self.drain_queue().await;
                return;
            }
            Ok(None) => {
                // Every port busy or cooling down: back to the queue head
                // if it has room, otherwise give the job up.
                let queued = {
                    let mut queue = self.queue.lock().await;
                    if queue.contains(&job_id) {
                        true
                    } else if queue.len() < self.config.max_queued_jobs {
                        queue.push_front(job_id.clone());
                        true
                    } else {
                        false
                    }
                };
                if queued {
                    if let Some(entry) = self.jobs.lock().await.get_mut(&job_id) {
                        entry.state = JobState::Queued;
                    }
                    // The blocker may be a cooling-down port with no
                    // retirement coming to re-drain the queue; try again
                    // once the cooldown has passed.
                    let d = self.clone();
                    let delay = self.config.port_cooldown + Duration::from_millis(50);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        d.drain_queue().await;
                    });
                } else {
                    tracing::warn!(job_id = %job_id, "no free ports and queue full, dropping job");
                    self.jobs.lock().await.remove(&job_id);
                }
                return;
            }
            Ok(Some(started)) => started,
        };

        {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&job_id) {
                Some(entry) => entry.port = Some(started.port),
                None => {
                    // Retired while we were starting; clean up immediately.
                    drop(jobs);
                    self.containers.destroy(started.port).await;
                    return;
                }
            }
        }
        let _ = log.lifecycle(
            "container starting",
            json!({"port": started.port, "containerId": started.container_id}),
        );

        if !self.containers.wait_for_health(started.port, HEALTH_TIMEOUT).await {
            tracing::error!(job_id = %job_id, port = started.port, "sandbox failed health probe");
            let _ = log.lifecycle("sandbox failed health probe", json!({"port": started.port}));
            if let Some(chat) = self.chat_for(identity.agent_id()).await {
                chat.send_message(&job_id, router::REPLY_ERROR);
            }
            self.retire(&job_id, RetireReason::HealthFailed).await;
            return;
        }

        {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = jobs.get_mut(&job_id) else {
                drop(jobs);
                self.containers.destroy(started.port).await;
                return;
            };
            entry.state = JobState::Ready;
            let (tx, rx) = mpsc::unbounded_channel();
            entry.turn_tx = Some(tx);
            entry.worker =
                Some(tokio::spawn(self.clone().job_worker(job_id.clone(), started.port, rx)));
        }
        let _ = log.lifecycle("container ready", json!({"port": started.port}));
        tracing::info!(job_id = %job_id, port = started.port, "job ready");

        self.write_creation_attestation(&job_id).await;
        self.arm_ghost_timer(&job_id).await;
    }

    /// Per-job worker: the single consumer of this job's buyer turns.
    async fn job_worker(
        self: Arc<Self>,
        job_id: String,
        port: u16,
        mut turns: mpsc::UnboundedReceiver<BuyerTurn>,
    ) {
        let (log, agent_id) = {
            let jobs = self.jobs.lock().await;
            match jobs.get(&job_id) {
                Some(entry) => (entry.log.clone(), entry.identity.agent_id().to_string()),
                None => return,
            }
        };

        while let Some(turn) = turns.recv().await {
            let nonce = router::message_nonce();
            let _ = log.append(
                "user",
                &turn.content,
                json!({"sender": turn.sender, "nonce": nonce}),
            );

            match self.containers.send_request(port, &turn.content).await {
                Ok(reply) => {
                    let reply = router::truncate_reply(&reply);
                    let _ = log.append(
                        "assistant",
                        &reply,
                        json!({"nonce": nonce, "port": port, "model": self.config.sandbox_model}),
                    );
                    if let Some(chat) = self.chat_for(&agent_id).await {
                        chat.send_message(&job_id, &reply);
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, port, error = %e, "sandbox request failed");
                    let _ = log.append(
                        "system",
                        "sandbox request failed",
                        json!({"event": "error", "nonce": nonce, "error": e.to_string()}),
                    );
                    if let Some(chat) = self.chat_for(&agent_id).await {
                        chat.send_message(&job_id, router::REPLY_ERROR);
                    }
                }
            }
        }
    }

    async fn arm_ghost_timer(self: &Arc<Self>, job_id: &str) {
        let handle = tokio::spawn({
            let d = self.clone();
            let job_id = job_id.to_string();
            async move {
                tokio::time::sleep(d.config.ghost_timeout).await;
                tracing::info!(job_id = %job_id, "no buyer message within ghost timeout, retiring");
                d.retire(&job_id, RetireReason::Ghost).await;
            }
        });

        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(job_id) {
            Some(entry) => {
                if let Some(old) = entry.ghost_timer.replace(handle) {
                    old.abort();
                }
            }
            None => handle.abort(),
        }
    }

    pub(crate) async fn handle_event(self: &Arc<Self>, event: ChatEvent) {
        match event {
            ChatEvent::Joined { job_id } => {
                tracing::debug!(job_id = %job_id, "joined chat room");
            }
            ChatEvent::Message { job_id, sender, content } => {
                self.handle_message(job_id, sender, content).await;
            }
        }
    }

    /// Route one buyer turn through the active-job state machine.
    pub(crate) async fn handle_message(
        self: &Arc<Self>,
        job_id: String,
        sender: String,
        content: String,
    ) {
        if router::is_self_message(&self.identity_names, &sender) {
            return;
        }

        let disposition = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&job_id) {
                Some(entry) => {
                    // Any buyer turn clears the ghost timer.
                    if let Some(timer) = entry.ghost_timer.take() {
                        timer.abort();
                    }
                    match entry.state {
                        JobState::Ready => match &entry.turn_tx {
                            Some(tx) => {
                                let _ = tx.send(BuyerTurn {
                                    sender: sender.clone(),
                                    content: content.clone(),
                                });
                                Disposition::Handled
                            }
                            None => Disposition::Handled,
                        },
                        JobState::Starting => Disposition::Reply {
                            text: router::REPLY_STARTING.to_string(),
                            agent_id: entry.identity.agent_id().to_string(),
                        },
                        JobState::Queued => Disposition::Reply {
                            text: router::REPLY_QUEUED.to_string(),
                            agent_id: entry.identity.agent_id().to_string(),
                        },
                        JobState::Retiring => Disposition::Handled,
                    }
                }
                None => Disposition::OnDemand,
            }
        };

        match disposition {
            Disposition::Handled => {}
            Disposition::Reply { text, agent_id } => {
                if let Some(chat) = self.chat_for(&agent_id).await {
                    chat.send_message(&job_id, &text);
                }
            }
            Disposition::OnDemand => self.on_demand_start(&job_id).await,
        }
    }

    /// A buyer turned up for a job we own but have no container for
    /// (typically after a restart): bring a fresh sandbox up, or queue.
    async fn on_demand_start(self: &Arc<Self>, job_id: &str) {
        let Some((job, agent_id)) = self.known_jobs.lock().await.get(job_id).cloned() else {
            tracing::debug!(job_id = %job_id, "message for unknown job, ignoring");
            return;
        };
        let Some(identity) =
            self.identities.iter().find(|i| i.agent_id() == agent_id).cloned()
        else {
            return;
        };

        let log = Arc::new(JobLog::new(&self.config.jobs_path, job_id));
        let _ = log.ensure_job_dir(&job);
        let _ = log.lifecycle("buyer returned, starting fresh sandbox", json!({}));

        let (active, _) = self.load().await;
        let starting = active < self.pool_size();
        self.jobs.lock().await.insert(
            job_id.to_string(),
            ActiveJob {
                job,
                identity: identity.clone(),
                state: if starting { JobState::Starting } else { JobState::Queued },
                port: None,
                created_at: Utc::now(),
                log,
                ghost_timer: None,
                turn_tx: None,
                worker: None,
            },
        );

        if starting {
            if let Some(chat) = self.chat_for(identity.agent_id()).await {
                chat.send_message(job_id, router::REPLY_STARTING);
            }
            let d = self.clone();
            let id = job_id.to_string();
            tokio::spawn(async move { d.start_job(id).await });
        } else {
            let queued = {
                let mut queue = self.queue.lock().await;
                if queue.len() < self.config.max_queued_jobs {
                    queue.push_back(job_id.to_string());
                    true
                } else {
                    false
                }
            };
            if !queued {
                self.jobs.lock().await.remove(job_id);
            }
            if let Some(chat) = self.chat_for(identity.agent_id()).await {
                chat.send_message(job_id, router::REPLY_QUEUED);
            }
        }
    }

    /// Retire a job: final buyer message where the reason calls for one,
    /// transcript digest, deletion attestation, best-effort delivery,
    /// container destruction, queue drain.
    pub(crate) async fn retire(self: &Arc<Self>, job_id: &str, reason: RetireReason) {
        let (identity, port, log, admitted_at) = {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = jobs.get_mut(job_id) else {
                return;
            };
            if entry.state == JobState::Retiring {
                return;
            }
            entry.state = JobState::Retiring;
            if let Some(timer) = entry.ghost_timer.take() {
                timer.abort();
            }
            // Closing the turn channel lets the worker drain and stop.
            entry.turn_tx = None;
            (entry.identity.clone(), entry.port, entry.log.clone(), entry.created_at)
        };
        // A still-queued job must also leave the queue, or a stale id
        // consumes the next drain.
        self.queue.lock().await.retain(|id| id != job_id);

        tracing::info!(job_id = %job_id, reason = reason.as_str(), "retiring job");
        if reason == RetireReason::Timeout {
            if let Some(chat) = self.chat_for(identity.agent_id()).await {
                chat.send_message(job_id, router::REPLY_TIMEOUT);
            }
        }

        let _ = log.lifecycle(
            "retiring",
            json!({
                "reason": reason.as_str(),
                "admittedAt": admitted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        );
        let transcript_digest = log.digest();

        if let Some(port) = port {
            self.write_deletion_attestation(job_id, port, reason, &transcript_digest).await;

            if matches!(reason, RetireReason::Completed | RetireReason::Timeout) {
                if let Some(market) = self.market_for(identity.agent_id()) {
                    if let Err(e) = market.deliver(job_id, &transcript_digest).await {
                        tracing::warn!(job_id = %job_id, error = %e, "delivery submission failed");
                    }
                }
            }

            self.containers.destroy(port).await;
        }

        if let Some(entry) = self.jobs.lock().await.remove(job_id) {
            if let Some(worker) = entry.worker {
                worker.abort();
            }
        }

        self.drain_queue().await;
    }

    /// Promote the queue head into a container start.
    async fn drain_queue(self: &Arc<Self>) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        let Some(job_id) = self.queue.lock().await.pop_front() else {
            return;
        };
        tracing::info!(job_id = %job_id, "promoting queued job");
        if let Some(entry) = self.jobs.lock().await.get(&job_id) {
            let _ = entry.log.lifecycle("promoted from queue", json!({}));
        }
        let d = self.clone();
        tokio::spawn(async move { d.start_job(job_id).await });
    }

    /// Retire every container past its maximum lifetime.
    pub(crate) async fn enforce_lifetimes(self: &Arc<Self>) {
        let mut expired = Vec::new();
        self.containers.enforce_lifetimes(|job_id, port| expired.push((job_id.to_string(), port)));
        for (job_id, port) in expired {
            tracing::info!(job_id = %job_id, port, "container exceeded maximum lifetime");
            self.retire(&job_id, RetireReason::Timeout).await;
        }
    }

    async fn shutdown(self: &Arc<Self>) {
        let job_ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        tracing::info!(jobs = job_ids.len(), "retiring all jobs for shutdown");
        for job_id in job_ids {
            self.retire(&job_id, RetireReason::Shutdown).await;
        }
    }

    async fn write_creation_attestation(self: &Arc<Self>, job_id: &str) {
        let snapshot = {
            let jobs = self.jobs.lock().await;
            jobs.get(job_id)
                .map(|e| (e.job.clone(), e.identity.clone(), e.log.clone(), e.port))
        };
        let Some((job, identity, log, Some(port))) = snapshot else {
            return;
        };
        let Some(info) = self.containers.info_for(port) else {
            return;
        };

        let job_hash = match attestation::local_job_hash(
            &job.job_id,
            &job.description,
            &job.buyer_verus_id,
            &job.amount,
            &job.currency,
            info.created_at.timestamp(),
        ) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "job hash computation failed");
                return;
            }
        };

        let record = CreationAttestation {
            kind: TYPE_CREATED.into(),
            job_id: job.job_id.clone(),
            container_id: info.container_id,
            agent_id: identity.agent_id().into(),
            identity: identity.identity_name().into(),
            created_at: info.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            job_hash,
            limits: ResourceLimits {
                memory: self.config.container_memory.clone(),
                cpus: self.config.container_cpus.clone(),
            },
            privacy_tier: self.config.privacy_tier.clone(),
            signature: None,
        };

        match serde_json::to_value(&record) {
            Ok(document) => {
                self.sign_and_submit(&identity, document, log.dir(), CREATION_FILE, job_id).await;
            }
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "attestation serialisation failed"),
        }
    }

    async fn write_deletion_attestation(
        self: &Arc<Self>,
        job_id: &str,
        port: u16,
        reason: RetireReason,
        transcript_sha256: &str,
    ) {
        let snapshot = {
            let jobs = self.jobs.lock().await;
            jobs.get(job_id).map(|e| (e.identity.clone(), e.log.clone()))
        };
        let Some((identity, log)) = snapshot else {
            return;
        };
        let Some(info) = self.containers.info_for(port) else {
            return;
        };

        let kind =
            if reason == RetireReason::Timeout { TYPE_DESTROYED_TIMEOUT } else { TYPE_DESTROYED };
        let record = DeletionAttestation {
            kind: kind.into(),
            job_id: job_id.into(),
            container_id: info.container_id,
            created_at: info.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            destroyed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data_volumes: self.containers.data_volumes(),
            deletion_method: "docker-rm".into(),
            transcript_sha256: transcript_sha256.into(),
            reason: match reason {
                RetireReason::Completed => None,
                other => Some(other.as_str().into()),
            },
            signature: None,
        };

        match serde_json::to_value(&record) {
            Ok(document) => {
                self.sign_and_submit(&identity, document, log.dir(), DELETION_FILE, job_id).await;
            }
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "attestation serialisation failed"),
        }
    }

    /// Sign, persist, and best-effort submit an attestation. Submission
    /// failure never blocks the lifecycle.
    async fn sign_and_submit(
        self: &Arc<Self>,
        identity: &Identity,
        mut document: serde_json::Value,
        dir: &std::path::Path,
        file_name: &str,
        job_id: &str,
    ) {
        if let Err(e) = attestation::sign_document(identity, &mut document) {
            tracing::error!(job_id = %job_id, error = %e, "attestation signing failed");
            return;
        }
        if let Err(e) = attestation::write_attestation(dir, file_name, &document) {
            tracing::error!(job_id = %job_id, error = %e, "attestation persist failed");
        }
        if let Some(market) = self.market_for(identity.agent_id()) {
            if let Err(e) = market.submit_attestation(job_id, &document).await {
                tracing::warn!(job_id = %job_id, error = %e, "attestation submission failed");
            }
        }
    }

    async fn load(&self) -> (usize, usize) {
        let active = {
            let jobs = self.jobs.lock().await;
            jobs.values()
                .filter(|e| matches!(e.state, JobState::Starting | JobState::Ready))
                .count()
        };
        let queued = self.queue.lock().await.len();
        (active, queued)
    }

    #[cfg(test)]
    async fn state_of(&self, job_id: &str) -> Option<JobState> {
        self.jobs.lock().await.get(job_id).map(|e| e.state)
    }

    #[cfg(test)]
    async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

async fn poll_loop(dispatcher: Arc<Dispatcher>) {
    let mut interval = tokio::time::interval(dispatcher.config.poll_interval);
    loop {
        interval.tick().await;
        dispatcher.poll_once().await;
    }
}

async fn lifetime_loop(dispatcher: Arc<Dispatcher>) {
    let mut interval = tokio::time::interval(LIFETIME_ENFORCE_INTERVAL);
    loop {
        interval.tick().await;
        dispatcher.enforce_lifetimes().await;
    }
}

async fn event_loop(dispatcher: Arc<Dispatcher>, mut events: mpsc::Receiver<ChatEvent>) {
    while let Some(event) = events.recv().await {
        dispatcher.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vap_proxy_api::TokenRegistry;
    use vap_runtime::attestation::verify_document;
    use vap_runtime::IdentityRecord;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY_A: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_B: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn identity(agent_id: &str, name: &str, key: &str) -> Arc<Identity> {
        Arc::new(
            Identity::from_record(IdentityRecord {
                agent_id: agent_id.into(),
                identity_name: name.into(),
                address: String::new(),
                i_address: format!("i{agent_id}"),
                wif: key.into(),
                network: "testnet".into(),
            })
            .unwrap(),
        )
    }

    fn job(job_id: &str) -> Job {
        Job {
            job_id: job_id.into(),
            job_hash: format!("hash-{job_id}"),
            buyer_verus_id: "buyer@".into(),
            amount: "2".parse().unwrap(),
            currency: "VRSC".into(),
            description: "answer questions".into(),
            status: JobStatus::Requested,
        }
    }

    async fn mount_marketplace(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1/jobs/[^/]+/accept$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"data": {}})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1/jobs/[^/]+/attestations$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {}})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1/jobs/[^/]+/deliver$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {}})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/chat/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"token": "chat-token"}
            })))
            .mount(server)
            .await;
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        _market: MockServer,
        _jobs_dir: tempfile::TempDir,
        jobs_path: std::path::PathBuf,
        identities: Vec<Arc<Identity>>,
    }

    async fn harness(extra: &[(&str, String)]) -> Harness {
        let market = MockServer::start().await;
        mount_marketplace(&market).await;

        let jobs_dir = tempfile::tempdir().unwrap();
        let jobs_path = jobs_dir.path().to_path_buf();

        let mut vars: HashMap<String, String> = HashMap::from([
            ("VAP_API".to_string(), market.uri()),
            ("LLM_API_KEY".to_string(), "k".to_string()),
            ("VAP_KEYS_FILE".to_string(), "/tmp/keys.json".to_string()),
            ("PORT_RANGE_START".to_string(), "8100".to_string()),
            ("PORT_RANGE_END".to_string(), "8101".to_string()),
            ("PORT_COOLDOWN".to_string(), "50".to_string()),
            ("MAX_QUEUED_JOBS".to_string(), "2".to_string()),
            ("MAX_ACCEPTS_PER_MIN".to_string(), "60".to_string()),
            ("JOBS_PATH".to_string(), jobs_path.to_string_lossy().into_owned()),
        ]);
        for (key, value) in extra {
            vars.insert(key.to_string(), value.clone());
        }

        let config = Arc::new(
            DispatcherConfig::from_vars(move |k| vars.get(k).cloned()).unwrap(),
        );
        let identities =
            vec![identity("agent-a", "alpha@", KEY_A), identity("agent-b", "beta@", KEY_B)];
        let registry = Arc::new(TokenRegistry::new());
        let containers =
            Arc::new(ContainerManager::with_mock_runtime(config.clone(), registry));
        let dispatcher = Dispatcher::new(config, identities.clone(), containers).unwrap();

        Harness { dispatcher, _market: market, _jobs_dir: jobs_dir, jobs_path, identities }
    }

    fn read_attestation(jobs_path: &std::path::Path, job_id: &str, file: &str) -> serde_json::Value {
        let raw = std::fs::read_to_string(jobs_path.join(job_id).join(file)).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    fn read_log(jobs_path: &std::path::Path, job_id: &str) -> Vec<serde_json::Value> {
        let raw = std::fs::read_to_string(
            jobs_path.join(job_id).join(vap_runtime::joblog::LOG_FILE),
        )
        .unwrap();
        raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_happy_path_fills_pool_then_queues_then_promotes() {
        let h = harness(&[]).await;
        let d = &h.dispatcher;

        for (i, job_id) in ["j1", "j2", "j3", "j4"].iter().enumerate() {
            let identity = h.identities[i % 2].clone();
            d.admit(job(job_id), identity).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(d.state_of("j1").await, Some(JobState::Ready));
        assert_eq!(d.state_of("j2").await, Some(JobState::Ready));
        assert_eq!(d.state_of("j3").await, Some(JobState::Queued));
        assert_eq!(d.state_of("j4").await, Some(JobState::Queued));
        assert_eq!(d.queue_len().await, 2);

        let (active, queued) = d.load().await;
        assert!(active + queued <= d.pool_size() + d.config.max_queued_jobs);

        // Completing j1 promotes j3 (after the released port's cooldown).
        d.retire("j1", RetireReason::Completed).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(d.state_of("j1").await, None);
        assert_eq!(d.state_of("j3").await, Some(JobState::Ready));
        assert_eq!(d.queue_len().await, 1);

        d.retire("j2", RetireReason::Completed).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(d.state_of("j4").await, Some(JobState::Ready));
        assert_eq!(d.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_admission_rejected_when_pool_and_queue_full() {
        let h = harness(&[
            ("PORT_RANGE_END", "8100".to_string()),
            ("MAX_QUEUED_JOBS", "1".to_string()),
        ])
        .await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        d.admit(job("j2"), h.identities[1].clone()).await;
        d.admit(job("j3"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(d.state_of("j1").await, Some(JobState::Ready));
        assert_eq!(d.state_of("j2").await, Some(JobState::Queued));
        // j3 was left unclaimed: no entry, and not marked seen, so a later
        // poll reconsiders it.
        assert_eq!(d.state_of("j3").await, None);
        assert!(!d.seen.lock().await.contains("j3"));
    }

    #[tokio::test]
    async fn test_accept_rate_limit_defers_jobs() {
        let h = harness(&[("MAX_ACCEPTS_PER_MIN", "1".to_string())]).await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        d.admit(job("j2"), h.identities[1].clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(d.state_of("j1").await, Some(JobState::Ready));
        assert_eq!(d.state_of("j2").await, None);
        // Deferred, not dropped: unseen so the next poll retries it.
        assert!(d.seen.lock().await.contains("j1"));
        assert!(!d.seen.lock().await.contains("j2"));
    }

    #[tokio::test]
    async fn test_ready_job_writes_verifiable_creation_attestation() {
        let h = harness(&[]).await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let doc = read_attestation(&h.jobs_path, "j1", CREATION_FILE);
        assert_eq!(doc["type"], TYPE_CREATED);
        assert_eq!(doc["jobId"], "j1");
        assert_eq!(doc["agentId"], "agent-a");
        assert_eq!(doc["limits"]["memory"], "2g");
        assert!(verify_document(h.identities[0].address(), &doc));
        // Tampering must break verification.
        let mut tampered = doc.clone();
        tampered["containerId"] = serde_json::Value::String("forged".into());
        assert!(!verify_document(h.identities[0].address(), &tampered));
    }

    #[tokio::test]
    async fn test_ghost_job_retired_with_deletion_attestation() {
        let h = harness(&[("GHOST_TIMEOUT", "0".to_string())]).await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(d.state_of("j1").await, None);
        let doc = read_attestation(&h.jobs_path, "j1", DELETION_FILE);
        assert_eq!(doc["type"], TYPE_DESTROYED);
        assert_eq!(doc["reason"], "ghost");
        assert!(verify_document(h.identities[0].address(), &doc));

        // The transcript digest in the attestation matches the log as it
        // stood at retirement.
        let log = JobLog::new(&h.jobs_path, "j1");
        assert_eq!(doc["transcriptSha256"], log.digest());
    }

    #[tokio::test]
    async fn test_lifetime_enforcement_produces_timeout_attestation() {
        let h = harness(&[("CONTAINER_MAX_LIFETIME", "0".to_string())]).await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(d.state_of("j1").await, Some(JobState::Ready));

        d.enforce_lifetimes().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(d.state_of("j1").await, None);
        let doc = read_attestation(&h.jobs_path, "j1", DELETION_FILE);
        assert_eq!(doc["type"], TYPE_DESTROYED_TIMEOUT);
        assert_eq!(doc["reason"], "timeout");
        assert!(verify_document(h.identities[0].address(), &doc));
    }

    #[tokio::test]
    async fn test_buyer_turn_round_trip_through_sandbox() {
        // The sandbox endpoint is a wiremock server whose port is the only
        // port in the pool, so the mock-runtime container "listens" there.
        let sandbox = MockServer::start().await;
        let sandbox_port = sandbox.address().port();
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "the answer is 4"}}]
            })))
            .mount(&sandbox)
            .await;

        let h = harness(&[
            ("PORT_RANGE_START", sandbox_port.to_string()),
            ("PORT_RANGE_END", sandbox_port.to_string()),
        ])
        .await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(d.state_of("j1").await, Some(JobState::Ready));

        d.handle_event(ChatEvent::Message {
            job_id: "j1".into(),
            sender: "buyer@".into(),
            content: "what is 2+2?".into(),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let entries = read_log(&h.jobs_path, "j1");
        let user = entries.iter().find(|e| e["role"] == "user").unwrap();
        let assistant = entries.iter().find(|e| e["role"] == "assistant").unwrap();
        assert_eq!(user["content"], "what is 2+2?");
        assert_eq!(user["sender"], "buyer@");
        assert_eq!(assistant["content"], "the answer is 4");
        // Nonce ties the pair together.
        assert_eq!(user["nonce"], assistant["nonce"]);
        assert_eq!(assistant["port"], sandbox_port);
    }

    #[tokio::test]
    async fn test_sandbox_error_logged_and_container_kept() {
        let sandbox = MockServer::start().await;
        let sandbox_port = sandbox.address().port();
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&sandbox)
            .await;

        let h = harness(&[
            ("PORT_RANGE_START", sandbox_port.to_string()),
            ("PORT_RANGE_END", sandbox_port.to_string()),
        ])
        .await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        d.handle_event(ChatEvent::Message {
            job_id: "j1".into(),
            sender: "buyer@".into(),
            content: "hello?".into(),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let entries = read_log(&h.jobs_path, "j1");
        let error = entries.iter().find(|e| e["event"] == "error").unwrap();
        assert!(error["nonce"].as_str().unwrap().len() == 16);
        // One failed request does not retire the container.
        assert_eq!(d.state_of("j1").await, Some(JobState::Ready));
    }

    #[tokio::test]
    async fn test_self_messages_dropped() {
        let h = harness(&[]).await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // "alpha@" is one of our identities; its echoes must not loop.
        d.handle_event(ChatEvent::Message {
            job_id: "j1".into(),
            sender: "alpha@".into(),
            content: "echo of our own reply".into(),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let entries = read_log(&h.jobs_path, "j1");
        assert!(entries.iter().all(|e| e["role"] != "user"));
    }

    #[tokio::test]
    async fn test_reconcile_rejoins_and_restarts_on_demand() {
        let h = harness(&[]).await;
        let d = &h.dispatcher;
        let market = &h._market;

        Mock::given(method("GET"))
            .and(path("/auth/challenge"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"challenge": "c", "challengeId": "ch"}
            })))
            .mount(market)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "verus_session=s; Path=/")
                    .set_body_json(serde_json::json!({"data": {}})),
            )
            .mount(market)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/me/jobs"))
            .and(query_param("status", "accepted"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"jobId": "j-old", "jobHash": "h", "buyerVerusId": "buyer@",
                           "amount": "1", "currency": "VRSC", "status": "accepted"}]
            })))
            .mount(market)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/me/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(market)
            .await;

        // A transcript from the previous dispatcher run.
        let old_log = JobLog::new(&h.jobs_path, "j-old");
        old_log.append("user", "earlier question", json!({"sender": "buyer@"})).unwrap();

        d.reconcile().await;
        assert!(d.seen.lock().await.contains("j-old"));
        assert!(d.known_jobs.lock().await.contains_key("j-old"));
        // No container was reattached.
        assert_eq!(d.state_of("j-old").await, None);

        // First buyer turn after restart brings up a fresh sandbox.
        d.handle_event(ChatEvent::Message {
            job_id: "j-old".into(),
            sender: "buyer@".into(),
            content: "are you back?".into(),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(d.state_of("j-old").await, Some(JobState::Ready));

        // The old transcript gained the restart gap entry and kept its
        // earlier turns.
        let entries = read_log(&h.jobs_path, "j-old");
        assert_eq!(entries[0]["content"], "earlier question");
        assert!(entries.iter().any(|e| {
            e["content"].as_str().is_some_and(|c| c.contains("dispatcher restarted"))
        }));
    }

    #[tokio::test]
    async fn test_shutdown_retires_everything() {
        let h = harness(&[]).await;
        let d = &h.dispatcher;

        d.admit(job("j1"), h.identities[0].clone()).await;
        d.admit(job("j2"), h.identities[1].clone()).await;
        d.admit(job("j3"), h.identities[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        d.accepting.store(false, Ordering::SeqCst);
        d.shutdown().await;

        assert_eq!(d.jobs.lock().await.len(), 0);
        assert_eq!(d.containers.active_count(), 0);
        // Containers that reached ready have deletion attestations.
        let doc = read_attestation(&h.jobs_path, "j1", DELETION_FILE);
        assert_eq!(doc["reason"], "shutdown");
    }
}
