//! Engine context and the serialized apply loop.
//!
//! [`SyncEngine::start`] takes a [`SyncContext`] holding every collaborator
//! and spawns:
//!
//! - the apply loop, sole owner of the reducer, outbox and gap detector
//! - a subscription reader that verifies inbound frames in parallel
//! - a connectivity watcher
//! - the retry timer
//! - a wallet account watcher that revokes the grant when the account changes
//!
//! Every source talks to the loop through one command channel, so messages
//! are folded one at a time. Publishes, history queries and identity lookups
//! run as separate tasks and report back through the same channel; none of
//! them blocks the loop.

use crate::config::SyncConfig;
use crate::crypto::KeyPair;
use crate::dag::{current_timestamp_millis, dependency_order, ContentHash};
use crate::error::{Result, SyncError};
use crate::forum::constants::MAX_CLOCK_SKEW_MS;
use crate::forum::message::{SignedMessage, VerifiedMessage};
use crate::forum::payload::Payload;
use crate::forum::permissions::PermissionEngine;
use crate::forum::state::{ApplyOutcome, ForumState};
use crate::forum::storage::ForumStorage;
use crate::forum::types::Address;
use crate::identity::{
    resolve, DelegationGrant, DelegationManager, IdentityDirectory, IdentityRecord,
    IdentityResolver, MessageVerifier, WalletAccount, WalletAdapter, WalletVerifiers,
};
use crate::outbox::{Dispatch, Outbox, OutboxReport, PublishOutcome};
use crate::storage::{KeyValueStore, KeyValueStoreExt, StoreName};
use crate::sync::recovery::{BufferDecision, GapDetector};
use crate::sync::status::SyncStatus;
use crate::transport::{HistoryFilter, PublishAck, Transport, TransportGateway};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Queue depth of the command channel.
const COMMAND_CAPACITY: usize = 1024;

/// Frames drained from the subscription per verification batch.
const MAX_INBOUND_BATCH: usize = 256;

/// Delay before resubscribing when a stream ends while connected.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);

/// Delegation store key of the anonymous signing key.
const ANONYMOUS_KEY: &[u8] = b"\0anonymous";

/// Collaborators of one engine instance.
pub struct SyncContext<T, W, R> {
    /// Engine configuration.
    pub config: SyncConfig,
    /// Local persistence.
    pub store: Arc<dyn KeyValueStore>,
    /// Pub/sub transport.
    pub transport: Arc<T>,
    /// Interactive wallet used to authorize delegated keys.
    pub wallet: Arc<W>,
    /// Name and ownership lookups.
    pub resolver: Arc<R>,
    /// Per-chain wallet signature verifiers.
    pub wallets: WalletVerifiers,
}

impl<T, W, R> SyncContext<T, W, R> {
    /// Bundles the collaborators.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<T>,
        wallet: Arc<W>,
        resolver: Arc<R>,
        wallets: WalletVerifiers,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            wallet,
            resolver,
            wallets,
        }
    }
}

enum Command {
    Inbound(Vec<VerifiedMessage>),
    History {
        requested: Option<ContentHash>,
        result: Result<Vec<VerifiedMessage>>,
    },
    Submit {
        message: SignedMessage,
        reply: oneshot::Sender<Result<ContentHash>>,
    },
    Published {
        id: ContentHash,
        sequence: u64,
        outcome: PublishOutcome,
    },
    Tick,
    Connection(bool),
    IdentityResolved(IdentityRecord),
    DiscardAbandoned(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<Result<()>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Live,
    History,
    Local,
}

/// Millisecond clock anchored at the wall clock and advanced by tokio time,
/// so paused test time drives the retry timer.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall_at_start: u64,
    started: tokio::time::Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall_at_start: current_timestamp_millis(),
            started: tokio::time::Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.wall_at_start
            .saturating_add(self.started.elapsed().as_millis() as u64)
    }
}

/// Cloneable access to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    delegation: Arc<DelegationManager>,
    anonymous: Arc<KeyPair>,
    last_anonymous_timestamp: Arc<Mutex<u64>>,
    permissions: PermissionEngine,
    state: watch::Receiver<Arc<ForumState>>,
    directory: watch::Receiver<Arc<IdentityDirectory>>,
    status: watch::Receiver<SyncStatus>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl EngineHandle {
    /// The address local actions are authored by right now.
    pub fn author(&self) -> Result<Address> {
        Ok(match self.delegation.active_grant()? {
            Some(grant) => grant.wallet_address().clone(),
            None => Address::anonymous(self.anonymous.public_key()),
        })
    }

    /// Checks permissions and signs `payload` without queueing it.
    ///
    /// Uses the active delegation grant if there is one and the anonymous
    /// key otherwise.
    pub fn sign(&self, payload: Payload) -> Result<SignedMessage> {
        let grant = self.delegation.active_grant()?;
        let author = match &grant {
            Some(grant) => grant.wallet_address().clone(),
            None => Address::anonymous(self.anonymous.public_key()),
        };
        {
            let state = self.state.borrow();
            let directory = self.directory.borrow();
            self.permissions
                .check_submit(&state, &directory, &author, &payload)?;
        }
        match grant {
            Some(_) => self.delegation.sign_with_delegation(payload),
            None => {
                let timestamp = {
                    let mut last = self
                        .last_anonymous_timestamp
                        .lock()
                        .map_err(|_| SyncError::crypto("Anonymous clock lock poisoned"))?;
                    let timestamp = current_timestamp_millis().max(last.saturating_add(1));
                    *last = timestamp;
                    timestamp
                };
                SignedMessage::create(payload, timestamp, &self.anonymous, None)
            }
        }
    }

    /// Signs `payload` and queues it for publishing.
    ///
    /// The message shows up in [`state`](Self::state) once the transport
    /// acknowledges it or it is observed inbound.
    ///
    /// # Errors
    /// - `PermissionDenied` if the author may not perform the action
    /// - `NoValidDelegation` if the grant expired while signing
    /// - `EngineStopped` if the engine has shut down
    pub async fn submit(&self, payload: Payload) -> Result<ContentHash> {
        let message = self.sign(payload)?;
        self.submit_signed(message).await
    }

    /// Queues an already signed message.
    pub async fn submit_signed(&self, message: SignedMessage) -> Result<ContentHash> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Submit { message, reply })
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Drops abandoned outbox entries. Returns how many were dropped.
    pub async fn discard_abandoned(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::DiscardAbandoned(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        response.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Observes reducer snapshots.
    pub fn state(&self) -> watch::Receiver<Arc<ForumState>> {
        self.state.clone()
    }

    /// The latest reducer snapshot.
    pub fn snapshot(&self) -> Arc<ForumState> {
        self.state.borrow().clone()
    }

    /// Observes identity directory snapshots.
    pub fn directory(&self) -> watch::Receiver<Arc<IdentityDirectory>> {
        self.directory.clone()
    }

    /// Observes sync counters.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// The delegation manager.
    pub fn delegation(&self) -> &Arc<DelegationManager> {
        &self.delegation
    }
}

/// A running engine.
pub struct SyncEngine<W> {
    handle: EngineHandle,
    wallet: Arc<W>,
    default_grant_duration: Duration,
    reports: Option<mpsc::UnboundedReceiver<OutboxReport>>,
    commands: mpsc::Sender<Command>,
    apply_loop: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl<W: WalletAdapter + 'static> SyncEngine<W> {
    /// Restores persisted state and starts every engine task.
    ///
    /// # Errors
    /// Fails on invalid configuration or unreadable storage.
    pub async fn start<T, R>(context: SyncContext<T, W, R>) -> Result<Self>
    where
        T: Transport,
        R: IdentityResolver + 'static,
    {
        let SyncContext {
            config,
            store,
            transport,
            wallet,
            resolver,
            wallets,
        } = context;
        config.validate()?;

        let verifier = Arc::new(MessageVerifier::new(wallets));
        let gateway = Arc::new(TransportGateway::new(
            transport,
            Arc::clone(&verifier),
            config.transport.clone(),
        ));
        let storage = ForumStorage::new(Arc::clone(&store));
        let state = storage.load_state()?;
        let outbox = Outbox::open(Arc::clone(&store), config.outbox.clone())?;

        let delegation = Arc::new(DelegationManager::new(
            Arc::clone(&store),
            config.delegation.clone(),
        ));
        if let Some(account) = wallet.active_account() {
            delegation.restore(&account)?;
        }
        let anonymous = Arc::new(load_anonymous_key(store.as_ref(), &config)?);

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(Arc::new(state.clone()));
        let (directory_tx, directory_rx) = watch::channel(Arc::new(IdentityDirectory::new()));
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let connection = gateway.connection();
        let connected = *connection.borrow();
        let clock = Clock::start();

        info!(
            applied = state.applied_count(),
            outbox = outbox.pending_count(),
            connected,
            "Starting sync engine"
        );

        let mut apply_loop = ApplyLoop {
            gaps: GapDetector::new(config.recovery.clone(), &config.transport.topic_prefix),
            config: config.clone(),
            clock,
            gateway: Arc::clone(&gateway),
            verifier,
            resolver,
            storage,
            state,
            directory: IdentityDirectory::new(),
            outbox,
            commands: commands.clone(),
            state_tx,
            directory_tx,
            status_tx,
            reports: report_tx,
            queries: HashMap::new(),
            connected,
            caught_up: false,
            disconnected_at: None,
            rejected_actions: 0,
            unsaved: 0,
            state_dirty: false,
            directory_dirty: false,
        };
        apply_loop.bootstrap();

        let tick = Duration::from_millis(config.outbox.tick_interval_ms);
        let workers = vec![
            tokio::spawn(read_inbound(Arc::clone(&gateway), commands.clone())),
            tokio::spawn(watch_connection(connection, commands.clone())),
            tokio::spawn(run_timer(tick, commands.clone())),
            tokio::spawn(watch_account(
                wallet.subscribe_account(),
                Arc::clone(&delegation),
            )),
        ];
        let apply_loop = tokio::spawn(apply_loop.run(command_rx));

        let handle = EngineHandle {
            commands: commands.clone(),
            delegation,
            anonymous,
            last_anonymous_timestamp: Arc::new(Mutex::new(0)),
            permissions: PermissionEngine::new(config.permissions.clone()),
            state: state_rx,
            directory: directory_rx,
            status: status_rx,
        };

        Ok(Self {
            handle,
            wallet,
            default_grant_duration: Duration::from_millis(config.delegation.default_duration_ms),
            reports: Some(report_rx),
            commands,
            apply_loop: Some(apply_loop),
            workers,
        })
    }

    /// Asks the wallet to authorize a fresh delegated key.
    ///
    /// Uses the configured default lifetime when `duration` is `None`.
    pub async fn authorize(&self, duration: Option<Duration>) -> Result<DelegationGrant> {
        let duration = duration.unwrap_or(self.default_grant_duration);
        self.handle
            .delegation
            .create_grant(self.wallet.as_ref(), duration)
            .await
    }
}

impl<W> SyncEngine<W> {
    /// A handle for submitting actions and observing state.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Takes the receiver of abandoned-entry reports. Only the first call
    /// returns it.
    pub fn take_reports(&mut self) -> Option<mpsc::UnboundedReceiver<OutboxReport>> {
        self.reports.take()
    }

    /// Stops every task, checkpoints the reducer and persists the outbox.
    pub async fn shutdown(mut self) -> Result<()> {
        for worker in self.workers.drain(..) {
            worker.abort();
        }
        let (reply, response) = oneshot::channel();
        let result = match self.commands.send(Command::Shutdown(reply)).await {
            Ok(()) => response.await.map_err(|_| SyncError::EngineStopped)?,
            Err(_) => Err(SyncError::EngineStopped),
        };
        if let Some(apply_loop) = self.apply_loop.take() {
            if let Err(e) = apply_loop.await {
                warn!("Apply loop ended abnormally: {}", e);
            }
        }
        result
    }
}

impl<W> Drop for SyncEngine<W> {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
        if let Some(apply_loop) = &self.apply_loop {
            apply_loop.abort();
        }
    }
}

fn load_anonymous_key(store: &dyn KeyValueStore, config: &SyncConfig) -> Result<KeyPair> {
    if let Some(keypair) = store.get::<KeyPair>(StoreName::Delegation, ANONYMOUS_KEY)? {
        return Ok(keypair);
    }
    let keypair = KeyPair::generate(config.delegation.key_scheme)?;
    store.put(StoreName::Delegation, ANONYMOUS_KEY, &keypair)?;
    debug!(
        address = Address::anonymous(keypair.public_key()).short(),
        "Generated anonymous signing key"
    );
    Ok(keypair)
}

// =============================================================================
// Workers
// =============================================================================

async fn read_inbound<T: Transport>(
    gateway: Arc<TransportGateway<T>>,
    commands: mpsc::Sender<Command>,
) {
    let mut connection = gateway.connection();
    loop {
        let mut inbound = gateway.subscribe();
        while let Some(frame) = inbound.recv().await {
            let mut frames = vec![frame];
            while frames.len() < MAX_INBOUND_BATCH {
                match inbound.try_recv() {
                    Ok(frame) => frames.push(frame),
                    Err(_) => break,
                }
            }
            let verified = gateway.accept_batch(frames).await;
            if verified.is_empty() {
                continue;
            }
            if commands.send(Command::Inbound(verified)).await.is_err() {
                return;
            }
        }

        debug!("Inbound stream ended");
        let connected = *connection.borrow_and_update();
        if connected {
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            continue;
        }
        loop {
            if connection.changed().await.is_err() {
                return;
            }
            let connected = *connection.borrow_and_update();
            if connected {
                break;
            }
        }
    }
}

async fn watch_connection(mut connection: watch::Receiver<bool>, commands: mpsc::Sender<Command>) {
    while connection.changed().await.is_ok() {
        let connected = *connection.borrow_and_update();
        if commands.send(Command::Connection(connected)).await.is_err() {
            return;
        }
    }
}

async fn run_timer(period: Duration, commands: mpsc::Sender<Command>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        if commands.send(Command::Tick).await.is_err() {
            return;
        }
    }
}

async fn watch_account(
    mut accounts: watch::Receiver<Option<WalletAccount>>,
    delegation: Arc<DelegationManager>,
) {
    while accounts.changed().await.is_ok() {
        let account = accounts.borrow_and_update().clone();
        let grant = match delegation.active_grant() {
            Ok(Some(grant)) => grant,
            Ok(None) => continue,
            Err(e) => {
                warn!("Failed to read delegation grant: {}", e);
                continue;
            }
        };
        let still_active = account.as_ref().is_some_and(|account| {
            &account.address == grant.wallet_address() && account.kind == grant.wallet_kind()
        });
        if !still_active {
            info!(
                wallet = grant.wallet_address().short(),
                "Wallet account changed, revoking delegation"
            );
            if let Err(e) = delegation.revoke() {
                warn!("Failed to revoke delegation grant: {}", e);
            }
        }
    }
}

// =============================================================================
// Apply loop
// =============================================================================

struct ApplyLoop<T, R> {
    config: SyncConfig,
    clock: Clock,
    gateway: Arc<TransportGateway<T>>,
    verifier: Arc<MessageVerifier>,
    resolver: Arc<R>,
    storage: ForumStorage,
    state: ForumState,
    directory: IdentityDirectory,
    gaps: GapDetector,
    outbox: Outbox,
    commands: mpsc::Sender<Command>,
    state_tx: watch::Sender<Arc<ForumState>>,
    directory_tx: watch::Sender<Arc<IdentityDirectory>>,
    status_tx: watch::Sender<SyncStatus>,
    reports: mpsc::UnboundedSender<OutboxReport>,
    queries: HashMap<ContentHash, AbortHandle>,
    connected: bool,
    caught_up: bool,
    disconnected_at: Option<u64>,
    rejected_actions: u64,
    unsaved: usize,
    state_dirty: bool,
    directory_dirty: bool,
}

impl<T, R> ApplyLoop<T, R>
where
    T: Transport,
    R: IdentityResolver + 'static,
{
    fn bootstrap(&mut self) {
        let authors: Vec<Address> = self.state.authors().into_iter().cloned().collect();
        for author in authors {
            self.observe_author(author);
        }
        let now = self.clock.now_ms();
        if self.connected {
            let since = now.saturating_sub(self.config.recovery.lookback_ms);
            self.catch_up(since, now);
            self.caught_up = true;
            self.flush_outbox(now);
        }
        self.publish_snapshots();
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            let now = self.clock.now_ms();
            match command {
                Command::Shutdown(reply) => {
                    let _ = reply.send(self.shutdown());
                    return;
                }
                command => self.handle(command, now),
            }
            self.publish_snapshots();
        }
    }

    fn handle(&mut self, command: Command, now: u64) {
        match command {
            Command::Inbound(messages) => self.fold(messages, Origin::Live, now),
            Command::History { requested, result } => self.on_history(requested, result, now),
            Command::Submit { message, reply } => {
                let id = *message.id();
                let result = self.outbox.enqueue(message, now).map(|_| id);
                let queued = result.is_ok();
                let _ = reply.send(result);
                if queued && self.connected {
                    self.flush_outbox(now);
                }
            }
            Command::Published {
                id,
                sequence,
                outcome,
            } => self.on_published(id, sequence, outcome, now),
            Command::Tick => self.on_tick(now),
            Command::Connection(connected) => self.on_connection(connected, now),
            Command::IdentityResolved(record) => {
                self.directory.record(record);
                self.directory_dirty = true;
            }
            Command::DiscardAbandoned(reply) => {
                let discarded = match self.outbox.take_abandoned() {
                    Ok(entries) => entries.len(),
                    Err(e) => {
                        warn!("Failed to discard abandoned entries: {}", e);
                        0
                    }
                };
                let _ = reply.send(discarded);
            }
            Command::Shutdown(_) => {}
        }
    }

    /// Folds messages one at a time. Dependents released by an applied
    /// message are replayed before the rest of the batch.
    fn fold(&mut self, messages: Vec<VerifiedMessage>, origin: Origin, now: u64) {
        let mut queue: VecDeque<VerifiedMessage> = messages.into();
        while let Some(message) = queue.pop_front() {
            let id = *message.id();
            if origin != Origin::Local {
                if let Err(e) = self.outbox.observe(&id) {
                    warn!(id = %id.short(), "Failed to confirm outbox entry: {}", e);
                }
            }
            if self.gaps.is_parked(&id) {
                continue;
            }

            match self.state.apply(&message) {
                ApplyOutcome::Duplicate => continue,
                ApplyOutcome::MissingDependency(missing) => {
                    self.park(message, missing, now);
                    continue;
                }
                ApplyOutcome::Rejected(reason) => {
                    self.rejected_actions += 1;
                    debug!(id = %id.short(), ?origin, "Rejected action: {}", reason);
                }
                ApplyOutcome::Applied | ApplyOutcome::Superseded => {}
            }

            self.state_dirty = true;
            self.unsaved += 1;
            self.observe_author(message.author().clone());

            self.abort_query(&id);
            let released = self.gaps.resolve(&id);
            for dependent in released.into_iter().rev() {
                queue.push_front(dependent);
            }
        }

        if self.unsaved >= self.config.storage.checkpoint_every {
            if let Err(e) = self.checkpoint() {
                warn!("Checkpoint failed: {}", e);
            }
        }
    }

    fn park(&mut self, message: VerifiedMessage, missing: ContentHash, now: u64) {
        if let BufferDecision::Query(filter) = self.gaps.park(message, missing, now) {
            self.spawn_query(Some(missing), filter);
        }
    }

    fn on_history(
        &mut self,
        requested: Option<ContentHash>,
        result: Result<Vec<VerifiedMessage>>,
        now: u64,
    ) {
        if let Some(id) = requested {
            self.queries.remove(&id);
            self.gaps.query_finished(&id);
            if !self.gaps.is_missing(&id) {
                debug!(id = %id.short(), "Entity resolved before history arrived");
                return;
            }
        }
        match result {
            Ok(messages) => {
                debug!(messages = messages.len(), "History batch received");
                self.fold(messages, Origin::History, now);
            }
            Err(e) => warn!("History query failed: {}", e),
        }
    }

    fn on_published(&mut self, id: ContentHash, sequence: u64, outcome: PublishOutcome, now: u64) {
        let mirror = match outcome {
            PublishOutcome::Acked => self.outbox.get(&id).map(|entry| entry.message.clone()),
            _ => None,
        };
        match self.outbox.record_outcome(&id, sequence, outcome, now) {
            Ok(Some(report)) => {
                if self.reports.send(report).is_err() {
                    debug!(id = %id.short(), "No listener for abandoned entry report");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(id = %id.short(), "Failed to record publish outcome: {}", e),
        }
        if let Some(message) = mirror {
            match self.verifier.verify(message) {
                Ok(verified) => self.fold(vec![verified], Origin::Local, now),
                Err(e) => warn!(id = %id.short(), "Local message failed verification: {}", e),
            }
        }
    }

    fn on_tick(&mut self, now: u64) {
        for id in self.gaps.expire(now) {
            self.abort_query(&id);
        }
        match self.verifier.prune_expired(now) {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned expired delegation nonces"),
            Err(e) => warn!("Failed to prune delegation nonces: {}", e),
        }
        if self.connected {
            self.flush_outbox(now);
            for (id, filter) in self.gaps.due_queries(now) {
                self.spawn_query(Some(id), filter);
            }
        }
    }

    fn on_connection(&mut self, connected: bool, now: u64) {
        if connected == self.connected {
            return;
        }
        self.connected = connected;
        if !connected {
            self.disconnected_at = Some(now);
            match self.outbox.connection_lost(now) {
                Ok(reverted) => info!(reverted, "Transport disconnected"),
                Err(e) => warn!("Failed to revert in-flight outbox entries: {}", e),
            }
            return;
        }

        info!("Transport connected");
        self.gaps.reset_session();
        // Until one full catch-up has run, the lookback window is owed.
        let since = match self.disconnected_at.take() {
            Some(at) if self.caught_up => at.saturating_sub(MAX_CLOCK_SKEW_MS),
            _ => now.saturating_sub(self.config.recovery.lookback_ms),
        };
        self.catch_up(since, now);
        self.caught_up = true;
        self.flush_outbox(now);
        for (id, filter) in self.gaps.due_queries(now) {
            self.spawn_query(Some(id), filter);
        }
    }

    fn catch_up(&mut self, since: u64, now: u64) {
        let filter = HistoryFilter {
            topics: self.gateway.topics(),
            start_ms: since,
            end_ms: now.saturating_add(MAX_CLOCK_SKEW_MS),
        };
        self.spawn_query(None, filter);
    }

    fn flush_outbox(&mut self, now: u64) {
        let due = match self.outbox.take_due(now) {
            Ok(due) => due,
            Err(e) => {
                warn!("Failed to read outbox: {}", e);
                return;
            }
        };
        for dispatch in due {
            self.spawn_publish(dispatch);
        }
    }

    fn spawn_publish(&self, dispatch: Dispatch) {
        let gateway = Arc::clone(&self.gateway);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let Dispatch { message, sequence } = dispatch;
            let id = *message.id();
            let result = gateway.publish(&message).await;
            let connected = gateway.is_connected();
            let outcome = match result {
                Ok(PublishAck::Ack) => PublishOutcome::Acked,
                Ok(PublishAck::NoAck) => PublishOutcome::Unacknowledged,
                Err(SyncError::PublishTimeout(_)) => PublishOutcome::TimedOut,
                Err(_) if !connected => PublishOutcome::Interrupted,
                Err(e) => PublishOutcome::Failed(e.to_string()),
            };
            let _ = commands
                .send(Command::Published {
                    id,
                    sequence,
                    outcome,
                })
                .await;
        });
    }

    fn spawn_query(&mut self, requested: Option<ContentHash>, filter: HistoryFilter) {
        if !self.connected {
            if let Some(id) = &requested {
                self.gaps.query_finished(id);
            }
            return;
        }
        debug!(
            requested = ?requested.map(|id| id.short()),
            start_ms = filter.start_ms,
            end_ms = filter.end_ms,
            "Querying history"
        );
        let gateway = Arc::clone(&self.gateway);
        let commands = self.commands.clone();
        let timeout_ms = self.config.recovery.query_timeout_ms;
        let task = tokio::spawn(async move {
            let fetched =
                tokio::time::timeout(Duration::from_millis(timeout_ms), gateway.query_history(filter))
                    .await;
            let result = match fetched {
                Ok(Ok(frames)) => Ok(dependency_order(gateway.accept_batch(frames).await)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SyncError::transport(format!(
                    "History query timed out after {} ms",
                    timeout_ms
                ))),
            };
            let _ = commands.send(Command::History { requested, result }).await;
        });
        if let Some(id) = requested {
            if let Some(previous) = self.queries.insert(id, task.abort_handle()) {
                previous.abort();
            }
        }
    }

    fn abort_query(&mut self, id: &ContentHash) {
        if let Some(query) = self.queries.remove(id) {
            debug!(id = %id.short(), "Cancelling history query");
            query.abort();
        }
    }

    fn observe_author(&mut self, author: Address) {
        let known = self.directory.len();
        if self.directory.observe(&author) {
            let resolver = Arc::clone(&self.resolver);
            let commands = self.commands.clone();
            tokio::spawn(async move {
                match resolve(resolver.as_ref(), author.clone()).await {
                    Ok(record) => {
                        let _ = commands.send(Command::IdentityResolved(record)).await;
                    }
                    Err(e) => debug!(address = author.short(), "Identity lookup failed: {}", e),
                }
            });
        }
        if self.directory.len() != known {
            self.directory_dirty = true;
        }
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            dropped_frames: self.gateway.dropped_frames(),
            rejected_actions: self.rejected_actions,
            outbox_pending: self.outbox.pending_count(),
            outbox_abandoned: self.outbox.abandoned_count(),
            network_connected: self.connected,
            ..SyncStatus::default()
        }
        .with_recovery(self.gaps.stats())
    }

    fn publish_snapshots(&mut self) {
        if self.state_dirty {
            self.state_tx.send_replace(Arc::new(self.state.clone()));
            self.state_dirty = false;
        }
        if self.directory_dirty {
            self.directory_tx
                .send_replace(Arc::new(self.directory.clone()));
            self.directory_dirty = false;
        }
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.storage.checkpoint(&self.state)?;
        debug!(applied = self.state.applied_count(), "Checkpointed reducer state");
        self.unsaved = 0;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        for (_, query) in self.queries.drain() {
            query.abort();
        }
        self.checkpoint()?;
        self.outbox.flush()?;
        self.publish_snapshots();
        info!(
            applied = self.state.applied_count(),
            outbox = self.outbox.pending_count(),
            "Sync engine stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forum::payload::{CellCreate, PostCreate, VoteCast};
    use crate::forum::types::TargetKind;
    use crate::identity::{LocalKeyVerifier, LocalKeyWallet, NoopResolver, WalletKind};
    use crate::storage::MemoryStore;
    use crate::transport::{topic_for, Frame, MemoryRelay, MemoryTransport};

    const WAIT: Duration = Duration::from_secs(5);

    async fn start_engine(
        transport: Arc<MemoryTransport>,
        config: SyncConfig,
    ) -> SyncEngine<LocalKeyWallet> {
        let wallet = Arc::new(LocalKeyWallet::generate(WalletKind::Ethereum).unwrap());
        let context = SyncContext::new(
            config,
            Arc::new(MemoryStore::new()),
            transport,
            wallet,
            Arc::new(NoopResolver),
            LocalKeyVerifier::registry(),
        );
        SyncEngine::start(context).await.expect("Failed to start engine")
    }

    async fn wait_for_queries(transport: &MemoryTransport, count: usize) -> Vec<HistoryFilter> {
        tokio::time::timeout(WAIT, async {
            loop {
                let queries = transport.history_queries();
                if queries.len() >= count {
                    return queries;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Timed out waiting for history queries")
    }

    async fn wait_state<F: Fn(&ForumState) -> bool>(handle: &EngineHandle, predicate: F) {
        let mut state = handle.state();
        tokio::time::timeout(WAIT, state.wait_for(|snapshot| predicate(snapshot)))
            .await
            .expect("Timed out waiting for state")
            .expect("Engine stopped");
    }

    async fn wait_status<F: Fn(&SyncStatus) -> bool>(handle: &EngineHandle, predicate: F) {
        let mut status = handle.status();
        tokio::time::timeout(WAIT, status.wait_for(|status| predicate(status)))
            .await
            .expect("Timed out waiting for status")
            .expect("Engine stopped");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offline_start_catches_up_full_lookback() {
        let relay = MemoryRelay::new();
        let transport = Arc::new(relay.connect());
        transport.set_connected(false);
        let config = SyncConfig::for_tests();
        let lookback = config.recovery.lookback_ms;
        let engine = start_engine(Arc::clone(&transport), config).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.history_queries().is_empty());

        transport.set_connected(true);
        let queries = wait_for_queries(&transport, 1).await;
        let window = current_timestamp_millis().saturating_sub(queries[0].start_ms);
        assert!(
            window >= lookback - 1_000,
            "first catch-up only looked back {} ms",
            window
        );

        // Later reconnects only cover the time spent offline.
        transport.set_connected(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.set_connected(true);
        let queries = wait_for_queries(&transport, 2).await;
        let window = current_timestamp_millis().saturating_sub(queries[1].start_ms);
        assert!(window < MAX_CLOCK_SKEW_MS + 5_000);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_live_parent_beats_slow_recovery() {
        let relay = MemoryRelay::new();
        let transport = Arc::new(relay.connect());
        let mut config = SyncConfig::for_tests();
        config.recovery.query_timeout_ms = 2_000;
        let prefix = config.transport.topic_prefix.clone();
        let engine = start_engine(Arc::clone(&transport), config).await;
        let handle = engine.handle();
        wait_for_queries(&transport, 1).await;
        transport.set_history_delay(Some(Duration::from_millis(300)));

        let author = KeyPair::generate_ed25519().unwrap();
        let now = current_timestamp_millis();
        let sign = |payload: Payload, offset: u64| {
            SignedMessage::create(payload, now + offset, &author, None).unwrap()
        };
        let cell = sign(CellCreate::new("race".into(), "".into(), None).unwrap().into(), 0);
        let post = sign(
            PostCreate::new(*cell.id(), "t".into(), "b".into()).unwrap().into(),
            1,
        );
        let vote = sign(VoteCast::new(*post.id(), TargetKind::Post, true).into(), 2);
        let late_cell = sign(CellCreate::new("late".into(), "".into(), None).unwrap().into(), 3);
        let inject = |message: &SignedMessage| {
            relay
                .inject(Frame {
                    topic: topic_for(&prefix, message.kind()),
                    payload: message.to_frame().unwrap(),
                })
                .unwrap()
        };

        inject(&cell);
        wait_state(&handle, |state| state.cell(cell.id()).is_some()).await;
        inject(&vote);
        wait_status(&handle, |status| status.parked_dependents == 1).await;
        wait_for_queries(&transport, 2).await;

        // The parent arrives live while its recovery query is still waiting.
        inject(&post);
        wait_state(&handle, |state| state.tally(post.id()).upvotes() == 1).await;

        // A history answer for the resolved id is discarded whole.
        let verifier = MessageVerifier::new(LocalKeyVerifier::registry());
        let stale = vec![
            verifier.verify(post.clone()).unwrap(),
            verifier.verify(late_cell.clone()).unwrap(),
        ];
        engine
            .commands
            .send(Command::History {
                requested: Some(*post.id()),
                result: Ok(stale),
            })
            .await
            .unwrap();
        handle.discard_abandoned().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let state = handle.snapshot();
        assert_eq!(state.applied_count(), 3);
        assert!(state.cell(late_cell.id()).is_none());
        let status = *handle.status().borrow();
        assert_eq!(status.currently_missing, 0);
        assert_eq!(status.parked_dependents, 0);
        assert_eq!(status.total_recovered, 1);
        assert_eq!(transport.history_queries().len(), 2);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::start();
        let before = clock.now_ms();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_ms() - before, 1_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_every_period() {
        let (commands, mut received) = mpsc::channel(16);
        let timer = tokio::spawn(run_timer(Duration::from_millis(100), commands));
        tokio::time::sleep(Duration::from_millis(350)).await;

        let mut ticks = 0;
        while let Ok(command) = received.try_recv() {
            if matches!(command, Command::Tick) {
                ticks += 1;
            }
        }
        assert_eq!(ticks, 3);
        timer.abort();
    }

    #[tokio::test]
    async fn test_anonymous_key_is_stable() {
        let store = crate::storage::MemoryStore::new();
        let config = SyncConfig::for_tests();
        let first = load_anonymous_key(&store, &config).unwrap();
        let second = load_anonymous_key(&store, &config).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }
}
