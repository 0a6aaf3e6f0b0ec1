// Poll scheduling — one recurring async task per target
//
// Each target owns its task, its `PollCursor`, and an `is_polling` flag
// checked after every suspension point. Targets never contend: stopping or
// backing off one target has no effect on any other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::Crypto;
use crate::error::PollError;
use crate::jobs::JobRunner;
use crate::notify::Notifier;
use crate::poll::policy::{DelayContext, PollerPolicy};
use crate::poll::selector::{self, PollCursor};
use crate::receive::decoder::EnvelopeDecoder;
use crate::receive::dispatcher::{DispatchMode, MessageDispatcher};
use crate::receive::reconciler::{ReceiveStateReconciler, ReconcileOptions};
use crate::store::{Storage, StoreError};
use crate::transport::{SwarmProvider, Transport};
use crate::types::{ApplicationState, Namespace, PollTarget};

/// Everything a poll cycle needs from the host
pub struct SchedulerEnv {
    pub storage: Storage,
    pub transport: Arc<dyn Transport>,
    pub swarm: Arc<dyn SwarmProvider>,
    pub crypto: Arc<dyn Crypto>,
    pub jobs: Arc<dyn JobRunner>,
    pub notifier: Arc<dyn Notifier>,
    pub user_public_key: String,
}

/// What one successful cycle produced
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub decoded: usize,
    pub inserted: Vec<u64>,
}

struct TargetHandle {
    is_polling: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct PollScheduler {
    env: Arc<SchedulerEnv>,
    targets: Mutex<HashMap<String, TargetHandle>>,
    app_state: Arc<RwLock<ApplicationState>>,
}

impl PollScheduler {
    pub fn new(env: SchedulerEnv) -> Self {
        Self {
            env: Arc::new(env),
            targets: Mutex::new(HashMap::new()),
            app_state: Arc::new(RwLock::new(ApplicationState::Background)),
        }
    }

    /// Foreground/background affects dispatch auto-start and notifications
    pub fn set_application_state(&self, state: ApplicationState) {
        *self.app_state.write() = state;
    }

    /// Start recurring polling for a target. Idempotent: a second start while
    /// the target's task is live is a no-op.
    pub fn start(&self, target: PollTarget, policy: Arc<dyn PollerPolicy>) {
        let mut targets = self.targets.lock();
        if let Some(existing) = targets.get(&target.id()) {
            if !existing.task.is_finished() {
                debug!(target = %target.id(), "Poll already running, start ignored");
                return;
            }
        }

        info!(target = %target.id(), poller = policy.name(), "Starting poller");
        let is_polling = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.env),
            target.clone(),
            policy,
            Arc::clone(&is_polling),
            Arc::clone(&self.app_state),
        ));
        targets.insert(target.id(), TargetHandle { is_polling, task });
    }

    /// Stop one target. The flag flips immediately; the task is cancelled at
    /// its next suspension point. A storage write that already raced ahead
    /// is left committed (receive is idempotent, so this is safe).
    pub fn stop(&self, target: &PollTarget) {
        if let Some(handle) = self.targets.lock().remove(&target.id()) {
            info!(target = %target.id(), "Stopping poller");
            handle.is_polling.store(false, Ordering::SeqCst);
            handle.task.abort();
        }
    }

    pub fn stop_all(&self) {
        let targets: Vec<String> = self.targets.lock().keys().cloned().collect();
        debug!(count = targets.len(), "Stopping all pollers");
        for (_, handle) in self.targets.lock().drain() {
            handle.is_polling.store(false, Ordering::SeqCst);
            handle.task.abort();
        }
    }

    pub fn is_polling(&self, target: &PollTarget) -> bool {
        self.targets
            .lock()
            .get(&target.id())
            .map(|h| h.is_polling.load(Ordering::SeqCst) && !h.task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.targets.lock().drain() {
            handle.is_polling.store(false, Ordering::SeqCst);
            handle.task.abort();
        }
    }
}

async fn run_loop(
    env: Arc<SchedulerEnv>,
    target: PollTarget,
    policy: Arc<dyn PollerPolicy>,
    is_polling: Arc<AtomicBool>,
    app_state: Arc<RwLock<ApplicationState>>,
) {
    let mut cursor = PollCursor::new();

    loop {
        if !is_polling.load(Ordering::SeqCst) {
            break;
        }
        let cycle_start = Instant::now();
        cursor.last_cycle_started = Some(cycle_start);

        match poll_once(&env, &target, &*policy, &mut cursor, &is_polling, &app_state).await {
            Ok(outcome) => {
                cursor.failure_count = 0;
                selector::increment_use(&mut cursor, policy.max_node_poll_count());
                if outcome.decoded > 0 {
                    debug!(
                        target = %target.id(),
                        decoded = outcome.decoded,
                        inserted = outcome.inserted.len(),
                        "Poll cycle complete"
                    );
                }
            }
            Err(err) => {
                cursor.failure_count += 1;
                if err.implicates_node() {
                    if let Some(node) = cursor.pinned.clone() {
                        env.swarm.report_failing(&target, &node).await;
                        selector::report_failure(&mut cursor, &node);
                    }
                }
                let ctx = delay_context(&env, &target, &cursor);
                if !policy.handle_error(&err, &ctx) {
                    warn!(target = %target.id(), "Poller giving up");
                    is_polling.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        if !is_polling.load(Ordering::SeqCst) {
            break;
        }

        // The delay is measured from cycle start, so time already spent
        // polling counts against it
        let delay = policy.next_delay(&delay_context(&env, &target, &cursor));
        let remaining = delay.saturating_sub(cycle_start.elapsed());
        tokio::time::sleep(remaining).await;
    }
}

/// One poll cycle: select a node, fetch, decode under the storage write,
/// dispatch, and (when foreground) drive reconciliation inline.
async fn poll_once(
    env: &SchedulerEnv,
    target: &PollTarget,
    policy: &dyn PollerPolicy,
    cursor: &mut PollCursor,
    is_polling: &AtomicBool,
    app_state: &RwLock<ApplicationState>,
) -> Result<CycleOutcome, PollError> {
    let swarm = env.swarm.swarm_for(target).await?;
    let node = selector::select_node(cursor, &swarm, policy.max_node_poll_count())?;

    let target_id = target.id();
    let namespaces = policy.namespaces();
    let since_hashes = env.storage.read(|tx| {
        let mut map: HashMap<Namespace, String> = HashMap::new();
        for namespace in namespaces {
            if let Some(hash) = tx.last_hash(&target_id, namespace.tag())? {
                map.insert(*namespace, hash);
            }
        }
        Ok(map)
    })?;

    let response = env.transport.poll(target, &node, namespaces, &since_hashes).await?;

    // The fetch is the longest suspension point; a stop that landed during
    // it means the response must be discarded, not written
    if !is_polling.load(Ordering::SeqCst) {
        return Ok(CycleOutcome::default());
    }

    let decoder = EnvelopeDecoder::new(&*env.crypto, &env.user_public_key);
    let decode_outcome = env
        .storage
        .write(|tx| {
            decoder
                .decode_batch(target, &node, &response.results, tx)
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

    let state = *app_state.read();
    let mode = match state {
        ApplicationState::Foreground => DispatchMode::Foreground,
        ApplicationState::Background => DispatchMode::Background,
    };

    let decoded = decode_outcome.decoded.len();
    let dispatcher = MessageDispatcher::new(&*env.jobs);
    let units = dispatcher.dispatch(decode_outcome.decoded, mode);

    let mut outcome = CycleOutcome {
        decoded,
        inserted: Vec::new(),
    };

    // Foreground units are not auto-started; drive them here, in dispatch
    // order, which preserves config-before-regular per thread
    if mode == DispatchMode::Foreground {
        let reconciler = ReceiveStateReconciler::new(
            env.storage.clone(),
            Arc::clone(&env.notifier),
            Arc::clone(&env.jobs),
            env.user_public_key.clone(),
        );
        let options = ReconcileOptions {
            app_state: state,
            call_busy: false,
        };
        for unit in units {
            if !is_polling.load(Ordering::SeqCst) {
                break;
            }
            let Some(kind) = unit.messages.first().map(|m| m.thread_kind) else {
                continue;
            };
            let batch = reconciler
                .reconcile_batch(&unit.thread_id, kind, &unit.messages, options)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            outcome.inserted.extend(batch.inserted);
        }
    }

    Ok(outcome)
}

fn delay_context(env: &SchedulerEnv, target: &PollTarget, cursor: &PollCursor) -> DelayContext {
    let last_message_age = target.fixed_thread_id().and_then(|thread_id| {
        let newest = env
            .storage
            .read(|tx| Ok(tx.thread(&thread_id)?.and_then(|t| t.last_message_timestamp_ms)))
            .ok()
            .flatten()?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Some(Duration::from_millis(now.saturating_sub(newest)))
    });

    DelayContext {
        failure_count: cursor.failure_count,
        last_message_age,
    }
}
