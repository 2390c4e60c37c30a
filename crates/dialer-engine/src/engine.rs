//! Dialer engine
//!
//! Process-lifetime container that wires storage, the telephony adapter and
//! every dialing component together, and runs the loops:
//!
//! - admission scheduler (fixed interval)
//! - dispatcher (fixed interval)
//! - timer sweep (fixed interval)
//! - signal reconciler (event driven)
//! - snapshot persistence (fixed interval, best-effort)
//!
//! Each interval loop awaits its own tick before waiting for the next one,
//! so a loop never overlaps itself.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapter::TelephonyAdapter;
use crate::config::DialerConfig;
use crate::dispatcher::{Dispatcher, DispatcherSettings};
use crate::error::{DialerError, Result};
use crate::rate_limit::{BucketSnapshot, RateLimiter};
use crate::reconciler::{ReconcilerStats, SignalReconciler};
use crate::route_health::{RouteHealth, RouteHealthTable};
use crate::scheduler::AdmissionScheduler;
use crate::state_machine::{CallStateMachine, TransitionData, TransitionResult, TransitionStatsSnapshot};
use crate::state_table::{CallEvent, TimerPolicy};
use crate::storage::DialerStore;
use crate::timer_sweep::TimerProcessor;
use crate::types::AttemptId;

/// How long `stop` waits for the reconciler to drain
const RECONCILER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct EngineTasks {
    scheduler: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    timer_sweep: JoinHandle<()>,
    reconciler: JoinHandle<()>,
    persistence: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Liveness of each loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub scheduler: bool,
    pub dispatcher: bool,
    pub timer_sweep: bool,
    pub reconciler: bool,
    pub persistence: bool,
}

impl LoopStatus {
    /// The four dialing loops; persistence is not required for health
    pub fn all_running(&self) -> bool {
        self.scheduler && self.dispatcher && self.timer_sweep && self.reconciler
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub name: String,
    pub connected: bool,
}

/// Point-in-time view served on `/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub instance_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub loops: LoopStatus,
    pub adapter: AdapterStatus,
    pub buckets: Vec<BucketSnapshot>,
    pub route_health: Vec<RouteHealth>,
    pub transitions: TransitionStatsSnapshot,
    pub reconciler: ReconcilerStats,
}

pub struct DialerEngine {
    config: DialerConfig,
    store: Arc<dyn DialerStore>,
    adapter: Arc<dyn TelephonyAdapter>,
    state_machine: Arc<CallStateMachine>,
    rate_limiter: Arc<RateLimiter>,
    health: Arc<RouteHealthTable>,
    scheduler: Arc<AdmissionScheduler>,
    dispatcher: Arc<Dispatcher>,
    timers: Arc<TimerProcessor>,
    reconciler: Arc<SignalReconciler>,
    tasks: Mutex<Option<EngineTasks>>,
}

impl DialerEngine {
    pub fn new(config: DialerConfig, store: Arc<dyn DialerStore>, adapter: Arc<dyn TelephonyAdapter>) -> Self {
        let state_machine = Arc::new(CallStateMachine::new(
            store.clone(),
            TimerPolicy::from_config(&config.timers),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let health = Arc::new(RouteHealthTable::new(config.route_health.clone()));

        let scheduler = Arc::new(AdmissionScheduler::new(
            store.clone(),
            state_machine.clone(),
            config.scheduler.clone(),
            config.general.instance_id.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            state_machine.clone(),
            adapter.clone(),
            rate_limiter.clone(),
            health.clone(),
            DispatcherSettings::from_config(&config),
        ));
        let timers = Arc::new(TimerProcessor::new(
            store.clone(),
            state_machine.clone(),
            config.timers.batch_size,
        ));
        let reconciler = Arc::new(SignalReconciler::new(store.clone(), state_machine.clone(), health.clone()));

        Self {
            config,
            store,
            adapter,
            state_machine,
            rate_limiter,
            health,
            scheduler,
            dispatcher,
            timers,
            reconciler,
            tasks: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DialerStore> {
        &self.store
    }

    pub fn state_machine(&self) -> &Arc<CallStateMachine> {
        &self.state_machine
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn route_health(&self) -> &Arc<RouteHealthTable> {
        &self.health
    }

    pub fn scheduler(&self) -> &Arc<AdmissionScheduler> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn timer_processor(&self) -> &Arc<TimerProcessor> {
        &self.timers
    }

    pub fn reconciler(&self) -> &Arc<SignalReconciler> {
        &self.reconciler
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Connect the adapter, restore in-memory state and spawn the loops.
    /// An adapter that cannot connect is fatal.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(DialerError::internal("dialer engine is already running"));
        }
        info!(instance_id = %self.config.general.instance_id, "Starting dialer engine");

        self.adapter.connect().await?;
        self.restore_snapshots().await;

        let events = self.adapter.subscribe(self.config.adapter.event_channel_capacity);
        let reconciler = self.reconciler.clone();
        let reconciler_task = tokio::spawn(async move { reconciler.run(events).await });

        let scheduler = self.scheduler.clone();
        let scheduler_task = spawn_tick_loop("scheduler", self.config.scheduler.interval(), move || {
            let scheduler = scheduler.clone();
            async move {
                if let Err(e) = scheduler.tick().await {
                    error!(error = %e, "Admission tick failed");
                }
            }
        });

        let dispatcher = self.dispatcher.clone();
        let dispatcher_task = spawn_tick_loop("dispatcher", self.config.dispatcher.interval(), move || {
            let dispatcher = dispatcher.clone();
            async move {
                if let Err(e) = dispatcher.tick().await {
                    error!(error = %e, "Dispatch tick failed");
                }
            }
        });

        let timers = self.timers.clone();
        let timer_task = spawn_tick_loop("timer_sweep", self.config.timers.sweep_interval(), move || {
            let timers = timers.clone();
            async move {
                if let Err(e) = timers.tick().await {
                    error!(error = %e, "Timer sweep failed");
                }
            }
        });

        let (store, limiter, health) = (self.store.clone(), self.rate_limiter.clone(), self.health.clone());
        let persistence_task = spawn_tick_loop("persistence", self.config.persistence.snapshot_interval(), move || {
            let (store, limiter, health) = (store.clone(), limiter.clone(), health.clone());
            async move { persist_snapshots(store.as_ref(), &limiter, &health).await }
        });

        *self.tasks.lock() = Some(EngineTasks {
            scheduler: scheduler_task,
            dispatcher: dispatcher_task,
            timer_sweep: timer_task,
            reconciler: reconciler_task,
            persistence: persistence_task,
            started_at: Utc::now(),
        });

        info!("Dialer engine started");
        Ok(())
    }

    /// Stop the loops and close the adapter. In-flight calls are not
    /// flushed; their timers fire on the next start.
    pub async fn stop(&self) -> Result<()> {
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            debug!("Dialer engine is not running");
            return Ok(());
        };
        info!("Stopping dialer engine");

        for handle in [tasks.scheduler, tasks.dispatcher, tasks.timer_sweep, tasks.persistence] {
            handle.abort();
            let _ = handle.await;
        }

        // dropping the sender ends the reconciler once it drains
        self.adapter.unsubscribe();
        let mut reconciler = tasks.reconciler;
        if tokio::time::timeout(RECONCILER_DRAIN_TIMEOUT, &mut reconciler).await.is_err() {
            warn!("Signal reconciler did not drain in time, aborting");
            reconciler.abort();
        }

        persist_snapshots(self.store.as_ref(), &self.rate_limiter, &self.health).await;
        self.adapter.disconnect().await?;

        info!("Dialer engine stopped");
        Ok(())
    }

    /// Operator cancellation of one attempt
    pub async fn cancel_attempt(&self, attempt_id: &AttemptId) -> Result<TransitionResult> {
        let data = TransitionData::new().with_reason("cancelled by operator");
        self.state_machine.transition(attempt_id, CallEvent::Cancel, Some(data)).await
    }

    /// Feed an externally produced event, such as an agent-side change
    pub async fn submit_event(
        &self,
        attempt_id: &AttemptId,
        event: CallEvent,
        data: Option<TransitionData>,
    ) -> Result<TransitionResult> {
        self.state_machine.transition(attempt_id, event, data).await
    }

    pub fn loop_status(&self) -> LoopStatus {
        match self.tasks.lock().as_ref() {
            None => LoopStatus::default(),
            Some(tasks) => LoopStatus {
                scheduler: !tasks.scheduler.is_finished(),
                dispatcher: !tasks.dispatcher.is_finished(),
                timer_sweep: !tasks.timer_sweep.is_finished(),
                reconciler: !tasks.reconciler.is_finished(),
                persistence: !tasks.persistence.is_finished(),
            },
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            instance_id: self.config.general.instance_id.clone(),
            started_at: self.tasks.lock().as_ref().map(|t| t.started_at),
            loops: self.loop_status(),
            adapter: AdapterStatus {
                name: self.adapter.name().to_string(),
                connected: self.adapter.is_connected(),
            },
            buckets: self.rate_limiter.snapshot(),
            route_health: self.health.snapshot(),
            transitions: self.state_machine.stats().snapshot(),
            reconciler: self.reconciler.stats(),
        }
    }

    async fn restore_snapshots(&self) {
        match self.store.load_bucket_snapshots().await {
            Ok(snapshots) => self.rate_limiter.restore(&snapshots, self.config.rate_limit.restore_policy),
            Err(e) => warn!(error = %e, "Could not load rate-limit snapshots, starting with full buckets"),
        }
        match self.store.load_route_health().await {
            Ok(snapshots) => self.health.restore(&snapshots),
            Err(e) => warn!(error = %e, "Could not load route health, starting with no data"),
        }
    }
}

async fn persist_snapshots(store: &dyn DialerStore, limiter: &RateLimiter, health: &RouteHealthTable) {
    if let Err(e) = store.save_bucket_snapshots(&limiter.snapshot()).await {
        warn!(error = %e, "Failed to persist rate-limit buckets");
    }
    if let Err(e) = store.save_route_health(&health.snapshot()).await {
        warn!(error = %e, "Failed to persist route health");
    }
}

fn spawn_tick_loop<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(loop_name = name, period_ms = period.as_millis() as u64, "Loop started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            tick().await;
        }
    })
}
