use crate::api::{FetchClient, FetchError, Fetched, RequestConfig};
use crate::hooks::{self, HookBus};
use crate::poller::stats::{ErrorEntry, ErrorLog, SampleWindow};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub type PollFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type PollCallback = Arc<dyn Fn(Value) -> PollFuture + Send + Sync>;

/// Wraps an async closure as a [`PollCallback`].
pub fn poll_callback<F, Fut>(f: F) -> PollCallback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Regime {
    /// The next cycle is armed only once the current one completed.
    Waiting,
    /// A repeating timer fires regardless of requests in flight.
    FixedInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Stopped,
    Running,
    /// Stopped after repeated failures; only an explicit start revives it.
    CircuitOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub uri: String,
    pub status: TaskStatus,
    pub regime: Regime,
    pub interval_ms: u64,
    pub fired: u64,
    pub moving_average_ms: u64,
    pub pending_samples: usize,
    pub errors: usize,
    pub last_error: Option<ErrorEntry>,
}

#[derive(Debug, Clone, Copy)]
enum CycleMode {
    /// Dispatched by the task's own timer (or a start); may re-arm.
    /// `sample_from` is where the cycle's timing sample starts, `None` when
    /// the cycle yields no sample.
    Scheduled {
        generation: u64,
        sample_from: Option<Instant>,
    },
    /// Forced refresh; never re-arms.
    Once,
}

struct TaskState {
    status: TaskStatus,
    regime: Regime,
    interval: Duration,
    fired: u64,
    last_polled_at: Option<Instant>,
    samples: SampleWindow,
    /// Cleared once the task adapted its interval, until the next stop.
    sampling: bool,
    errors: ErrorLog,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every stop so completions from before it are recognised.
    generation: u64,
}

impl TaskState {
    fn new(interval: Duration) -> Self {
        Self {
            status: TaskStatus::Stopped,
            regime: Regime::Waiting,
            interval,
            fired: 0,
            last_polled_at: None,
            samples: SampleWindow::new(),
            sampling: true,
            errors: ErrorLog::new(),
            timer: None,
            generation: 0,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.status == TaskStatus::Running && self.generation == generation
    }

    /// Feeds one gap into the window. Returns the interval to switch to
    /// when the averaged gap shows the cadence is not sustainable.
    fn observe_gap(&mut self, gap: Duration, ceiling: Duration) -> Option<Duration> {
        let average = self.samples.push(gap)?;
        if average <= self.interval {
            return None;
        }
        let adapted = average.min(ceiling);
        (adapted > self.interval).then_some(adapted)
    }

    fn halt(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.samples.reset();
        self.sampling = true;
        self.generation = self.generation.wrapping_add(1);
        self.status = TaskStatus::Stopped;
    }
}

/// Polls one endpoint and adapts its own cadence.
pub struct PollTask {
    uri: String,
    callback: PollCallback,
    client: FetchClient,
    hooks: Option<HookBus>,
    max_interval: Duration,
    state: Mutex<TaskState>,
}

impl PollTask {
    pub fn new(
        uri: impl Into<String>,
        callback: PollCallback,
        client: FetchClient,
        interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            uri: uri.into(),
            callback,
            client,
            hooks: None,
            max_interval,
            state: Mutex::new(TaskState::new(interval)),
        }
    }

    pub fn with_hooks(mut self, hooks: HookBus) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    pub fn regime(&self) -> Regime {
        self.state.lock().regime
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    pub fn fired(&self) -> u64 {
        self.state.lock().fired
    }

    pub fn moving_average(&self) -> Duration {
        self.state.lock().samples.average()
    }

    pub fn last_polled_at(&self) -> Option<Instant> {
        self.state.lock().last_polled_at
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock();
        TaskSnapshot {
            uri: self.uri.clone(),
            status: state.status,
            regime: state.regime,
            interval_ms: state.interval.as_millis() as u64,
            fired: state.fired,
            moving_average_ms: state.samples.average().as_millis() as u64,
            pending_samples: state.samples.len(),
            errors: state.errors.len(),
            last_error: state.errors.last().cloned(),
        }
    }

    /// Arms the first cycle one interval from now. No-op while running.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.status == TaskStatus::Running {
            return;
        }
        state.status = TaskStatus::Running;
        tracing::debug!(uri = %self.uri, regime = ?state.regime, "Starting poller");
        self.arm(&mut state);
    }

    /// Like [`start`](Self::start), but the first cycle is dispatched
    /// immediately.
    pub fn start_now(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.status == TaskStatus::Running {
            return;
        }
        state.status = TaskStatus::Running;
        tracing::debug!(uri = %self.uri, regime = ?state.regime, "Starting poller immediately");

        let generation = state.generation;
        state.last_polled_at = None;
        if state.regime == Regime::FixedInterval {
            self.arm(&mut state);
        }
        drop(state);

        // Nothing was polled before this cycle, so there is no gap to sample.
        self.dispatch(CycleMode::Scheduled {
            generation,
            sample_from: None,
        });
    }

    /// Cancels the pending timer. Requests already in flight complete but do
    /// not re-arm.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Running {
            return;
        }
        tracing::debug!(uri = %self.uri, "Stopping poller");
        state.halt();
    }

    pub fn restart(self: &Arc<Self>) {
        self.stop();
        self.start();
    }

    /// One fetch cycle outside the schedule.
    pub async fn run_once(self: &Arc<Self>) {
        Arc::clone(self).cycle(CycleMode::Once).await;
    }

    /// A zero interval is ignored.
    pub fn set_interval(self: &Arc<Self>, interval: Duration, restart: bool) {
        if interval.is_zero() {
            tracing::warn!(uri = %self.uri, "Ignoring zero poll interval");
            return;
        }
        tracing::info!(
            uri = %self.uri,
            interval_ms = interval.as_millis() as u64,
            restart,
            "Poll interval changed"
        );
        self.state.lock().interval = interval;
        if restart {
            self.restart();
        }
    }

    /// `true` gates every cycle on the previous response, `false` switches to
    /// a fixed repeating timer. Restarts the task.
    pub fn wait_for_response(self: &Arc<Self>, wait: bool) {
        let regime = if wait {
            Regime::Waiting
        } else {
            Regime::FixedInterval
        };

        {
            let mut state = self.state.lock();
            if state.status == TaskStatus::Running {
                state.halt();
            }
            if state.regime != regime {
                tracing::info!(uri = %self.uri, ?regime, "Poll regime changed");
            }
            state.regime = regime;
            state.last_polled_at = None;
        }
        self.start();
    }

    /// Replaces the outstanding timer with a fresh one for the current
    /// regime. Caller holds the state lock.
    fn arm(self: &Arc<Self>, state: &mut TaskState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let interval = state.interval;
        let armed_at = Instant::now();
        state.last_polled_at = Some(armed_at);

        let task = Arc::clone(self);
        let timer = match state.regime {
            Regime::Waiting => tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                task.dispatch(CycleMode::Scheduled {
                    generation,
                    sample_from: Some(armed_at),
                });
            }),
            // The timer keeps the cadence, so a sample is the round trip of
            // the cycle it dispatched.
            Regime::FixedInterval => tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(armed_at + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    let tick = ticker.tick().await;
                    task.dispatch(CycleMode::Scheduled {
                        generation,
                        sample_from: Some(tick),
                    });
                }
            }),
        };
        state.timer = Some(timer);
    }

    /// Cycles run detached from the timer so aborting the timer never
    /// cancels a request in flight.
    fn dispatch(self: &Arc<Self>, mode: CycleMode) {
        tokio::spawn(Arc::clone(self).cycle(mode));
    }

    async fn cycle(self: Arc<Self>, mode: CycleMode) {
        let fired = {
            let mut state = self.state.lock();
            if let CycleMode::Scheduled { generation, .. } = mode {
                if !state.is_current(generation) {
                    return;
                }
            }
            state.fired += 1;
            state.fired
        };
        tracing::trace!(uri = %self.uri, fired, "Poll cycle dispatched");

        match self.client.get(&self.uri, &RequestConfig::poller()).await {
            Ok(Fetched::Changed(payload)) => {
                (self.callback)(payload).await;
                if let Some(hooks) = &self.hooks {
                    hooks.call(hooks::POLL_UPDATED, json!({ "uri": self.uri }));
                }
                self.complete(mode);
            }
            Ok(Fetched::Unchanged) => self.complete(mode),
            Err(error) => self.fail(mode, &error),
        }
    }

    fn complete(self: &Arc<Self>, mode: CycleMode) {
        let CycleMode::Scheduled {
            generation,
            sample_from,
        } = mode
        else {
            return;
        };

        let mut state = self.state.lock();
        if !state.is_current(generation) {
            return;
        }

        let adapted = match sample_from {
            Some(from) if state.sampling => {
                let gap = Instant::now().saturating_duration_since(from);
                state.observe_gap(gap, self.max_interval)
            }
            _ => None,
        };
        if let Some(adapted) = adapted {
            tracing::info!(
                uri = %self.uri,
                interval_ms = adapted.as_millis() as u64,
                previous_ms = state.interval.as_millis() as u64,
                "Endpoint cannot sustain its poll interval, waiting for responses"
            );
            state.interval = adapted;
            state.halt();
            // Adapts once per run; a stop or restart re-enables sampling.
            state.sampling = false;
            state.regime = Regime::Waiting;
            state.status = TaskStatus::Running;
            self.arm(&mut state);
            return;
        }

        if state.regime == Regime::Waiting {
            self.arm(&mut state);
        }
    }

    fn fail(self: &Arc<Self>, mode: CycleMode, error: &FetchError) {
        let mut state = self.state.lock();
        let fired = state.fired;
        state.errors.record(fired, Utc::now());
        let retries = state.errors.recent_failures(fired);
        tracing::info!(
            uri = %self.uri,
            fired,
            retries,
            error = %error,
            "Poll cycle failed"
        );

        if state.status == TaskStatus::Running && state.errors.should_open_circuit(fired) {
            tracing::warn!(uri = %self.uri, fired, "Max retries reached, stopping poller");
            state.halt();
            state.status = TaskStatus::CircuitOpen;
            drop(state);

            if let Some(hooks) = &self.hooks {
                hooks.call(hooks::POLL_CIRCUIT_OPEN, json!({ "uri": self.uri }));
            }
            return;
        }

        if let CycleMode::Scheduled { generation, .. } = mode {
            if state.is_current(generation) && state.regime == Regime::Waiting {
                self.arm(&mut state);
            }
        }
    }
}
