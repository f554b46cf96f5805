//! SequenceEngine - runs a step table through a protocol.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  start()  ┌────────────┐       ┌─────────┐
//! │ Idle │──────────▶│ Estimating │──────▶│ Running │
//! └──────┘           └────────────┘       └────┬────┘
//!                                              │
//!                    ┌──────────┬──────────────┼
//!                    ▼          ▼              ▼
//!               ┌──────────┐ ┌─────────┐ ┌────────┐
//!               │ Finished │ │ Aborted │ │ Failed │
//!               └──────────┘ └─────────┘ └────────┘
//! ```
//!
//! Every run ends with exactly one [`EngineEvent::Finished`], whatever the
//! outcome, including a step that panics. Before it is sent, the engine lowers
//! its own abort flag and the protocol's hardware flags, so a caller that has
//! seen `Finished` may start the next run straight away.
//!
//! An abort and the end-of-run reset are serialized: the reset waits for an
//! in-flight [`AbortHandle::abort`] to finish, and an abort that arrives once
//! the run is over does nothing.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = SequenceEngine::new(protocol);
//! let mut run = engine.start(steps)?;
//! let abort = run.abort_handle();
//!
//! while let Some(event) = run.next_event().await {
//!     println!("{event}");
//! }
//! let outcome = run.join().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use fluidics_core::capabilities::PortRouter;
use fluidics_core::{AbortSignal, FluidicsError, FluidicsResult, Step};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocols::Protocol;

/// Port-switch overhead added to every step in estimates.
const PORT_SWITCH_SECONDS: f64 = 2.0;

/// Settling time added when a step fills the tubing afterwards.
const TUBING_FILL_SECONDS: f64 = 1.0;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run started yet
    Idle,
    /// Computing the run estimate and validating steps
    Estimating,
    /// Executing steps
    Running,
    /// Last run completed every step
    Finished,
    /// Last run was aborted by the user
    Aborted,
    /// Last run stopped on an error
    Failed,
}

impl EngineState {
    /// True for states a new run may start from.
    pub fn is_terminal(self) -> bool {
        !matches!(self, EngineState::Estimating | EngineState::Running)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Estimating => write!(f, "estimating"),
            EngineState::Running => write!(f, "running"),
            EngineState::Finished => write!(f, "finished"),
            EngineState::Aborted => write!(f, "aborted"),
            EngineState::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of one step iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The protocol is about to process the step
    Started,
    /// Step processed, incubation wait in progress
    Incubating,
    /// Step processed and incubated
    Completed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Started => write!(f, "Started"),
            StepStatus::Incubating => write!(f, "Incubating"),
            StepStatus::Completed => write!(f, "Completed"),
        }
    }
}

/// Predicted duration of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Predicted wall-clock seconds at full speed
    pub total_seconds: f64,
    /// Enabled step iterations, repeats included
    pub total_iterations: u32,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every enabled step ran
    Completed,
    /// Stopped by an abort request
    Aborted,
    /// Stopped by a validation or hardware error
    Failed,
}

impl RunOutcome {
    fn state(self) -> EngineState {
        match self {
            RunOutcome::Completed => EngineState::Finished,
            RunOutcome::Aborted => EngineState::Aborted,
            RunOutcome::Failed => EngineState::Failed,
        }
    }
}

/// Notifications sent to the caller while a run executes.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Sent first, before any validation.
    Estimate(Estimate),
    /// `step_index` is the step's position in the table (zero-based);
    /// `iteration` counts iterations across the whole run from 1.
    Progress {
        /// Zero-based row in the step table
        step_index: usize,
        /// One-based iteration across the run
        iteration: u32,
        /// What happened
        status: StepStatus,
    },
    /// At most one per run, just before `Finished`.
    Error {
        /// User-facing description
        message: String,
    },
    /// Always the last event of a run.
    Finished {
        /// How the run ended
        outcome: RunOutcome,
    },
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Estimate(estimate) => write!(
                f,
                "Estimated {:.0} s over {} iterations",
                estimate.total_seconds, estimate.total_iterations
            ),
            EngineEvent::Progress {
                step_index,
                iteration,
                status,
            } => write!(f, "Step {}, iteration {iteration}: {status}", step_index + 1),
            EngineEvent::Error { message } => write!(f, "Error: {message}"),
            EngineEvent::Finished { outcome } => write!(f, "Finished ({outcome:?})"),
        }
    }
}

/// Estimate a run over the enabled steps.
///
/// Per step: pumping time at the step's flow rate, the tubing fill from the
/// common valve if one is set, incubation, and a fixed port-switch overhead,
/// all multiplied by the repeat count.
pub fn estimate_steps(steps: &[Step], router: &dyn PortRouter) -> Estimate {
    let mut total_seconds = 0.0;
    let mut total_iterations = 0;
    for step in steps.iter().filter(|step| step.enabled) {
        let mut seconds = step.volume_ul / step.flow_rate_ul_per_min * 60.0;
        if let Some(fill) = step.fill_tubing_with {
            seconds += router.dead_volume_to_valve(fill) / step.flow_rate_ul_per_min * 60.0
                + TUBING_FILL_SECONDS;
        }
        if step.incubation_time_min > 0.0 {
            seconds += step.incubation_time_min * 60.0;
        }
        seconds += PORT_SWITCH_SECONDS;
        total_seconds += seconds * f64::from(step.repeat_count);
        total_iterations += step.repeat_count;
    }
    Estimate {
        total_seconds,
        total_iterations,
    }
}

// =============================================================================
// Abort Handle
// =============================================================================

/// Requests cancellation of the current run from any task.
#[derive(Clone)]
pub struct AbortHandle {
    signal: AbortSignal,
    protocol: Arc<dyn Protocol>,
    state: Arc<Mutex<EngineState>>,
    /// Held across a whole abort, and by the worker while it resets.
    abort_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AbortHandle {
    /// Raise the engine's abort flag and abort the protocol's hardware.
    ///
    /// Idempotent. Operations already inside a protocol notice at their next
    /// checkpoint. Does nothing when no run is in progress.
    pub async fn abort(&self) {
        let _guard = self.abort_lock.lock().await;
        let state = *self.state.lock();
        if state.is_terminal() {
            debug!(%state, "Abort ignored, no run in progress");
            return;
        }
        if !self.signal.is_raised() {
            info!("Abort requested");
        }
        self.signal.raise();
        self.protocol.abort().await;
    }

    /// True while an abort is pending for the current run.
    pub fn is_raised(&self) -> bool {
        self.signal.is_raised()
    }
}

// =============================================================================
// Run Handle
// =============================================================================

/// A run in progress: its event stream and its worker task.
pub struct RunHandle {
    events: mpsc::Receiver<EngineEvent>,
    task: JoinHandle<RunOutcome>,
    abort: AbortHandle,
}

impl RunHandle {
    /// Next event, or `None` once the run has finished and the stream is drained.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Handle that aborts this run from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Wait for the worker, discarding events not yet read.
    pub async fn join(self) -> FluidicsResult<RunOutcome> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| FluidicsError::Operation(format!("Sequence worker failed: {e}")))
    }

    /// Read every remaining event, then wait for the worker.
    pub async fn collect(mut self) -> FluidicsResult<(Vec<EngineEvent>, RunOutcome)> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.join().await?;
        Ok((events, outcome))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Executes step tables through one protocol, one run at a time.
pub struct SequenceEngine {
    protocol: Arc<dyn Protocol>,
    state: Arc<Mutex<EngineState>>,
    abort: AbortSignal,
    abort_lock: Arc<tokio::sync::Mutex<()>>,
    incubation_scale: f64,
    event_capacity: usize,
}

impl SequenceEngine {
    /// Idle engine over `protocol`, incubating in real time.
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        Self {
            protocol,
            state: Arc::new(Mutex::new(EngineState::Idle)),
            abort: AbortSignal::new(),
            abort_lock: Arc::new(tokio::sync::Mutex::new(())),
            incubation_scale: 1.0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Multiply incubation waits by `scale` (simulated runs).
    pub fn with_incubation_scale(mut self, scale: f64) -> Self {
        self.incubation_scale = scale.max(0.0);
        self
    }

    /// Buffer size of each run's event channel.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Current state; terminal once a run has sent `Finished`.
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// The protocol steps are run through.
    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    /// Estimate a run of `steps` against this protocol's valves.
    pub fn estimate(&self, steps: &[Step]) -> Estimate {
        estimate_steps(steps, self.protocol.port_router().as_ref())
    }

    /// Handle that aborts whichever run is in progress when it is used.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            signal: self.abort.clone(),
            protocol: self.protocol.clone(),
            state: self.state.clone(),
            abort_lock: self.abort_lock.clone(),
        }
    }

    /// Abort the current run, if any.
    pub async fn abort(&self) {
        self.abort_handle().abort().await;
    }

    /// Start running `steps` on a new task.
    ///
    /// Fails if a run is already in progress.
    pub fn start(&self, steps: Vec<Step>) -> FluidicsResult<RunHandle> {
        {
            let mut state = self.state.lock();
            if !state.is_terminal() {
                return Err(FluidicsError::Operation(format!(
                    "Cannot start: engine is {}",
                    *state
                )));
            }
            *state = EngineState::Estimating;
        }

        let (tx, events) = mpsc::channel(self.event_capacity);
        let worker = RunWorker {
            protocol: self.protocol.clone(),
            state: self.state.clone(),
            abort: self.abort.clone(),
            abort_lock: self.abort_lock.clone(),
            incubation_scale: self.incubation_scale,
            tx,
        };
        let task = tokio::spawn(worker.run(steps));
        Ok(RunHandle {
            events,
            task,
            abort: self.abort_handle(),
        })
    }
}

/// Why a run stopped before completing every step.
enum Interrupt {
    Aborted,
    Failed(String),
}

#[derive(Clone)]
struct RunWorker {
    protocol: Arc<dyn Protocol>,
    state: Arc<Mutex<EngineState>>,
    abort: AbortSignal,
    abort_lock: Arc<tokio::sync::Mutex<()>>,
    incubation_scale: f64,
    tx: mpsc::Sender<EngineEvent>,
}

impl RunWorker {
    async fn emit(&self, event: EngineEvent) {
        // A caller that dropped its receiver no longer wants events.
        let _ = self.tx.send(event).await;
    }

    async fn run(self, steps: Vec<Step>) -> RunOutcome {
        let estimate = estimate_steps(&steps, self.protocol.port_router().as_ref());
        info!(
            protocol = self.protocol.name(),
            steps = steps.len(),
            total_seconds = estimate.total_seconds,
            total_iterations = estimate.total_iterations,
            "Starting sequence run"
        );
        self.emit(EngineEvent::Estimate(estimate)).await;

        // Steps run on their own task so a panic still ends the run cleanly.
        let result = match tokio::spawn(self.clone().body(steps)).await {
            Ok(result) => result,
            Err(e) => Err(Interrupt::Failed(format!("Sequence worker failed: {e}"))),
        };

        let outcome = match result {
            Ok(()) => {
                info!("Sequence run completed");
                RunOutcome::Completed
            }
            Err(Interrupt::Aborted) => {
                warn!("Sequence run aborted");
                self.emit(EngineEvent::Error {
                    message: FluidicsError::AbortRequested.to_string(),
                })
                .await;
                RunOutcome::Aborted
            }
            Err(Interrupt::Failed(message)) => {
                error!(%message, "Sequence run failed");
                self.emit(EngineEvent::Error { message }).await;
                RunOutcome::Failed
            }
        };

        {
            let _guard = self.abort_lock.lock().await;
            self.abort.clear();
            self.protocol.reset_abort();
            *self.state.lock() = outcome.state();
        }
        self.emit(EngineEvent::Finished { outcome }).await;
        outcome
    }

    async fn body(self, steps: Vec<Step>) -> Result<(), Interrupt> {
        self.validate(&steps)?;
        *self.state.lock() = EngineState::Running;
        self.execute(&steps).await
    }

    fn validate(&self, steps: &[Step]) -> Result<(), Interrupt> {
        for (index, step) in steps.iter().enumerate().filter(|(_, s)| s.enabled) {
            self.protocol
                .validate_step(step)
                .map_err(|e| Interrupt::Failed(format!("Error processing step {}: {e}", index + 1)))?;
        }
        Ok(())
    }

    async fn execute(&self, steps: &[Step]) -> Result<(), Interrupt> {
        let mut iteration = 0;
        for (index, step) in steps.iter().enumerate() {
            if !step.enabled {
                continue;
            }
            for repeat in 1..=step.repeat_count {
                if self.abort.is_raised() {
                    return Err(Interrupt::Aborted);
                }
                iteration += 1;
                self.progress(index, iteration, StepStatus::Started).await;

                if let Err(e) = self.protocol.process_step(step).await {
                    if e.is_abort() {
                        return Err(Interrupt::Aborted);
                    }
                    return Err(Interrupt::Failed(format!(
                        "Error processing step {} (repeat {repeat}): {e}",
                        index + 1
                    )));
                }
                if self.abort.is_raised() {
                    return Err(Interrupt::Aborted);
                }

                if step.incubation_time_min > 0.0 {
                    self.progress(index, iteration, StepStatus::Incubating).await;
                    let wait = Duration::try_from_secs_f64(
                        step.incubation_time_min * 60.0 * self.incubation_scale,
                    )
                    .unwrap_or(Duration::MAX);
                    if self.abort.wait(wait).await {
                        return Err(Interrupt::Aborted);
                    }
                }
                self.progress(index, iteration, StepStatus::Completed).await;
            }
        }
        Ok(())
    }

    async fn progress(&self, step_index: usize, iteration: u32, status: StepStatus) {
        info!(step_index, iteration, %status, "Step progress");
        self.emit(EngineEvent::Progress {
            step_index,
            iteration,
            status,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fluidics_core::RoutingError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct FlatRouter;

    #[async_trait]
    impl PortRouter for FlatRouter {
        async fn open(&self, _logical_port: u32) -> Result<(), RoutingError> {
            Ok(())
        }
        fn current_port(&self) -> u32 {
            1
        }
        fn addressable_ports(&self) -> u32 {
            10
        }
        fn is_terminal_port(&self, _logical_port: u32) -> bool {
            true
        }
        fn dead_volume_to_valve(&self, _logical_port: u32) -> f64 {
            250.0
        }
        fn dead_volume_to_port(&self, _logical_port: u32) -> f64 {
            0.0
        }
        fn reagent_name(&self, _logical_port: u32) -> Option<String> {
            None
        }
    }

    /// Protocol that succeeds instantly, fails on steps named "Fail" and
    /// panics on steps named "Panic".
    ///
    /// `hardware_aborted` stands in for a device flag raised at the end of a
    /// slow hardware abort.
    struct ScriptedProtocol {
        calls: Mutex<Vec<String>>,
        aborts: Mutex<u32>,
        resets: Mutex<u32>,
        abort_delay: Duration,
        hardware_aborted: AtomicBool,
    }

    impl ScriptedProtocol {
        fn new() -> Arc<Self> {
            Self::with_abort_delay(Duration::ZERO)
        }

        fn with_abort_delay(abort_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                aborts: Mutex::new(0),
                resets: Mutex::new(0),
                abort_delay,
                hardware_aborted: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Protocol for ScriptedProtocol {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn port_router(&self) -> Arc<dyn PortRouter> {
            Arc::new(FlatRouter)
        }
        fn validate_step(&self, step: &Step) -> FluidicsResult<()> {
            if step.name == "Invalid" {
                return Err(FluidicsError::Validation("Unknown step name: Invalid".into()));
            }
            Ok(())
        }
        async fn process_step(&self, step: &Step) -> FluidicsResult<()> {
            self.calls.lock().push(step.name.clone());
            if step.name == "Fail" {
                return Err(FluidicsError::Operation("valve jammed".into()));
            }
            if step.name == "Panic" {
                panic!("pump driver bug");
            }
            Ok(())
        }
        async fn abort(&self) {
            *self.aborts.lock() += 1;
            tokio::time::sleep(self.abort_delay).await;
            self.hardware_aborted.store(true, Ordering::SeqCst);
        }
        fn reset_abort(&self) {
            *self.resets.lock() += 1;
            self.hardware_aborted.store(false, Ordering::SeqCst);
        }
    }

    fn progress(events: &[EngineEvent]) -> Vec<(usize, u32, StepStatus)> {
        events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Progress {
                    step_index,
                    iteration,
                    status,
                } => Some((*step_index, *iteration, *status)),
                _ => None,
            })
            .collect()
    }

    fn finished_count(events: &[EngineEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Finished { .. }))
            .count()
    }

    /// Drain a run, calling `abort` from a separate task once the first
    /// incubation starts.
    async fn run_and_abort_on_incubation(mut run: RunHandle) -> (Vec<EngineEvent>, RunOutcome) {
        let abort = run.abort_handle();
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), run.next_event())
            .await
            .unwrap()
        {
            if matches!(
                event,
                EngineEvent::Progress {
                    status: StepStatus::Incubating,
                    ..
                }
            ) {
                let abort = abort.clone();
                tokio::spawn(async move { abort.abort().await });
            }
            events.push(event);
        }
        (events, run.join().await.unwrap())
    }

    fn errors(events: &[EngineEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_estimate_matches_hand_calculation() {
        let steps = vec![Step::new("Flow Wash", 1, 500.0, 1000.0)
            .with_incubation(2.0)
            .with_repeat(3)];
        let estimate = estimate_steps(&steps, &FlatRouter);
        assert_eq!(estimate.total_seconds, 726.0);
        assert_eq!(estimate.total_iterations, 3);
    }

    #[test]
    fn test_estimate_adds_tubing_fill_and_skips_disabled() {
        let steps = vec![
            Step::new("Flow Wash", 1, 500.0, 500.0).with_fill_tubing(9),
            Step::new("Flow Wash", 1, 500.0, 500.0).disabled(),
        ];
        let estimate = estimate_steps(&steps, &FlatRouter);
        // 60 s pumping + 30 s fill + 1 s + 2 s overhead.
        assert_eq!(estimate.total_seconds, 93.0);
        assert_eq!(estimate.total_iterations, 1);
    }

    #[tokio::test]
    async fn test_run_reports_every_iteration() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol.clone()).with_incubation_scale(0.0);
        let steps = vec![
            Step::new("A", 1, 500.0, 100.0).with_repeat(2),
            Step::new("Skipped", 1, 500.0, 100.0).disabled(),
            Step::new("B", 1, 500.0, 100.0).with_incubation(1.0),
        ];
        let (events, outcome) = engine.start(steps).unwrap().collect().await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert!(matches!(events[0], EngineEvent::Estimate(_)));
        assert_eq!(
            progress(&events),
            vec![
                (0, 1, StepStatus::Started),
                (0, 1, StepStatus::Completed),
                (0, 2, StepStatus::Started),
                (0, 2, StepStatus::Completed),
                (2, 3, StepStatus::Started),
                (2, 3, StepStatus::Incubating),
                (2, 3, StepStatus::Completed),
            ]
        );
        assert!(errors(&events).is_empty());
        assert_eq!(
            events.last(),
            Some(&EngineEvent::Finished {
                outcome: RunOutcome::Completed
            })
        );
        assert_eq!(*protocol.calls.lock(), vec!["A", "A", "B"]);
        assert_eq!(engine.state(), EngineState::Finished);
    }

    #[tokio::test]
    async fn test_failure_stops_the_whole_run() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol.clone());
        let steps = vec![
            Step::new("A", 1, 500.0, 100.0),
            Step::new("Fail", 1, 500.0, 100.0).with_repeat(3),
            Step::new("C", 1, 500.0, 100.0),
        ];
        let (events, outcome) = engine.start(steps).unwrap().collect().await.unwrap();

        assert_eq!(outcome, RunOutcome::Failed);
        let errors = errors(&events);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0], "Error processing step 2 (repeat 1): valve jammed");
        assert_eq!(
            progress(&events).last(),
            Some(&(1, 2, StepStatus::Started))
        );
        assert_eq!(finished_count(&events), 1);
        assert_eq!(*protocol.calls.lock(), vec!["A", "Fail"]);
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_validation_failure_touches_no_hardware() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol.clone());
        let steps = vec![
            Step::new("A", 1, 500.0, 100.0),
            Step::new("Invalid", 1, 500.0, 100.0),
        ];
        let (events, outcome) = engine.start(steps).unwrap().collect().await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert!(progress(&events).is_empty());
        assert!(errors(&events)[0].starts_with("Error processing step 2: Invalid step"));
        assert!(protocol.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_abort_cuts_incubation_short() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol.clone());
        let steps = vec![
            Step::new("A", 1, 500.0, 100.0).with_incubation(1.0),
            Step::new("B", 1, 500.0, 100.0),
        ];
        let mut run = engine.start(steps).unwrap();
        let abort = run.abort_handle();

        let started = Instant::now();
        let mut events = Vec::new();
        while let Some(event) = run.next_event().await {
            if matches!(
                event,
                EngineEvent::Progress {
                    status: StepStatus::Incubating,
                    ..
                }
            ) {
                abort.abort().await;
            }
            events.push(event);
        }
        let outcome = run.join().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome, RunOutcome::Aborted);
        assert_eq!(errors(&events), vec!["Operation aborted by user"]);
        assert!(!progress(&events).contains(&(0, 1, StepStatus::Completed)));
        assert_eq!(*protocol.calls.lock(), vec!["A"]);
        assert_eq!(*protocol.aborts.lock(), 1);
        assert_eq!(*protocol.resets.lock(), 1);
        assert!(!abort.is_raised());
        assert_eq!(engine.state(), EngineState::Aborted);
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol);
        let run = engine
            .start(vec![Step::new("A", 1, 500.0, 100.0).with_incubation(10.0)])
            .unwrap();
        assert!(engine.start(vec![Step::new("B", 1, 500.0, 100.0)]).is_err());

        engine.abort().await;
        assert_eq!(run.join().await.unwrap(), RunOutcome::Aborted);

        let (_, outcome) = engine
            .start(vec![Step::new("B", 1, 500.0, 100.0)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_out_of_range_incubation_waits_for_abort() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol.clone());
        let step = Step::new("A", 1, 500.0, 100.0).with_incubation(1e18);
        assert!(step.validate_shape().is_ok());

        let run = engine.start(vec![step]).unwrap();
        let (events, outcome) = run_and_abort_on_incubation(run).await;

        assert_eq!(outcome, RunOutcome::Aborted);
        assert_eq!(errors(&events), vec!["Operation aborted by user"]);
        assert_eq!(finished_count(&events), 1);
        assert_eq!(engine.state(), EngineState::Aborted);

        let (_, outcome) = engine
            .start(vec![Step::new("B", 1, 500.0, 100.0)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_panicking_step_still_finishes_the_run() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol.clone());
        let steps = vec![
            Step::new("A", 1, 500.0, 100.0),
            Step::new("Panic", 1, 500.0, 100.0),
            Step::new("C", 1, 500.0, 100.0),
        ];
        let (events, outcome) = engine.start(steps).unwrap().collect().await.unwrap();

        assert_eq!(outcome, RunOutcome::Failed);
        let errors = errors(&events);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Sequence worker failed"));
        assert_eq!(
            events.last(),
            Some(&EngineEvent::Finished {
                outcome: RunOutcome::Failed
            })
        );
        assert_eq!(finished_count(&events), 1);
        assert_eq!(engine.state(), EngineState::Failed);
        assert_eq!(*protocol.resets.lock(), 1);

        let (_, outcome) = engine
            .start(vec![Step::new("C", 1, 500.0, 100.0)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_reset_waits_for_slow_hardware_abort() {
        let protocol = ScriptedProtocol::with_abort_delay(Duration::from_millis(100));
        let engine = SequenceEngine::new(protocol.clone());
        let run = engine
            .start(vec![Step::new("A", 1, 500.0, 100.0).with_incubation(1.0)])
            .unwrap();

        let started = Instant::now();
        let (events, outcome) = run_and_abort_on_incubation(run).await;

        assert_eq!(outcome, RunOutcome::Aborted);
        assert_eq!(finished_count(&events), 1);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(*protocol.aborts.lock(), 1);
        assert_eq!(*protocol.resets.lock(), 1);
        assert!(!protocol.hardware_aborted.load(Ordering::SeqCst));
        assert!(!engine.abort_handle().is_raised());
    }

    #[tokio::test]
    async fn test_abort_while_idle_is_ignored() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol.clone());
        engine.abort().await;

        assert_eq!(*protocol.aborts.lock(), 0);
        assert!(!protocol.hardware_aborted.load(Ordering::SeqCst));
        assert!(!engine.abort_handle().is_raised());

        let (events, outcome) = engine
            .start(vec![Step::new("A", 1, 500.0, 100.0).with_repeat(2)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(errors(&events).is_empty());
        assert_eq!(*protocol.calls.lock(), vec!["A", "A"]);
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_abort_next_run() {
        let protocol = ScriptedProtocol::new();
        let engine = SequenceEngine::new(protocol.clone()).with_incubation_scale(0.0);
        let first = engine.start(vec![Step::new("A", 1, 500.0, 100.0)]).unwrap();
        let stale = first.abort_handle();
        assert_eq!(first.join().await.unwrap(), RunOutcome::Completed);

        stale.abort().await;
        assert_eq!(*protocol.aborts.lock(), 0);

        let (_, outcome) = engine
            .start(vec![Step::new("B", 1, 500.0, 100.0)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
    }
}
