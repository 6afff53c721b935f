//! Automatic follow-up commands when a robot comes online.
//!
//! Each OFFLINE/CONNECTIONBROKEN to ONLINE transition schedules a workflow:
//! wait, send `init`, wait again, send `factsheetRequest`. Every step re-checks
//! that the robot is still online and the broker still connected before it
//! sends; a failed check or failed send abandons the remaining steps.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::store::{StateTransition, TransitionListener};
use crate::translator::RobotCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub auto_init: bool,
    pub init_delay: Duration,
    pub auto_factsheet: bool,
    pub factsheet_delay: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for WorkflowSettings {
    fn from(app: &AppConfig) -> Self {
        Self {
            auto_init: app.auto_init_on_connect,
            init_delay: app.auto_init_delay(),
            auto_factsheet: app.auto_factsheet_request,
            factsheet_delay: app.factsheet_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStep {
    Init,
    FactsheetRequest,
}

impl WorkflowStep {
    fn command(self) -> RobotCommand {
        match self {
            WorkflowStep::Init => RobotCommand::Init,
            WorkflowStep::FactsheetRequest => RobotCommand::FactsheetRequest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Sent,
    SkippedOffline,
    SkippedDisconnected,
    Failed(String),
}

/// A step and the delay before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledStep {
    pub step: WorkflowStep,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowReport {
    pub serial: String,
    pub steps: Vec<(WorkflowStep, StepOutcome)>,
}

impl WorkflowReport {
    pub fn sent(&self, step: WorkflowStep) -> bool {
        self.steps
            .iter()
            .any(|(s, outcome)| *s == step && *outcome == StepOutcome::Sent)
    }
}

/// Listens on the store, which the dispatcher already owns, so the dispatcher
/// is only held weakly here.
pub struct WorkflowEngine {
    dispatcher: Weak<Dispatcher>,
    settings: WorkflowSettings,
    runtime: Handle,
    pending: Mutex<Vec<JoinHandle<WorkflowReport>>>,
}

impl WorkflowEngine {
    pub fn new(dispatcher: &Arc<Dispatcher>, settings: WorkflowSettings, runtime: Handle) -> Self {
        Self {
            dispatcher: Arc::downgrade(dispatcher),
            settings,
            runtime,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Steps run for a robot that just came online.
    pub fn plan(&self) -> Vec<ScheduledStep> {
        let mut steps = Vec::new();
        if !self.settings.auto_init {
            return steps;
        }
        steps.push(ScheduledStep {
            step: WorkflowStep::Init,
            delay: self.settings.init_delay,
        });
        if self.settings.auto_factsheet {
            steps.push(ScheduledStep {
                step: WorkflowStep::FactsheetRequest,
                delay: self.settings.factsheet_delay,
            });
        }
        steps
    }

    /// Spawn the workflow for `serial`. Returns `false` when auto-init is off.
    pub fn schedule(&self, serial: &str) -> bool {
        let steps = self.plan();
        if steps.is_empty() {
            return false;
        }

        info!(
            serial = %serial,
            delay_ms = self.settings.init_delay.as_millis() as u64,
            "🤖 robot online, scheduling auto-init"
        );

        let dispatcher = Weak::clone(&self.dispatcher);
        let serial = serial.to_string();
        let handle = self
            .runtime
            .spawn(async move { run_workflow(dispatcher, serial, steps).await });

        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
        true
    }

    /// Hand over every workflow spawned so far.
    pub fn take_pending(&self) -> Vec<JoinHandle<WorkflowReport>> {
        core::mem::take(&mut *self.pending.lock())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Abort workflows still waiting. Used on shutdown.
    pub fn abandon_all(&self) {
        let handles = self.take_pending();
        let mut abandoned = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            info!(abandoned, "abandoned pending workflows");
        }
    }
}

impl TransitionListener for WorkflowEngine {
    fn on_transition(&self, transition: &StateTransition) {
        if transition.came_online() {
            self.schedule(&transition.serial);
        }
    }
}

async fn run_workflow(
    dispatcher: Weak<Dispatcher>,
    serial: String,
    steps: Vec<ScheduledStep>,
) -> WorkflowReport {
    let mut report = WorkflowReport {
        serial,
        steps: Vec::with_capacity(steps.len()),
    };

    for scheduled in steps {
        tokio::time::sleep(scheduled.delay).await;
        let outcome = match dispatcher.upgrade() {
            Some(dispatcher) => run_step(&dispatcher, &report.serial, scheduled.step).await,
            None => {
                debug!(serial = %report.serial, "bridge dropped, workflow abandoned");
                StepOutcome::Failed("bridge dropped".to_string())
            }
        };
        let done = outcome != StepOutcome::Sent;
        report.steps.push((scheduled.step, outcome));
        if done {
            break;
        }
    }
    report
}

async fn run_step(dispatcher: &Dispatcher, serial: &str, step: WorkflowStep) -> StepOutcome {
    if !dispatcher.store().is_online(serial) {
        warn!(serial = %serial, step = ?step, "robot went offline, workflow cancelled");
        return StepOutcome::SkippedOffline;
    }
    if !dispatcher.connection().is_connected() {
        warn!(serial = %serial, step = ?step, "broker not connected, workflow cancelled");
        return StepOutcome::SkippedDisconnected;
    }

    match dispatcher.send(serial, &step.command()).await {
        Ok(_) => {
            info!(serial = %serial, step = ?step, "✅ workflow step sent");
            StepOutcome::Sent
        }
        Err(e) => {
            warn!(serial = %serial, step = ?step, error = %e, "❌ workflow step failed");
            StepOutcome::Failed(e.to_string())
        }
    }
}
