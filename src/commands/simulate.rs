// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Replays a scenario of lock requests against a fresh registry.
//!
//! A scenario file declares locks in `[[lock]]` tables and the operations to
//! apply to them in `[[step]]` tables:
//!
//! ```toml
//! [[lock]]
//! name = "writer"
//! persistence = "temporary"
//! origin = "https://a.example"
//! client = "idb"
//! exclusive = true
//!
//! [[step]]
//! action = "acquire"
//! lock = "writer"
//! ```

use crate::config::QuotaLockConfig;
use crate::error::{QuotaLockError, Result};
use crate::locking::{
    AcquirePromise, ClientType, DirectoryLock, DirectoryLockCategory, InvalidationHandler, LockId,
    LockIdsByClient, LockKind, LockRegistry, LockRegistryObserver, LockSnapshot, LockState,
    OriginMetadata, OriginScope, PersistenceScope,
};
use colored::Colorize;
use comfy_table::{Cell, Color, Table};
use log::debug;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// A lock declared by a scenario.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockSpec {
    pub name: String,
    #[serde(default = "wildcard")]
    pub persistence: String,
    #[serde(default = "wildcard")]
    pub origin: String,
    /// Omitted for locks covering every client.
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Releases the lock from its invalidation handler.
    #[serde(default)]
    pub release_on_invalidate: bool,
}

fn wildcard() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepAction {
    Acquire,
    AcquireImmediately,
    Release,
    Invalidate,
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StepAction::Acquire => "acquire",
            StepAction::AcquireImmediately => "acquire-immediately",
            StepAction::Release => "release",
            StepAction::Invalidate => "invalidate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub action: StepAction,
    pub lock: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default, rename = "lock")]
    pub locks: Vec<LockSpec>,
    #[serde(default, rename = "step")]
    pub steps: Vec<StepSpec>,
}

impl Scenario {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| QuotaLockError::ScenarioError(format!("Failed to parse scenario: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        debug!("Loaded scenario from {path:?}");
        Self::parse(&contents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum StepOutcome {
    Granted,
    Waiting { blocked_on: Vec<String> },
    Rejected { reason: String },
    Released,
    Invalidated,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub action: StepAction,
    pub lock: String,
    pub outcome: StepOutcome,
    /// Side effects observed while the step ran, such as other locks being
    /// granted or rejected.
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockReport {
    pub name: String,
    #[serde(flatten)]
    pub snapshot: LockSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub steps: Vec<StepReport>,
    pub locks: Vec<LockReport>,
}

impl SimulationReport {
    pub fn lock(&self, name: &str) -> Option<&LockSnapshot> {
        self.locks
            .iter()
            .find(|report| report.name == name)
            .map(|report| &report.snapshot)
    }
}

#[derive(Default)]
struct EventLog {
    events: RefCell<Vec<String>>,
}

impl EventLog {
    fn push(&self, event: String) {
        self.events.borrow_mut().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

impl LockRegistryObserver for EventLog {
    fn on_origin_released(&self, metadata: &OriginMetadata) {
        self.push(format!(
            "origin {} released ({})",
            metadata.origin, metadata.persistence_type
        ));
    }

    fn on_abort_requested(&self, lock_ids: &LockIdsByClient) {
        for (client, ids) in lock_ids {
            self.push(format!("abort requested for {client} locks {ids:?}"));
        }
    }
}

struct ReleaseOnInvalidate;

impl InvalidationHandler for ReleaseOnInvalidate {
    fn lock_invalidated(&self, lock: &DirectoryLock) {
        lock.release();
    }
}

struct TrackedLock {
    name: String,
    lock: DirectoryLock,
    promise: Option<AcquirePromise>,
    reported: bool,
}

/// Drives one scenario against its own registry.
struct Simulation {
    events: Rc<EventLog>,
    /// Locks only hold their invalidation handler weakly.
    _release_handler: Rc<ReleaseOnInvalidate>,
    locks: Vec<TrackedLock>,
}

impl Drop for Simulation {
    fn drop(&mut self) {
        for tracked in self.locks.iter().rev() {
            tracked.lock.release();
        }
    }
}

impl Simulation {
    fn new(config: &QuotaLockConfig, scenario: &Scenario) -> Result<Self> {
        let events = Rc::new(EventLog::default());
        let registry = LockRegistry::with_observer(config.locking.clone(), events.clone());
        let release_handler = Rc::new(ReleaseOnInvalidate);

        let mut locks: Vec<TrackedLock> = Vec::with_capacity(scenario.locks.len());
        for lock_spec in &scenario.locks {
            if locks.iter().any(|tracked| tracked.name == lock_spec.name) {
                return Err(QuotaLockError::ScenarioError(format!(
                    "lock '{}' is declared twice",
                    lock_spec.name
                )));
            }

            let lock = build_lock(&registry, lock_spec)?;
            if lock_spec.release_on_invalidate {
                lock.on_invalidate(&release_handler);
            }
            locks.push(TrackedLock {
                name: lock_spec.name.clone(),
                lock,
                promise: None,
                reported: false,
            });
        }

        Ok(Self {
            events,
            _release_handler: release_handler,
            locks,
        })
    }

    fn index_of(&self, name: &str, step: usize) -> Result<usize> {
        self.locks
            .iter()
            .position(|tracked| tracked.name == name)
            .ok_or_else(|| {
                QuotaLockError::ScenarioError(format!("step {step} names unknown lock '{name}'"))
            })
    }

    fn name_of(&self, id: LockId) -> String {
        self.locks
            .iter()
            .find(|tracked| tracked.lock.id() == id)
            .map(|tracked| tracked.name.clone())
            .unwrap_or_else(|| format!("#{id}"))
    }

    fn run(&mut self, steps: &[StepSpec]) -> Result<SimulationReport> {
        let mut reports = Vec::with_capacity(steps.len());
        for (offset, step_spec) in steps.iter().enumerate() {
            let step = offset + 1;
            let index = self.index_of(&step_spec.lock, step)?;
            let outcome = self.apply(index, step_spec.action, step)?;
            let mut events = self.events.take();
            events.extend(self.collect_settlements());
            reports.push(StepReport {
                step,
                action: step_spec.action,
                lock: step_spec.lock.clone(),
                outcome,
                events,
            });
        }

        let locks = self
            .locks
            .iter()
            .map(|tracked| LockReport {
                name: tracked.name.clone(),
                snapshot: tracked.lock.snapshot(),
            })
            .collect();

        Ok(SimulationReport {
            steps: reports,
            locks,
        })
    }

    fn apply(&mut self, index: usize, action: StepAction, step: usize) -> Result<StepOutcome> {
        let name = self.locks[index].name.clone();
        let lock = self.locks[index].lock.clone();

        match action {
            StepAction::Acquire => {
                if self.locks[index].promise.is_none() && lock.state() != LockState::Created {
                    return Err(QuotaLockError::ScenarioError(format!(
                        "step {step}: lock '{name}' cannot be acquired while {}",
                        lock.state()
                    )));
                }

                let promise = lock.acquire();
                let tracked = &mut self.locks[index];
                if promise.is_settled() {
                    tracked.reported = true;
                }
                tracked.promise = Some(promise.clone());

                Ok(match promise.outcome() {
                    Some(Ok(())) => StepOutcome::Granted,
                    Some(Err(rejection)) => StepOutcome::Rejected {
                        reason: rejection.to_string(),
                    },
                    None => StepOutcome::Waiting {
                        blocked_on: lock
                            .blocked_on_ids()
                            .into_iter()
                            .map(|id| self.name_of(id))
                            .collect(),
                    },
                })
            }
            StepAction::AcquireImmediately => {
                if self.locks[index].promise.is_some() || lock.state() != LockState::Created {
                    return Err(QuotaLockError::ScenarioError(format!(
                        "step {step}: lock '{name}' cannot be acquired immediately while {}",
                        lock.state()
                    )));
                }

                let blockers: Vec<String> = lock
                    .locks_must_wait_for()
                    .iter()
                    .map(|blocker| self.name_of(blocker.id()))
                    .collect();
                if !blockers.is_empty() {
                    return Err(QuotaLockError::ScenarioError(format!(
                        "step {step}: lock '{name}' conflicts with {}",
                        blockers.join(", ")
                    )));
                }

                lock.acquire_immediately();
                Ok(StepOutcome::Granted)
            }
            StepAction::Release => {
                lock.release();
                Ok(StepOutcome::Released)
            }
            StepAction::Invalidate => {
                lock.invalidate();
                Ok(StepOutcome::Invalidated)
            }
        }
    }

    /// Reports acquisitions that settled as a side effect of the last step.
    fn collect_settlements(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        for tracked in self.locks.iter_mut().filter(|tracked| !tracked.reported) {
            let Some(outcome) = tracked.promise.as_ref().and_then(|p| p.outcome()) else {
                continue;
            };
            tracked.reported = true;
            events.push(match outcome {
                Ok(()) => format!("lock '{}' granted", tracked.name),
                Err(rejection) => format!("lock '{}' rejected: {rejection}", tracked.name),
            });
        }
        events
    }
}

fn build_lock(registry: &LockRegistry, lock_spec: &LockSpec) -> Result<DirectoryLock> {
    let persistence: PersistenceScope = lock_spec.persistence.parse()?;
    let origin: OriginScope = lock_spec.origin.parse()?;
    let client = lock_spec
        .client
        .as_deref()
        .map(str::parse::<ClientType>)
        .transpose()?;
    let category = lock_spec
        .category
        .as_deref()
        .map(str::parse::<DirectoryLockCategory>)
        .transpose()?
        .unwrap_or_default();
    let kind = LockKind::from_exclusive(lock_spec.exclusive);

    if let Some(client) = client {
        if !registry.client_type_in_range(client) {
            return Err(QuotaLockError::ScenarioError(format!(
                "lock '{}': client type {client} is disabled by configuration",
                lock_spec.name
            )));
        }
    }

    if lock_spec.internal {
        return Ok(DirectoryLock::internal(
            registry,
            persistence,
            origin,
            client,
            kind,
            category,
        ));
    }

    let invalid = |what: &str| {
        QuotaLockError::ScenarioError(format!(
            "lock '{}': external locks need {what}",
            lock_spec.name
        ))
    };
    let persistence_type = persistence
        .value()
        .ok_or_else(|| invalid("a single persistence type"))?;
    let origin = origin.origin().ok_or_else(|| invalid("a single origin"))?;
    let client = client.ok_or_else(|| invalid("a client type"))?;
    if category != DirectoryLockCategory::None {
        return Err(invalid("the 'none' category"));
    }

    let mut metadata = OriginMetadata::from_origin(origin, persistence_type);
    if let Some(group) = &lock_spec.group {
        metadata = metadata.with_group(group.as_str());
    }
    if metadata.group.is_empty() {
        return Err(invalid("a group"));
    }
    if metadata.storage_origin.is_empty() {
        return Err(invalid("a storage origin"));
    }

    Ok(DirectoryLock::for_client(
        registry,
        persistence_type,
        &metadata,
        client,
        kind,
    ))
}

/// Runs a scenario and returns its report without printing anything.
pub fn run_scenario(config: &QuotaLockConfig, scenario: &Scenario) -> Result<SimulationReport> {
    let mut simulation = Simulation::new(config, scenario)?;
    simulation.run(&scenario.steps)
}

pub struct SimulateCommand<'a> {
    config: &'a QuotaLockConfig,
}

impl<'a> SimulateCommand<'a> {
    pub fn new(config: &'a QuotaLockConfig) -> Result<Self> {
        Ok(Self { config })
    }

    pub fn execute(&self, scenario_path: &Path, json: bool) -> Result<()> {
        let scenario = Scenario::load(scenario_path)?;
        let report = run_scenario(self.config, &scenario)?;

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        for step in &report.steps {
            print_step(step);
        }
        println!();
        println!("{}", render_table(&report));
        Ok(())
    }
}

fn print_step(step: &StepReport) {
    let outcome = match &step.outcome {
        StepOutcome::Granted => "granted".green().bold(),
        StepOutcome::Waiting { blocked_on } => {
            format!("waiting on {}", blocked_on.join(", ")).yellow()
        }
        StepOutcome::Rejected { reason } => format!("rejected ({reason})").red().bold(),
        StepOutcome::Released => "released".cyan(),
        StepOutcome::Invalidated => "invalidated".red(),
    };
    println!(
        "{} {} {}: {outcome}",
        format!("[{}]", step.step).dimmed(),
        step.action,
        step.lock.bold()
    );
    for event in &step.events {
        println!("    {} {event}", "->".dimmed());
    }
}

fn render_table(report: &SimulationReport) -> Table {
    let names: HashMap<LockId, &str> = report
        .locks
        .iter()
        .map(|lock| (lock.snapshot.id, lock.name.as_str()))
        .collect();
    let name_list = |ids: &[LockId]| {
        ids.iter()
            .map(|id| names.get(id).map_or_else(|| format!("#{id}"), |n| n.to_string()))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_BORDERS_ONLY);
    table.set_header(vec![
        Cell::new("Lock"),
        Cell::new("Id"),
        Cell::new("Scope"),
        Cell::new("Kind"),
        Cell::new("State"),
        Cell::new("Blocked On"),
    ]);

    for lock in &report.locks {
        let snapshot = &lock.snapshot;
        let state_color = match snapshot.state {
            LockState::Acquired => Color::Green,
            LockState::Waiting => Color::Yellow,
            LockState::Dropped { .. } => Color::DarkGrey,
            LockState::Created => Color::Reset,
        };
        let mut state = snapshot.state.to_string();
        if snapshot.invalidated {
            state.push_str(" (invalidated)");
        }
        let kind = if snapshot.internal {
            format!("{} internal", snapshot.kind)
        } else {
            snapshot.kind.to_string()
        };

        table.add_row(vec![
            Cell::new(&lock.name),
            Cell::new(snapshot.id),
            Cell::new(&snapshot.scope),
            Cell::new(kind),
            Cell::new(state).fg(state_color),
            Cell::new(name_list(&snapshot.blocked_on)),
        ]);
    }

    table
}
