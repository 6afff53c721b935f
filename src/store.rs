//! Per-robot state registry.
//!
//! Every inbound connection or telemetry message for a roster robot is merged
//! here. Merges are rejected when their `headerId` is not newer than the one
//! already stored. Connection-state changes are reported to registered
//! [`TransitionListener`]s once the write lock has been released, so a
//! listener may read the store again without deadlocking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::protocol::{
    ActionState, BatteryState, ConnectionState, ErrorInfo, RobotUpdate, StateMessage, Velocity,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RobotIdentity {
    pub serial: String,
    pub manufacturer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub map_id: String,
    pub localization_score: f64,
    pub initialized: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Battery {
    pub charge: f64,
    pub voltage: f64,
    pub charging: bool,
}

/// Operational data derived from detailed telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationalSnapshot {
    pub order_id: String,
    pub order_update_id: u64,
    pub order_started_at: Option<DateTime<Utc>>,
    pub driving: bool,
    pub paused: bool,
    pub operating_mode: String,
    pub last_node_id: String,
    pub last_node_sequence_id: u64,
    pub position: Option<Position>,
    pub battery: Option<Battery>,
    pub battery_state: Option<BatteryState>,
    pub velocity: Option<Velocity>,
    pub active_actions: Vec<ActionState>,
    pub last_error: Option<ErrorInfo>,
    pub safety_violation: bool,
}

impl OperationalSnapshot {
    pub fn is_executing_order(&self) -> bool {
        !self.order_id.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotRecord {
    pub identity: RobotIdentity,
    pub connection_state: ConnectionState,
    pub registered_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub last_header_id: u64,
    pub has_factsheet: bool,
    pub factsheet_received_at: Option<DateTime<Utc>>,
    pub detail: Option<OperationalSnapshot>,
}

impl RobotRecord {
    // First sighting is treated as coming from OFFLINE so an ONLINE first
    // message is reported as a transition.
    fn new(identity: RobotIdentity, header_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            connection_state: ConnectionState::Offline,
            registered_at: now,
            last_update: now,
            last_header_id: header_id,
            has_factsheet: false,
            factsheet_received_at: None,
            detail: None,
        }
    }

    pub fn serial(&self) -> &str {
        &self.identity.serial
    }

    pub fn is_online(&self) -> bool {
        self.connection_state == ConnectionState::Online
    }

    pub fn has_detailed_info(&self) -> bool {
        self.detail.is_some()
    }

    pub fn is_executing_order(&self) -> bool {
        self.detail.as_ref().is_some_and(OperationalSnapshot::is_executing_order)
    }

    pub fn has_issues(&self) -> bool {
        self.detail
            .as_ref()
            .is_some_and(|d| d.last_error.is_some() || d.safety_violation)
    }

    pub fn battery_charge(&self) -> Option<f64> {
        self.detail.as_ref()?.battery.map(|b| b.charge)
    }
}

/// A change of a robot's reported connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub serial: String,
    pub manufacturer: String,
    pub old: ConnectionState,
    pub new: ConnectionState,
}

impl StateTransition {
    pub fn came_online(&self) -> bool {
        self.old != ConnectionState::Online && self.new == ConnectionState::Online
    }
}

pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, transition: &StateTransition);
}

impl<F> TransitionListener for F
where
    F: Fn(&StateTransition) + Send + Sync,
{
    fn on_transition(&self, transition: &StateTransition) {
        self(transition);
    }
}

/// Result of a single merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    NotTarget,
    Stale { stored: u64, received: u64 },
    Applied {
        created: bool,
        transition: Option<StateTransition>,
    },
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveOrder {
    pub order_id: String,
    pub driving: bool,
    pub paused: bool,
    pub active_actions: usize,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub target: usize,
    pub registered: usize,
    pub online: usize,
    pub executing: usize,
    pub with_issues: usize,
    pub with_factsheet: usize,
}

pub struct RobotStateStore {
    roster: HashSet<String>,
    records: RwLock<HashMap<String, RobotRecord>>,
    listeners: RwLock<Vec<Arc<dyn TransitionListener>>>,
}

impl RobotStateStore {
    pub fn new<I, S>(roster: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roster: roster.into_iter().map(Into::into).collect(),
            records: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TransitionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_target(&self, serial: &str) -> bool {
        self.roster.contains(serial)
    }

    pub fn target_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.roster.iter().cloned().collect();
        serials.sort();
        serials
    }

    pub fn merge(&self, update: &RobotUpdate) -> MergeOutcome {
        let serial = update.serial();
        if !self.is_target(serial) {
            debug!(serial = %serial, "ignoring update for robot outside the roster");
            return MergeOutcome::NotTarget;
        }

        let header_id = update.header_id();
        let now = Utc::now();

        let (created, transition) = {
            let mut records = self.records.write();

            let created = !records.contains_key(serial);
            let record = records.entry(serial.to_string()).or_insert_with(|| {
                RobotRecord::new(
                    RobotIdentity {
                        serial: serial.to_string(),
                        manufacturer: update.manufacturer().to_string(),
                    },
                    header_id,
                    now,
                )
            });

            if !created && header_id <= record.last_header_id {
                debug!(
                    serial = %serial,
                    stored = record.last_header_id,
                    received = header_id,
                    "discarding stale update"
                );
                return MergeOutcome::Stale {
                    stored: record.last_header_id,
                    received: header_id,
                };
            }

            let old = record.connection_state;
            record.last_header_id = header_id;
            record.last_update = now;

            if let Some(state) = update.connection_state() {
                record.connection_state = state;
            }
            if let RobotUpdate::State(msg) = update {
                let detail = record.detail.get_or_insert_with(OperationalSnapshot::default);
                apply_detail(detail, msg, now);
            }

            let new = record.connection_state;
            let transition = (old != new).then(|| StateTransition {
                serial: serial.to_string(),
                manufacturer: record.identity.manufacturer.clone(),
                old,
                new,
            });
            (created, transition)
        };

        if created {
            info!(serial = %serial, header_id, "✅ registered robot");
        }

        if let Some(transition) = &transition {
            info!(
                serial = %serial,
                old = %transition.old,
                new = %transition.new,
                "🔄 robot connection state changed"
            );
            let listeners: Vec<Arc<dyn TransitionListener>> = self.listeners.read().clone();
            for listener in listeners {
                listener.on_transition(transition);
            }
        }

        MergeOutcome::Applied {
            created,
            transition,
        }
    }

    /// Record that a factsheet arrived. Unknown robots are ignored.
    pub fn mark_factsheet_received(&self, serial: &str) -> bool {
        let mut records = self.records.write();
        match records.get_mut(serial) {
            Some(record) => {
                record.has_factsheet = true;
                record.factsheet_received_at = Some(Utc::now());
                info!(serial = %serial, "📋 factsheet received");
                true
            }
            None => {
                warn!(serial = %serial, "factsheet for unregistered robot");
                false
            }
        }
    }

    pub fn snapshot(&self, serial: &str) -> Option<RobotRecord> {
        self.records.read().get(serial).cloned()
    }

    pub fn snapshot_all(&self) -> HashMap<String, RobotRecord> {
        self.records.read().clone()
    }

    pub fn is_online(&self, serial: &str) -> bool {
        self.records
            .read()
            .get(serial)
            .is_some_and(RobotRecord::is_online)
    }

    pub fn manufacturer_of(&self, serial: &str) -> Option<String> {
        self.records
            .read()
            .get(serial)
            .map(|r| r.identity.manufacturer.clone())
    }

    fn filtered<P>(&self, predicate: P) -> Vec<RobotRecord>
    where
        P: Fn(&RobotRecord) -> bool,
    {
        let records = self.records.read();
        let mut out: Vec<RobotRecord> = records
            .values()
            .filter(|r| self.is_target(r.serial()) && predicate(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.identity.serial.cmp(&b.identity.serial));
        out
    }

    pub fn online_robots(&self) -> Vec<String> {
        self.filtered(RobotRecord::is_online)
            .into_iter()
            .map(|r| r.identity.serial)
            .collect()
    }

    pub fn registered_target_robots(&self) -> Vec<RobotRecord> {
        self.filtered(|_| true)
    }

    pub fn missing_target_robots(&self) -> Vec<String> {
        let records = self.records.read();
        let mut missing: Vec<String> = self
            .roster
            .iter()
            .filter(|s| !records.contains_key(s.as_str()))
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    pub fn executing_robots(&self) -> Vec<RobotRecord> {
        self.filtered(RobotRecord::is_executing_order)
    }

    pub fn robots_with_issues(&self) -> Vec<RobotRecord> {
        self.filtered(RobotRecord::has_issues)
    }

    /// Robots reporting a charge above zero and below `threshold` percent.
    pub fn low_battery_robots(&self, threshold: f64) -> Vec<RobotRecord> {
        self.filtered(|r| r.battery_charge().is_some_and(|c| c > 0.0 && c < threshold))
    }

    pub fn robots_with_detailed_info(&self) -> Vec<RobotRecord> {
        self.filtered(RobotRecord::has_detailed_info)
    }

    pub fn battery_status(&self) -> HashMap<String, BatteryState> {
        self.filtered(|_| true)
            .into_iter()
            .filter_map(|r| {
                let battery = r.detail?.battery_state?;
                Some((r.identity.serial, battery))
            })
            .collect()
    }

    pub fn active_orders(&self) -> HashMap<String, ActiveOrder> {
        self.executing_robots()
            .into_iter()
            .filter_map(|r| {
                let detail = r.detail?;
                Some((
                    r.identity.serial,
                    ActiveOrder {
                        order_id: detail.order_id,
                        driving: detail.driving,
                        paused: detail.paused,
                        active_actions: detail.active_actions.len(),
                        started_at: detail.order_started_at,
                    },
                ))
            })
            .collect()
    }

    pub fn fleet_summary(&self) -> FleetSummary {
        let registered = self.registered_target_robots();
        FleetSummary {
            target: self.roster.len(),
            registered: registered.len(),
            online: registered.iter().filter(|r| r.is_online()).count(),
            executing: registered.iter().filter(|r| r.is_executing_order()).count(),
            with_issues: registered.iter().filter(|r| r.has_issues()).count(),
            with_factsheet: registered.iter().filter(|r| r.has_factsheet).count(),
        }
    }
}

fn apply_detail(detail: &mut OperationalSnapshot, msg: &StateMessage, now: DateTime<Utc>) {
    if let Some(order_id) = &msg.order_id {
        if order_id.is_empty() {
            detail.order_started_at = None;
        } else if *order_id != detail.order_id || detail.order_started_at.is_none() {
            detail.order_started_at = Some(now);
        }
        detail.order_id.clone_from(order_id);
    }
    if let Some(id) = msg.order_update_id {
        detail.order_update_id = id;
    }
    if let Some(driving) = msg.driving {
        detail.driving = driving;
    }
    if let Some(paused) = msg.paused {
        detail.paused = paused;
    }
    if let Some(mode) = &msg.operating_mode {
        detail.operating_mode.clone_from(mode);
    }
    if let Some(node) = &msg.last_node_id {
        detail.last_node_id.clone_from(node);
    }
    if let Some(seq) = msg.last_node_sequence_id {
        detail.last_node_sequence_id = seq;
    }
    if let Some(pos) = &msg.agv_position {
        detail.position = Some(Position {
            x: pos.x,
            y: pos.y,
            theta: pos.theta,
            map_id: pos.map_id.clone(),
            localization_score: pos.localization_score,
            initialized: pos.position_initialized,
        });
    }
    if let Some(battery) = &msg.battery_state {
        detail.battery = Some(Battery {
            charge: battery.battery_charge,
            voltage: battery.battery_voltage,
            charging: battery.charging,
        });
        detail.battery_state = Some(battery.clone());
    }
    if let Some(velocity) = msg.velocity {
        detail.velocity = Some(velocity);
    }
    if let Some(actions) = &msg.action_states {
        detail.active_actions.clone_from(actions);
    }
    if let Some(safety) = &msg.safety_state {
        detail.safety_violation = safety.is_violated();
    }

    // Cleared whenever a detailed message reports no error.
    detail.last_error = msg.errors.as_ref().and_then(|e| e.first()).cloned();
}
