//! Real-time indicators derived from the client event stream.
//!
//! Each connection carries a small set of computed scalar values (ping
//! gap, log-level counts, battery level). Every indicator type implements
//! its own update rule over the events it observes; crossing into a
//! stricter threshold raises an incident toward registered observers.
//! `reset` recomputes a connection's values from the persisted event
//! history, the canonical recovery path after process state loss.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::event::{ClientEvent, EventType};
use crate::store::{EventHistoryStore, StoreError};
use crate::types::ExamId;

// ============================================================================
// Indicator Definitions
// ============================================================================

/// The closed set of indicator types. Each variant carries its own update
/// rule; dispatch is a match, not an inheritance chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndicatorType {
    LastPing,
    ErrorCount,
    WarnCount,
    InfoCount,
    BatteryStatus,
    WlanStatus,
}

impl IndicatorType {
    /// Event types this indicator subscribes to.
    pub fn observed_event_types(&self) -> &'static [EventType] {
        match self {
            IndicatorType::LastPing => &[EventType::Ping],
            IndicatorType::ErrorCount => &[EventType::ErrorLog],
            IndicatorType::WarnCount => &[EventType::WarnLog],
            IndicatorType::InfoCount => &[EventType::InfoLog],
            IndicatorType::BatteryStatus | IndicatorType::WlanStatus => &[EventType::InfoLog],
        }
    }

    /// Status indicators read the most recent event with this fixed tag.
    fn status_tag(&self) -> Option<&'static str> {
        match self {
            IndicatorType::BatteryStatus => Some("battery"),
            IndicatorType::WlanStatus => Some("wlan"),
            _ => None,
        }
    }

    /// Whether lower values are stricter (battery and WLAN drain downward).
    fn inverse(&self) -> bool {
        matches!(self, IndicatorType::BatteryStatus | IndicatorType::WlanStatus)
    }

    fn initial_value(&self) -> f64 {
        match self {
            IndicatorType::ErrorCount | IndicatorType::WarnCount | IndicatorType::InfoCount => 0.0,
            // Undefined until the first observation.
            IndicatorType::LastPing | IndicatorType::BatteryStatus | IndicatorType::WlanStatus => {
                f64::NAN
            }
        }
    }
}

/// One step of an indicator's threshold ladder, ordered ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub value: f64,
    pub color: String,
    pub icon: Option<String>,
}

/// Per-exam indicator definition, applied to every connection of the exam.
#[derive(Debug, Clone)]
pub struct IndicatorDef {
    pub name: String,
    pub indicator_type: IndicatorType,
    /// Tag filter for log-count indicators: when set, only events carrying
    /// one of these tags are counted, and consecutive same-tag entries
    /// count once.
    pub tags: Option<Vec<String>>,
    pub thresholds: Vec<Threshold>,
}

impl IndicatorDef {
    pub fn new(name: impl Into<String>, indicator_type: IndicatorType) -> Self {
        Self {
            name: name.into(),
            indicator_type,
            tags: None,
            thresholds: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_thresholds(mut self, mut thresholds: Vec<Threshold>) -> Self {
        thresholds.sort_by(|a, b| a.value.total_cmp(&b.value));
        self.thresholds = thresholds;
        self
    }
}

// ============================================================================
// Indicator State
// ============================================================================

/// Live computed value of one (connection, indicator) pair.
#[derive(Debug, Clone)]
pub struct IndicatorState {
    def: IndicatorDef,
    value: f64,
    /// Tag of the immediately preceding observed event; the de-duplication
    /// window. `None` until the first event.
    last_tag: Option<Option<String>>,
    last_ping_time: Option<i64>,
    level: usize,
}

impl IndicatorState {
    fn new(def: IndicatorDef) -> Self {
        let value = def.indicator_type.initial_value();
        let level = threshold_level(&def, value);
        Self {
            def,
            value,
            last_tag: None,
            last_ping_time: None,
            level,
        }
    }

    pub fn indicator_type(&self) -> IndicatorType {
        self.def.indicator_type
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn current_value(&self) -> f64 {
        self.value
    }

    /// Index of the strictest threshold the current value has reached, 0
    /// when none.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Human-facing value: integer formatting, `"--"` for status
    /// indicators before their first report, empty for an undefined ping
    /// gap.
    pub fn display_value(&self) -> String {
        if self.value.is_nan() {
            return match self.def.indicator_type {
                IndicatorType::BatteryStatus | IndicatorType::WlanStatus => "--".to_string(),
                _ => String::new(),
            };
        }
        format!("{}", self.value as i64)
    }

    /// Apply one observed event. Returns the threshold crossed when the
    /// update moved the value into a stricter band.
    fn apply(&mut self, event: &ClientEvent) -> Option<Threshold> {
        match self.def.indicator_type {
            IndicatorType::LastPing => {
                if let Some(previous) = self.last_ping_time {
                    self.value = (event.server_time - previous) as f64;
                }
                self.last_ping_time = Some(event.server_time);
            }
            IndicatorType::ErrorCount | IndicatorType::WarnCount | IndicatorType::InfoCount => {
                let tag = event.tag().map(str::to_string);
                match &self.def.tags {
                    // No tag filter: every matching event counts.
                    None => self.value += 1.0,
                    Some(tags) => {
                        let in_window = self.last_tag.as_ref() == Some(&tag);
                        let counted = matches!(&tag, Some(t) if tags.contains(t));
                        if counted && !in_window {
                            self.value += 1.0;
                        }
                        self.last_tag = Some(tag);
                    }
                }
            }
            IndicatorType::BatteryStatus | IndicatorType::WlanStatus => {
                let expected = self.def.indicator_type.status_tag();
                if event.tag() == expected {
                    if let Some(value) = event.numeric_value {
                        self.value = value;
                    }
                }
            }
        }
        self.update_level()
    }

    fn update_level(&mut self) -> Option<Threshold> {
        let new_level = threshold_level(&self.def, self.value);
        let crossed = if new_level > self.level {
            // The ladder is sorted ascending; inverse indicators reach
            // their strictest threshold from the low end.
            let index = if self.def.indicator_type.inverse() {
                self.def.thresholds.len() - new_level
            } else {
                new_level - 1
            };
            self.def.thresholds.get(index).cloned()
        } else {
            None
        };
        self.level = new_level;
        crossed
    }

    /// Recompute from the persisted history, replaying the update rule
    /// without raising incidents.
    fn reset_from(&mut self, events: &[ClientEvent]) {
        self.value = self.def.indicator_type.initial_value();
        self.last_tag = None;
        self.last_ping_time = None;
        for event in events {
            if self
                .def
                .indicator_type
                .observed_event_types()
                .contains(&event.event_type)
            {
                let _ = self.apply(event);
            }
        }
        self.level = threshold_level(&self.def, self.value);
    }
}

/// Number of thresholds the value has reached or passed, comparing in
/// ascending order; inverse indicators pass thresholds going downward.
/// An undefined value sits below every threshold.
fn threshold_level(def: &IndicatorDef, value: f64) -> usize {
    if value.is_nan() {
        return 0;
    }
    if def.indicator_type.inverse() {
        def.thresholds.iter().filter(|t| value <= t.value).count()
    } else {
        def.thresholds.iter().filter(|t| value >= t.value).count()
    }
}

// ============================================================================
// Incidents
// ============================================================================

/// A threshold crossing surfaced to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub connection_token: String,
    pub indicator_type: IndicatorType,
    pub value: f64,
    pub threshold: Threshold,
}

/// Observer of threshold-crossing incidents (monitoring dashboards).
/// Raising an incident is a side effect, not a failure path.
pub trait IncidentSink: Send + Sync {
    fn on_incident(&self, incident: &Incident);
}

// ============================================================================
// Indicator Engine
// ============================================================================

/// Snapshot of one indicator for external consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorValue {
    pub name: String,
    pub indicator_type: IndicatorType,
    pub value: f64,
    pub display_value: String,
}

/// Per-connection indicator sets, built from per-exam definitions and
/// driven by [`notify_event`](IndicatorEngine::notify_event).
pub struct IndicatorEngine<H: EventHistoryStore> {
    history: Arc<H>,
    defs: RwLock<HashMap<ExamId, Vec<IndicatorDef>>>,
    states: RwLock<HashMap<String, Arc<Mutex<Vec<IndicatorState>>>>>,
    sinks: RwLock<Vec<Arc<dyn IncidentSink>>>,
}

impl<H: EventHistoryStore> IndicatorEngine<H> {
    pub fn new(history: Arc<H>) -> Self {
        Self {
            history,
            defs: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register the indicator definitions of an exam.
    pub async fn define_exam_indicators(&self, exam_id: ExamId, defs: Vec<IndicatorDef>) {
        self.defs.write().await.insert(exam_id, defs);
    }

    pub async fn add_incident_sink(&self, sink: Arc<dyn IncidentSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Build the indicator set for a connection from its exam's
    /// definitions. When the exam defines no ping indicator, a hidden one
    /// is added to keep tracking liveness.
    pub async fn init_connection(&self, connection_token: &str, exam_id: Option<ExamId>) {
        let mut defs = match exam_id {
            Some(exam_id) => self
                .defs
                .read()
                .await
                .get(&exam_id)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        };
        if !defs
            .iter()
            .any(|d| d.indicator_type == IndicatorType::LastPing)
        {
            defs.push(IndicatorDef::new("ping", IndicatorType::LastPing));
        }
        let states: Vec<IndicatorState> = defs.into_iter().map(IndicatorState::new).collect();
        self.states
            .write()
            .await
            .insert(connection_token.to_string(), Arc::new(Mutex::new(states)));
        debug!("initialized indicators for connection: {}", connection_token);
    }

    /// Dispatch an event to every indicator of the connection observing
    /// its type. Unknown connections are nothing to do.
    pub async fn notify_event(&self, connection_token: &str, event: &ClientEvent) {
        let states = {
            let map = self.states.read().await;
            map.get(connection_token).cloned()
        };
        let Some(states) = states else {
            return;
        };

        let mut incidents = Vec::new();
        {
            let mut states = states.lock().await;
            for state in states.iter_mut() {
                if !state
                    .def
                    .indicator_type
                    .observed_event_types()
                    .contains(&event.event_type)
                {
                    continue;
                }
                if let Some(threshold) = state.apply(event) {
                    incidents.push(Incident {
                        connection_token: connection_token.to_string(),
                        indicator_type: state.def.indicator_type,
                        value: state.value,
                        threshold,
                    });
                }
            }
        }

        if !incidents.is_empty() {
            let sinks = self.sinks.read().await;
            for incident in &incidents {
                warn!(
                    "indicator incident for connection {}: {:?} value {} crossed {:?}",
                    incident.connection_token,
                    incident.indicator_type,
                    incident.value,
                    incident.threshold
                );
                for sink in sinks.iter() {
                    sink.on_incident(incident);
                }
            }
        }
    }

    /// Current snapshot of a connection's indicators.
    pub async fn indicator_values(&self, connection_token: &str) -> Vec<IndicatorValue> {
        let states = {
            let map = self.states.read().await;
            map.get(connection_token).cloned()
        };
        let Some(states) = states else {
            return Vec::new();
        };
        let states = states.lock().await;
        states
            .iter()
            .map(|s| IndicatorValue {
                name: s.def.name.clone(),
                indicator_type: s.def.indicator_type,
                value: s.value,
                display_value: s.display_value(),
            })
            .collect()
    }

    /// Reload a connection's indicator values from the persisted event
    /// history. Recompute-from-source, not replay of the live stream.
    pub async fn reset(&self, connection_token: &str) -> Result<(), StoreError> {
        let states = {
            let map = self.states.read().await;
            map.get(connection_token).cloned()
        };
        let Some(states) = states else {
            return Ok(());
        };
        let mut states = states.lock().await;
        for state in states.iter_mut() {
            let events = self
                .history
                .all_for(
                    connection_token,
                    state.def.indicator_type.observed_event_types(),
                )
                .await?;
            state.reset_from(&events);
        }
        Ok(())
    }

    /// Discard the indicator state of a closing connection.
    pub async fn discard(&self, connection_token: &str) {
        self.states.write().await.remove(connection_token);
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
