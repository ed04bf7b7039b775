//! In-process doubles shared by the unit tests.

use crate::events::EventSink;
use crate::remote::{RemoteAck, RemoteError, ReportsRemote};
use report_registry::ReportV1;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RemoteState {
    script: VecDeque<Result<RemoteAck, RemoteError>>,
    fallback: Option<Result<RemoteAck, RemoteError>>,
    calls: Vec<String>,
    stored: HashSet<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    in_flight_total: usize,
    max_in_flight_total: usize,
}

/// Remote that answers from a script, then succeeds (or repeats a fallback).
/// Successful creates are idempotent on id like the real server.
#[derive(Clone, Default)]
pub struct ScriptedRemote {
    state: Arc<Mutex<RemoteState>>,
    delay: Duration,
}

impl ScriptedRemote {
    pub fn always(result: Result<RemoteAck, RemoteError>) -> Self {
        let remote = Self::default();
        remote.state.lock().expect("lock").fallback = Some(result);
        remote
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, result: Result<RemoteAck, RemoteError>) {
        self.state.lock().expect("lock").script.push_back(result);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("lock").calls.clone()
    }

    pub fn max_concurrent_for(&self, id: &str) -> usize {
        self.state
            .lock()
            .expect("lock")
            .max_in_flight
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of calls in flight at once, across all ids.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().expect("lock").max_in_flight_total
    }
}

impl ReportsRemote for ScriptedRemote {
    async fn create_report(&self, report: &ReportV1) -> Result<RemoteAck, RemoteError> {
        {
            let mut state = self.state.lock().expect("lock");
            state.calls.push(report.id.clone());
            let now_in_flight = {
                let n = state.in_flight.entry(report.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let max = state.max_in_flight.entry(report.id.clone()).or_insert(0);
            *max = (*max).max(now_in_flight);
            state.in_flight_total += 1;
            state.max_in_flight_total = state.max_in_flight_total.max(state.in_flight_total);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut state = self.state.lock().expect("lock");
        if let Some(n) = state.in_flight.get_mut(&report.id) {
            *n -= 1;
        }
        state.in_flight_total -= 1;
        let scripted = state.script.pop_front();
        let result = scripted
            .or_else(|| state.fallback.clone())
            .unwrap_or(Ok(RemoteAck::Created));
        match result {
            Ok(_) => {
                if state.stored.insert(report.id.clone()) {
                    Ok(RemoteAck::Created)
                } else {
                    Ok(RemoteAck::Duplicate)
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Clone, Default)]
pub struct CaptureSink {
    seen: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl CaptureSink {
    pub fn names(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("lock")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn events_for(&self, report_id: &str) -> Vec<String> {
        self.seen
            .lock()
            .expect("lock")
            .iter()
            .filter(|(_, payload)| payload.get("id").and_then(serde_json::Value::as_str) == Some(report_id))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl EventSink for CaptureSink {
    fn emit_json(&self, event: &str, payload: serde_json::Value) {
        if let Ok(mut guard) = self.seen.lock() {
            guard.push((event.to_string(), payload));
        }
    }
}
