//! Shared test transport.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use repsync::traits::Transport;
use repsync::{Request, Result, SyncError};
use serde_json::{Value, json};
use tokio::time::Instant;

/// One recorded transport call.
#[derive(Debug, Clone)]
pub struct Call {
    pub route: String,
    pub request: Request,
    pub at: Instant,
}

/// Transport answering from per-route scripts.
///
/// Routes are the cache key for reads, `kind/id` for writes and the source
/// for fetches. Once a route's script runs dry: writes echo their body,
/// reads return `{"resource": .., "call": n}`, fetches fail as unreachable.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value>>>>,
    latency: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses for a route.
    pub fn script(&self, route: &str, responses: impl IntoIterator<Item = Result<Value>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .extend(responses);
    }

    /// Queue `n` copies of the same failure.
    pub fn fail(&self, route: &str, n: usize, error: SyncError) {
        self.script(route, std::iter::repeat_n(Err(error), n));
    }

    /// Make every call on `route` take `latency` before answering.
    pub fn slow(&self, route: &str, latency: Duration) {
        self.latency
            .lock()
            .unwrap()
            .insert(route.to_string(), latency);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, route: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.route == route)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Bodies of every write, in send order.
    pub fn writes(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c.request {
                Request::Write { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }
}

fn route(request: &Request) -> String {
    match request {
        Request::Read(descriptor) => descriptor.key().to_string(),
        Request::Write { entity, .. } => entity.to_string(),
        Request::Fetch { source } => source.clone(),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn perform(&self, request: &Request) -> Result<Value> {
        let route = route(request);
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                route: route.clone(),
                request: request.clone(),
                at: Instant::now(),
            });
            calls.iter().filter(|c| c.route == route).count()
        };

        let latency = self.latency.lock().unwrap().get(&route).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&route)
            .and_then(VecDeque::pop_front);
        if let Some(response) = scripted {
            return response;
        }

        match request {
            Request::Write { body, .. } => Ok(body.clone()),
            Request::Read(descriptor) => Ok(json!({
                "resource": descriptor.resource,
                "call": call_number,
            })),
            Request::Fetch { source } => Err(SyncError::Unreachable(format!("{source} is down"))),
        }
    }
}
