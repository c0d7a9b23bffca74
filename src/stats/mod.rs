//! Sample records emitted by VUs into the external stats sink.
//!
//! The VU never aggregates. Every finished request (including redirect hops
//! and failed attempts) and every iteration becomes one [`Metric`] sent over a
//! `crossbeam_channel` to whatever pipeline the orchestrator attached.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::vu::Identity;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct RequestTimings {
    pub sending: Duration,
    pub waiting: Duration,
    pub receiving: Duration,
    pub duration: Duration,
    pub request_size: usize,
    pub response_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Metric {
    Request {
        name: String,
        method: String,
        url: String,
        /// 0 when no response was received.
        status: u16,
        timings: RequestTimings,
        error: Option<String>,
        vu: i64,
        iteration: i64,
        tags: HashMap<String, String>,
    },
    Iteration {
        vu: i64,
        iteration: i64,
        duration: Duration,
        error: Option<String>,
        tags: HashMap<String, String>,
    },
}

impl Metric {
    pub fn is_error(&self) -> bool {
        match self {
            Metric::Request { error, .. } | Metric::Iteration { error, .. } => error.is_some(),
        }
    }
}

/// Outcome of one HTTP round trip, as handed to [`Collector::request`].
pub struct RequestSample<'a> {
    pub name: Option<&'a str>,
    pub method: &'a str,
    pub url: &'a str,
    pub status: u16,
    pub timings: RequestTimings,
    pub error: Option<String>,
    pub tags: &'a HashMap<String, String>,
}

/// Per-VU handle on the stats sink. Stamps every metric with the VU identity
/// and the configured tags. Sends never block and never fail the script.
#[derive(Clone)]
pub struct Collector {
    tx: Option<Sender<Metric>>,
    identity: Arc<Identity>,
    tags: Arc<HashMap<String, String>>,
}

impl Collector {
    pub(crate) fn new(
        tx: Option<Sender<Metric>>,
        identity: Arc<Identity>,
        tags: HashMap<String, String>,
    ) -> Self {
        Self {
            tx,
            identity,
            tags: Arc::new(tags),
        }
    }

    fn merged_tags(&self, extra: &HashMap<String, String>) -> HashMap<String, String> {
        if extra.is_empty() {
            return (*self.tags).clone();
        }
        let mut tags = (*self.tags).clone();
        tags.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags
    }

    fn send(&self, metric: Metric) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(metric);
        }
    }

    pub fn request(&self, sample: RequestSample<'_>) {
        let tags = self.merged_tags(sample.tags);
        self.send(Metric::Request {
            name: sample.name.unwrap_or(sample.url).to_string(),
            method: sample.method.to_string(),
            url: sample.url.to_string(),
            status: sample.status,
            timings: sample.timings,
            error: sample.error,
            vu: self.identity.id(),
            iteration: self.identity.iteration(),
            tags,
        });
    }

    pub fn iteration(&self, duration: Duration, error: Option<String>) {
        self.send(Metric::Iteration {
            vu: self.identity.id(),
            iteration: self.identity.iteration(),
            duration,
            error,
            tags: (*self.tags).clone(),
        });
    }
}
