// Observed events that flow from the browser adapter into the core
//
// The tab/request observation layer is out of scope; it delivers a stream
// of pre-formed events. Using an enum allows pattern matching and keeps
// communication between the adapter and the core type-safe.

use crate::pages::PageObservation;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default capacity of the intake buffer.
pub const MAX_BUFFER_LENGTH: usize = 1024;

/// Default time a producer will buffer before declaring nobody listens.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Main event type flowing into the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")] // Creates JSON like {"type": "page_observed", ...}
pub enum ObservedEvent {
    /// A snapshot of one tab, ready for the page pipeline.
    #[serde(rename = "page_observed")]
    PageObserved { page: PageObservation },

    /// A third-party HTTP request left the browser.
    #[serde(rename = "request_observed")]
    RequestObserved {
        url: String,
        tab_url: String,
        is_private: bool,
        request_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_headers: Option<std::collections::HashMap<String, String>>,
    },

    /// The user clicked inside a tab.
    #[serde(rename = "click")]
    Click { tab_id: u32, url: String },

    /// A navigation happened (used by the activity estimator).
    #[serde(rename = "navigation")]
    Navigation { kind: NavigationKind, url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationKind {
    ForwardBack,
    Link,
    Typed,
    Reload,
    Other,
}

struct QueueState {
    buffer: VecDeque<ObservedEvent>,
    consumer: Option<mpsc::UnboundedSender<ObservedEvent>>,
    detected_errors: bool,
    opened_at: Instant,
}

/// Bounded intake buffer between the browser adapter and the core.
///
/// Events produced before a consumer attaches are buffered up to
/// [`MAX_BUFFER_LENGTH`]; overruns drop the oldest event and set the
/// error flag. If no consumer attaches within the connect timeout, the
/// buffer is discarded (the adapter keeps running, the core just missed
/// the early events and knows it).
pub struct EventQueue {
    state: Mutex<QueueState>,
    max_len: usize,
    connect_timeout: Duration,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_limits(MAX_BUFFER_LENGTH, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_limits(max_len: usize, connect_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                consumer: None,
                detected_errors: false,
                opened_at: Instant::now(),
            }),
            max_len,
            connect_timeout,
        }
    }

    /// Push one event. Never blocks and never fails; losses are recorded
    /// in the error flag instead.
    pub fn push(&self, event: ObservedEvent) {
        let mut state = self.state.lock().unwrap();

        let event = if let Some(consumer) = &state.consumer {
            match consumer.send(event) {
                Ok(()) => return,
                Err(err) => {
                    // Consumer went away; fall back to buffering.
                    state.consumer = None;
                    state.detected_errors = true;
                    err.0
                }
            }
        } else {
            event
        };

        if state.consumer.is_none() && state.opened_at.elapsed() > self.connect_timeout {
            // Nobody attached in time: stop accumulating.
            if !state.buffer.is_empty() {
                state.buffer.clear();
            }
            state.detected_errors = true;
            return;
        }

        if state.buffer.len() >= self.max_len {
            state.buffer.pop_front();
            state.detected_errors = true;
        }
        state.buffer.push_back(event);
    }

    /// Attach the (single) consumer. Buffered events are replayed into
    /// the returned channel in order.
    pub fn connect(&self) -> mpsc::UnboundedReceiver<ObservedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        for event in state.buffer.drain(..) {
            let _ = tx.send(event);
        }
        state.consumer = Some(tx);
        rx
    }

    /// Whether events were lost (overrun or connect timeout).
    pub fn detected_errors(&self) -> bool {
        self.state.lock().unwrap().detected_errors
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
