//! CloudEvents emission for build observability
//!
//! Every build reports `started`, then either `succeeded` or `failed`. Failure
//! events carry the failing stage, the error and, when the API endpoint could
//! not be resolved, the resolver's diagnostic.

use crate::model::BuildId;
use chrono::Utc;
use cloudevents::{Event, EventBuilder, EventBuilderV10};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const EVENT_SOURCE: &str = "https://kube-eleven.io/builder";
const EVENT_TYPE_PREFIX: &str = "io.kube-eleven.build";

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("failed to build event: {0}")]
    Build(String),

    #[error("failed to deliver event: {0}")]
    Delivery(#[from] reqwest::Error),
}

/// Build lifecycle transition reported to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildEventKind {
    Started,
    Succeeded,
    Failed,
}

impl BuildEventKind {
    pub fn event_type(self) -> String {
        let suffix = match self {
            BuildEventKind::Started => "started",
            BuildEventKind::Succeeded => "succeeded",
            BuildEventKind::Failed => "failed",
        };
        format!("{}.{}", EVENT_TYPE_PREFIX, suffix)
    }
}

enum SinkMode {
    Disabled,
    Http { url: String, client: reqwest::Client },
    Memory(Arc<Mutex<Vec<Event>>>),
}

/// Destination of build events
///
/// Cloning shares the destination.
#[derive(Clone)]
pub struct BuildEventSink {
    mode: Arc<SinkMode>,
}

impl Default for BuildEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildEventSink {
    /// Create a sink configured from environment variables
    ///
    /// - KUBE_ELEVEN_EVENTS_ENABLED: "true" to enable emission (default: false)
    /// - KUBE_ELEVEN_EVENTS_SINK_URL: HTTP endpoint receiving CloudEvents
    pub fn new() -> Self {
        let enabled = std::env::var("KUBE_ELEVEN_EVENTS_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            == "true";
        let sink_url = std::env::var("KUBE_ELEVEN_EVENTS_SINK_URL").ok();

        match (enabled, sink_url) {
            (true, Some(url)) => Self::http(url),
            _ => Self::disabled(),
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            mode: Arc::new(SinkMode::Http {
                url: url.into(),
                client: reqwest::Client::new(),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: Arc::new(SinkMode::Disabled),
        }
    }

    /// Sink that keeps events in memory, for tests
    pub fn new_mock() -> Self {
        Self {
            mode: Arc::new(SinkMode::Memory(Arc::new(Mutex::new(Vec::new())))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(*self.mode, SinkMode::Disabled)
    }

    /// Events recorded by a mock sink
    pub fn get_emitted_events(&self) -> Vec<Event> {
        match &*self.mode {
            SinkMode::Memory(events) => events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            _ => Vec::new(),
        }
    }

    /// Build and deliver one event
    pub async fn emit(
        &self,
        kind: BuildEventKind,
        build_id: &BuildId,
        data: serde_json::Value,
    ) -> Result<(), EventsError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let event = build_event(kind, build_id, data)?;
        self.send_event(event).await
    }

    async fn send_event(&self, event: Event) -> Result<(), EventsError> {
        match &*self.mode {
            SinkMode::Disabled => Ok(()),
            SinkMode::Memory(events) => {
                events
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(event);
                Ok(())
            }
            SinkMode::Http { url, client } => {
                client
                    .post(url)
                    .header("Content-Type", "application/cloudevents+json")
                    .json(&event)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
        }
    }
}

/// Build a CloudEvent describing a build transition
pub fn build_event(
    kind: BuildEventKind,
    build_id: &BuildId,
    data: serde_json::Value,
) -> Result<Event, EventsError> {
    EventBuilderV10::new()
        .id(uuid::Uuid::new_v4().to_string())
        .source(EVENT_SOURCE)
        .ty(kind.event_type())
        .subject(build_id.to_string())
        .time(Utc::now())
        .data("application/json", data)
        .build()
        .map_err(|e| EventsError::Build(e.to_string()))
}
