//! Domain event publishing.
//!
//! # Responsibility
//! - Shape change notifications emitted after committed mutations.
//! - Isolate the notification transport behind `EventPublisher`.
//!
//! # Invariants
//! - Events are emitted only after commit.
//! - Publish failures are logged and never propagated; the committed
//!   mutation stands.

use crate::config::ServiceConfig;
use crate::logging::CoreLogger;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// Events live for one delivery hop.
const EVENT_TTL: u32 = 1;

pub const REQUEST_QUEUE_REORDERED: &str = "REQUEST_QUEUE_REORDERED";
pub const LOAN_ANONYMIZED: &str = "LOAN_ANONYMIZED";

/// Notification envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    /// JSON-encoded payload.
    pub event_payload: String,
    pub event_metadata: EventMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub published_by: String,
    pub tenant_id: String,
    #[serde(rename = "eventTTL")]
    pub event_ttl: u32,
}

#[derive(Debug)]
pub enum PublishError {
    /// Bus accepted the call but refused the event.
    Rejected(String),
    /// Bus could not be reached.
    Transport(String),
    Encode(serde_json::Error),
}

impl Display for PublishError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(message) => write!(f, "event rejected: {message}"),
            Self::Transport(message) => write!(f, "event transport failed: {message}"),
            Self::Encode(err) => write!(f, "event encoding failed: {err}"),
        }
    }
}

impl Error for PublishError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Encode(err) => Some(err),
            _ => None,
        }
    }
}

/// Notification bus boundary.
pub trait EventPublisher {
    fn publish(&self, event: &Event) -> Result<(), PublishError>;
}

impl<T: EventPublisher + ?Sized> EventPublisher for &T {
    fn publish(&self, event: &Event) -> Result<(), PublishError> {
        (**self).publish(event)
    }
}

impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    fn publish(&self, event: &Event) -> Result<(), PublishError> {
        (**self).publish(event)
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish(&self, _event: &Event) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Writes events as JSON lines through a logger.
#[derive(Debug, Clone, Default)]
pub struct LogEventPublisher {
    logger: CoreLogger,
}

impl LogEventPublisher {
    pub fn new(logger: CoreLogger) -> Self {
        Self {
            logger: logger.scoped("circstore_core::events"),
        }
    }
}

impl EventPublisher for LogEventPublisher {
    fn publish(&self, event: &Event) -> Result<(), PublishError> {
        let encoded = serde_json::to_string(event).map_err(PublishError::Encode)?;
        self.logger.info(format_args!(
            "event=event_publish module=events status=ok event_id={} event_type={} body={}",
            event.id, event.event_type, encoded
        ));
        Ok(())
    }
}

/// Builds events for one tenant and hands them to a publisher.
pub struct EventEmitter<P: EventPublisher> {
    publisher: P,
    published_by: String,
    tenant_id: String,
    enabled: bool,
    logger: CoreLogger,
}

impl<P: EventPublisher> EventEmitter<P> {
    pub fn new(publisher: P, config: &ServiceConfig, logger: CoreLogger) -> Self {
        Self {
            publisher,
            published_by: config.module_id.clone(),
            tenant_id: config.tenant_id.clone(),
            enabled: config.publish_events,
            logger: logger.scoped("circstore_core::events"),
        }
    }

    /// Builds the envelope for `event_type` and `payload`.
    pub fn build(&self, event_type: &str, payload: &Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            event_payload: payload.to_string(),
            event_metadata: EventMetadata {
                published_by: self.published_by.clone(),
                tenant_id: self.tenant_id.clone(),
                event_ttl: EVENT_TTL,
            },
        }
    }

    /// Publishes one event. Returns whether it was delivered.
    ///
    /// Failures are logged at `warn` and swallowed.
    pub fn emit(&self, event_type: &str, payload: &Value) -> bool {
        if !self.enabled {
            return false;
        }

        let event = self.build(event_type, payload);
        match self.publisher.publish(&event) {
            Ok(()) => {
                self.logger.debug(format_args!(
                    "event=event_publish module=events status=ok event_id={} event_type={}",
                    event.id, event.event_type
                ));
                true
            }
            Err(err) => {
                self.logger.warn(format_args!(
                    "event=event_publish module=events status=error event_id={} event_type={} error_code=publish_failed error={}",
                    event.id, event.event_type, err
                ));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        EventEmitter, EventPublisher, NoopEventPublisher, PublishError, REQUEST_QUEUE_REORDERED,
    };
    use crate::config::ServiceConfig;
    use crate::logging::CoreLogger;
    use serde_json::json;

    struct Refusing;

    impl EventPublisher for Refusing {
        fn publish(&self, _event: &super::Event) -> Result<(), PublishError> {
            Err(PublishError::Transport("bus offline".to_string()))
        }
    }

    fn config() -> ServiceConfig {
        ServiceConfig {
            tenant_id: "diku".to_string(),
            module_id: "circstore-test".to_string(),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn built_event_carries_tenant_metadata_and_wire_names() {
        let emitter = EventEmitter::new(NoopEventPublisher, &config(), CoreLogger::default());
        let event = emitter.build(REQUEST_QUEUE_REORDERED, &json!({ "ids": [] }));

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["eventType"], "REQUEST_QUEUE_REORDERED");
        assert_eq!(wire["eventPayload"], "{\"ids\":[]}");
        assert_eq!(wire["eventMetadata"]["tenantId"], "diku");
        assert_eq!(wire["eventMetadata"]["publishedBy"], "circstore-test");
        assert_eq!(wire["eventMetadata"]["eventTTL"], 1);
    }

    #[test]
    fn emit_swallows_publisher_failures_and_respects_disable_flag() {
        let failing = EventEmitter::new(Refusing, &config(), CoreLogger::default());
        assert!(!failing.emit(REQUEST_QUEUE_REORDERED, &json!({})));

        let mut disabled_config = config();
        disabled_config.publish_events = false;
        let disabled = EventEmitter::new(NoopEventPublisher, &disabled_config, CoreLogger::default());
        assert!(!disabled.emit(REQUEST_QUEUE_REORDERED, &json!({})));

        let enabled = EventEmitter::new(NoopEventPublisher, &config(), CoreLogger::default());
        assert!(enabled.emit(REQUEST_QUEUE_REORDERED, &json!({})));
    }
}
