//! Event types for the roster event system
//!
//! Provides shared event definitions and the EventBus used to fan out
//! post-commit notifications (audit log writers, live UIs, tests).

use crate::ActorId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Roster event types
///
/// Emitted only after the transaction they describe has closed, so a
/// subscriber never observes an event for state that could still roll back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RosterEvent {
    /// Student batch import committed
    ImportCommitted {
        batch_id: Uuid,
        actor_id: ActorId,
        students_created: usize,
        students_updated: usize,
        /// Names of classes synthesized by this batch
        groups_created: Vec<String>,
        /// Rows that became part of the plan (including superseded duplicates)
        rows_accepted: usize,
        /// Rows dropped because a required field was empty
        rows_skipped: usize,
        /// Rows replaced by a later row with the same national id
        rows_superseded: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Student batch import aborted with zero persisted effect
    ImportFailed {
        batch_id: Uuid,
        actor_id: ActorId,
        /// Last stage reached before the abort ("received", "decoded", "planned")
        stage: String,
        /// Error kind ("schema_mismatch", "empty_batch", "conflict", ...)
        error_kind: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Class-list import committed
    GroupsImported {
        batch_id: Uuid,
        actor_id: ActorId,
        groups_created: Vec<String>,
        /// Names that already existed
        groups_skipped: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Single student created or updated
    StudentSaved {
        actor_id: ActorId,
        student_id: i64,
        national_student_id: String,
        created: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Student soft-deleted
    StudentRemoved {
        actor_id: ActorId,
        student_id: i64,
        national_student_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl RosterEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            RosterEvent::ImportCommitted { .. } => "ImportCommitted",
            RosterEvent::ImportFailed { .. } => "ImportFailed",
            RosterEvent::GroupsImported { .. } => "GroupsImported",
            RosterEvent::StudentSaved { .. } => "StudentSaved",
            RosterEvent::StudentRemoved { .. } => "StudentRemoved",
        }
    }

    /// Audit log type recorded for this event
    pub fn log_type(&self) -> &'static str {
        match self {
            RosterEvent::ImportCommitted { .. } => "import-student",
            RosterEvent::ImportFailed { .. } => "import-student-failed",
            RosterEvent::GroupsImported { .. } => "import-class",
            RosterEvent::StudentSaved { .. } => "create-student-success",
            RosterEvent::StudentRemoved { .. } => "delete-student",
        }
    }

    /// Actor the event is attributed to
    pub fn actor_id(&self) -> ActorId {
        match self {
            RosterEvent::ImportCommitted { actor_id, .. }
            | RosterEvent::ImportFailed { actor_id, .. }
            | RosterEvent::GroupsImported { actor_id, .. }
            | RosterEvent::StudentSaved { actor_id, .. }
            | RosterEvent::StudentRemoved { actor_id, .. } => *actor_id,
        }
    }

    /// Short human-readable summary
    pub fn message(&self) -> String {
        match self {
            RosterEvent::ImportCommitted {
                students_created,
                students_updated,
                groups_created,
                ..
            } => format!(
                "Student import committed: {} created, {} updated, {} classes created",
                students_created,
                students_updated,
                groups_created.len()
            ),
            RosterEvent::ImportFailed { stage, reason, .. } => {
                format!("Student import failed after {}: {}", stage, reason)
            }
            RosterEvent::GroupsImported { groups_created, groups_skipped, .. } => format!(
                "Class import committed: {} created, {} already existed",
                groups_created.len(),
                groups_skipped
            ),
            RosterEvent::StudentSaved { national_student_id, created, .. } => {
                if *created {
                    format!("Student {} created", national_student_id)
                } else {
                    format!("Student {} updated", national_student_id)
                }
            }
            RosterEvent::StudentRemoved { national_student_id, .. } => {
                format!("Student {} deleted", national_student_id)
            }
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use roster_common::events::{EventBus, RosterEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(RosterEvent::StudentRemoved {
///     actor_id: 1,
///     student_id: 7,
///     national_student_id: "111".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert_eq!(rx.try_recv().unwrap().event_type(), "StudentRemoved");
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RosterEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// `capacity` is the number of events buffered before the oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: RosterEvent,
    ) -> Result<usize, broadcast::error::SendError<RosterEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: RosterEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_event() -> RosterEvent {
        RosterEvent::ImportFailed {
            batch_id: Uuid::new_v4(),
            actor_id: 3,
            stage: "received".to_string(),
            error_kind: "empty_batch".to_string(),
            reason: "No valid rows found in the batch".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_eventbus_emit_without_subscribers_fails() {
        let bus = EventBus::new(10);
        assert!(bus.emit(failed_event()).is_err());
        // Lossy variant must not panic either
        bus.emit_lossy(failed_event());
    }

    #[test]
    fn test_eventbus_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.emit(failed_event()).unwrap(), 2);

        assert_eq!(rx1.try_recv().unwrap().event_type(), "ImportFailed");
        assert_eq!(rx2.try_recv().unwrap().event_type(), "ImportFailed");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(failed_event()).unwrap();
        assert_eq!(json["type"], "ImportFailed");
        assert_eq!(json["actor_id"], 3);
        assert_eq!(json["error_kind"], "empty_batch");
    }

    #[test]
    fn test_log_types_and_actor() {
        let event = RosterEvent::GroupsImported {
            batch_id: Uuid::new_v4(),
            actor_id: 9,
            groups_created: vec!["10A".to_string()],
            groups_skipped: 2,
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(event.log_type(), "import-class");
        assert_eq!(event.actor_id(), 9);
        assert_eq!(event.message(), "Class import committed: 1 created, 2 already existed");
        assert_eq!(failed_event().log_type(), "import-student-failed");
    }
}
