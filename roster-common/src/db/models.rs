//! Database models

use serde::{Deserialize, Serialize};

/// Generated primary key of a `students` row
pub type StudentId = i64;

/// Generated primary key of a `classes` row
pub type GroupId = i64;

/// A class (the grouping entity students belong to)
///
/// `name` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

/// A persisted student together with its class
///
/// `national_student_id` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    pub national_student_id: String,
    pub school_student_id: String,
    pub group: Group,
}

/// One persisted audit log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub log_type: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub actor_id: Option<i64>,
    pub logged_at: String,
}
