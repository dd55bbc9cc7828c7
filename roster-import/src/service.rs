//! Import service
//!
//! Orchestrates one batch through its stages:
//!
//! ```text
//! Received -> Decoded -> Planned -> Committed
//!     \           \          \
//!      `-----------`----------`--> Aborted
//! ```
//!
//! Decoding runs on the caller's task. Lookups, planning and the writes run
//! on one transaction inside a spawned task, so dropping the caller's future
//! after the transaction started cannot leave it half-applied. Audit events
//! are recorded only once the transaction has closed.

use crate::audit::AuditSink;
use crate::committer;
use crate::decoder::{decode, CandidateRecord, TableSchema};
use crate::error::ImportError;
use crate::planner::{self, Lookups};
use crate::store::{RosterStore, StudentRow};
use roster_common::config::ImportConfig;
use roster_common::db::{Group, Student};
use roster_common::{ActorId, RosterEvent};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqliteConnection};
use sqlx::Transaction;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle stage of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Received,
    Decoded,
    Planned,
    Committed,
    Aborted,
}

impl BatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStage::Received => "received",
            BatchStage::Decoded => "decoded",
            BatchStage::Planned => "planned",
            BatchStage::Committed => "committed",
            BatchStage::Aborted => "aborted",
        }
    }
}

/// Outcome of a committed student import
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    /// Finalized students in first-occurrence order, each with its class
    pub students: Vec<Student>,
    /// Classes synthesized by this batch
    pub groups_created: Vec<Group>,
    pub rows_accepted: usize,
    pub rows_skipped: usize,
    pub rows_superseded: usize,
    pub students_created: usize,
    pub students_updated: usize,
}

/// Outcome of a committed class-list import
#[derive(Debug, Clone, Serialize)]
pub struct GroupImportResult {
    pub batch_id: Uuid,
    pub groups_created: Vec<Group>,
    /// Distinct names that already existed
    pub groups_skipped: usize,
    pub rows_skipped: usize,
}

/// One student submitted outside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentInput {
    pub name: String,
    pub national_id: String,
    pub local_id: String,
    pub group_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedStudent {
    pub student: Student,
    pub created: bool,
}

/// Roster import entry point
pub struct ImportService {
    store: RosterStore,
    audit: Arc<dyn AuditSink>,
    config: ImportConfig,
}

impl ImportService {
    pub fn new(store: RosterStore, audit: Arc<dyn AuditSink>, config: ImportConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    pub fn store(&self) -> &RosterStore {
        &self.store
    }

    fn start_timeout(&self) -> Option<Duration> {
        self.config.start_timeout_ms.map(Duration::from_millis)
    }

    /// Import a student spreadsheet, all or nothing
    pub async fn import_batch(
        &self,
        bytes: &[u8],
        actor_id: ActorId,
    ) -> Result<BatchResult, ImportError> {
        let batch_id = Uuid::new_v4();
        info!(
            %batch_id,
            actor_id,
            bytes = bytes.len(),
            stage = BatchStage::Received.as_str(),
            "Student import received"
        );

        let schema = TableSchema::students(&self.config.columns);
        let decoded = match decode(bytes, &schema) {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.abort(batch_id, actor_id, BatchStage::Received, e)),
        };
        info!(
            %batch_id,
            records = decoded.records.len(),
            skipped = decoded.skipped_rows,
            stage = BatchStage::Decoded.as_str(),
            "Student import decoded"
        );

        // The transaction starts on the caller's task: a caller that gives up
        // before this point leaves no trace.
        let tx = match begin_with_timeout(&self.store, self.start_timeout()).await {
            Ok(tx) => tx,
            Err(e) => return Err(self.abort(batch_id, actor_id, BatchStage::Decoded, e)),
        };

        let batch = BatchContext {
            batch_id,
            actor_id,
            rows_skipped: decoded.skipped_rows,
            audit: Arc::clone(&self.audit),
        };
        let task = tokio::spawn(reconcile(self.store.clone(), tx, decoded.records, batch));

        match task.await {
            Ok(result) => result,
            Err(join_err) => {
                let error = ImportError::Internal(format!("Import task failed: {}", join_err));
                Err(self.abort(batch_id, actor_id, BatchStage::Planned, error))
            }
        }
    }

    /// Import a class-list spreadsheet
    ///
    /// Names that already exist are skipped; the rest are created in one
    /// transaction attributed to `actor_id`.
    pub async fn import_groups(
        &self,
        bytes: &[u8],
        actor_id: ActorId,
    ) -> Result<GroupImportResult, ImportError> {
        let batch_id = Uuid::new_v4();
        info!(%batch_id, actor_id, "Class import received");

        let schema = TableSchema::classes(&self.config.class_column);
        let decoded = decode(bytes, &schema).inspect_err(|e| {
            warn!(%batch_id, actor_id, error_kind = e.kind(), "Class import rejected: {}", e);
        })?;
        let names = planner::distinct_group_names(&decoded.records);

        let tx = begin_with_timeout(&self.store, self.start_timeout())
            .await
            .inspect_err(|e| {
                warn!(%batch_id, actor_id, error_kind = e.kind(), "Class import not started: {}", e);
            })?;

        let store = self.store.clone();
        let audit = Arc::clone(&self.audit);
        let rows_skipped = decoded.skipped_rows;
        let task = tokio::spawn(async move {
            let result = import_groups_in(&store, tx, &names, actor_id).await;
            match &result {
                Ok((groups_created, groups_skipped)) => {
                    info!(
                        %batch_id,
                        created = groups_created.len(),
                        skipped = groups_skipped,
                        "Class import committed"
                    );
                    audit.record(RosterEvent::GroupsImported {
                        batch_id,
                        actor_id,
                        groups_created: groups_created.iter().map(|g| g.name.clone()).collect(),
                        groups_skipped: *groups_skipped,
                        timestamp: chrono::Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(%batch_id, actor_id, error_kind = e.kind(), "Class import aborted: {}", e);
                }
            }
            result
        });

        let (groups_created, groups_skipped) = task
            .await
            .map_err(|e| ImportError::Internal(format!("Import task failed: {}", e)))??;

        Ok(GroupImportResult {
            batch_id,
            groups_created,
            groups_skipped,
            rows_skipped,
        })
    }

    /// Create or update one student by national id
    ///
    /// The class must already exist; unlike batch imports nothing is synthesized.
    pub async fn upsert_student(
        &self,
        input: StudentInput,
        actor_id: ActorId,
    ) -> Result<SavedStudent, ImportError> {
        let input = validate_input(input)?;

        let mut tx = begin_with_timeout(&self.store, self.start_timeout()).await?;

        let group = self
            .store
            .find_active_group(&mut tx, &input.group_name)
            .await?
            .ok_or_else(|| ImportError::NotFound("class not found".to_string()))?;
        let existing = self.store.find_student_any(&mut tx, &input.national_id).await?;

        let row = StudentRow {
            id: existing,
            name: input.name,
            national_id: input.national_id.clone(),
            local_id: input.local_id,
            group_id: group.id,
        };
        self.store.upsert_students(&mut tx, &[row], actor_id).await?;

        let student = self
            .store
            .load_students(&mut tx, &[input.national_id])
            .await?
            .pop()
            .ok_or_else(|| ImportError::Internal("Saved student not found".to_string()))?;

        tx.commit().await?;

        let created = existing.is_none();
        info!(actor_id, student_id = student.id, created, "Student saved");

        self.audit.record(RosterEvent::StudentSaved {
            actor_id,
            student_id: student.id,
            national_student_id: student.national_student_id.clone(),
            created,
            timestamp: chrono::Utc::now(),
        });

        Ok(SavedStudent { student, created })
    }

    /// Soft-delete a student by national id
    pub async fn remove_student(
        &self,
        national_id: &str,
        actor_id: ActorId,
    ) -> Result<Student, ImportError> {
        let mut tx = begin_with_timeout(&self.store, self.start_timeout()).await?;

        let student = self
            .store
            .find_active_student(&mut tx, national_id)
            .await?
            .ok_or_else(|| ImportError::NotFound("student not found".to_string()))?;

        if !self
            .store
            .soft_delete_student(&mut tx, student.id, actor_id)
            .await?
        {
            return Err(ImportError::Conflict(format!(
                "Student {} was removed concurrently",
                national_id
            )));
        }

        tx.commit().await?;
        info!(actor_id, student_id = student.id, "Student removed");

        self.audit.record(RosterEvent::StudentRemoved {
            actor_id,
            student_id: student.id,
            national_student_id: student.national_student_id.clone(),
            timestamp: chrono::Utc::now(),
        });

        Ok(student)
    }

    fn abort(
        &self,
        batch_id: Uuid,
        actor_id: ActorId,
        stage: BatchStage,
        error: ImportError,
    ) -> ImportError {
        record_abort(self.audit.as_ref(), batch_id, actor_id, stage, error)
    }
}

/// Identity and audit target of a batch in flight
struct BatchContext {
    batch_id: Uuid,
    actor_id: ActorId,
    rows_skipped: usize,
    audit: Arc<dyn AuditSink>,
}

impl BatchContext {
    fn abort(&self, stage: BatchStage, error: ImportError) -> ImportError {
        record_abort(self.audit.as_ref(), self.batch_id, self.actor_id, stage, error)
    }
}

/// Atomic section of a student import, from lookups to the outcome event
///
/// Runs detached from the caller, so a started transaction always reaches
/// commit or rollback and always produces its notification.
async fn reconcile(
    store: RosterStore,
    mut tx: Transaction<'static, Sqlite>,
    records: Vec<CandidateRecord>,
    batch: BatchContext,
) -> Result<BatchResult, ImportError> {
    let batch_id = batch.batch_id;

    let lookups = match resolve_lookups(&store, &mut tx, &records).await {
        Ok(lookups) => lookups,
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback after failed lookup also failed: {}", rollback_err);
            }
            return Err(batch.abort(BatchStage::Decoded, e));
        }
    };

    let plan = planner::plan(&records, &lookups, batch.actor_id);
    info!(
        %batch_id,
        mutations = plan.student_mutations.len(),
        superseded = plan.superseded_rows,
        groups_to_create = plan.groups_to_create.len(),
        stage = BatchStage::Planned.as_str(),
        "Student import planned"
    );

    let outcome = match committer::commit(tx, &store, &plan).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(batch.abort(BatchStage::Planned, e)),
    };

    info!(
        %batch_id,
        created = outcome.students_created,
        updated = outcome.students_updated,
        groups_created = outcome.groups_created.len(),
        groups_restored = outcome.groups_restored,
        stage = BatchStage::Committed.as_str(),
        "Student import committed"
    );

    batch.audit.record(RosterEvent::ImportCommitted {
        batch_id,
        actor_id: batch.actor_id,
        students_created: outcome.students_created,
        students_updated: outcome.students_updated,
        groups_created: outcome.groups_created.iter().map(|g| g.name.clone()).collect(),
        rows_accepted: plan.rows_accepted,
        rows_skipped: batch.rows_skipped,
        rows_superseded: plan.superseded_rows,
        timestamp: chrono::Utc::now(),
    });

    Ok(BatchResult {
        batch_id,
        students: outcome.students,
        groups_created: outcome.groups_created,
        rows_accepted: plan.rows_accepted,
        rows_skipped: batch.rows_skipped,
        rows_superseded: plan.superseded_rows,
        students_created: outcome.students_created,
        students_updated: outcome.students_updated,
    })
}

/// Atomic section of a class-list import
async fn import_groups_in(
    store: &RosterStore,
    mut tx: Transaction<'static, Sqlite>,
    names: &[String],
    actor_id: ActorId,
) -> Result<(Vec<Group>, usize), ImportError> {
    let groups = match store.find_groups_by_names(&mut tx, names).await {
        Ok(groups) => groups,
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback after failed lookup also failed: {}", rollback_err);
            }
            return Err(e);
        }
    };
    let lookups = Lookups {
        groups,
        ..Lookups::default()
    };

    let plan = planner::plan_groups(names, &lookups, actor_id);
    let created = committer::commit_groups(tx, store, &plan, actor_id).await?;
    Ok((created, plan.existing.len()))
}

/// Log the abort, record it for audit and hand the error back
fn record_abort(
    audit: &dyn AuditSink,
    batch_id: Uuid,
    actor_id: ActorId,
    stage: BatchStage,
    error: ImportError,
) -> ImportError {
    warn!(
        %batch_id,
        actor_id,
        last_stage = stage.as_str(),
        stage = BatchStage::Aborted.as_str(),
        error_kind = error.kind(),
        "Student import aborted: {}",
        error
    );

    audit.record(RosterEvent::ImportFailed {
        batch_id,
        actor_id,
        stage: stage.as_str().to_string(),
        error_kind: error.kind().to_string(),
        reason: error.to_string(),
        timestamp: chrono::Utc::now(),
    });

    error
}

async fn resolve_lookups(
    store: &RosterStore,
    conn: &mut SqliteConnection,
    records: &[CandidateRecord],
) -> Result<Lookups, ImportError> {
    let national_ids = planner::distinct_national_ids(records);
    let group_names = planner::distinct_group_names(records);

    let students = store.find_students_by_national_ids(conn, &national_ids).await?;
    let groups = store.find_groups_by_names(conn, &group_names).await?;
    debug!(
        known_students = students.len(),
        known_groups = groups.len(),
        "Lookups resolved"
    );

    Ok(Lookups { students, groups })
}

/// Begin a transaction, giving up after `limit` if one is set
async fn begin_with_timeout(
    store: &RosterStore,
    limit: Option<Duration>,
) -> Result<Transaction<'static, Sqlite>, ImportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, store.begin())
            .await
            .map_err(|_| ImportError::StartTimeout(limit))?,
        None => store.begin().await,
    }
}

fn validate_input(input: StudentInput) -> Result<StudentInput, ImportError> {
    let input = StudentInput {
        name: input.name.trim().to_string(),
        national_id: input.national_id.trim().to_string(),
        local_id: input.local_id.trim().to_string(),
        group_name: input.group_name.trim().to_string(),
    };

    for (field, value) in [
        ("name", &input.name),
        ("national_id", &input.national_id),
        ("local_id", &input.local_id),
        ("group_name", &input.group_name),
    ] {
        if value.is_empty() {
            return Err(ImportError::Invalid(format!("{} must not be empty", field)));
        }
    }

    Ok(input)
}
