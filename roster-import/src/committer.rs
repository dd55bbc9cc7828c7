//! Transactional committer
//!
//! Applies a [`ReconciliationPlan`] inside one open transaction, in a fixed
//! order: classes first, then students. The transaction is committed only
//! when every step succeeded; any failure rolls it back so nothing from the
//! batch persists.

use crate::error::ImportError;
use crate::planner::{GroupBinding, GroupPlan, GroupToCreate, ReconciliationPlan};
use crate::store::{RosterStore, StudentRow};
use roster_common::db::{Group, GroupId, Student};
use roster_common::ActorId;
use sqlx::sqlite::{Sqlite, SqliteConnection};
use sqlx::Transaction;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Result of a committed plan
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Finalized students in plan order
    pub students: Vec<Student>,
    /// Classes created by this plan, in plan order
    pub groups_created: Vec<Group>,
    pub students_created: usize,
    pub students_updated: usize,
    /// Soft-deleted classes brought back because the batch referenced them
    pub groups_restored: u64,
}

/// Apply `plan` and commit `tx`
///
/// Consumes the transaction: it is either committed or rolled back before
/// this returns.
pub async fn commit(
    mut tx: Transaction<'static, Sqlite>,
    store: &RosterStore,
    plan: &ReconciliationPlan,
) -> Result<CommitOutcome, ImportError> {
    match apply(&mut tx, store, plan).await {
        Ok(outcome) => {
            tx.commit().await?;
            Ok(outcome)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback after failed import also failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}

async fn apply(
    conn: &mut SqliteConnection,
    store: &RosterStore,
    plan: &ReconciliationPlan,
) -> Result<CommitOutcome, ImportError> {
    // 1. Classes
    let to_create = dedupe_groups(&plan.groups_to_create);
    let groups_created = store.create_groups(conn, &to_create).await?;
    let groups_restored = store
        .restore_groups(conn, &plan.existing_group_ids(), plan.actor_id)
        .await?;
    debug!(
        created = groups_created.len(),
        restored = groups_restored,
        "Classes written"
    );

    // 2. Bind every class reference to a concrete id
    let synthesized: HashMap<&str, GroupId> = groups_created
        .iter()
        .map(|g| (g.name.as_str(), g.id))
        .collect();

    let mut rows = Vec::with_capacity(plan.student_mutations.len());
    for mutation in &plan.student_mutations {
        let fields = mutation.fields();
        let group_id = match fields.group.binding {
            GroupBinding::Existing(id) => id,
            GroupBinding::Synthesized => *synthesized.get(fields.group.name.as_str()).ok_or_else(|| {
                ImportError::Internal(format!(
                    "Class {} referenced but not created",
                    fields.group.name
                ))
            })?,
        };
        rows.push(StudentRow {
            id: mutation.existing_id(),
            name: fields.name.clone(),
            national_id: fields.national_id.clone(),
            local_id: fields.local_id.clone(),
            group_id,
        });
    }

    // 3. Students
    let written = store.upsert_students(conn, &rows, plan.actor_id).await?;
    if written.len() != rows.len() {
        return Err(ImportError::Internal(format!(
            "Expected {} students written, got {}",
            rows.len(),
            written.len()
        )));
    }

    // 4. Reload in plan order
    let keys: Vec<String> = rows.into_iter().map(|r| r.national_id).collect();
    let students = store.load_students(conn, &keys).await?;

    let students_created = plan
        .student_mutations
        .iter()
        .filter(|m| m.is_create())
        .count();

    Ok(CommitOutcome {
        students,
        groups_created,
        students_created,
        students_updated: plan.student_mutations.len() - students_created,
        groups_restored,
    })
}

/// Apply a class-list plan and commit `tx`
///
/// Creates the missing classes and restores soft-deleted existing ones.
/// Returns the created classes in plan order.
pub async fn commit_groups(
    mut tx: Transaction<'static, Sqlite>,
    store: &RosterStore,
    plan: &GroupPlan,
    actor_id: ActorId,
) -> Result<Vec<Group>, ImportError> {
    match apply_groups(&mut tx, store, plan, actor_id).await {
        Ok(created) => {
            tx.commit().await?;
            Ok(created)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback after failed class import also failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}

async fn apply_groups(
    conn: &mut SqliteConnection,
    store: &RosterStore,
    plan: &GroupPlan,
    actor_id: ActorId,
) -> Result<Vec<Group>, ImportError> {
    let created = store
        .create_groups(conn, &dedupe_groups(&plan.to_create))
        .await?;
    let existing: Vec<GroupId> = plan.existing.iter().map(|(_, id)| *id).collect();
    store.restore_groups(conn, &existing, actor_id).await?;
    Ok(created)
}

fn dedupe_groups(groups: &[GroupToCreate]) -> Vec<GroupToCreate> {
    let mut seen = HashSet::new();
    groups
        .iter()
        .filter(|g| seen.insert(g.name.as_str()))
        .cloned()
        .collect()
}
