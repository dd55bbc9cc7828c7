//! Reconciliation planner
//!
//! Merges decoded records against persisted state and decides, per record,
//! whether it creates or updates a student and which class it binds to.
//! Classes referenced by the batch but not yet persisted are scheduled for
//! creation, attributed to the importing actor.
//!
//! Planning performs no I/O and cannot fail: the caller resolves
//! [`Lookups`] beforehand (inside the import transaction) and the resulting
//! [`ReconciliationPlan`] is a deterministic function of its inputs.

use crate::decoder::CandidateRecord;
use roster_common::db::{GroupId, StudentId};
use roster_common::ActorId;
use std::collections::{HashMap, HashSet};

/// Persisted state relevant to one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lookups {
    /// national_student_id -> student id
    pub students: HashMap<String, StudentId>,
    /// class name -> class id
    pub groups: HashMap<String, GroupId>,
}

/// How a mutation's class reference gets its id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBinding {
    /// Class already persisted
    Existing(GroupId),
    /// Class created earlier in the same plan; id known only at commit time
    Synthesized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub name: String,
    pub binding: GroupBinding,
}

/// Field values a student mutation writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentFields {
    pub name: String,
    pub national_id: String,
    pub local_id: String,
    pub group: GroupRef,
}

/// Create-or-update decision made at planning time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentMutation {
    Create(StudentFields),
    Update { id: StudentId, fields: StudentFields },
}

impl StudentMutation {
    pub fn fields(&self) -> &StudentFields {
        match self {
            StudentMutation::Create(fields) => fields,
            StudentMutation::Update { fields, .. } => fields,
        }
    }

    /// Id of the persisted student this mutation overwrites
    pub fn existing_id(&self) -> Option<StudentId> {
        match self {
            StudentMutation::Create(_) => None,
            StudentMutation::Update { id, .. } => Some(*id),
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, StudentMutation::Create(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupToCreate {
    pub name: String,
    pub created_by: ActorId,
}

/// Ordered set of changes for one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub actor_id: ActorId,
    /// Distinct names in first-seen order
    pub groups_to_create: Vec<GroupToCreate>,
    /// At most one mutation per national id, in first-occurrence order
    pub student_mutations: Vec<StudentMutation>,
    /// Records that entered planning
    pub rows_accepted: usize,
    /// Earlier rows replaced by a later row with the same national id
    pub superseded_rows: usize,
}

impl ReconciliationPlan {
    /// Ids of already persisted classes the plan references
    pub fn existing_group_ids(&self) -> Vec<GroupId> {
        let mut seen = HashSet::new();
        self.student_mutations
            .iter()
            .filter_map(|m| match m.fields().group.binding {
                GroupBinding::Existing(id) => Some(id),
                GroupBinding::Synthesized => None,
            })
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Class-list plan: which names to create, which already exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    pub to_create: Vec<GroupToCreate>,
    pub existing: Vec<(String, GroupId)>,
}

/// Distinct class names in first-seen order
pub fn distinct_group_names(records: &[CandidateRecord]) -> Vec<String> {
    distinct(records.iter().map(|r| r.group_name.as_str()))
}

/// Distinct national ids in first-seen order
pub fn distinct_national_ids(records: &[CandidateRecord]) -> Vec<String> {
    distinct(records.iter().map(|r| r.national_id.as_str()))
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .filter(|v| seen.insert(*v))
        .map(str::to_string)
        .collect()
}

/// Partition class names into persisted and to-be-created
pub fn plan_groups(names: &[String], lookups: &Lookups, actor_id: ActorId) -> GroupPlan {
    let mut to_create = Vec::new();
    let mut existing = Vec::new();
    let mut seen = HashSet::new();

    for name in names {
        if !seen.insert(name.as_str()) {
            continue;
        }
        match lookups.groups.get(name) {
            Some(id) => existing.push((name.clone(), *id)),
            None => to_create.push(GroupToCreate {
                name: name.clone(),
                created_by: actor_id,
            }),
        }
    }

    GroupPlan {
        to_create,
        existing,
    }
}

/// Build the reconciliation plan for a decoded batch
///
/// When several records share a national id, the latest record's fields
/// survive in the slot of the first occurrence.
pub fn plan(records: &[CandidateRecord], lookups: &Lookups, actor_id: ActorId) -> ReconciliationPlan {
    let group_plan = plan_groups(&distinct_group_names(records), lookups, actor_id);

    let mut student_mutations: Vec<StudentMutation> = Vec::with_capacity(records.len());
    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut superseded_rows = 0;

    for record in records {
        let group = GroupRef {
            name: record.group_name.clone(),
            binding: match lookups.groups.get(&record.group_name) {
                Some(id) => GroupBinding::Existing(*id),
                None => GroupBinding::Synthesized,
            },
        };

        let fields = StudentFields {
            name: record.name.clone(),
            national_id: record.national_id.clone(),
            local_id: record.local_id.clone(),
            group,
        };

        let mutation = match lookups.students.get(&record.national_id) {
            Some(id) => StudentMutation::Update { id: *id, fields },
            None => StudentMutation::Create(fields),
        };

        match slots.get(record.national_id.as_str()) {
            Some(&slot) => {
                student_mutations[slot] = mutation;
                superseded_rows += 1;
            }
            None => {
                slots.insert(record.national_id.as_str(), student_mutations.len());
                student_mutations.push(mutation);
            }
        }
    }

    ReconciliationPlan {
        actor_id,
        groups_to_create: group_plan.to_create,
        student_mutations,
        rows_accepted: records.len(),
        superseded_rows,
    }
}
