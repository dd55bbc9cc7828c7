//! Roster persistence
//!
//! All statements that take a `&mut SqliteConnection` run on whatever
//! connection the caller hands in; the import path passes its open
//! transaction so lookups and writes share one snapshot.
//!
//! Multi-row statements are split into chunks of
//! `max_rows_per_statement` rows to stay under SQLite's bound-parameter limit.

use crate::error::ImportError;
use crate::planner::GroupToCreate;
use roster_common::db::{Group, GroupId, Student, StudentId};
use roster_common::ActorId;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool, Transaction};
use std::collections::HashMap;

/// Columns written for one student by [`RosterStore::upsert_students`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRow {
    /// `None` inserts a new row; `Some` overwrites that row
    pub id: Option<StudentId>,
    pub name: String,
    pub national_id: String,
    pub local_id: String,
    pub group_id: GroupId,
}

const STUDENT_SELECT: &str = r#"
    SELECT s.id, s.name, s.national_student_id, s.school_student_id,
           c.id AS class_id, c.name AS class_name
    FROM students s
    JOIN classes c ON c.id = s.class_id
"#;

/// Database repository for students and classes
#[derive(Clone)]
pub struct RosterStore {
    pool: SqlitePool,
    max_rows_per_statement: usize,
}

impl RosterStore {
    pub fn new(pool: SqlitePool, max_rows_per_statement: usize) -> Self {
        Self {
            pool,
            max_rows_per_statement: max_rows_per_statement.max(1),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, ImportError> {
        Ok(self.pool.begin().await?)
    }

    /// Map national ids to student ids (soft-deleted rows included)
    pub async fn find_students_by_national_ids(
        &self,
        conn: &mut SqliteConnection,
        national_ids: &[String],
    ) -> Result<HashMap<String, StudentId>, ImportError> {
        let mut found = HashMap::with_capacity(national_ids.len());

        for chunk in national_ids.chunks(self.max_rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, national_student_id FROM students WHERE national_student_id IN (",
            );
            let mut separated = qb.separated(", ");
            for national_id in chunk {
                separated.push_bind(national_id.clone());
            }
            separated.push_unseparated(")");

            let rows: Vec<(StudentId, String)> = qb.build_query_as().fetch_all(&mut *conn).await?;
            found.extend(rows.into_iter().map(|(id, national_id)| (national_id, id)));
        }

        Ok(found)
    }

    /// Map class names to class ids (soft-deleted rows included)
    pub async fn find_groups_by_names(
        &self,
        conn: &mut SqliteConnection,
        names: &[String],
    ) -> Result<HashMap<String, GroupId>, ImportError> {
        let mut found = HashMap::with_capacity(names.len());

        for chunk in names.chunks(self.max_rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT id, name FROM classes WHERE name IN (");
            let mut separated = qb.separated(", ");
            for name in chunk {
                separated.push_bind(name.clone());
            }
            separated.push_unseparated(")");

            let rows: Vec<(GroupId, String)> = qb.build_query_as().fetch_all(&mut *conn).await?;
            found.extend(rows.into_iter().map(|(id, name)| (name, id)));
        }

        Ok(found)
    }

    /// Active (not soft-deleted) class by name
    pub async fn find_active_group(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<Option<Group>, ImportError> {
        let row = sqlx::query("SELECT id, name FROM classes WHERE name = ? AND deleted_at IS NULL")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(|row| -> Result<Group, ImportError> {
            Ok(Group {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            })
        })
        .transpose()
    }

    /// Insert classes, returning them with their generated ids
    ///
    /// A name that already exists fails the statement with a unique violation.
    pub async fn create_groups(
        &self,
        conn: &mut SqliteConnection,
        groups: &[GroupToCreate],
    ) -> Result<Vec<Group>, ImportError> {
        let mut created = Vec::with_capacity(groups.len());

        for chunk in groups.chunks(self.max_rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO classes (name, created_by, updated_by) ");
            qb.push_values(chunk, |mut b, group| {
                b.push_bind(group.name.clone())
                    .push_bind(group.created_by)
                    .push_bind(group.created_by);
            });
            qb.push(" RETURNING id, name");

            let rows: Vec<(GroupId, String)> = qb.build_query_as().fetch_all(&mut *conn).await?;
            created.extend(rows.into_iter().map(|(id, name)| Group { id, name }));
        }

        // RETURNING order is unspecified; report in insertion order
        let position: HashMap<&str, usize> = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.as_str(), i))
            .collect();
        created.sort_by_key(|g| position.get(g.name.as_str()).copied().unwrap_or(usize::MAX));

        Ok(created)
    }

    /// Clear the soft-delete marker of the given classes
    pub async fn restore_groups(
        &self,
        conn: &mut SqliteConnection,
        ids: &[GroupId],
        actor_id: ActorId,
    ) -> Result<u64, ImportError> {
        let mut restored = 0;

        for chunk in ids.chunks(self.max_rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "UPDATE classes SET deleted_at = NULL, deleted_by = NULL, updated_at = CURRENT_TIMESTAMP, updated_by = ",
            );
            qb.push_bind(actor_id);
            qb.push(" WHERE deleted_at IS NOT NULL AND id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            restored += qb.build().execute(&mut *conn).await?.rows_affected();
        }

        Ok(restored)
    }

    /// Insert or overwrite students in as few statements as possible
    ///
    /// Rows with an id overwrite that student (restoring it if soft-deleted);
    /// rows without one are inserted. A new row whose national id is already
    /// taken fails with a unique violation. Returns `(id, national_id)` pairs.
    pub async fn upsert_students(
        &self,
        conn: &mut SqliteConnection,
        rows: &[StudentRow],
        actor_id: ActorId,
    ) -> Result<Vec<(StudentId, String)>, ImportError> {
        let mut written = Vec::with_capacity(rows.len());

        for chunk in rows.chunks(self.max_rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO students (id, name, school_student_id, national_student_id, class_id, created_by, updated_by) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(row.name.clone())
                    .push_bind(row.local_id.clone())
                    .push_bind(row.national_id.clone())
                    .push_bind(row.group_id)
                    .push_bind(actor_id)
                    .push_bind(actor_id);
            });
            qb.push(
                r#"
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    school_student_id = excluded.school_student_id,
                    national_student_id = excluded.national_student_id,
                    class_id = excluded.class_id,
                    updated_by = excluded.updated_by,
                    updated_at = CURRENT_TIMESTAMP,
                    deleted_at = NULL,
                    deleted_by = NULL
                RETURNING id, national_student_id
                "#,
            );

            let returned: Vec<(StudentId, String)> =
                qb.build_query_as().fetch_all(&mut *conn).await?;
            written.extend(returned);
        }

        Ok(written)
    }

    /// Load students with their class, in the order of `national_ids`
    pub async fn load_students(
        &self,
        conn: &mut SqliteConnection,
        national_ids: &[String],
    ) -> Result<Vec<Student>, ImportError> {
        let mut by_key: HashMap<String, Student> = HashMap::with_capacity(national_ids.len());

        for chunk in national_ids.chunks(self.max_rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(STUDENT_SELECT);
            qb.push(" WHERE s.national_student_id IN (");
            let mut separated = qb.separated(", ");
            for national_id in chunk {
                separated.push_bind(national_id.clone());
            }
            separated.push_unseparated(")");

            for row in qb.build().fetch_all(&mut *conn).await? {
                let student = student_from_row(&row)?;
                by_key.insert(student.national_student_id.clone(), student);
            }
        }

        national_ids
            .iter()
            .map(|key| {
                by_key.remove(key).ok_or_else(|| {
                    ImportError::Internal(format!("Student {} missing after write", key))
                })
            })
            .collect()
    }

    /// Student by national id, any deletion state
    pub async fn find_student_any(
        &self,
        conn: &mut SqliteConnection,
        national_id: &str,
    ) -> Result<Option<StudentId>, ImportError> {
        let id: Option<StudentId> =
            sqlx::query_scalar("SELECT id FROM students WHERE national_student_id = ?")
            .bind(national_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(id)
    }

    /// Active student by national id
    pub async fn find_active_student(
        &self,
        conn: &mut SqliteConnection,
        national_id: &str,
    ) -> Result<Option<Student>, ImportError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(STUDENT_SELECT);
        qb.push(" WHERE s.deleted_at IS NULL AND s.national_student_id = ");
        qb.push_bind(national_id.to_string());

        qb.build()
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| student_from_row(&row))
            .transpose()
    }

    /// Active student by national id, on a pooled connection
    pub async fn find_student(&self, national_id: &str) -> Result<Option<Student>, ImportError> {
        let mut conn = self.pool.acquire().await?;
        self.find_active_student(&mut conn, national_id).await
    }

    /// Mark a student deleted by `actor_id`
    pub async fn soft_delete_student(
        &self,
        conn: &mut SqliteConnection,
        id: StudentId,
        actor_id: ActorId,
    ) -> Result<bool, ImportError> {
        let result = sqlx::query(
            r#"
            UPDATE students
            SET deleted_at = CURRENT_TIMESTAMP, deleted_by = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(actor_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn student_from_row(row: &SqliteRow) -> Result<Student, ImportError> {
    Ok(Student {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        national_student_id: row.try_get("national_student_id")?,
        school_student_id: row.try_get("school_student_id")?,
        group: Group {
            id: row.try_get("class_id")?,
            name: row.try_get("class_name")?,
        },
    })
}
