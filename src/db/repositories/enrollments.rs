use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::db::{connection::Database, helpers::fmt_datetime};

impl Database {
    /// Returns `true` when the student was not already enrolled.
    pub async fn enroll_student(
        &self,
        class_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let class_id = class_id.to_string();
        let student_id = student_id.to_string();
        self.execute(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO enrollments (class_id, student_id, enrolled_at)
                     VALUES (?1, ?2, ?3)",
                    params![class_id, student_id, fmt_datetime(&now)],
                )
                .with_context(|| format!("failed to enroll {student_id} in {class_id}"))?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn enrolled_students(&self, class_id: &str) -> Result<Vec<String>> {
        let class_id = class_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT student_id FROM enrollments WHERE class_id = ?1 ORDER BY student_id",
            )?;
            let rows = stmt.query_map(params![class_id], |row| row.get::<_, String>(0))?;
            let students = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(students)
        })
        .await
    }

    pub async fn is_enrolled(&self, class_id: &str, student_id: &str) -> Result<bool> {
        let class_id = class_id.to_string();
        let student_id = student_id.to_string();
        self.execute(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM enrollments WHERE class_id = ?1 AND student_id = ?2",
                    params![class_id, student_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}
