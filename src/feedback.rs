//! Student ratings of answers, stored next to the conversation log.

use chrono::{TimeZone, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::{validate_course_id, AssistantError, Result};

const LOW_RATED_LIMIT: i64 = 10;
const SAMPLE_COMMENTS: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackEntry {
    pub id: i64,
    pub user_id: String,
    pub question: String,
    pub answer: String,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseReport {
    pub course_id: String,
    pub total: u64,
    /// Rounded to two decimals; `None` without feedback.
    pub average_rating: Option<f64>,
    /// Counts for ratings 1 through 5.
    pub distribution: [u64; 5],
    pub sample_comments: Vec<String>,
    /// Most recent entries rated 2 or lower.
    pub low_rated: Vec<FeedbackEntry>,
    pub first_at: Option<String>,
    pub last_at: Option<String>,
}

pub struct FeedbackStore {
    pool: SqlitePool,
}

fn rfc3339(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

impl FeedbackStore {
    /// `pool` must have the conversation schema applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add_feedback(
        &self,
        course_id: &str,
        user_id: &str,
        question: &str,
        answer: &str,
        rating: u8,
        comment: Option<&str>,
    ) -> Result<i64> {
        validate_course_id(course_id)?;
        if !(1..=5).contains(&rating) {
            return Err(AssistantError::InvalidInput(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }
        let res = sqlx::query(
            "INSERT INTO feedback (course_id, user_id, question, answer, rating, comment, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(course_id)
        .bind(user_id)
        .bind(question)
        .bind(answer)
        .bind(i64::from(rating))
        .bind(comment.filter(|c| !c.trim().is_empty()))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        info!(course_id, user_id, rating, "feedback recorded");
        Ok(res.last_insert_rowid())
    }

    /// All feedback for a course, oldest first.
    pub async fn entries(&self, course_id: &str) -> Result<Vec<FeedbackEntry>> {
        self.query_entries(
            "SELECT id, user_id, question, answer, rating, comment, created_at
             FROM feedback WHERE course_id = ? ORDER BY id",
            course_id,
            None,
        )
        .await
    }

    async fn query_entries(
        &self,
        sql: &str,
        course_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<FeedbackEntry>> {
        validate_course_id(course_id)?;
        let mut q = sqlx::query(sql).bind(course_id);
        if let Some(limit) = limit {
            q = q.bind(limit);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| FeedbackEntry {
                id: row.get("id"),
                user_id: row.get("user_id"),
                question: row.get("question"),
                answer: row.get("answer"),
                rating: row.get::<i64, _>("rating") as u8,
                comment: row.get("comment"),
                created_at: rfc3339(row.get("created_at")),
            })
            .collect())
    }

    pub async fn course_report(&self, course_id: &str) -> Result<CourseReport> {
        validate_course_id(course_id)?;
        let rows = sqlx::query(
            "SELECT rating, COUNT(*) AS n FROM feedback WHERE course_id = ? GROUP BY rating",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        let mut distribution = [0u64; 5];
        for row in &rows {
            let rating: i64 = row.get("rating");
            if (1..=5).contains(&rating) {
                distribution[(rating - 1) as usize] = row.get::<i64, _>("n") as u64;
            }
        }
        let total: u64 = distribution.iter().sum();
        let average_rating = (total > 0).then(|| {
            let sum: u64 = distribution
                .iter()
                .enumerate()
                .map(|(i, n)| (i as u64 + 1) * n)
                .sum();
            (sum as f64 / total as f64 * 100.0).round() / 100.0
        });

        let span = sqlx::query(
            "SELECT MIN(created_at) AS first_at, MAX(created_at) AS last_at FROM feedback WHERE course_id = ?",
        )
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;

        let sample_comments: Vec<String> = sqlx::query_scalar(
            "SELECT comment FROM feedback WHERE course_id = ? AND comment IS NOT NULL ORDER BY id LIMIT ?",
        )
        .bind(course_id)
        .bind(SAMPLE_COMMENTS)
        .fetch_all(&self.pool)
        .await?;

        let low_rated = self
            .query_entries(
                "SELECT id, user_id, question, answer, rating, comment, created_at
                 FROM feedback WHERE course_id = ? AND rating <= 2 ORDER BY id DESC LIMIT ?",
                course_id,
                Some(LOW_RATED_LIMIT),
            )
            .await?;

        Ok(CourseReport {
            course_id: course_id.to_string(),
            total,
            average_rating,
            distribution,
            sample_comments,
            low_rated,
            first_at: span.get::<Option<i64>, _>("first_at").map(rfc3339),
            last_at: span.get::<Option<i64>, _>("last_at").map(rfc3339),
        })
    }

    /// Write every entry of a course as CSV (`id,date,user_id,question,rating,comment`).
    pub async fn export_csv<W: std::io::Write>(&self, course_id: &str, writer: W) -> Result<usize> {
        let entries = self.entries(course_id).await?;
        let mut out = csv::Writer::from_writer(writer);
        let to_io = |e: csv::Error| AssistantError::Io(std::io::Error::new(std::io::ErrorKind::Other, e));
        out.write_record(["id", "date", "user_id", "question", "rating", "comment"])
            .map_err(to_io)?;
        for e in &entries {
            out.write_record([
                e.id.to_string().as_str(),
                e.created_at.as_str(),
                e.user_id.as_str(),
                e.question.as_str(),
                e.rating.to_string().as_str(),
                e.comment.as_deref().unwrap_or(""),
            ])
            .map_err(to_io)?;
        }
        out.flush()?;
        Ok(entries.len())
    }
}
