use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Sent,
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Sent => "sent",
            TaskStatus::Dead => "dead",
        }
    }

    /// Sent and dead tasks are never picked up by a worker again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Sent | TaskStatus::Dead)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "sent" => Ok(TaskStatus::Sent),
            "dead" => Ok(TaskStatus::Dead),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// A queued outbound email and its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: TaskStatus,
    pub fail_count: i32,
    pub last_error: Option<String>,
    /// Set when a worker claims the task, refreshed right before each
    /// delivery attempt, cleared when it is requeued.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Incremented on every claim. Outcome reports carry the token they were
    /// claimed with and are ignored once another claim has taken over.
    pub lease_token: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Task {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Task {
            id: row.try_get("id")?,
            recipient: row.try_get("to_addr")?,
            subject: row.try_get("subject")?,
            body: row.try_get("body")?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse task status: {}", e).into())
            })?,
            fail_count: row.try_get("fail_count")?,
            last_error: row.try_get("last_error")?,
            claimed_at: row.try_get("claimed_at")?,
            lease_token: row.try_get("lease_token")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Task {
    /// Whether another failure would still send the task back to pending.
    pub fn can_retry(&self, max_retries: i32) -> bool {
        self.fail_count < max_retries
    }

    pub fn lease_expired(&self, lease: chrono::Duration, now: DateTime<Utc>) -> bool {
        match (self.status, self.claimed_at) {
            (TaskStatus::Processing, Some(claimed_at)) => claimed_at + lease <= now,
            _ => false,
        }
    }
}

/// Validated content for a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMailTask {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Task view returned by the operator endpoints. The message body is omitted.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskResponse {
    pub id: i64,
    pub recipient: String,
    pub subject: String,
    pub status: TaskStatus,
    pub fail_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            recipient: task.recipient,
            subject: task.subject,
            status: task.status,
            fail_count: task.fail_count,
            last_error: task.last_error,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TaskStats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub dead: i64,
}
