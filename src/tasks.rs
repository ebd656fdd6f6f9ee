//! Background task bookkeeping for the dashboard.
//!
//! A task's status is derived from its timestamps: it is pending until it
//! starts, in progress until it completes or fails. The dashboard lists tasks
//! a page at a time, optionally filtered by status, and reports totals.

use crate::error::TaskError;

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

const DEFAULT_PAGE_LIMIT: u64 = 10;

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: u64,
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    /// Whether the task falls under `status`.
    ///
    /// The categories follow the timestamps independently, so a task that
    /// failed without ever being started counts as both failed and pending.
    pub fn has_status(&self, status: TaskStatus) -> bool {
        match status {
            TaskStatus::Completed => self.completed_at.is_some(),
            TaskStatus::Failed => self.failed_at.is_some(),
            TaskStatus::InProgress => {
                self.started_at.is_some() && self.completed_at.is_none() && self.failed_at.is_none()
            }
            TaskStatus::Pending => self.started_at.is_none(),
        }
    }
}

/// Status filter of the task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    InProgress,
    Pending,
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "in_progress" => Ok(TaskStatus::InProgress),
            "pending" => Ok(TaskStatus::Pending),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// Query parameters of the task list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListParams {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pagination {
    /// Number of tasks matching the filter, across all pages.
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

/// One page of the task list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub pagination: Pagination,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub in_progress: u64,
}

/// In-memory task store ordered by id.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<BTreeMap<u64, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending task and return its id.
    pub fn create(&self, kind: impl Into<String>, payload: Value) -> u64 {
        let mut tasks = self.tasks.write();
        let id = tasks.keys().next_back().map_or(1, |last| last + 1);
        tasks.insert(
            id,
            Task {
                id,
                kind: kind.into(),
                payload,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                failed_at: None,
                error: None,
            },
        );
        id
    }

    pub fn start(&self, id: u64) -> Result<(), TaskError> {
        self.update(id, |task| task.started_at = Some(Utc::now()))
    }

    pub fn complete(&self, id: u64) -> Result<(), TaskError> {
        self.update(id, |task| task.completed_at = Some(Utc::now()))
    }

    pub fn fail(&self, id: u64, error: impl Into<String>) -> Result<(), TaskError> {
        let error = error.into();
        self.update(id, |task| {
            task.failed_at = Some(Utc::now());
            task.error = Some(error);
        })
    }

    /// One page of tasks in id order.
    ///
    /// Pages start at 1 and default to 10 tasks. A page past the end is
    /// empty but still reports the total. An unrecognised status is ignored.
    pub fn list(&self, params: &TaskListParams) -> TaskPage {
        let page = params.page.unwrap_or(1).max(1);
        let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1);
        let offset = (page - 1).saturating_mul(limit);

        let status = params.status.as_deref().and_then(|raw| match raw.parse() {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("Listing all tasks: {}", e);
                None
            }
        });

        let tasks = self.tasks.read();
        let matching: Vec<&Task> = tasks
            .values()
            .filter(|task| status.map_or(true, |s| task.has_status(s)))
            .collect();
        let total = matching.len() as u64;
        let page_tasks = matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();

        TaskPage {
            tasks: page_tasks,
            pagination: Pagination { total, page, limit },
        }
    }

    pub fn stats(&self) -> TaskStats {
        let tasks = self.tasks.read();
        let count = |status| tasks.values().filter(|t| t.has_status(status)).count() as u64;
        TaskStats {
            total: tasks.len() as u64,
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            pending: count(TaskStatus::Pending),
            in_progress: count(TaskStatus::InProgress),
        }
    }

    pub fn get(&self, id: u64) -> Result<Task, TaskError> {
        self.tasks.read().get(&id).cloned().ok_or(TaskError::NotFound(id))
    }

    /// Look a task up by an id taken from a request path.
    pub fn get_by_id(&self, raw_id: &str) -> Result<Task, TaskError> {
        let id = raw_id
            .trim()
            .parse()
            .map_err(|_| TaskError::InvalidId(raw_id.to_string()))?;
        self.get(id)
    }

    fn update(&self, id: u64, apply: impl FnOnce(&mut Task)) -> Result<(), TaskError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        apply(task);
        Ok(())
    }
}
