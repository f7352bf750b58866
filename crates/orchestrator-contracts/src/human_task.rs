//! Human-in-the-loop gates (§3, §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HumanTaskType {
    Validation,
    Approval,
    Input,
    Review,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HumanTaskStatus {
    Pending,
    Completed,
    Cancelled,
}

/// Declared on a `Step` (or standalone `human_task` step) to request a gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanGateConfig {
    #[serde(default = "default_task_type")]
    pub task_type: HumanTaskType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_task_type() -> HumanTaskType {
    HumanTaskType::Approval
}

/// A response submitted through `completeHumanTask`. `approved` selects
/// whether the FSM is sent `HUMAN_APPROVED` or `HUMAN_REJECTED`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanTaskResponse {
    pub approved: bool,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanTask {
    pub id: String,
    pub execution_id: String,
    pub step_index: usize,
    pub step_name: String,
    pub task_type: HumanTaskType,
    pub title: String,
    pub description: String,
    pub data: serde_json::Value,
    pub status: HumanTaskStatus,
    pub priority: u8,
    pub assignee: Option<String>,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response: Option<HumanTaskResponse>,
    pub completed_by: Option<String>,
}

impl HumanTask {
    pub fn new(
        id: impl Into<String>,
        execution_id: impl Into<String>,
        step_index: usize,
        step_name: impl Into<String>,
        gate: &HumanGateConfig,
        data: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            execution_id: execution_id.into(),
            step_index,
            step_name: step_name.into(),
            task_type: gate.task_type,
            title: gate.title.clone(),
            description: gate.description.clone(),
            data,
            status: HumanTaskStatus::Pending,
            priority: gate.priority,
            assignee: gate.assignee.clone(),
            timeout_ms: gate.timeout_ms,
            created_at,
            completed_at: None,
            response: None,
            completed_by: None,
        }
    }

    pub fn complete(
        &mut self,
        response: HumanTaskResponse,
        completed_by: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.status = HumanTaskStatus::Completed;
        self.completed_at = Some(now);
        self.completed_by = Some(completed_by.into());
        self.response = Some(response);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = HumanTaskStatus::Cancelled;
        self.completed_at = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.status == HumanTaskStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_records_response() {
        let gate = HumanGateConfig {
            task_type: HumanTaskType::Approval,
            title: "Review output".into(),
            description: String::new(),
            priority: 1,
            assignee: None,
            timeout_ms: Some(60_000),
        };
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut task = HumanTask::new("t1", "e1", 2, "review", &gate, serde_json::json!({}), now);
        assert!(task.is_pending());

        task.complete(
            HumanTaskResponse {
                approved: true,
                comment: None,
                payload: serde_json::json!({}),
            },
            "alice",
            now,
        );
        assert_eq!(task.status, HumanTaskStatus::Completed);
        assert_eq!(task.completed_by.as_deref(), Some("alice"));
        assert!(!task.is_pending());
    }
}
