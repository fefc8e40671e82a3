use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
}

impl PlanStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw
            .trim()
            .to_ascii_lowercase()
            .replace(|c: char| c == '-' || c == ' ', "_")
            .as_str()
        {
            "pending" | "todo" => Some(PlanStatus::Pending),
            "in_progress" | "active" | "doing" => Some(PlanStatus::InProgress),
            "completed" | "complete" | "done" => Some(PlanStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanStep {
    pub step: String,
    pub status: PlanStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSnapshot {
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub steps: Vec<PlanStep>,
}

impl PlanSnapshot {
    pub fn new(steps: Vec<PlanStep>, explanation: Option<String>) -> Self {
        Self {
            updated_at: Utc::now(),
            explanation,
            steps,
        }
    }

    pub fn in_progress_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == PlanStatus::InProgress)
            .count()
    }
}
