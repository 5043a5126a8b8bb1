//! Plan produced by the planner tool.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub number: u32,
    pub description: String,
    pub status: StepStatus,
}

/// A numbered, status-tagged list of natural-language actions.
///
/// `current_step_index` starts at -1 (before the first step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    #[serde(rename = "currentStepIndex", default = "Plan::initial_index")]
    pub current_step_index: i32,
}

impl Plan {
    fn initial_index() -> i32 {
        -1
    }

    /// An empty plan, used when planning fails.
    pub fn empty() -> Self {
        Self {
            steps: Vec::new(),
            current_step_index: -1,
        }
    }
}
