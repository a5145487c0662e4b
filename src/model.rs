//! Records the dashboards read from the server.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dashboard audience
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  Intern,
  Mentor,
  TechLead,
  Admin,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Role::Intern => "intern",
      Role::Mentor => "mentor",
      Role::TechLead => "tech_lead",
      Role::Admin => "admin",
    };
    f.write_str(name)
  }
}

impl FromStr for Role {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
      "intern" => Ok(Role::Intern),
      "mentor" => Ok(Role::Mentor),
      "tech_lead" | "techlead" => Ok(Role::TechLead),
      "admin" => Ok(Role::Admin),
      other => Err(format!("unknown role: {}", other)),
    }
  }
}

/// User account as listed on the admin and mentor dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  pub id: String,
  pub username: String,
  pub name: String,
  #[serde(default)]
  pub email: Option<String>,
  pub role: Role,
  #[serde(default = "default_active")]
  pub is_active: bool,
  #[serde(default)]
  pub cohort_id: Option<String>,
  #[serde(default)]
  pub cohort_name: Option<String>,
  #[serde(default)]
  pub college: Option<String>,
  #[serde(default)]
  pub deactivation_reason: Option<String>,
}

fn default_active() -> bool {
  true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  NotStarted,
  InProgress,
  Done,
  Blocked,
}

/// Task assigned to an intern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  pub title: String,
  pub status: TaskStatus,
  #[serde(default)]
  pub priority: Option<String>,
  #[serde(default)]
  pub due_date: Option<String>,
  pub assignee: String,
}

/// One day of attendance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
  pub date: String,
  pub present: bool,
  #[serde(default)]
  pub hours: Option<f64>,
}

/// Aggregated progress for one intern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
  pub username: String,
  pub completed_tasks: u32,
  pub total_tasks: u32,
  #[serde(default)]
  pub attendance_rate: Option<f64>,
  #[serde(default)]
  pub score: Option<f64>,
}

impl PerformanceSummary {
  pub fn completion_rate(&self) -> f64 {
    if self.total_tasks == 0 {
      0.0
    } else {
      f64::from(self.completed_tasks) / f64::from(self.total_tasks)
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
  pub rank: u32,
  pub username: String,
  pub name: String,
  pub score: f64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_user_defaults_to_active() {
    let user: User = serde_json::from_str(
      r#"{"id":"u1","username":"alice","name":"Alice","role":"intern","cohortId":"c-7"}"#,
    )
    .unwrap();
    assert!(user.is_active);
    assert_eq!(user.cohort_id.as_deref(), Some("c-7"));
    assert_eq!(user.role, Role::Intern);
  }

  #[test]
  fn test_completion_rate_handles_no_tasks() {
    let summary = PerformanceSummary {
      username: "alice".into(),
      completed_tasks: 0,
      total_tasks: 0,
      attendance_rate: None,
      score: None,
    };
    assert_eq!(summary.completion_rate(), 0.0);
  }

  #[test]
  fn test_role_wire_name() {
    assert_eq!(serde_json::to_string(&Role::TechLead).unwrap(), "\"tech_lead\"");
    assert_eq!(Role::TechLead.to_string(), "tech_lead");
  }

  #[test]
  fn test_role_from_cli_arg() {
    assert_eq!("Tech-Lead".parse::<Role>(), Ok(Role::TechLead));
    assert_eq!(" admin ".parse::<Role>(), Ok(Role::Admin));
    assert!("manager".parse::<Role>().is_err());
  }
}
