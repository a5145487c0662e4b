//! Logical read resources and their cache keys.

use url::Url;

use crate::cache::{QueryKey, TtlTier};
use crate::client::endpoint_url;
use crate::error::Result;

/// Read endpoints the dashboards fetch through the cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKey {
  /// Tasks assigned to one intern
  UserTasks { username: String },
  /// Performance summary for one intern
  UserPerformance { username: String },
  /// Attendance history for one intern
  UserAttendance { username: String },
  /// Ranking within a scope ("global", a college, a cohort)
  Leaderboard { scope: String },
  /// Interns enrolled from one college
  CollegeInterns { college: String },
  /// Members of one cohort
  CohortMembers { cohort_id: String },
  /// Interns mentored by one user
  MentorInterns { username: String },
  /// Every user account (admin view)
  AdminUsers,
}

impl ResourceKey {
  fn resource(&self) -> &'static str {
    match self {
      Self::UserTasks { .. } => "user-tasks",
      Self::UserPerformance { .. } => "user-performance",
      Self::UserAttendance { .. } => "user-attendance",
      Self::Leaderboard { .. } => "leaderboard",
      Self::CollegeInterns { .. } => "college-interns",
      Self::CohortMembers { .. } => "cohort-members",
      Self::MentorInterns { .. } => "mentor-interns",
      Self::AdminUsers => "admin-users",
    }
  }

  fn scope(&self) -> &str {
    match self {
      Self::UserTasks { username }
      | Self::UserPerformance { username }
      | Self::UserAttendance { username }
      | Self::MentorInterns { username } => username,
      Self::Leaderboard { scope } => scope,
      Self::CollegeInterns { college } => college,
      Self::CohortMembers { cohort_id } => cohort_id,
      Self::AdminUsers => "all",
    }
  }

  /// Prefix shared by every key of this resource kind, e.g. `user-tasks:`
  pub fn prefix(&self) -> String {
    format!("{}:", self.resource())
  }

  /// Read endpoint under `base`.
  ///
  /// The scope is normalized the same way as the cache key, so every key
  /// maps to exactly one URL. Scopes are percent-encoded as single path
  /// segments or query values.
  pub fn url(&self, base: &Url) -> Result<Url> {
    let scope = normalize_scope(self.scope());
    let scope = scope.as_str();
    let mut url = match self {
      Self::UserTasks { .. } => endpoint_url(base, &["api", "users", scope, "tasks"])?,
      Self::UserPerformance { .. } => {
        endpoint_url(base, &["api", "users", scope, "performance"])?
      }
      Self::UserAttendance { .. } => endpoint_url(base, &["api", "users", scope, "attendance"])?,
      Self::Leaderboard { .. } => endpoint_url(base, &["api", "leaderboard"])?,
      Self::CollegeInterns { .. } => endpoint_url(base, &["api", "colleges", scope, "interns"])?,
      Self::CohortMembers { .. } => endpoint_url(base, &["api", "cohorts", scope, "members"])?,
      Self::MentorInterns { .. } => endpoint_url(base, &["api", "mentors", scope, "interns"])?,
      Self::AdminUsers => endpoint_url(base, &["api", "admin", "users"])?,
    };
    if let Self::Leaderboard { .. } = self {
      url.query_pairs_mut().append_pair("scope", scope);
    }
    Ok(url)
  }
}

impl QueryKey for ResourceKey {
  fn cache_key(&self) -> String {
    format!("{}:{}", self.resource(), normalize_scope(self.scope()))
  }

  fn description(&self) -> String {
    match self {
      Self::UserTasks { username } => format!("tasks for {}", username),
      Self::UserPerformance { username } => format!("performance of {}", username),
      Self::UserAttendance { username } => format!("attendance of {}", username),
      Self::Leaderboard { scope } => format!("leaderboard ({})", scope),
      Self::CollegeInterns { college } => format!("interns from {}", college),
      Self::CohortMembers { cohort_id } => format!("cohort {} members", cohort_id),
      Self::MentorInterns { username } => format!("interns of mentor {}", username),
      Self::AdminUsers => "all users".to_string(),
    }
  }

  fn tier(&self) -> TtlTier {
    match self {
      Self::UserTasks { .. } | Self::AdminUsers | Self::MentorInterns { .. } => TtlTier::Short,
      Self::UserPerformance { .. }
      | Self::UserAttendance { .. }
      | Self::CollegeInterns { .. }
      | Self::CohortMembers { .. } => TtlTier::Medium,
      Self::Leaderboard { .. } => TtlTier::Long,
    }
  }
}

/// Normalize a scope for consistent keys.
/// Trims whitespace and lowercases, since usernames and college codes are
/// case-insensitive on the server.
fn normalize_scope(scope: &str) -> String {
  scope.trim().to_lowercase()
}
