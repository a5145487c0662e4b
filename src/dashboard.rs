//! One mounted dashboard: the cache, tab controller and sync engine wired
//! together for a signed-in user.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{QueryKey, TtlCache};
use crate::client::{ResourceEndpoint, ResourceReader};
use crate::config::Config;
use crate::error::Result;
use crate::keys::ResourceKey;
use crate::model::{AttendanceRecord, LeaderboardEntry, PerformanceSummary, Role, Task, User};
use crate::scheduler::ScheduledTask;
use crate::sync::{BulkOutcome, MutationOptions, Overlaid, PatchFields, SyncEngine};
use crate::tabs::{FetchOutcome, TabSource, ViewDataController};

/// Who the dashboard is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub username: String,
  pub role: Role,
  /// Scopes the tech lead's intern list
  pub college: Option<String>,
}

/// Data held by one tab.
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardData {
  Tasks(Vec<Task>),
  Performance(PerformanceSummary),
  Attendance(Vec<AttendanceRecord>),
  Leaderboard(Vec<LeaderboardEntry>),
  Users(Vec<User>),
}

impl DashboardData {
  pub fn users(&self) -> Option<&[User]> {
    match self {
      DashboardData::Users(users) => Some(users),
      _ => None,
    }
  }

  /// One-line description for logs.
  pub fn summary(&self) -> String {
    match self {
      DashboardData::Tasks(tasks) => format!("{} tasks", tasks.len()),
      DashboardData::Performance(p) => format!(
        "{}/{} tasks completed ({:.0}%)",
        p.completed_tasks,
        p.total_tasks,
        p.completion_rate() * 100.0
      ),
      DashboardData::Attendance(days) => {
        let present = days.iter().filter(|d| d.present).count();
        format!("present {} of {} days", present, days.len())
      }
      DashboardData::Leaderboard(entries) => format!("{} ranked", entries.len()),
      DashboardData::Users(users) => {
        let active = users.iter().filter(|u| u.is_active).count();
        format!("{} users ({} active)", users.len(), active)
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DashboardTab {
  Tasks,
  Performance,
  Attendance,
  Leaderboard,
  Interns,
  Users,
}

impl DashboardTab {
  fn for_role(role: Role) -> &'static [DashboardTab] {
    use DashboardTab::*;
    match role {
      Role::Intern => &[Tasks, Performance, Attendance, Leaderboard],
      Role::Mentor => &[Interns, Leaderboard],
      Role::TechLead => &[Interns, Performance, Leaderboard],
      Role::Admin => &[Users, Leaderboard],
    }
  }

  fn id(self) -> &'static str {
    match self {
      DashboardTab::Tasks => "tasks",
      DashboardTab::Performance => "performance",
      DashboardTab::Attendance => "attendance",
      DashboardTab::Leaderboard => "leaderboard",
      DashboardTab::Interns => "interns",
      DashboardTab::Users => "users",
    }
  }

  fn key(self, session: &Session) -> ResourceKey {
    let username = session.username.clone();
    match self {
      DashboardTab::Tasks => ResourceKey::UserTasks { username },
      DashboardTab::Performance => ResourceKey::UserPerformance { username },
      DashboardTab::Attendance => ResourceKey::UserAttendance { username },
      DashboardTab::Leaderboard => ResourceKey::Leaderboard {
        scope: "global".to_string(),
      },
      DashboardTab::Interns => match (&session.role, &session.college) {
        (Role::TechLead, Some(college)) => ResourceKey::CollegeInterns {
          college: college.clone(),
        },
        _ => ResourceKey::MentorInterns { username },
      },
      DashboardTab::Users => ResourceKey::AdminUsers,
    }
  }

  fn lists_users(self) -> bool {
    matches!(self, DashboardTab::Interns | DashboardTab::Users)
  }

  fn decode(self, value: Value) -> Result<DashboardData> {
    Ok(match self {
      DashboardTab::Tasks => DashboardData::Tasks(serde_json::from_value(value)?),
      DashboardTab::Performance => DashboardData::Performance(serde_json::from_value(value)?),
      DashboardTab::Attendance => DashboardData::Attendance(serde_json::from_value(value)?),
      DashboardTab::Leaderboard => DashboardData::Leaderboard(serde_json::from_value(value)?),
      DashboardTab::Interns | DashboardTab::Users => {
        DashboardData::Users(serde_json::from_value(value)?)
      }
    })
  }
}

/// Wires the three sync components for one session.
///
/// Each dashboard owns its own cache, controller and engine; clones share
/// them.
#[derive(Clone)]
pub struct Dashboard {
  session: Session,
  cache: TtlCache,
  tabs: ViewDataController<DashboardData>,
  sync: SyncEngine,
  keys: Vec<(DashboardTab, ResourceKey)>,
  poll_interval: Duration,
}

impl Dashboard {
  pub fn new(
    config: &Config,
    session: Session,
    endpoint: Arc<dyn ResourceEndpoint>,
    reader: Arc<dyn ResourceReader>,
  ) -> Self {
    let policy = config.cache.policy();
    let cache = TtlCache::new(policy);

    let layout = DashboardTab::for_role(session.role);
    let initial = layout.first().map(|tab| tab.id()).unwrap_or_default();
    let tabs = ViewDataController::new(initial, cache.clone(), config.tabs.options(&policy));

    let mut keys = Vec::with_capacity(layout.len());
    for &tab in layout {
      let key = tab.key(&session);
      tabs.register(tab.id(), tab_source(tab, key.clone(), &cache, &reader));
      keys.push((tab, key));
    }

    info!(user = %session.username, role = %session.role, tabs = keys.len(), "dashboard ready");
    Self {
      session,
      cache,
      tabs,
      sync: SyncEngine::new(endpoint, config.sync.options()),
      keys,
      poll_interval: config.sync.poll_interval(),
    }
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  pub fn cache(&self) -> &TtlCache {
    &self.cache
  }

  pub fn tabs(&self) -> &ViewDataController<DashboardData> {
    &self.tabs
  }

  pub fn sync(&self) -> &SyncEngine {
    &self.sync
  }

  /// Tab ids in display order.
  pub fn tab_ids(&self) -> Vec<&'static str> {
    self.keys.iter().map(|(tab, _)| tab.id()).collect()
  }

  /// Load the initial tab.
  pub async fn open(&self) -> Result<()> {
    let active = self.tabs.active_tab();
    self.tabs.switch_tab(&active).await
  }

  pub async fn switch_tab(&self, id: &str) -> Result<()> {
    self.tabs.switch_tab(id).await
  }

  /// Preload every tab other than the active one.
  pub fn preload_inactive(&self) -> Vec<JoinHandle<Result<FetchOutcome>>> {
    let active = self.tabs.active_tab();
    self
      .tab_ids()
      .into_iter()
      .filter(|id| *id != active)
      .filter_map(|id| self.tabs.preload_tab(id).ok().flatten())
      .collect()
  }

  /// The first user-list tab with pending patches merged in.
  pub fn users_view(&self) -> Option<Vec<Overlaid<User>>> {
    let (tab, _) = self.keys.iter().find(|(tab, _)| tab.lists_users())?;
    match self.tabs.data(tab.id())? {
      DashboardData::Users(users) => Some(self.sync.overlay(&users)),
      _ => None,
    }
  }

  /// Invalidate `keys`, then refresh every tab that reads one of them and
  /// has already been shown. Tabs not yet loaded pick up fresh data when
  /// they are first opened.
  pub async fn reconcile(&self, keys: &[ResourceKey]) -> Vec<(String, Result<FetchOutcome>)> {
    let stale: HashSet<String> = keys.iter().map(|key| key.cache_key()).collect();
    for key in &stale {
      self.cache.invalidate(key);
    }

    let active = self.tabs.active_tab();
    let mut results = Vec::new();
    for (tab, key) in &self.keys {
      if !stale.contains(&key.cache_key()) {
        continue;
      }
      let shown = tab.id() == active
        || self
          .tabs
          .state(tab.id())
          .map(|s| s.last_fetched_at.is_some() || s.loading)
          .unwrap_or(false);
      if !shown {
        debug!(tab = tab.id(), "reconcile skipped unopened tab");
        continue;
      }
      results.push((tab.id().to_string(), self.tabs.refresh(tab.id()).await));
    }
    info!(keys = stale.len(), refreshed = results.len(), "reconciled");
    results
  }

  fn user_list_keys(&self) -> Vec<ResourceKey> {
    self
      .keys
      .iter()
      .filter(|(tab, _)| tab.lists_users())
      .map(|(_, key)| key.clone())
      .collect()
  }

  async fn reconcile_users(&self) {
    // Cohort rosters are not tabs, but other views may have cached them.
    self.cache.invalidate_by_prefix("cohort-members:");
    self.reconcile(&self.user_list_keys()).await;
  }

  pub async fn update_user(&self, user_id: &str, fields: PatchFields) -> Result<Value> {
    let result = self
      .sync
      .update_user(user_id, fields, MutationOptions::new())
      .await?;
    self.reconcile_users().await;
    Ok(result)
  }

  pub async fn set_user_active(
    &self,
    user_id: &str,
    active: bool,
    reason: Option<&str>,
  ) -> Result<Value> {
    let result = self
      .sync
      .toggle_user_status(user_id, active, reason, MutationOptions::new())
      .await?;
    self.reconcile_users().await;
    Ok(result)
  }

  pub async fn assign_cohort(
    &self,
    user_id: &str,
    cohort_id: &str,
    cohort_name: Option<&str>,
  ) -> Result<Value> {
    let result = self
      .sync
      .assign_cohort(user_id, cohort_id, cohort_name, MutationOptions::new())
      .await?;
    self.reconcile_users().await;
    Ok(result)
  }

  pub async fn remove_cohort(&self, user_id: &str) -> Result<Value> {
    let result = self
      .sync
      .remove_cohort(user_id, MutationOptions::new())
      .await?;
    self.reconcile_users().await;
    Ok(result)
  }

  pub async fn bulk_set_active(
    &self,
    user_ids: &[String],
    active: bool,
    reason: Option<&str>,
  ) -> Result<BulkOutcome> {
    let outcome = self
      .sync
      .bulk_toggle_status(user_ids, active, reason, MutationOptions::new())
      .await?;
    self.reconcile_users().await;
    Ok(outcome)
  }

  pub async fn bulk_assign_cohort(
    &self,
    user_ids: &[String],
    cohort_id: &str,
    cohort_name: Option<&str>,
  ) -> Result<BulkOutcome> {
    let outcome = self
      .sync
      .bulk_assign_cohort(user_ids, cohort_id, cohort_name, MutationOptions::new())
      .await?;
    self.reconcile_users().await;
    Ok(outcome)
  }

  /// Poll the server's sync queue at the configured interval. Dropping the
  /// handle stops polling.
  pub fn start_status_polling(&self) -> ScheduledTask {
    debug!(interval = ?self.poll_interval, "starting status polling");
    self.sync.start_auto_refresh(self.poll_interval)
  }
}

fn tab_source(
  tab: DashboardTab,
  key: ResourceKey,
  cache: &TtlCache,
  reader: &Arc<dyn ResourceReader>,
) -> TabSource<DashboardData> {
  let cache_key = key.cache_key();
  let cache = cache.clone();
  let reader = Arc::clone(reader);

  TabSource::new(move || {
    let cache = cache.clone();
    let reader = Arc::clone(&reader);
    let key = key.clone();
    async move {
      let read_key = key.clone();
      let value: Value = cache
        .fetch(&key, move || async move { reader.read(&read_key).await })
        .await?;
      tab.decode(value)
    }
  })
  .cached_as(cache_key)
}
