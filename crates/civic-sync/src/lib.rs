//! Report lifecycle store: the session's in-memory authority for reports,
//! notifications and identity, mirrored to a local durable cache and
//! reconciled against the remote document store.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use civic_core::{
    CategoryFilter, DepartmentTally, GlobalStats, Notification, NotificationDraft, Report,
    ReportDraft, ReportEdit, ReportStatus, SessionUser, StatusFilter, TimelineEntry, UserStats,
    ValidationError,
};
use civic_storage::{
    BackoffPolicy, DocumentStore, FileKeyValueStore, HttpDocumentStore, HttpStoreConfig,
    KeyValueStore, MemoryDocumentStore, RemoteError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod services;

pub use services::{
    AdminService, CitizenRegistration, DepartmentUpdate, DepartmentUserUpdate, NewDepartmentUser,
    ProfileUpdate, ReportService, UserService,
};

pub const CRATE_NAME: &str = "civic-sync";

pub const REPORTS_KEY: &str = "@reports_data";
pub const NOTIFICATIONS_KEY: &str = "@notifications_data";
pub const CURRENT_USER_KEY: &str = "@current_user";

const SEED_REPORTS_YAML: &str = include_str!("../seed/reports.yaml");

/// How remote reports are reconciled with local copies sharing the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    #[default]
    RemoteWins,
    /// Keep the local copy only when its last modification is strictly newer.
    MostRecentWins,
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "remote-wins" | "remote_wins" | "remote" => Ok(MergePolicy::RemoteWins),
            "most-recent-wins" | "most_recent_wins" | "most-recent" => {
                Ok(MergePolicy::MostRecentWins)
            }
            other => Err(format!("unknown merge policy `{other}`")),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub http_timeout_secs: u64,
    /// Maximum retained notifications; `0` keeps everything.
    pub notification_cap: usize,
    pub merge_policy: MergePolicy,
    pub seed_demo: bool,
    pub clear_on_logout: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./civic-data"),
            remote_url: None,
            remote_token: None,
            http_timeout_secs: 20,
            notification_cap: 200,
            merge_policy: MergePolicy::RemoteWins,
            seed_demo: true,
            clear_on_logout: false,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("CIVIC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            remote_url: std::env::var("CIVIC_REMOTE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            remote_token: std::env::var("CIVIC_REMOTE_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            http_timeout_secs: std::env::var("CIVIC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            notification_cap: std::env::var("CIVIC_NOTIFICATION_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.notification_cap),
            merge_policy: match std::env::var("CIVIC_MERGE_POLICY") {
                Ok(raw) => raw.parse().unwrap_or_else(|err: String| {
                    warn!(error = %err, "falling back to remote-wins merge policy");
                    MergePolicy::RemoteWins
                }),
                Err(_) => defaults.merge_policy,
            },
            seed_demo: env_flag("CIVIC_SEED_DEMO", defaults.seed_demo),
            clear_on_logout: env_flag("CIVIC_CLEAR_ON_LOGOUT", defaults.clear_on_logout),
        }
    }

    pub fn local_cache(&self) -> Arc<dyn KeyValueStore> {
        Arc::new(FileKeyValueStore::new(self.data_dir.join("cache")))
    }

    /// HTTP document store when a remote URL is configured, otherwise an
    /// in-process store that lives as long as the returned handle.
    pub fn remote_store(&self) -> anyhow::Result<Arc<dyn DocumentStore>> {
        let Some(url) = &self.remote_url else {
            info!("no remote url configured; using in-memory document store");
            return Ok(Arc::new(MemoryDocumentStore::new()));
        };
        let store = HttpDocumentStore::new(HttpStoreConfig {
            base_url: url.clone(),
            bearer_token: self.remote_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        })
        .with_context(|| format!("configuring remote document store at {url}"))?;
        Ok(Arc::new(store))
    }
}

/// Produces the human-readable notes written into report timelines.
pub trait Localizer: Send + Sync {
    fn submitted_note(&self) -> String {
        "Submitted by citizen".to_string()
    }

    fn status_note(&self, status: ReportStatus) -> String {
        format!("Status updated to {}", status.display_label())
    }

    fn assigned_note(&self, department: &str) -> String {
        format!("Assigned to {department} department")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnglishLocalizer;

impl Localizer for EnglishLocalizer {}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("report {report_id} belongs to another user")]
    NotOwner { report_id: String },
    #[error("report {report_id} can no longer be edited (status {status})")]
    NotEditable {
        report_id: String,
        status: ReportStatus,
    },
    #[error("report {report_id} can no longer be deleted (status {status})")]
    NotDeletable {
        report_id: String,
        status: ReportStatus,
    },
    #[error("no user is signed in")]
    NoSession,
}

/// Built-in demo reports used when the cache holds no report collection.
pub fn seed_reports() -> anyhow::Result<Vec<Report>> {
    let mut reports: Vec<Report> =
        serde_yaml::from_str(SEED_REPORTS_YAML).context("parsing built-in seed reports")?;
    for report in &mut reports {
        report.restore_timeline_invariants();
    }
    Ok(reports)
}

#[derive(Debug, Default)]
struct AdminRole {
    /// Bumped on every identity change so a late check cannot apply to a newer session.
    epoch: u64,
    is_admin: bool,
}

pub struct ReportLifecycleStore {
    config: StoreConfig,
    cache: Arc<dyn KeyValueStore>,
    reports_remote: ReportService,
    admin: AdminService,
    localizer: Box<dyn Localizer>,
    reports: Vec<Report>,
    notifications: Vec<Notification>,
    current_user: Option<SessionUser>,
    admin_role: Arc<Mutex<AdminRole>>,
    admin_check: Option<JoinHandle<()>>,
    last_notification_id: i64,
    initialized: bool,
}

impl ReportLifecycleStore {
    pub fn new(
        config: StoreConfig,
        cache: Arc<dyn KeyValueStore>,
        remote: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            cache,
            reports_remote: ReportService::new(remote.clone()),
            admin: AdminService::new(remote),
            localizer: Box::<EnglishLocalizer>::default(),
            reports: Vec::new(),
            notifications: Vec::new(),
            current_user: None,
            admin_role: Arc::default(),
            admin_check: None,
            last_notification_id: 0,
            initialized: false,
        }
    }

    /// Build the store with the collaborators named by `config`.
    pub fn from_config(config: StoreConfig) -> anyhow::Result<Self> {
        let cache = config.local_cache();
        let remote = config.remote_store()?;
        Ok(Self::new(config, cache, remote))
    }

    pub fn with_localizer(mut self, localizer: Box<dyn Localizer>) -> Self {
        self.localizer = localizer;
        self
    }

    /// Load cached state (or seed data), start the admin-role check for a
    /// cached identity, and enable write-through persistence.
    pub async fn initialize(&mut self) {
        if self.initialized {
            return;
        }

        self.reports = match self.load_cached::<Vec<Report>>(REPORTS_KEY).await {
            Some(mut reports) => {
                reports.iter_mut().for_each(Report::restore_timeline_invariants);
                reports
            }
            None if self.config.seed_demo => seed_reports().unwrap_or_else(|err| {
                warn!(error = %err, "seed reports unavailable");
                Vec::new()
            }),
            None => Vec::new(),
        };
        self.notifications = self
            .load_cached::<Vec<Notification>>(NOTIFICATIONS_KEY)
            .await
            .unwrap_or_default();
        self.last_notification_id = self.notifications.iter().map(|n| n.id).max().unwrap_or(0);
        self.current_user = self.load_cached::<SessionUser>(CURRENT_USER_KEY).await;

        if let Some(uid) = self
            .current_user
            .as_ref()
            .and_then(SessionUser::identity_token)
            .map(str::to_string)
        {
            self.spawn_admin_check(uid);
        }

        self.initialized = true;
        info!(
            reports = self.reports.len(),
            notifications = self.notifications.len(),
            signed_in = self.current_user.is_some(),
            "report store initialized"
        );
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Wait for a pending background admin-role check, if any.
    pub async fn settle_admin_check(&mut self) {
        if let Some(handle) = self.admin_check.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "admin role check task failed");
                }
            }
        }
    }

    pub fn reports(&self) -> &[Report] {
        &self.reports
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn current_user(&self) -> Option<&SessionUser> {
        self.current_user.as_ref()
    }

    /// Department and staff administration against the same remote store.
    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    pub fn is_admin(&self) -> bool {
        self.admin_role
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_admin
    }

    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    /// Reports owned by `user_id`, defaulting to the signed-in user.
    pub fn user_reports(&self, user_id: Option<&str>) -> Vec<&Report> {
        let owner = user_id.or_else(|| {
            self.current_user
                .as_ref()
                .and_then(SessionUser::report_owner_id)
        });
        match owner {
            Some(owner) => self.reports.iter().filter(|r| r.user_id == owner).collect(),
            None => Vec::new(),
        }
    }

    pub fn user_stats(&self) -> UserStats {
        let mine = self.user_reports(None);
        UserStats {
            total: mine.len(),
            pending: mine
                .iter()
                .filter(|r| r.status == ReportStatus::Pending)
                .count(),
            resolved: mine
                .iter()
                .filter(|r| r.status == ReportStatus::Resolved)
                .count(),
        }
    }

    pub fn stats(&self) -> GlobalStats {
        let count = |pred: fn(ReportStatus) -> bool| {
            self.reports.iter().filter(|r| pred(r.status)).count()
        };
        GlobalStats {
            total: self.reports.len(),
            pending: count(|s| s == ReportStatus::Pending),
            in_progress: count(ReportStatus::is_in_flight),
            resolved: count(|s| s == ReportStatus::Resolved),
        }
    }

    pub fn reports_by_status(&self, filter: StatusFilter) -> Vec<&Report> {
        self.reports
            .iter()
            .filter(|r| filter.matches(r.status))
            .collect()
    }

    pub fn reports_by_department(&self, filter: CategoryFilter) -> Vec<&Report> {
        self.reports
            .iter()
            .filter(|r| filter.matches(r.category))
            .collect()
    }

    pub fn report(&self, id: &str) -> Option<&Report> {
        self.reports.iter().find(|r| r.id == id)
    }

    pub fn department_stats(&self) -> DepartmentTally {
        let mut tally = DepartmentTally::new();
        for report in &self.reports {
            *tally.entry(report.category).or_default() += 1;
        }
        tally
    }

    /// Submit a report. The remote document is created first; if that fails
    /// nothing changes locally and the error is returned.
    pub async fn add_report(&mut self, draft: ReportDraft) -> Result<String, StoreError> {
        let now = Utc::now();
        let note = self.localizer.submitted_note();
        let seed_entry = TimelineEntry {
            status: ReportStatus::Pending,
            date: now,
            note: note.clone(),
        };

        let id = self
            .reports_remote
            .create_report(&draft, std::slice::from_ref(&seed_entry))
            .await?;

        let report = Report::submitted(id.clone(), draft, now, note);
        info!(report_id = %id, category = %report.category, "report submitted");
        self.reports.insert(0, report);
        self.persist_reports().await;

        self.add_notification(NotificationDraft::report_submitted(&id))
            .await;
        Ok(id)
    }

    /// Record a status change. Returns `false` (and does nothing) for an unknown id.
    pub async fn update_report_status(
        &mut self,
        id: &str,
        status: ReportStatus,
        note: Option<String>,
    ) -> bool {
        let Some(report) = self.reports.iter_mut().find(|r| r.id == id) else {
            debug!(report_id = id, "status update for unknown report ignored");
            return false;
        };

        let note = note.unwrap_or_else(|| self.localizer.status_note(status));
        report.record_status(status, note, Utc::now());
        let snapshot = report.clone();
        info!(report_id = id, status = %status, "report status updated");

        self.persist_reports().await;
        self.mirror_lifecycle(&snapshot).await;
        self.add_notification(NotificationDraft::status_changed(id, status))
            .await;
        true
    }

    /// Set the report's department; only a `Pending` report moves to
    /// `Assigned` and notifies. Returns `false` for an unknown id.
    pub async fn assign_department(&mut self, id: &str, department: &str) -> bool {
        let Some(report) = self.reports.iter_mut().find(|r| r.id == id) else {
            debug!(report_id = id, "assignment for unknown report ignored");
            return false;
        };

        let note = self.localizer.assigned_note(department);
        let transitioned = report.assign_department(department, note, Utc::now());
        let snapshot = report.clone();
        info!(report_id = id, department, transitioned, "department assigned");

        self.persist_reports().await;
        self.mirror_lifecycle(&snapshot).await;
        if transitioned {
            self.add_notification(NotificationDraft::assigned(id, department))
                .await;
        }
        true
    }

    /// Prepend a notification and return its id.
    pub async fn add_notification(&mut self, draft: NotificationDraft) -> i64 {
        let id = self.next_notification_id();
        self.notifications
            .insert(0, draft.into_notification(id, Utc::now()));

        let cap = self.config.notification_cap;
        if cap > 0 && self.notifications.len() > cap {
            let dropped = self.notifications.len() - cap;
            self.notifications.truncate(cap);
            debug!(dropped, cap, "oldest notifications pruned");
        }

        self.persist_notifications().await;
        id
    }

    pub async fn mark_notification_as_read(&mut self, id: i64) {
        let Some(notification) = self.notifications.iter_mut().find(|n| n.id == id) else {
            return;
        };
        if notification.read {
            return;
        }
        notification.read = true;
        self.persist_notifications().await;
    }

    pub async fn mark_all_notifications_as_read(&mut self) {
        let mut changed = false;
        for notification in self.notifications.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            changed = true;
        }
        if changed {
            self.persist_notifications().await;
        }
    }

    /// Start a session: resolve the admin role, then pull the user's remote
    /// reports into the local collection. Report fetch failures are logged only.
    pub async fn login(&mut self, user: SessionUser) {
        let uid = user.identity_token().map(str::to_string);
        let owner = user.report_owner_id().map(str::to_string);

        let epoch = self.reset_admin_role();
        self.current_user = Some(user);
        self.persist_current_user().await;

        if let Some(uid) = uid {
            let is_admin = self.admin.verify_admin_role(&uid).await;
            self.apply_admin_role(epoch, is_admin);
        }

        let Some(owner) = owner else {
            return;
        };
        match self.reports_remote.fetch_user_reports(&owner).await {
            Ok(fetched) => {
                let count = fetched.len();
                self.merge_remote(fetched);
                self.persist_reports().await;
                info!(user_id = %owner, fetched = count, "session reports restored");
            }
            Err(err) => {
                warn!(user_id = %owner, error = %err, "failed to load user reports on login");
            }
        }
    }

    /// End the session. Cached reports and notifications survive unless
    /// `clear_on_logout` is configured.
    pub async fn logout(&mut self) {
        self.reset_admin_role();
        self.current_user = None;
        self.persist_current_user().await;

        if self.config.clear_on_logout {
            self.reports.clear();
            self.notifications.clear();
            self.persist_reports().await;
            self.persist_notifications().await;
        }
        info!("signed out");
    }

    /// Owner edit of a report's content while it is still `Pending` or `Assigned`.
    /// Returns `Ok(false)` for an unknown id.
    pub async fn edit_report(&mut self, id: &str, edit: ReportEdit) -> Result<bool, StoreError> {
        let Some(index) = self.owned_report_index(id)? else {
            return Ok(false);
        };
        let status = self.reports[index].status;
        if !status.owner_editable() {
            return Err(StoreError::NotEditable {
                report_id: id.to_string(),
                status,
            });
        }
        if edit.is_empty() {
            return Ok(true);
        }

        let mut updated = self.reports[index].clone();
        updated.apply_edit(edit, Utc::now());
        self.reports_remote.update_content(&updated).await?;

        self.reports[index] = updated;
        self.persist_reports().await;
        info!(report_id = id, "report edited by owner");
        Ok(true)
    }

    /// Owner deletion of a `Pending` report. Returns `Ok(false)` for an unknown id.
    pub async fn delete_report(&mut self, id: &str) -> Result<bool, StoreError> {
        let Some(index) = self.owned_report_index(id)? else {
            return Ok(false);
        };
        let status = self.reports[index].status;
        if status != ReportStatus::Pending {
            return Err(StoreError::NotDeletable {
                report_id: id.to_string(),
                status,
            });
        }

        self.reports_remote.delete_report(id).await?;
        self.reports.remove(index);
        self.persist_reports().await;
        info!(report_id = id, "report deleted by owner");
        Ok(true)
    }

    /// Pull the whole remote `reports` collection and merge it in. Returns the
    /// number of remote reports fetched.
    pub async fn refresh_all_reports(&mut self) -> Result<usize, StoreError> {
        let fetched = self.reports_remote.fetch_all_reports().await?;
        let count = fetched.len();
        self.merge_remote(fetched);
        self.persist_reports().await;
        info!(fetched = count, "all reports refreshed");
        Ok(count)
    }

    fn owned_report_index(&self, id: &str) -> Result<Option<usize>, StoreError> {
        let owner = self
            .current_user
            .as_ref()
            .and_then(SessionUser::report_owner_id)
            .ok_or(StoreError::NoSession)?;
        let Some(index) = self.reports.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        if self.reports[index].user_id != owner {
            return Err(StoreError::NotOwner {
                report_id: id.to_string(),
            });
        }
        Ok(Some(index))
    }

    /// Merge by id: existing entries keep their position, unseen ones are appended.
    fn merge_remote(&mut self, fetched: Vec<Report>) {
        for remote in fetched {
            match self.reports.iter_mut().find(|r| r.id == remote.id) {
                Some(local) => {
                    let keep_local = self.config.merge_policy == MergePolicy::MostRecentWins
                        && local.last_modified() > remote.last_modified();
                    if keep_local {
                        debug!(report_id = %local.id, "keeping newer local report");
                    } else {
                        *local = remote;
                    }
                }
                None => self.reports.push(remote),
            }
        }
    }

    /// Best-effort push of a local admin mutation to the remote document.
    async fn mirror_lifecycle(&self, report: &Report) {
        match self.reports_remote.push_lifecycle(report).await {
            Ok(()) => {}
            Err(RemoteError::NotFound { .. }) => {
                debug!(report_id = %report.id, "report has no remote document; kept local only");
            }
            Err(err) => {
                warn!(report_id = %report.id, error = %err, "failed to mirror report to remote store");
            }
        }
    }

    /// Millisecond timestamp, bumped to stay strictly increasing.
    fn next_notification_id(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let id = now.max(self.last_notification_id.saturating_add(1));
        self.last_notification_id = id;
        id
    }

    fn reset_admin_role(&mut self) -> u64 {
        if let Some(handle) = self.admin_check.take() {
            handle.abort();
        }
        let mut role = self
            .admin_role
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        role.epoch += 1;
        role.is_admin = false;
        role.epoch
    }

    fn apply_admin_role(&self, epoch: u64, is_admin: bool) {
        let mut role = self
            .admin_role
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if role.epoch == epoch {
            role.is_admin = is_admin;
        }
    }

    fn spawn_admin_check(&mut self, uid: String) {
        let epoch = self.reset_admin_role();
        let admin = self.admin.clone();
        let role = Arc::clone(&self.admin_role);
        self.admin_check = Some(tokio::spawn(async move {
            let is_admin = admin.verify_admin_role(&uid).await;
            let mut role = role.lock().unwrap_or_else(PoisonError::into_inner);
            if role.epoch == epoch {
                role.is_admin = is_admin;
                debug!(uid = %uid, is_admin, "cached session admin role resolved");
            }
        }));
    }

    async fn load_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.cache.get(key).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(key, error = %err, "failed to read local cache");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "discarding unreadable cache entry");
                None
            }
        }
    }

    async fn write_cached<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if !self.initialized {
            return;
        }
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key, error = %err, "failed to serialize cache entry");
                return;
            }
        };
        if let Err(err) = self.cache.set(key, &payload).await {
            warn!(key, error = %err, "failed to write local cache");
        }
    }

    async fn persist_reports(&self) {
        self.write_cached(REPORTS_KEY, self.reports.as_slice()).await;
    }

    async fn persist_notifications(&self) {
        self.write_cached(NOTIFICATIONS_KEY, self.notifications.as_slice())
            .await;
    }

    async fn persist_current_user(&self) {
        match &self.current_user {
            Some(user) => self.write_cached(CURRENT_USER_KEY, user).await,
            None if self.initialized => {
                if let Err(err) = self.cache.remove(CURRENT_USER_KEY).await {
                    warn!(key = CURRENT_USER_KEY, error = %err, "failed to clear cached user");
                }
            }
            None => {}
        }
    }
}

impl Drop for ReportLifecycleStore {
    fn drop(&mut self) {
        if let Some(handle) = self.admin_check.take() {
            handle.abort();
        }
    }
}
