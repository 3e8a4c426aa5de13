//! Core domain model for civic issue reports, their status timeline and notifications.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "civic-core";

/// Upper bound on attachments accepted by the submission flow.
pub const MAX_MEDIA_ITEMS: usize = 5;

/// Canonical report lifecycle status.
///
/// Serialized as the lowercase canonical key (`pending`, `inProgress`, ...).
/// Deserialization accepts legacy display casing such as `"Pending"` or
/// `"In Progress"` so that records written by older clients normalize on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReportStatus {
    Pending,
    Assigned,
    InProgress,
    Resolved,
    Closed,
}

impl ReportStatus {
    pub const ALL: [ReportStatus; 5] = [
        ReportStatus::Pending,
        ReportStatus::Assigned,
        ReportStatus::InProgress,
        ReportStatus::Resolved,
        ReportStatus::Closed,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Assigned => "assigned",
            ReportStatus::InProgress => "inProgress",
            ReportStatus::Resolved => "resolved",
            ReportStatus::Closed => "closed",
        }
    }

    pub fn display_label(self) -> &'static str {
        match self {
            ReportStatus::Pending => "Pending",
            ReportStatus::Assigned => "Assigned",
            ReportStatus::InProgress => "In Progress",
            ReportStatus::Resolved => "Resolved",
            ReportStatus::Closed => "Closed",
        }
    }

    pub fn is_terminal_success(self) -> bool {
        self == ReportStatus::Resolved
    }

    /// Counted as in-flight work by the global dashboard.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ReportStatus::Assigned | ReportStatus::InProgress)
    }

    /// Statuses during which the submitting citizen may still edit the report.
    pub fn owner_editable(self) -> bool {
        matches!(self, ReportStatus::Pending | ReportStatus::Assigned)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown report status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for ReportStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let folded: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "pending" => Ok(ReportStatus::Pending),
            "assigned" => Ok(ReportStatus::Assigned),
            "inprogress" => Ok(ReportStatus::InProgress),
            "resolved" => Ok(ReportStatus::Resolved),
            "closed" => Ok(ReportStatus::Closed),
            _ => Err(UnknownStatus(raw.to_string())),
        }
    }
}

impl Serialize for ReportStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

impl<'de> Deserialize<'de> for ReportStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Department category a report is filed under. Unknown values read as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Garbage,
    Electricity,
    Water,
    Gas,
    Roads,
    Sewerage,
    Streetlights,
    #[serde(other)]
    Other,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Garbage,
        Category::Electricity,
        Category::Water,
        Category::Gas,
        Category::Roads,
        Category::Sewerage,
        Category::Streetlights,
        Category::Other,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Category::Garbage => "Garbage",
            Category::Electricity => "Electricity",
            Category::Water => "Water",
            Category::Gas => "Gas",
            Category::Roads => "Roads",
            Category::Sewerage => "Sewerage",
            Category::Streetlights => "Streetlights",
            Category::Other => "Other",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Category::Garbage => "Garbage",
            Category::Electricity => "Electricity",
            Category::Water => "Water Supply",
            Category::Gas => "Sui Gas",
            Category::Roads => "Roads & Infrastructure",
            Category::Sewerage => "Sewerage",
            Category::Streetlights => "Street Lights",
            Category::Other => "Other",
        }
    }

    pub fn translation_key(self) -> &'static str {
        match self {
            Category::Garbage => "garbageCollection",
            Category::Electricity => "electricity",
            Category::Water => "waterSupply",
            Category::Gas => "gasProblems",
            Category::Roads => "roadMaintenance",
            Category::Sewerage => "sewerageIssues",
            Category::Streetlights => "streetLights",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.id().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| UnknownCategory(raw.to_string()))
    }
}

/// Serialized as `Low`/`Medium`/`High`; any casing is accepted on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub uri: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
}

/// One audit-trail step. Timelines are append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub status: ReportStatus,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub note: String,
}

/// Citizen submission payload. The store never validates it; callers use
/// [`ReportDraft::validate`] before submitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDraft {
    pub user_id: String,
    pub category: Category,
    pub title: String,
    pub description: String,
    pub location: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub contact_info: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaItem>,
}

impl ReportDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField("userId"));
        }
        if self.description.trim().is_empty() {
            return Err(ValidationError::MissingField("description"));
        }
        if self.location.trim().is_empty() {
            return Err(ValidationError::MissingField("location"));
        }
        if self.media.len() > MAX_MEDIA_ITEMS {
            return Err(ValidationError::TooManyMedia {
                count: self.media.len(),
                max: MAX_MEDIA_ITEMS,
            });
        }
        Ok(())
    }

    /// Legacy single-photo field: the first attachment's uri.
    pub fn photo(&self) -> Option<&str> {
        self.media.first().map(|m| m.uri.as_str())
    }
}

/// Owner-editable fields. `None` leaves a field untouched; category is never editable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub priority: Option<Priority>,
    pub contact_info: Option<String>,
    pub media: Option<Vec<MediaItem>>,
}

impl ReportEdit {
    pub fn is_empty(&self) -> bool {
        *self == ReportEdit::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),
    #[error("at most {max} media attachments are allowed, got {count}")]
    TooManyMedia { count: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub user_id: String,
    pub category: Category,
    pub title: String,
    pub description: String,
    pub location: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub contact_info: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub status: ReportStatus,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Report {
    /// Build a freshly submitted report: `Pending`, single-entry timeline.
    pub fn submitted(
        id: impl Into<String>,
        draft: ReportDraft,
        at: DateTime<Utc>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: draft.user_id,
            category: draft.category,
            title: draft.title,
            description: draft.description,
            location: draft.location,
            priority: draft.priority,
            contact_info: draft.contact_info,
            media: draft.media,
            department: None,
            assigned_to: None,
            status: ReportStatus::Pending,
            timeline: vec![TimelineEntry {
                status: ReportStatus::Pending,
                date: at,
                note: note.into(),
            }],
            created_at: at,
            updated_at: None,
        }
    }

    /// Append a timeline entry and move `status` to match it.
    pub fn record_status(&mut self, status: ReportStatus, note: impl Into<String>, at: DateTime<Utc>) {
        self.timeline.push(TimelineEntry {
            status,
            date: at,
            note: note.into(),
        });
        self.status = status;
        self.updated_at = Some(at);
    }

    /// Set the department. Only a `Pending` report transitions to `Assigned`
    /// (and gets a timeline entry); returns whether that transition happened.
    pub fn assign_department(
        &mut self,
        department: impl Into<String>,
        note: impl Into<String>,
        at: DateTime<Utc>,
    ) -> bool {
        self.department = Some(department.into());
        self.updated_at = Some(at);
        if self.status != ReportStatus::Pending {
            return false;
        }
        self.record_status(ReportStatus::Assigned, note, at);
        true
    }

    pub fn apply_edit(&mut self, edit: ReportEdit, at: DateTime<Utc>) {
        if let Some(title) = edit.title {
            self.title = title;
        }
        if let Some(description) = edit.description {
            self.description = description;
        }
        if let Some(location) = edit.location {
            self.location = location;
        }
        if let Some(priority) = edit.priority {
            self.priority = priority;
        }
        if let Some(contact_info) = edit.contact_info {
            self.contact_info = Some(contact_info);
        }
        if let Some(media) = edit.media {
            self.media = media;
        }
        self.updated_at = Some(at);
    }

    pub fn photo(&self) -> Option<&str> {
        self.media.first().map(|m| m.uri.as_str())
    }

    /// Repair records read from outside the store so that the timeline is
    /// non-empty, starts at `Pending`, and ends at the current status.
    pub fn restore_timeline_invariants(&mut self) {
        if self.timeline.first().map(|e| e.status) != Some(ReportStatus::Pending) {
            self.timeline.insert(
                0,
                TimelineEntry {
                    status: ReportStatus::Pending,
                    date: self.created_at,
                    note: String::new(),
                },
            );
        }
        if self.timeline.last().map(|e| e.status) != Some(self.status) {
            self.timeline.push(TimelineEntry {
                status: self.status,
                date: self.updated_at.unwrap_or(self.created_at),
                note: String::new(),
            });
        }
    }

    /// Last-modified instant used by most-recent-wins merging.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    #[default]
    Info,
}

pub mod notification_keys {
    pub const REPORT_SUBMITTED: &str = "reportSubmitted";
    pub const REPORT_SUBMITTED_MSG: &str = "reportSubmittedMsg";
    pub const STATUS_UPDATED: &str = "statusUpdated";
    pub const STATUS_UPDATED_MSG: &str = "statusUpdatedMsg";
    pub const REPORT_RESOLVED: &str = "reportResolved";
    pub const REPORT_RESOLVED_MSG: &str = "reportResolvedMsg";
    pub const REPORT_ASSIGNED: &str = "reportAssigned";
    pub const REPORT_ASSIGNED_MSG: &str = "reportAssignedMsg";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub title_key: String,
    pub message_key: String,
    #[serde(default)]
    pub icon: String,
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    #[serde(default)]
    pub read: bool,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_key: Option<String>,
}

/// Notification fields supplied by the caller; id, time and `read` are assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotificationDraft {
    pub title_key: String,
    pub message_key: String,
    pub icon: String,
    pub kind: NotificationKind,
    pub report_id: Option<String>,
    pub status_key: Option<String>,
    pub department_key: Option<String>,
}

impl NotificationDraft {
    pub fn report_submitted(report_id: &str) -> Self {
        Self {
            title_key: notification_keys::REPORT_SUBMITTED.to_string(),
            message_key: notification_keys::REPORT_SUBMITTED_MSG.to_string(),
            icon: "✅".to_string(),
            kind: NotificationKind::Success,
            report_id: Some(report_id.to_string()),
            ..Default::default()
        }
    }

    pub fn status_changed(report_id: &str, status: ReportStatus) -> Self {
        let (title_key, message_key, icon, kind) = if status.is_terminal_success() {
            (
                notification_keys::REPORT_RESOLVED,
                notification_keys::REPORT_RESOLVED_MSG,
                "🎉",
                NotificationKind::Success,
            )
        } else {
            (
                notification_keys::STATUS_UPDATED,
                notification_keys::STATUS_UPDATED_MSG,
                "🔄",
                NotificationKind::Info,
            )
        };
        Self {
            title_key: title_key.to_string(),
            message_key: message_key.to_string(),
            icon: icon.to_string(),
            kind,
            report_id: Some(report_id.to_string()),
            status_key: Some(status.key().to_string()),
            department_key: None,
        }
    }

    pub fn assigned(report_id: &str, department: &str) -> Self {
        Self {
            title_key: notification_keys::REPORT_ASSIGNED.to_string(),
            message_key: notification_keys::REPORT_ASSIGNED_MSG.to_string(),
            icon: "📋".to_string(),
            kind: NotificationKind::Info,
            report_id: Some(report_id.to_string()),
            status_key: Some(ReportStatus::Assigned.key().to_string()),
            department_key: Some(department.to_string()),
        }
    }

    pub fn into_notification(self, id: i64, time: DateTime<Utc>) -> Notification {
        Notification {
            id,
            title_key: self.title_key,
            message_key: self.message_key,
            icon: self.icon,
            kind: self.kind,
            read: false,
            time,
            report_id: self.report_id,
            status_key: self.status_key,
            department_key: self.department_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    #[default]
    Citizen,
    Admin,
    DepartmentUser,
}

/// Identity of the signed-in session, as cached on the device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionUser {
    /// Remote identity token; absent for phone-only sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Phone-number keyed document id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: Role,
}

impl SessionUser {
    pub fn identity_token(&self) -> Option<&str> {
        self.uid.as_deref().filter(|uid| !uid.is_empty())
    }

    /// Identifier stored in `Report::user_id` for this user's submissions.
    pub fn report_owner_id(&self) -> Option<&str> {
        self.identity_token()
            .or_else(|| self.id.as_deref().filter(|id| !id.is_empty()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Offline,
    Active,
    Working,
}

/// A `users` collection record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub status: Option<PresenceStatus>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn session(&self) -> SessionUser {
        SessionUser {
            uid: self.uid.clone(),
            id: Some(self.id.clone()),
            phone: self.phone.clone(),
            name: self.name.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon_name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentDraft {
    pub name: String,
    pub icon_name: String,
    pub color: String,
}

impl DepartmentDraft {
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        let style = department_style(&name);
        Self {
            icon_name: style.icon_name.to_string(),
            color: style.color.to_string(),
            name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepartmentStyle {
    pub icon_name: &'static str,
    pub color: &'static str,
}

const FALLBACK_STYLE: DepartmentStyle = DepartmentStyle {
    icon_name: "help-circle-outline",
    color: "#6366f1",
};

/// Icon + tint for a department name, case-insensitive.
pub fn department_style(name: &str) -> DepartmentStyle {
    let style = |icon_name, color| DepartmentStyle { icon_name, color };
    match name.trim().to_ascii_lowercase().as_str() {
        "animal rescue" => style("paw", "#f59e0b"),
        "sewerage" => style("layers", "#78716c"),
        "water" => style("water-drop", "#3b82f6"),
        "sanitation" => style("trash", "#64748b"),
        "electricity" => style("flash", "#eab308"),
        "roads" => style("car", "#f97316"),
        "parks" => style("leaf", "#22c55e"),
        "health" => style("medical", "#ef4444"),
        "education" => style("school", "#8b5cf6"),
        "public safety" => style("shield", "#ec4899"),
        _ => FALLBACK_STYLE,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UserStats {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub resolved: usize,
}

pub type DepartmentTally = BTreeMap<Category, usize>;

/// Status filter; the sentinel `"all"` parses to [`StatusFilter::All`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Only(ReportStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: ReportStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().eq_ignore_ascii_case("all") {
            return Ok(StatusFilter::All);
        }
        raw.parse().map(StatusFilter::Only)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryFilter {
    All,
    Only(Category),
}

impl CategoryFilter {
    pub fn matches(&self, category: Category) -> bool {
        match self {
            CategoryFilter::All => true,
            CategoryFilter::Only(wanted) => *wanted == category,
        }
    }
}

impl FromStr for CategoryFilter {
    type Err = UnknownCategory;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().eq_ignore_ascii_case("all") {
            return Ok(CategoryFilter::All);
        }
        raw.parse().map(CategoryFilter::Only)
    }
}
