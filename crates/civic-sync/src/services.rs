//! Typed access to the remote `reports`, `users` and `departments` collections.
//!
//! Every report read from the remote store goes through normalization: legacy
//! status casing is folded to the canonical enumeration, a missing timeline is
//! synthesized, and the single legacy `photo` field is lifted into `media`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use civic_core::{
    Category, Department, DepartmentDraft, MediaItem, MediaKind, Priority, PresenceStatus, Report,
    ReportDraft, ReportStatus, Role, SessionUser, TimelineEntry, UserProfile, ValidationError,
};
use civic_storage::{Collection, Document, DocumentStore, FieldFilter, Fields, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::StoreError;

fn into_fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

/// Accepts RFC 3339 strings, epoch milliseconds, and `{seconds, nanoseconds}`
/// timestamp objects (with or without a leading underscore on the keys).
fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::from_timestamp_millis(millis)
        }
        Value::Object(map) => {
            let field = |name: &str| map.get(name).or_else(|| map.get(&format!("_{name}")));
            let seconds = field("seconds")?.as_i64()?;
            let nanos = field("nanoseconds")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0);
            DateTime::from_timestamp(seconds, nanos)
        }
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportDocument {
    id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default = "default_category")]
    category: Category,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    contact_info: Option<String>,
    #[serde(default)]
    media: Vec<MediaItem>,
    #[serde(default)]
    photo: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    timeline: Vec<TimelineDocument>,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    assigned_to: Option<String>,
    #[serde(default)]
    created_at: Option<Value>,
    #[serde(default)]
    updated_at: Option<Value>,
}

fn default_category() -> Category {
    Category::Other
}

#[derive(Debug, Deserialize)]
struct TimelineDocument {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    date: Option<Value>,
    #[serde(default)]
    note: String,
}

fn report_from_document(doc: &Document) -> Result<Report, RemoteError> {
    let raw: ReportDocument = doc.decode()?;
    let invalid = |reason: String| RemoteError::InvalidDocument {
        id: doc.id.clone(),
        reason,
    };

    let status = match raw.status.as_deref().map(str::trim) {
        None | Some("") => ReportStatus::Pending,
        Some(s) => s.parse().map_err(|err| invalid(format!("{err}")))?,
    };
    let created_at = raw
        .created_at
        .as_ref()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);
    let updated_at = raw.updated_at.as_ref().and_then(parse_timestamp);

    let timeline = raw
        .timeline
        .into_iter()
        .filter_map(|entry| {
            let status = match entry.status.as_deref() {
                Some(s) => s.parse().ok()?,
                None => ReportStatus::Pending,
            };
            Some(TimelineEntry {
                status,
                date: entry
                    .date
                    .as_ref()
                    .and_then(parse_timestamp)
                    .unwrap_or(created_at),
                note: entry.note,
            })
        })
        .collect();

    let media = match (raw.media.is_empty(), raw.photo) {
        (true, Some(uri)) if !uri.is_empty() => vec![MediaItem {
            uri,
            kind: MediaKind::Image,
        }],
        _ => raw.media,
    };

    let mut report = Report {
        id: raw.id,
        user_id: raw.user_id,
        category: raw.category,
        title: raw.title,
        description: raw.description,
        location: raw.location,
        priority: raw.priority,
        contact_info: raw.contact_info.filter(|c| !c.is_empty()),
        media,
        department: raw.department,
        assigned_to: raw.assigned_to,
        status,
        timeline,
        created_at,
        updated_at,
    };
    report.restore_timeline_invariants();
    Ok(report)
}

/// Decode every document, skipping (and logging) the ones that do not parse.
fn reports_from_documents(docs: Vec<Document>) -> Vec<Report> {
    docs.iter()
        .filter_map(|doc| match report_from_document(doc) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(report_id = %doc.id, error = %err, "skipping malformed report document");
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct ReportService {
    remote: Arc<dyn DocumentStore>,
}

impl ReportService {
    pub fn new(remote: Arc<dyn DocumentStore>) -> Self {
        Self { remote }
    }

    /// Create the remote document for a submission; the store assigns the id.
    pub async fn create_report(
        &self,
        draft: &ReportDraft,
        timeline: &[TimelineEntry],
    ) -> Result<String, RemoteError> {
        let fields = into_fields(json!({
            "userId": draft.user_id,
            "category": draft.category,
            "title": draft.title,
            "description": draft.description,
            "location": draft.location,
            "priority": draft.priority,
            "contactInfo": draft.contact_info,
            "media": draft.media,
            "photo": draft.photo(),
            "status": ReportStatus::Pending,
            "timeline": timeline,
            "department": Value::Null,
        }));
        self.remote.create(Collection::Reports, fields).await
    }

    pub async fn fetch_user_reports(&self, user_id: &str) -> Result<Vec<Report>, RemoteError> {
        let docs = self
            .remote
            .query(Collection::Reports, &[FieldFilter::equals("userId", user_id)])
            .await?;
        Ok(reports_from_documents(docs))
    }

    pub async fn fetch_all_reports(&self) -> Result<Vec<Report>, RemoteError> {
        let docs = self.remote.query(Collection::Reports, &[]).await?;
        Ok(reports_from_documents(docs))
    }

    pub async fn fetch_report(&self, id: &str) -> Result<Option<Report>, RemoteError> {
        match self.remote.get(Collection::Reports, id).await? {
            Some(doc) => report_from_document(&doc).map(Some),
            None => Ok(None),
        }
    }

    /// Write the status-affecting fields of a report.
    pub async fn push_lifecycle(&self, report: &Report) -> Result<(), RemoteError> {
        let patch = into_fields(json!({
            "status": report.status,
            "timeline": report.timeline,
            "department": report.department,
            "assignedTo": report.assigned_to,
        }));
        self.remote.update(Collection::Reports, &report.id, patch).await
    }

    /// Write the owner-editable fields of a report.
    pub async fn update_content(&self, report: &Report) -> Result<(), RemoteError> {
        let patch = into_fields(json!({
            "title": report.title,
            "description": report.description,
            "location": report.location,
            "priority": report.priority,
            "contactInfo": report.contact_info,
            "media": report.media,
            "photo": report.photo(),
        }));
        self.remote.update(Collection::Reports, &report.id, patch).await
    }

    pub async fn delete_report(&self, id: &str) -> Result<(), RemoteError> {
        self.remote.delete(Collection::Reports, id).await
    }

    /// Admin-side status change applied directly to the remote record.
    pub async fn update_report_status(
        &self,
        id: &str,
        status: ReportStatus,
    ) -> Result<Report, RemoteError> {
        let mut report = self.require(id).await?;
        report.record_status(
            status,
            format!("Status changed to {}", status.display_label()),
            Utc::now(),
        );
        self.push_lifecycle(&report).await?;
        Ok(report)
    }

    /// Hand a report to a specific department user.
    pub async fn assign_report(
        &self,
        id: &str,
        department_user_id: &str,
    ) -> Result<Report, RemoteError> {
        let mut report = self.require(id).await?;
        report.assigned_to = Some(department_user_id.to_string());
        report.record_status(
            ReportStatus::Assigned,
            format!("Report assigned to user {department_user_id}"),
            Utc::now(),
        );
        self.push_lifecycle(&report).await?;
        Ok(report)
    }

    async fn require(&self, id: &str) -> Result<Report, RemoteError> {
        self.fetch_report(id)
            .await?
            .ok_or_else(|| RemoteError::NotFound {
                collection: Collection::Reports,
                id: id.to_string(),
            })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDepartmentUser {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub department_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentUserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
}

fn patch_from<T: Serialize>(update: &T) -> Fields {
    serde_json::to_value(update)
        .map(into_fields)
        .unwrap_or_default()
}

/// Role checks, departments and department staff.
#[derive(Clone)]
pub struct AdminService {
    remote: Arc<dyn DocumentStore>,
}

impl AdminService {
    pub fn new(remote: Arc<dyn DocumentStore>) -> Self {
        Self { remote }
    }

    /// `true` only when the user document exists and carries the admin role.
    /// Lookup failures count as "not admin".
    pub async fn verify_admin_role(&self, uid: &str) -> bool {
        match self.remote.get(Collection::Users, uid).await {
            Ok(Some(doc)) => doc.fields.get("role").and_then(Value::as_str) == Some("admin"),
            Ok(None) => false,
            Err(err) => {
                warn!(uid, error = %err, "admin role check failed");
                false
            }
        }
    }

    /// Any user by document id; failures are logged and read as absent.
    pub async fn get_user_by_id(&self, id: &str) -> Option<UserProfile> {
        match self.remote.get(Collection::Users, id).await {
            Ok(Some(doc)) => match doc.decode::<UserProfile>() {
                Ok(profile) => Some(profile),
                Err(err) => {
                    warn!(user_id = id, error = %err, "malformed user document");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(user_id = id, error = %err, "fetching user failed");
                None
            }
        }
    }

    pub async fn list_departments(&self) -> Result<Vec<Department>, RemoteError> {
        let docs = self.remote.query(Collection::Departments, &[]).await?;
        docs.iter().map(Document::decode).collect()
    }

    pub async fn add_department(&self, draft: &DepartmentDraft) -> Result<String, RemoteError> {
        let mut fields = patch_from(draft);
        fields.insert("isActive".to_string(), Value::Bool(true));
        let id = self.remote.create(Collection::Departments, fields).await?;
        info!(department_id = %id, name = %draft.name, "department added");
        Ok(id)
    }

    pub async fn update_department(
        &self,
        id: &str,
        update: &DepartmentUpdate,
    ) -> Result<(), RemoteError> {
        self.remote
            .update(Collection::Departments, id, patch_from(update))
            .await
    }

    pub async fn delete_department(&self, id: &str) -> Result<(), RemoteError> {
        self.remote.delete(Collection::Departments, id).await
    }

    /// Department staff, optionally narrowed to one department.
    pub async fn list_department_users(
        &self,
        department_id: Option<&str>,
    ) -> Result<Vec<UserProfile>, RemoteError> {
        let mut filters = vec![FieldFilter::equals("role", "departmentUser")];
        if let Some(department_id) = department_id {
            filters.push(FieldFilter::equals("departmentId", department_id));
        }
        let docs = self.remote.query(Collection::Users, &filters).await?;
        docs.iter().map(Document::decode).collect()
    }

    pub async fn create_department_user(
        &self,
        user: &NewDepartmentUser,
    ) -> Result<String, RemoteError> {
        let fields = into_fields(json!({
            "name": user.name,
            "phone": user.phone,
            "email": user.email,
            "departmentId": user.department_id,
            "role": Role::DepartmentUser,
            "status": PresenceStatus::Offline,
        }));
        self.remote.create(Collection::Users, fields).await
    }

    pub async fn update_department_user(
        &self,
        uid: &str,
        update: &DepartmentUserUpdate,
    ) -> Result<(), RemoteError> {
        self.remote
            .update(Collection::Users, uid, patch_from(update))
            .await
    }

    pub async fn update_user_status(
        &self,
        uid: &str,
        status: PresenceStatus,
    ) -> Result<(), RemoteError> {
        let patch = into_fields(json!({
            "status": status,
            "lastActive": Utc::now(),
        }));
        self.remote.update(Collection::Users, uid, patch).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CitizenRegistration {
    pub first_name: String,
    pub last_name: String,
    pub gender: Option<String>,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Citizen accounts, keyed by phone number.
#[derive(Clone)]
pub struct UserService {
    remote: Arc<dyn DocumentStore>,
}

impl UserService {
    pub fn new(remote: Arc<dyn DocumentStore>) -> Self {
        Self { remote }
    }

    pub async fn check_user_exists(&self, phone: &str) -> Result<bool, RemoteError> {
        Ok(self.remote.get(Collection::Users, phone).await?.is_some())
    }

    pub async fn register_citizen(
        &self,
        phone: &str,
        registration: &CitizenRegistration,
    ) -> Result<SessionUser, RemoteError> {
        let name = format!("{} {}", registration.first_name, registration.last_name)
            .trim()
            .to_string();
        let fields = into_fields(json!({
            "uid": registration.uid,
            "phone": phone,
            "name": name,
            "firstName": registration.first_name,
            "lastName": registration.last_name,
            "gender": registration.gender,
            "role": Role::Citizen,
            "status": PresenceStatus::Active,
        }));
        self.remote.set(Collection::Users, phone, fields).await?;
        Ok(SessionUser {
            uid: registration.uid.clone(),
            id: Some(phone.to_string()),
            phone: phone.to_string(),
            name,
            role: Role::Citizen,
        })
    }

    pub async fn get_user_profile(&self, id: &str) -> Result<Option<UserProfile>, RemoteError> {
        match self.remote.get(Collection::Users, id).await? {
            Some(doc) => doc.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Record a fresh auth uid on the phone-keyed document. Failures are only
    /// logged since the phone number still identifies the user.
    pub async fn update_user_auth_id(&self, phone: &str, uid: &str) {
        let patch = into_fields(json!({ "uid": uid }));
        if let Err(err) = self.remote.update(Collection::Users, phone, patch).await {
            warn!(phone, error = %err, "updating user auth id failed");
        }
    }

    pub async fn update_user_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), StoreError> {
        if user_id.trim().is_empty() {
            return Err(ValidationError::MissingField("userId").into());
        }

        let mut patch = Fields::new();
        if let Some(name) = &update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ValidationError::EmptyField("name").into());
            }
            patch.insert("name".to_string(), Value::String(name.to_string()));
        }
        if let Some(phone) = &update.phone {
            let phone = phone.trim();
            if phone.is_empty() {
                return Err(ValidationError::EmptyField("phone").into());
            }
            patch.insert("phone".to_string(), Value::String(phone.to_string()));
        }

        self.remote.update(Collection::Users, user_id, patch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_storage::MemoryDocumentStore;

    fn remote() -> Arc<MemoryDocumentStore> {
        Arc::new(MemoryDocumentStore::new())
    }

    #[tokio::test]
    async fn legacy_report_documents_are_normalized() {
        let store = remote();
        store
            .set(
                Collection::Reports,
                "legacy-1",
                into_fields(json!({
                    "userId": "u1",
                    "category": "Water",
                    "description": "Leak",
                    "location": "Main St",
                    "priority": "high",
                    "photo": "file://leak.jpg",
                    "status": "In Progress",
                })),
            )
            .await
            .expect("seed");

        let service = ReportService::new(store);
        let report = service
            .fetch_report("legacy-1")
            .await
            .expect("fetch")
            .expect("present");

        assert_eq!(report.status, ReportStatus::InProgress);
        assert_eq!(report.priority, Priority::High);
        assert_eq!(report.photo(), Some("file://leak.jpg"));
        assert_eq!(report.timeline.first().map(|e| e.status), Some(ReportStatus::Pending));
        assert_eq!(report.timeline.last().map(|e| e.status), Some(ReportStatus::InProgress));
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped_in_listings() {
        let store = remote();
        store
            .set(
                Collection::Reports,
                "bad",
                into_fields(json!({"userId": "u1", "status": "archived"})),
            )
            .await
            .expect("seed bad");
        store
            .set(
                Collection::Reports,
                "good",
                into_fields(json!({"userId": "u1", "status": "pending"})),
            )
            .await
            .expect("seed good");

        let reports = ReportService::new(store)
            .fetch_user_reports("u1")
            .await
            .expect("fetch");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, "good");
    }

    #[tokio::test]
    async fn legacy_timestamp_encodings_are_accepted() {
        let store = remote();
        let created = [
            ("r-str", json!("2023-11-14T22:13:20Z")),
            ("r-obj", json!({"seconds": 1_700_000_000i64, "nanoseconds": 0})),
            ("r-millis", json!(1_700_000_000_000i64)),
        ];
        for (id, created_at) in created {
            store
                .set(Collection::Reports, id, into_fields(json!({"userId": "u1"})))
                .await
                .expect("seed");
            // `set` stamps server time; overwrite it with the legacy encoding.
            store
                .update(
                    Collection::Reports,
                    id,
                    into_fields(json!({
                        "createdAt": created_at,
                        "status": "assigned",
                        "timeline": [
                            {"status": "pending", "date": {"_seconds": 1_700_000_000i64, "_nanoseconds": 5}},
                            {"status": "assigned", "date": 1_700_000_060_000i64},
                        ],
                    })),
                )
                .await
                .expect("legacy fields");
        }

        let mut reports = ReportService::new(store)
            .fetch_user_reports("u1")
            .await
            .expect("fetch");
        reports.sort_by(|a, b| a.id.cmp(&b.id));

        let ids: Vec<_> = reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r-millis", "r-obj", "r-str"]);
        for report in &reports {
            assert_eq!(report.created_at.timestamp(), 1_700_000_000);
            assert_eq!(report.timeline.len(), 2);
            assert_eq!(report.timeline[0].date.timestamp(), 1_700_000_000);
            assert_eq!(report.timeline[1].date.timestamp(), 1_700_000_060);
        }
    }

    #[test]
    fn unreadable_timestamps_fall_back_instead_of_failing() {
        let doc = Document {
            id: "r1".into(),
            fields: into_fields(json!({
                "userId": "u1",
                "createdAt": true,
                "timeline": [{"status": "pending", "date": "yesterday"}],
            })),
        };
        let report = report_from_document(&doc).expect("decoded");
        assert_eq!(report.timeline.len(), 1);
        assert_eq!(report.timeline[0].date, report.created_at);
    }

    #[tokio::test]
    async fn remote_status_update_appends_timeline() {
        let store = remote();
        let service = ReportService::new(store.clone());
        let draft = ReportDraft {
            user_id: "u1".into(),
            category: Category::Roads,
            title: "Pothole".into(),
            description: "Deep pothole".into(),
            location: "Ring Road".into(),
            priority: Priority::Medium,
            contact_info: None,
            media: vec![],
        };
        let timeline = [TimelineEntry {
            status: ReportStatus::Pending,
            date: Utc::now(),
            note: "Submitted".into(),
        }];
        let id = service.create_report(&draft, &timeline).await.expect("create");

        let updated = service
            .update_report_status(&id, ReportStatus::Resolved)
            .await
            .expect("update");
        assert_eq!(updated.timeline.len(), 2);
        assert_eq!(updated.timeline[1].note, "Status changed to Resolved");

        let assigned = service.assign_report(&id, "staff-7").await.expect("assign");
        assert_eq!(assigned.assigned_to.as_deref(), Some("staff-7"));
        assert_eq!(assigned.status, ReportStatus::Assigned);

        let err = service
            .update_report_status("missing", ReportStatus::Closed)
            .await
            .expect_err("missing");
        assert!(matches!(err, RemoteError::NotFound { .. }));
    }

    #[tokio::test]
    async fn admin_role_requires_admin_document() {
        let store = remote();
        store
            .set(Collection::Users, "boss", into_fields(json!({"role": "admin"})))
            .await
            .expect("seed");
        store
            .set(Collection::Users, "citizen", into_fields(json!({"role": "citizen"})))
            .await
            .expect("seed");

        let admin = AdminService::new(store.clone());
        assert!(admin.verify_admin_role("boss").await);
        assert!(!admin.verify_admin_role("citizen").await);
        assert!(!admin.verify_admin_role("ghost").await);

        store.set_offline(true);
        assert!(!admin.verify_admin_role("boss").await);
        assert!(admin.get_user_by_id("boss").await.is_none());
    }

    #[tokio::test]
    async fn departments_and_staff_round_trip_through_remote() {
        let store = remote();
        let admin = AdminService::new(store);

        let dept_id = admin
            .add_department(&DepartmentDraft::from_name("Water"))
            .await
            .expect("add");
        admin
            .update_department(
                &dept_id,
                &DepartmentUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        let departments = admin.list_departments().await.expect("list");
        assert_eq!(departments.len(), 1);
        assert_eq!(departments[0].icon_name, "water-drop");
        assert!(!departments[0].is_active);

        let staff_id = admin
            .create_department_user(&NewDepartmentUser {
                name: "Ayesha".into(),
                phone: "+92300".into(),
                email: None,
                department_id: dept_id.clone(),
            })
            .await
            .expect("create staff");
        admin
            .update_user_status(&staff_id, PresenceStatus::Working)
            .await
            .expect("status");

        let staff = admin
            .list_department_users(Some(dept_id.as_str()))
            .await
            .expect("staff");
        assert_eq!(staff.len(), 1);
        assert_eq!(staff[0].role, Role::DepartmentUser);
        assert_eq!(staff[0].status, Some(PresenceStatus::Working));
        assert!(admin
            .list_department_users(Some("elsewhere"))
            .await
            .expect("staff")
            .is_empty());

        admin
            .update_department_user(
                &staff_id,
                &DepartmentUserUpdate {
                    name: Some("Ayesha Malik".into()),
                    department_id: Some("roads-dept".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("update staff");
        let moved = admin.get_user_by_id(&staff_id).await.expect("staff profile");
        assert_eq!(moved.name, "Ayesha Malik");
        assert_eq!(moved.department_id.as_deref(), Some("roads-dept"));
        assert_eq!(moved.phone, "+92300");
        assert!(admin.get_user_by_id("nobody").await.is_none());

        admin.delete_department(&dept_id).await.expect("delete");
        assert!(admin.list_departments().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn citizen_registration_and_profile_validation() {
        let store = remote();
        let users = UserService::new(store);

        assert!(!users.check_user_exists("+92301").await.expect("check"));
        let session = users
            .register_citizen(
                "+92301",
                &CitizenRegistration {
                    first_name: "Bilal".into(),
                    last_name: "Khan".into(),
                    gender: None,
                    uid: Some("uid-9".into()),
                },
            )
            .await
            .expect("register");
        assert_eq!(session.name, "Bilal Khan");
        assert_eq!(session.report_owner_id(), Some("uid-9"));
        assert!(users.check_user_exists("+92301").await.expect("check"));

        let err = users
            .update_user_profile(
                "+92301",
                &ProfileUpdate {
                    name: Some("   ".into()),
                    phone: None,
                },
            )
            .await
            .expect_err("blank name");
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::EmptyField("name"))
        ));

        users
            .update_user_profile(
                "+92301",
                &ProfileUpdate {
                    name: Some("  Bilal A. Khan ".into()),
                    phone: None,
                },
            )
            .await
            .expect("update");
        let profile = users
            .get_user_profile("+92301")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(profile.name, "Bilal A. Khan");
        assert_eq!(profile.role, Role::Citizen);

        users.update_user_auth_id("+92301", "uid-10").await;
        let profile = users
            .get_user_profile("+92301")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(profile.uid.as_deref(), Some("uid-10"));
        assert_eq!(profile.session().report_owner_id(), Some("uid-10"));

        // Unknown phone numbers are logged, not raised.
        users.update_user_auth_id("+92999", "uid-11").await;
        assert!(!users.check_user_exists("+92999").await.expect("check"));
    }
}
