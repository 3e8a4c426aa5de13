use std::sync::Arc;

use civic_core::{
    notification_keys, Category, GlobalStats, NotificationDraft, Priority, Report, ReportDraft,
    ReportStatus, Role, SessionUser,
};
use civic_storage::{
    Collection, DocumentStore, FileKeyValueStore, KeyValueStore, MemoryDocumentStore,
    MemoryKeyValueStore,
};
use civic_sync::{ReportLifecycleStore, StoreConfig, StoreError, REPORTS_KEY};
use serde_json::json;
use tempfile::tempdir;

fn config() -> StoreConfig {
    StoreConfig {
        seed_demo: false,
        ..StoreConfig::default()
    }
}

fn citizen(uid: &str) -> SessionUser {
    SessionUser {
        uid: Some(uid.to_string()),
        id: Some("+923001234567".to_string()),
        phone: "+923001234567".to_string(),
        name: "Sana".to_string(),
        role: Role::Citizen,
    }
}

fn burst_pipe(user_id: &str) -> ReportDraft {
    ReportDraft {
        user_id: user_id.to_string(),
        category: Category::Water,
        title: "Burst pipe".to_string(),
        description: "Burst pipe on Main St".to_string(),
        location: "Main St".to_string(),
        priority: Priority::High,
        contact_info: None,
        media: vec![],
    }
}

async fn ready_store(
    cache: Arc<dyn KeyValueStore>,
    remote: Arc<dyn DocumentStore>,
) -> ReportLifecycleStore {
    let mut store = ReportLifecycleStore::new(config(), cache, remote);
    store.initialize().await;
    store
}

#[tokio::test]
async fn water_report_is_submitted_assigned_and_resolved() {
    let mut store = ready_store(
        Arc::new(MemoryKeyValueStore::new()),
        Arc::new(MemoryDocumentStore::new()),
    )
    .await;
    store.login(citizen("citizen-1")).await;

    let id = store
        .add_report(burst_pipe("citizen-1"))
        .await
        .expect("submit");

    let report = store.report(&id).expect("submitted report");
    assert_eq!(report.status, ReportStatus::Pending);
    assert_eq!(report.status.key(), "pending");
    assert_eq!(report.status.display_label(), "Pending");
    assert_eq!(report.timeline.len(), 1);
    assert_eq!(report.department, None);
    assert_eq!(store.notifications()[0].title_key, notification_keys::REPORT_SUBMITTED);
    assert_eq!(store.notifications()[0].report_id.as_deref(), Some(id.as_str()));

    assert!(store.assign_department(&id, "Water").await);
    assert!(
        store
            .update_report_status(&id, ReportStatus::Resolved, None)
            .await
    );

    let report = store.report(&id).expect("resolved report");
    assert_eq!(report.status, ReportStatus::Resolved);
    assert_eq!(report.timeline.len(), 3);
    assert_eq!(report.department.as_deref(), Some("Water"));
    assert_eq!(report.timeline[0].status, ReportStatus::Pending);
    assert_eq!(report.timeline[1].status, ReportStatus::Assigned);
    assert_eq!(report.timeline.last().map(|e| e.status), Some(report.status));
    assert_eq!(store.notifications().len(), 3);
    assert_eq!(store.user_stats().resolved, 1);
}

#[tokio::test]
async fn global_stats_count_assigned_as_in_flight() {
    let remote = Arc::new(MemoryDocumentStore::new());
    let mut store = ready_store(Arc::new(MemoryKeyValueStore::new()), remote).await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(store.add_report(burst_pipe("citizen-1")).await.expect("submit"));
    }
    store
        .update_report_status(&ids[2], ReportStatus::Assigned, None)
        .await;
    store
        .update_report_status(&ids[3], ReportStatus::InProgress, None)
        .await;
    store
        .update_report_status(&ids[4], ReportStatus::Resolved, None)
        .await;

    assert_eq!(
        store.stats(),
        GlobalStats {
            total: 5,
            pending: 2,
            in_progress: 2,
            resolved: 1,
        }
    );
}

#[tokio::test]
async fn notifications_are_newest_first_and_mark_all_is_idempotent() {
    let mut store = ready_store(
        Arc::new(MemoryKeyValueStore::new()),
        Arc::new(MemoryDocumentStore::new()),
    )
    .await;

    let a = store
        .add_notification(NotificationDraft {
            title_key: "a".into(),
            ..Default::default()
        })
        .await;
    let b = store
        .add_notification(NotificationDraft {
            title_key: "b".into(),
            ..Default::default()
        })
        .await;
    assert_eq!(store.notifications()[0].id, b);
    assert_eq!(store.notifications()[1].id, a);

    store.mark_all_notifications_as_read().await;
    assert!(store.notifications().iter().all(|n| n.read));
    store.mark_all_notifications_as_read().await;
    assert!(store.notifications().iter().all(|n| n.read));
    assert_eq!(store.unread_count(), 0);
}

#[tokio::test]
async fn cached_collections_survive_a_restart() {
    let dir = tempdir().expect("tempdir");
    let remote: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());

    let (reports_before, notifications_before, user_before) = {
        let cache = Arc::new(FileKeyValueStore::new(dir.path()));
        let mut store = ready_store(cache, remote.clone()).await;
        store.login(citizen("citizen-1")).await;
        let id = store
            .add_report(burst_pipe("citizen-1"))
            .await
            .expect("submit");
        store.assign_department(&id, "Water").await;
        store.mark_all_notifications_as_read().await;
        (
            store.reports().to_vec(),
            store.notifications().to_vec(),
            store.current_user().cloned(),
        )
    };

    let cache = Arc::new(FileKeyValueStore::new(dir.path()));
    let raw = cache.get(REPORTS_KEY).await.expect("read").expect("cached");
    let decoded: Vec<Report> = serde_json::from_str(&raw).expect("decode");
    assert_eq!(decoded, reports_before);

    let restarted = ready_store(cache, remote).await;
    assert_eq!(restarted.reports(), reports_before.as_slice());
    assert_eq!(restarted.notifications(), notifications_before.as_slice());
    assert_eq!(restarted.current_user().cloned(), user_before);
}

#[tokio::test]
async fn failed_submission_leaves_state_unchanged() {
    let remote = Arc::new(MemoryDocumentStore::new());
    let mut store = ready_store(Arc::new(MemoryKeyValueStore::new()), remote.clone()).await;

    remote.set_offline(true);
    let err = store
        .add_report(burst_pipe("citizen-1"))
        .await
        .expect_err("remote offline");
    assert!(matches!(err, StoreError::Remote(_)));
    assert!(store.reports().is_empty());
    assert!(store.notifications().is_empty());
}

#[tokio::test]
async fn local_cache_failures_never_reach_the_caller() {
    let cache = Arc::new(MemoryKeyValueStore::new());
    let mut store = ready_store(cache.clone(), Arc::new(MemoryDocumentStore::new())).await;

    cache.set_failing(true);
    let id = store
        .add_report(burst_pipe("citizen-1"))
        .await
        .expect("submit despite cache failure");
    assert!(store.report(&id).is_some());
    assert_eq!(store.notifications().len(), 1);
}

#[tokio::test]
async fn login_merges_remote_reports_and_tolerates_fetch_failure() {
    let remote = Arc::new(MemoryDocumentStore::new());
    let remote_id = remote
        .create(
            Collection::Reports,
            serde_json::from_value(json!({
                "userId": "citizen-1",
                "category": "Roads",
                "title": "Pothole",
                "description": "Deep pothole",
                "location": "Ring Road",
                "priority": "Medium",
                "status": "Pending",
                "timeline": [],
            }))
            .expect("fields"),
        )
        .await
        .expect("seed remote");

    let mut store = ReportLifecycleStore::new(
        StoreConfig::default(),
        Arc::new(MemoryKeyValueStore::new()),
        remote.clone(),
    );
    store.initialize().await;
    let seeded = store.reports().len();

    store.login(citizen("citizen-1")).await;
    assert_eq!(store.reports().len(), seeded + 1);
    let restored = store.report(&remote_id).expect("restored");
    assert_eq!(restored.status, ReportStatus::Pending);
    assert_eq!(restored.timeline.len(), 1);
    assert_eq!(store.user_reports(None).len(), 1);

    store.logout().await;
    remote.set_offline(true);
    store.login(citizen("citizen-1")).await;
    assert!(store.current_user().is_some());
    assert!(!store.is_admin());
    assert_eq!(store.reports().len(), seeded + 1);
}

#[tokio::test]
async fn user_reports_are_empty_without_a_session() {
    let store = ReportLifecycleStore::new(
        StoreConfig::default(),
        Arc::new(MemoryKeyValueStore::new()),
        Arc::new(MemoryDocumentStore::new()),
    );
    assert!(store.user_reports(None).is_empty());
    assert_eq!(store.user_stats().total, 0);
}
