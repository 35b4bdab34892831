//! Runs against a real Postgres when DATABASE_URL is set; skipped otherwise.
use project_versions::{
    db::{init_db, PgVersionStore},
    models::{BuildTransition, DeployTransition, NewVersion, StorageRecord},
    store::VersionStore,
    BuildStatus, DeployStatus, VersionError,
};
use serial_test::serial;
use uuid::Uuid;

async fn store() -> Option<PgVersionStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = init_db(&url).await.expect("postgres");
    sqlx::query("DELETE FROM project_versions").execute(&pool).await.unwrap();
    Some(PgVersionStore::new(pool))
}

fn draft(project: &str) -> NewVersion {
    let id = Uuid::new_v4();
    let rec = |suffix: &str| StorageRecord {
        object_key: format!("projects/{project}/versions/{id}/{suffix}"),
        provider: "memory".into(),
        generation: None,
        checksum: None,
    };
    NewVersion { id, project_id: project.into(), src_storage: rec("src.zip"), dist_storage: rec("dist.zip") }
}

#[tokio::test]
#[serial]
async fn drafts_numbering_and_conflicts() {
    let Some(store) = store().await else { return };
    let a = store.insert_draft(draft("p")).await.unwrap();
    let b = store.insert_draft(draft("p")).await.unwrap();
    assert!(b.created_at > a.created_at);
    assert!(store.find_latest("p").await.unwrap().is_none());
    assert_eq!(store.find_previous("p", b.created_at).await.unwrap().unwrap().id, a.id);

    let a = store.assign_number(a.id, 1, "v1").await.unwrap();
    assert_eq!(a.code.as_deref(), Some("v1"));
    let err = store.assign_number(b.id, 1, "v1").await.unwrap_err();
    assert!(matches!(err, VersionError::DuplicateCode { .. }), "{err:?}");
    store.assign_number(b.id, 2, "v2").await.unwrap();

    let listed = store.list_by_project("p").await.unwrap();
    assert_eq!(listed.iter().map(|v| v.number).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
    assert_eq!(store.find_by_code("p", "v2").await.unwrap().unwrap().id, b.id);
    assert!(store.remove(b.id).await.unwrap());
    assert!(!store.remove(b.id).await.unwrap());
}

#[tokio::test]
#[serial]
async fn guarded_transitions() {
    let Some(store) = store().await else { return };
    let v = store.insert_draft(draft("q")).await.unwrap();
    store.assign_number(v.id, 1, "v1").await.unwrap();

    let sched = BuildTransition::Schedule { request_id: "req-1".into() };
    let s = store.transition_build(v.id, None, &sched).await.unwrap().unwrap();
    assert_eq!(s.build_status.value, BuildStatus::Scheduled);
    assert!(store.transition_build(v.id, None, &sched).await.unwrap().is_none());
    assert_eq!(store.find_by_build_request("req-1").await.unwrap().unwrap().id, v.id);

    let ok = BuildTransition::Succeed { dist_generation: Some("42".into()) };
    assert!(store.transition_build(v.id, Some("other"), &ok).await.unwrap().is_none());
    let done = store.transition_build(v.id, Some("req-1"), &ok).await.unwrap().unwrap();
    assert_eq!(done.dist_storage.generation.as_deref(), Some("42"));
    assert!(done.build_request_id.is_none());
    assert_eq!(store.list_by_build_status(&[BuildStatus::Succeeded], 5).await.unwrap().len(), 1);

    let d = store.transition_deploy(v.id, &DeployTransition::Schedule).await.unwrap().unwrap();
    assert_eq!(d.deploy_status.value, DeployStatus::Scheduled);
    assert!(store.transition_deploy(v.id, &DeployTransition::Schedule).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn stale_drafts_sweep_only_unnumbered() {
    let Some(store) = store().await else { return };
    let a = store.insert_draft(draft("r")).await.unwrap();
    let b = store.insert_draft(draft("r")).await.unwrap();
    store.assign_number(b.id, 1, "v1").await.unwrap();
    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(5);

    let stale = store.list_stale_drafts(cutoff, 10).await.unwrap();
    assert_eq!(stale.iter().map(|v| v.id).collect::<Vec<_>>(), vec![a.id]);
    assert!(!store.remove_draft(b.id).await.unwrap());
    assert!(store.remove_draft(a.id).await.unwrap());
    assert!(store.list_stale_drafts(cutoff, 10).await.unwrap().is_empty());
}
