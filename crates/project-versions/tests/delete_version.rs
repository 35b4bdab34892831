use project_versions::{test_support::Harness, VersionError};

#[tokio::test]
async fn succeeded_version_removes_both_artifacts() {
    let h = Harness::new();
    let p = Harness::project("p1");
    let v = h.create(&p, "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let done = h.complete_build(&scheduled, "dist").await.unwrap();
    assert!(h.objects.contains(&done.dist_storage.object_key));

    h.service.delete(&done).await.unwrap();
    assert!(!h.objects.contains(&done.src_storage.object_key));
    assert!(!h.objects.contains(&done.dist_storage.object_key));
    assert!(h.service.get_by_project_and_code(&p, "v1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn unbuilt_version_only_removes_source() {
    let h = Harness::new();
    let p = Harness::project("p1");
    let v = h.create(&p, "src").await.unwrap();
    // any attempt on the dist key would fail the delete
    h.artifacts.fail_delete_of(&v.dist_storage.object_key);
    h.service.delete(&v).await.unwrap();
    assert!(!h.objects.contains(&v.src_storage.object_key));
    assert!(h.service.list_by_project(&p).await.unwrap().is_empty());
}

#[tokio::test]
async fn failures_are_reported_per_artifact() {
    let h = Harness::new();
    let p = Harness::project("p1");
    let v = h.create(&p, "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let done = h.complete_build(&scheduled, "dist").await.unwrap();
    h.artifacts.fail_delete_of(&done.src_storage.object_key);

    let err = h.service.delete(&done).await.unwrap_err();
    match &err {
        VersionError::DeleteFailed { src, dist } => {
            assert!(src.as_deref().unwrap_or_default().contains("injected delete failure"));
            assert!(dist.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.http_status(), 500);
    // dist removal was still attempted
    assert!(!h.objects.contains(&done.dist_storage.object_key));
    // the document stays so the delete can be retried
    assert!(h.service.get_by_project_and_code(&p, "v1").await.is_ok());
}

#[tokio::test]
async fn foreign_provider_is_rejected() {
    let h = Harness::new();
    let mut v = h.create(&Harness::project("p1"), "src").await.unwrap();
    v.src_storage.provider = "gcs".into();
    let err = h.service.delete(&v).await.unwrap_err();
    assert!(matches!(err, VersionError::InvalidOption { option: "version.srcStorage.provider", kind: "unsupported" }));
    assert!(h.objects.contains(&v.src_storage.object_key));
}

#[tokio::test]
async fn out_of_date_copy_still_removes_build_output() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let done = h.complete_build(&scheduled, "dist").await.unwrap();
    let before = h.objects.object_count();

    // `v` still says NOT_SCHEDULED
    h.service.delete(&v).await.unwrap();
    assert!(!h.objects.contains(&done.dist_storage.object_key));
    assert!(!h.objects.contains(&done.src_storage.object_key));
    assert_eq!(h.objects.object_count(), before - 2);
    assert!(h.service.get_by_id(v.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn in_flight_build_blocks_delete() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();

    let err = h.service.delete(&v).await.unwrap_err();
    assert!(matches!(err, VersionError::BuildInFlight { .. }), "{err:?}");
    assert_eq!(err.http_status(), 409);
    assert!(h.objects.contains(&v.src_storage.object_key));

    // once the build finishes the version can go
    let done = h.complete_build(&scheduled, "dist").await.unwrap();
    h.service.delete(&done).await.unwrap();
    assert!(!h.objects.contains(&done.dist_storage.object_key));
}

#[tokio::test]
async fn failed_build_output_is_removed_too() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    h.service.schedule_build(&v).await.unwrap();
    let req = h.worker.last_request_for(&v).unwrap();
    let ct = req.dest.headers.get("content-type").cloned();
    h.objects.write_with_lease(&req.dest.url, ct.as_deref(), bytes::Bytes::from("partial")).unwrap();
    let failed = h
        .service
        .builds()
        .handle_build_failure(&req.request_id, &project_versions::worker::BuildReport::message("crashed"))
        .await
        .unwrap();
    assert!(!failed.has_dist());

    h.service.delete(&failed).await.unwrap();
    assert!(!h.objects.contains(&v.dist_storage.object_key));
}

#[tokio::test]
async fn deleting_twice_is_not_found() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    h.service.delete(&v).await.unwrap();
    assert!(h.service.delete(&v).await.unwrap_err().is_not_found());
}
