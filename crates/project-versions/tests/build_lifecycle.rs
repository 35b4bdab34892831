use project_versions::{
    deploy::DeployOutcome,
    storage::ArtifactStore,
    telemetry,
    test_support::Harness,
    worker::{dispatch_event, BuildReport, WorkerEvent},
    BuildStatus, DeployStatus, VersionError,
};

#[tokio::test]
async fn scheduling_is_idempotent() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let first = h.service.schedule_build(&v).await.unwrap();
    let second = h.service.schedule_build(&first).await.unwrap();
    assert_eq!(h.worker.requests().len(), 1);
    assert_eq!(first.build_status.value, BuildStatus::Scheduled);
    assert!(first.build_request_id.is_some());
    assert_eq!(first.build_request_id, second.build_request_id);
    // a stale copy of the document does not fool it either
    h.service.schedule_build(&v).await.unwrap();
    assert_eq!(h.worker.requests().len(), 1);
}

#[tokio::test]
async fn request_carries_source_read_and_dist_write_leases() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "the source").await.unwrap();
    h.service.schedule_build(&v).await.unwrap();
    let req = h.worker.last_request_for(&v).unwrap();
    assert_eq!(h.read(&req.src.url).unwrap(), bytes::Bytes::from("the source"));
    assert_eq!(req.dest.method, "PUT");
    assert_eq!(req.dest.headers.get("content-type").map(String::as_str), Some("application/zip"));
    assert_eq!(req.project_id, "p1");
}

#[tokio::test]
async fn success_then_failure_is_stale() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let rid = scheduled.build_request_id.clone().unwrap();

    let done = h.complete_build(&scheduled, "built").await.unwrap();
    assert_eq!(done.build_status.value, BuildStatus::Succeeded);
    assert!(done.build_request_id.is_none());
    let meta = h.objects.object_metadata(&done.dist_storage.object_key, None).await.unwrap().unwrap();
    assert_eq!(done.dist_storage.generation.as_deref(), Some(meta.generation.as_str()));

    let err = h.service.builds().handle_build_failure(&rid, &BuildReport::message("late")).await.unwrap_err();
    assert!(matches!(err, VersionError::NotFound { .. }), "{err:?}");
    let after = h.service.get_by_id(v.id).await.unwrap();
    assert_eq!(after.build_status.value, BuildStatus::Succeeded);
    assert!(telemetry::gather_text().contains("version_build_callbacks_stale_total"));
}

#[tokio::test]
async fn started_then_succeeded() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let rid = scheduled.build_request_id.clone().unwrap();
    let started = h.service.builds().handle_build_started(&rid).await.unwrap();
    assert_eq!(started.build_status.value, BuildStatus::Started);
    assert_eq!(started.build_request_id.as_deref(), Some(rid.as_str()));
    // in flight, so scheduling again is a no-op
    h.service.schedule_build(&started).await.unwrap();
    assert_eq!(h.worker.requests().len(), 1);
    let done = h.complete_build(&started, "built").await.unwrap();
    assert_eq!(done.build_status.value, BuildStatus::Succeeded);
    assert!(h.service.builds().handle_build_started(&rid).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn failure_keeps_dist_untouched_and_allows_reschedule() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let rid = scheduled.build_request_id.clone().unwrap();
    let failed = h.service.builds().handle_build_failure(&rid, &BuildReport::message("npm exited 1")).await.unwrap();
    assert_eq!(failed.build_status.value, BuildStatus::Failed);
    assert_eq!(failed.build_status.reason.as_deref(), Some("npm exited 1"));
    assert!(failed.build_request_id.is_none());
    assert_eq!(failed.dist_storage, v.dist_storage);

    let again = h.service.schedule_build(&failed).await.unwrap();
    assert_eq!(again.build_status.value, BuildStatus::Scheduled);
    assert_ne!(again.build_request_id.as_deref(), Some(rid.as_str()));
    assert_eq!(h.worker.requests().len(), 2);
}

#[tokio::test]
async fn enqueue_failure_marks_build_failed() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    h.worker.refuse_next();
    let err = h.service.schedule_build(&v).await.unwrap_err();
    assert!(matches!(err, VersionError::Storage(_)), "{err:?}");
    let after = h.service.get_by_id(v.id).await.unwrap();
    assert_eq!(after.build_status.value, BuildStatus::Failed);
    assert!(after.build_status.reason.as_deref().unwrap_or_default().contains("enqueue failed"));
    assert!(after.build_request_id.is_none());
    // picked up by the maintenance path
    let rescheduled = h.service.reschedule_failed_builds(10).await.unwrap();
    assert_eq!(rescheduled.len(), 1);
    assert_eq!(rescheduled[0].build_status.value, BuildStatus::Scheduled);
}

#[tokio::test]
async fn callback_before_enqueue_returns_is_applied() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let release = h.worker.hold_next();
    let service = h.service.clone();
    let copy = v.clone();
    let pending = tokio::spawn(async move { service.schedule_build(&copy).await });

    let req = loop {
        if let Some(r) = h.worker.last_request_for(&v) { break r; }
        tokio::task::yield_now().await;
    };
    // the worker picks the job up before the publish is acknowledged
    let started = h.service.builds().handle_build_started(&req.request_id).await.unwrap();
    assert_eq!(started.build_status.value, BuildStatus::Started);
    release.send(()).unwrap();

    let scheduled = pending.await.unwrap().unwrap();
    assert_eq!(scheduled.build_status.value, BuildStatus::Started);
    assert_eq!(scheduled.build_request_id.as_deref(), Some(req.request_id.as_str()));
    let done = h.complete_build(&scheduled, "out").await.unwrap();
    assert_eq!(done.build_status.value, BuildStatus::Succeeded);
}

#[tokio::test]
async fn success_without_output_fails_the_build() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let rid = scheduled.build_request_id.unwrap();
    let v = h.service.builds().handle_build_success(&rid, &BuildReport::default()).await.unwrap();
    assert_eq!(v.build_status.value, BuildStatus::Failed);
    assert!(v.dist_storage.generation.is_none());
    assert!(h.deployer.requests().is_empty());
}

#[tokio::test]
async fn success_notifies_deployer_and_tracks_deploy_status() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let done = h.complete_build(&scheduled, "out").await.unwrap();
    assert_eq!(done.deploy_status.value, DeployStatus::Scheduled);
    let reqs = h.deployer.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].project_id, "p1");
    assert_eq!(reqs[0].detail["versionCode"], "v1");

    let deployed = h.service.builds().record_deploy_result(v.id, DeployOutcome::Succeeded, None).await.unwrap();
    assert_eq!(deployed.deploy_status.value, DeployStatus::Succeeded);
    let err = h.service.builds().record_deploy_result(v.id, DeployOutcome::Failed, Some("late".into())).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn deploy_notification_failure_does_not_undo_success() {
    let h = Harness::new();
    h.deployer.set_failing(true);
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let scheduled = h.service.schedule_build(&v).await.unwrap();
    let done = h.complete_build(&scheduled, "out").await.unwrap();
    assert_eq!(done.build_status.value, BuildStatus::Succeeded);
    assert_eq!(done.deploy_status.value, DeployStatus::NotScheduled);
}

#[tokio::test]
async fn worker_events_are_dispatched() {
    let h = Harness::new();
    let v = h.create(&Harness::project("p1"), "src").await.unwrap();
    let rid = h.service.schedule_build(&v).await.unwrap().build_request_id.unwrap();
    let started = dispatch_event(h.service.builds(), WorkerEvent::Started { build_request_id: rid.clone() }).await.unwrap();
    assert_eq!(started.build_status.value, BuildStatus::Started);
    let failed = dispatch_event(h.service.builds(), WorkerEvent::Failed { build_request_id: rid.clone(), report: BuildReport::message("boom") })
        .await
        .unwrap();
    assert_eq!(failed.build_status.value, BuildStatus::Failed);
    let stale = dispatch_event(h.service.builds(), WorkerEvent::Succeeded { build_request_id: rid, report: BuildReport::default() }).await;
    assert!(stale.unwrap_err().is_not_found());
}

#[tokio::test]
async fn unknown_request_is_not_found() {
    let h = Harness::new();
    let err = h.service.builds().handle_build_success("nope", &BuildReport::default()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn reschedule_respects_limit_and_status() {
    let h = Harness::new();
    let p = Harness::project("p1");
    let mut ids = Vec::new();
    for _ in 0..3 {
        let v = h.create(&p, "src").await.unwrap();
        let rid = h.service.schedule_build(&v).await.unwrap().build_request_id.unwrap();
        h.service.builds().handle_build_failure(&rid, &BuildReport::default()).await.unwrap();
        ids.push(v.id);
    }
    let untouched = h.create(&p, "src").await.unwrap();
    let listed = h.service.list_by_build_status(&[BuildStatus::Failed], 10).await.unwrap();
    assert_eq!(listed.len(), 3);

    let rescheduled = h.service.reschedule_failed_builds(2).await.unwrap();
    assert_eq!(rescheduled.iter().map(|v| v.id).collect::<Vec<_>>(), ids[..2].to_vec());
    assert_eq!(h.service.list_by_build_status(&[BuildStatus::Failed], 10).await.unwrap().len(), 1);
    assert_eq!(h.service.get_by_id(untouched.id).await.unwrap().build_status.value, BuildStatus::NotScheduled);
}
