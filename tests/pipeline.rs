mod support;

use std::sync::Arc;
use std::time::Duration;

use appgetter::check::commit_or_discard;
use appgetter::error::GetterError;
use appgetter::getter::STEP_REMOVED;
use appgetter::keys::SessionState;
use appgetter::pipeline::{
    ERR_INTERNAL, STEP_FINISHED, STEP_FINISHED_WITH_ERRORS, STEP_GETTING_ROUTES,
    STEP_INTERNAL_ERROR, STEP_METADATA, STEP_SEQUENCE, STEP_STARTING, STEP_WRITING_ROUTES,
};
use appgetter::storage::{AppFiles, ROUTES_FILE};
use appgetter_core::manifest::{ERR_BLANK_NAME, ERR_MANIFEST_NOT_FOUND};
use appgetter_core::store::memory::InMemoryAppStore;
use appgetter_core::store::AppStore;
use appgetter_core::versions::{ERR_DUPLICATE_VERSION, ERR_NEXT_LOWER_SCHEMA};

use support::*;

const CLEAN: &str = r#"{"name": "blah", "version": "0.0.1", "license": "MIT"}"#;

async fn run(h: &Harness, manifest: &str, app_id: Option<i64>) -> (String, Vec<String>) {
    let token = h
        .getter
        .install_files(1, &package(manifest), app_id)
        .await
        .unwrap();
    let mut steps = Vec::new();
    h.getter
        .wait_done(&token, |e| steps.push(e.step.clone()))
        .await
        .unwrap();
    (token, steps)
}

/// App 1 owned by user 1, with the given stored versions.
async fn store_with_versions(versions: &[(&str, u32)]) -> Arc<InMemoryAppStore> {
    let store = Arc::new(InMemoryAppStore::new());
    let app = store.create_app(1, "notes").await.unwrap();
    for (v, schema) in versions {
        seed_version(&store, app.app_id, v, *schema);
    }
    store
}

fn with_schema(version: &str, schema: u32) -> String {
    let migrations: Vec<String> = (1..=schema)
        .map(|s| format!(r#"{{"direction": "up", "schema": {}}}"#, s))
        .collect();
    format!(
        r#"{{"name": "notes", "version": "{}", "schema": {}, "license": "MIT", "migrations": [{}]}}"#,
        version,
        schema,
        migrations.join(",")
    )
}

#[tokio::test]
async fn clean_package_runs_every_step() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let (token, steps) = run(&h, CLEAN, None).await;

    assert_eq!(
        steps,
        vec![
            STEP_STARTING,
            STEP_METADATA,
            STEP_GETTING_ROUTES,
            STEP_WRITING_ROUTES,
            STEP_FINISHED
        ]
    );

    let results = h.getter.get_results(&token).unwrap();
    assert!(results.errors.is_empty(), "{:?}", results.errors);
    assert!(results.is_ok());
    assert_eq!(results.manifest.as_ref().unwrap().name, "blah");

    let last = h.getter.get_last_event(&token).unwrap();
    assert!(last.done && !last.error);

    let location = h.getter.get_location(&token).unwrap();
    let written = std::fs::read(h.tmp.path().join(&location).join(ROUTES_FILE)).unwrap();
    let routes: Vec<serde_json::Value> = serde_json::from_slice(&written).unwrap();
    assert_eq!(routes.len(), 1);

    let sandbox = h.launcher.last();
    assert_eq!(sandbox.graceful.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(kills(&sandbox), 0);
    assert_eq!(h.launcher.specs.lock().unwrap()[0].entrypoint, "app.lua");
}

#[tokio::test]
async fn blank_name_is_one_error_and_skips_routes() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let (token, steps) = run(&h, r#"{"version": "0.0.1", "license": "MIT"}"#, None).await;

    let results = h.getter.get_results(&token).unwrap();
    assert_eq!(results.errors, vec![ERR_BLANK_NAME.to_string()]);
    assert!(results.errors[0].contains("name"));
    assert!(!steps.iter().any(|s| s == STEP_GETTING_ROUTES));
    assert_eq!(steps.last().unwrap(), STEP_FINISHED_WITH_ERRORS);
    assert_eq!(h.launcher.launch_count(), 0);

    let last = h.getter.get_last_event(&token).unwrap();
    assert!(last.done && last.error);
}

#[tokio::test]
async fn missing_manifest_is_a_validation_error() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let token = h
        .getter
        .install_files(
            1,
            &[appgetter::package::PackageFile::new("app.lua", "")],
            None,
        )
        .await
        .unwrap();
    h.getter.wait_done(&token, |_| {}).await;

    let results = h.getter.get_results(&token).unwrap();
    assert_eq!(results.errors, vec![ERR_MANIFEST_NOT_FOUND.to_string()]);
    assert!(!results.internal_error);
    assert!(h.audit.messages().is_empty());
}

#[tokio::test]
async fn unknown_manifest_fields_are_rejected() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let (token, _) = run(&h, r#"{"name": "x", "version": "1.0.0", "colour": "red"}"#, None).await;
    let results = h.getter.get_results(&token).unwrap();
    assert_eq!(results.errors.len(), 1);
    assert!(results.errors[0].contains("malformed"));
}

#[tokio::test]
async fn version_between_neighbors() {
    let store = store_with_versions(&[("0.2.1", 0), ("0.8.1", 2)]).await;
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store);
    let (token, steps) = run(&h, &with_schema("0.5.0", 1), Some(1)).await;

    assert!(steps.iter().any(|s| s == STEP_SEQUENCE));
    let results = h.getter.get_results(&token).unwrap();
    assert!(results.errors.is_empty(), "{:?}", results.errors);
    assert_eq!(results.prev_version.as_deref(), Some("0.2.1"));
    assert_eq!(results.next_version.as_deref(), Some("0.8.1"));
}

#[tokio::test]
async fn inconsistent_neighbors_give_one_error() {
    let store = store_with_versions(&[("0.2.1", 1), ("0.8.1", 0)]).await;
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store);
    let (token, _) = run(&h, &with_schema("0.5.0", 1), Some(1)).await;

    let results = h.getter.get_results(&token).unwrap();
    assert_eq!(results.errors, vec![ERR_NEXT_LOWER_SCHEMA.to_string()]);
    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test]
async fn duplicate_version_has_no_neighbors() {
    let store = store_with_versions(&[("0.2.1", 0), ("0.5.0", 0), ("0.8.1", 0)]).await;
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store);
    let (token, _) = run(&h, &with_schema("0.5.0", 0), Some(1)).await;

    let results = h.getter.get_results(&token).unwrap();
    assert_eq!(results.errors, vec![ERR_DUPLICATE_VERSION.to_string()]);
    assert_eq!(results.prev_version, None);
    assert_eq!(results.next_version, None);
}

#[tokio::test]
async fn corrupt_stored_version_is_internal() {
    let store = store_with_versions(&[("not-semver", 0)]).await;
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store);
    let (token, steps) = run(&h, &with_schema("0.5.0", 0), Some(1)).await;

    let results = h.getter.get_results(&token).unwrap();
    assert!(results.internal_error);
    assert_eq!(results.errors, vec![ERR_INTERNAL.to_string()]);
    assert_eq!(steps.last().unwrap(), STEP_INTERNAL_ERROR);
    assert!(h.audit.messages()[0].contains("not-semver"));
}

#[tokio::test]
async fn other_users_app_is_refused() {
    let store = store_with_versions(&[]).await;
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store);
    let token = h
        .getter
        .install_files(2, &package(&with_schema("1.0.0", 0)), Some(1))
        .await
        .unwrap();
    h.getter.wait_done(&token, |_| {}).await;
    let results = h.getter.get_results(&token).unwrap();
    assert_eq!(results.errors.len(), 1);
    assert!(results.errors[0].contains("another user"));
}

#[tokio::test(start_paused = true)]
async fn silent_sandbox_is_killed_once_and_session_fails() {
    let h = Harness::new(Behavior::Silent);
    let token = h.getter.install_files(1, &package(CLEAN), None).await.unwrap();
    let last = h.getter.wait_done(&token, |_| {}).await.unwrap();

    assert!(last.done && last.error);
    assert_eq!(last.step, STEP_INTERNAL_ERROR);
    assert_eq!(kills(&h.launcher.last()), 1);

    let results = h.getter.get_results(&token).unwrap();
    assert!(results.internal_error);
    assert_eq!(results.errors, vec![ERR_INTERNAL.to_string()]);
    assert!(h.audit.messages()[0].contains("deadline"));

    // The host keeps accepting work.
    h.launcher.set_behavior(Behavior::routes(ONE_ROUTE));
    let (token, _) = run(&h, CLEAN, None).await;
    assert!(h.getter.get_results(&token).unwrap().is_ok());
}

#[tokio::test]
async fn malformed_route_reply_is_internal() {
    let h = Harness::new(Behavior::routes(r#"{"not": "an array"}"#));
    let (token, _) = run(&h, CLEAN, None).await;

    let results = h.getter.get_results(&token).unwrap();
    assert!(results.internal_error);
    assert_eq!(results.errors, vec![ERR_INTERNAL.to_string()]);
    assert!(h.audit.messages()[0].contains("Malformed route reply"));
    assert!(!results.errors[0].contains("array"));
}

#[tokio::test]
async fn invalid_route_table_is_a_validation_error() {
    let h = Harness::new(Behavior::routes(
        r#"[{"method": "GET", "path": {"path": "nope", "end": true},
             "auth": {"allow": "public"},
             "handler": {"type": "function", "function": "index"}}]"#,
    ));
    let (token, steps) = run(&h, CLEAN, None).await;

    let results = h.getter.get_results(&token).unwrap();
    assert!(!results.internal_error);
    assert_eq!(results.errors.len(), 1);
    assert!(results.errors[0].contains("must start with /"));
    assert!(!steps.iter().any(|s| s == STEP_WRITING_ROUTES));
    let location = h.getter.get_location(&token).unwrap();
    assert!(!h.tmp.path().join(location).join(ROUTES_FILE).exists());
}

#[tokio::test]
async fn late_subscriber_gets_terminal_event_only() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let (token, _) = run(&h, CLEAN, None).await;

    let (last, sub) = h.getter.subscribe(&token);
    assert!(last.unwrap().done);
    assert!(sub.is_none());
}

#[tokio::test]
async fn commit_creates_app_and_version() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let (token, _) = run(&h, CLEAN, None).await;
    let location = h.getter.get_location(&token).unwrap();

    let (app_id, version) = h.getter.commit(&token).await.unwrap();
    assert_eq!(version, "0.0.1");

    let app = h.store.get_app(app_id).await.unwrap().unwrap();
    assert_eq!(app.name, "blah");
    assert_eq!(app.owner_id, 1);
    let versions = h.store.list_versions(app_id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].location_key, location);

    // Bookkeeping is gone, files stay.
    assert!(h.getter.get_results(&token).is_none());
    assert!(h.getter.get_last_event(&token).is_none());
    assert!(h.files.exists(&location).await.unwrap());
    assert!(matches!(
        h.getter.commit(&token).await,
        Err(GetterError::NotFound)
    ));
}

#[tokio::test]
async fn commit_adds_version_to_existing_app() {
    let store = store_with_versions(&[("0.1.0", 0)]).await;
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store);
    let (token, _) = run(&h, &with_schema("0.2.0", 1), Some(1)).await;

    let (app_id, version) = h.getter.commit(&token).await.unwrap();
    assert_eq!((app_id, version.as_str()), (1, "0.2.0"));
    assert_eq!(h.store.list_versions(1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn commit_refuses_sessions_with_errors() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let (token, _) = run(&h, r#"{"version": "0.0.1"}"#, None).await;

    assert!(matches!(
        h.getter.commit(&token).await,
        Err(GetterError::HasErrors)
    ));
    assert_eq!(h.getter.session_state(&token), Some(SessionState::Ready));
}

#[tokio::test]
async fn commit_before_results_is_not_ready() {
    let h = Harness::new(Behavior::Silent);
    let token = h.getter.install_files(1, &package(CLEAN), None).await.unwrap();

    assert!(matches!(
        h.getter.commit(&token).await,
        Err(GetterError::NotReady)
    ));
    h.getter.delete(&token).await.unwrap();
}

#[tokio::test]
async fn delete_during_commit_is_refused() {
    let store = Arc::new(GatedStore::closed());
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store.clone());
    let (token, _) = run(&h, CLEAN, None).await;

    let getter = h.getter.clone();
    let commit_token = token.clone();
    let commit = tokio::spawn(async move { getter.commit(&commit_token).await });

    while h.getter.session_state(&token) != Some(SessionState::Committing) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(matches!(
        h.getter.delete(&token).await,
        Err(GetterError::Committing)
    ));
    assert!(matches!(
        h.getter.commit(&token).await,
        Err(GetterError::Committing)
    ));

    store.open();
    let (app_id, _) = commit.await.unwrap().unwrap();
    assert_eq!(app_id, 1);
    assert!(matches!(
        h.getter.delete(&token).await,
        Err(GetterError::NotFound)
    ));
}

#[tokio::test]
async fn delete_during_route_discovery_kills_once() {
    let h = Harness::new(Behavior::Silent);
    let token = h.getter.install_files(1, &package(CLEAN), None).await.unwrap();
    let (_, sub) = h.getter.subscribe(&token);
    let mut sub = sub.unwrap();

    while h.launcher.launch_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let location = h.getter.get_location(&token).unwrap();
    h.getter.delete(&token).await.unwrap();

    let mut last = None;
    while let Some(e) = sub.events.recv().await {
        last = Some(e);
    }
    let last = last.unwrap();
    assert!(last.done && last.error);
    assert_eq!(last.step, STEP_REMOVED);

    // Let the pipeline observe the cancellation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(kills(&h.launcher.last()), 1);
    assert!(!h.files.exists(&location).await.unwrap());
    assert!(h.getter.get_results(&token).is_none());
    assert!(h.getter.get_last_event(&token).is_none());
}

#[tokio::test]
async fn delete_key_data_keeps_files() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let (token, _) = run(&h, CLEAN, None).await;
    let location = h.getter.get_location(&token).unwrap();

    h.getter.delete_key_data(&token);
    assert!(h.getter.get_results(&token).is_none());
    assert!(h.getter.session_state(&token).is_none());
    assert!(h.files.exists(&location).await.unwrap());

    // Iterating on the same files.
    let again = h.getter.reprocess(1, None, &location).await.unwrap();
    assert_ne!(again, token);
    h.getter.wait_done(&again, |_| {}).await;
    assert!(h.getter.get_results(&again).unwrap().is_ok());
    assert_eq!(location_count(&h.tmp), 1);
}

#[tokio::test]
async fn archive_intake_strips_top_directory() {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for f in package(CLEAN) {
        writer
            .start_file(format!("blah/{}", f.path), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&f.data).unwrap();
    }
    let archive = writer.finish().unwrap().into_inner();

    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let token = h.getter.install_archive(1, archive, None).await.unwrap();
    h.getter.wait_done(&token, |_| {}).await;
    assert!(h.getter.get_results(&token).unwrap().is_ok());
}

#[tokio::test]
async fn garbage_archive_is_a_package_error() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    assert!(matches!(
        h.getter.install_archive(1, b"nope".to_vec(), None).await,
        Err(GetterError::Package(_))
    ));
    assert_eq!(location_count(&h.tmp), 0);
}

#[tokio::test]
async fn padded_entrypoint_is_a_validation_error() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    let (token, _) = run(
        &h,
        r#"{"name": "blah", "version": "0.0.1", "license": "MIT", "entrypoint": " app.lua"}"#,
        None,
    )
    .await;

    let results = h.getter.get_results(&token).unwrap();
    assert!(!results.internal_error);
    assert_eq!(results.errors.len(), 1);
    assert!(results.errors[0].contains("whitespace"));
    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test]
async fn reprocess_refuses_unknown_locations() {
    let h = Harness::new(Behavior::routes(ONE_ROUTE));
    assert!(matches!(
        h.getter.reprocess(1, None, "app0000").await,
        Err(GetterError::NotFound)
    ));
    assert!(matches!(
        h.getter.reprocess(1, None, "../etc").await,
        Err(GetterError::NotFound)
    ));
    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test]
async fn failed_commit_can_be_retried_without_orphan_apps() {
    let store = Arc::new(FlakyStore::failing(1));
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store.clone());
    let (token, _) = run(&h, CLEAN, None).await;

    assert!(matches!(
        h.getter.commit(&token).await,
        Err(GetterError::Internal(_))
    ));
    assert_eq!(h.getter.session_state(&token), Some(SessionState::Ready));
    assert!(h.audit.messages()[0].contains("commit failed"));
    assert!(store.get_app(1).await.unwrap().is_none());

    let (app_id, version) = h.getter.commit(&token).await.unwrap();
    assert_eq!((app_id, version.as_str()), (1, "0.0.1"));
    assert_eq!(store.list_versions(1).await.unwrap().len(), 1);
    assert!(store.get_app(2).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_install_commit_discards_the_package() {
    let store = Arc::new(FlakyStore::failing(1));
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store);
    let (token, _) = run(&h, CLEAN, None).await;
    let location = h.getter.get_location(&token).unwrap();

    assert!(commit_or_discard(&h.getter, &token).await.is_err());
    assert!(!h.files.exists(&location).await.unwrap());
    assert!(h.getter.session_state(&token).is_none());
}

async fn two_clean_sessions(h: &Harness, first: &str, second: &str) -> (String, String) {
    let (a, _) = run(h, first, Some(1)).await;
    let (b, _) = run(h, second, Some(1)).await;
    assert!(h.getter.get_results(&a).unwrap().is_ok());
    assert!(h.getter.get_results(&b).unwrap().is_ok());
    (a, b)
}

#[tokio::test]
async fn concurrent_commits_of_equal_versions_admit_one() {
    let store = store_with_versions(&[("0.2.1", 0), ("0.8.1", 2)]).await;
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store.clone());
    let (a, b) = two_clean_sessions(
        &h,
        &with_schema("0.5.0", 2),
        &with_schema("0.5.0+build", 0),
    )
    .await;

    let (ra, rb) = tokio::join!(h.getter.commit(&a), h.getter.commit(&b));
    let outcomes = [ra, rb];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let refused = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    match refused {
        GetterError::Conflict(msg) => assert!(msg.contains(ERR_DUPLICATE_VERSION)),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(store.list_versions(1).await.unwrap().len(), 3);
}

#[tokio::test]
async fn commit_rechecks_schema_against_newer_versions() {
    let store = store_with_versions(&[("0.2.1", 0), ("0.8.1", 2)]).await;
    let h = Harness::with_store(Behavior::routes(ONE_ROUTE), store.clone());
    let (a, b) =
        two_clean_sessions(&h, &with_schema("0.5.0", 2), &with_schema("0.6.0", 0)).await;

    h.getter.commit(&a).await.unwrap();
    match h.getter.commit(&b).await {
        Err(GetterError::Conflict(msg)) => assert!(msg.contains("higher schema")),
        other => panic!("unexpected outcome: {:?}", other),
    }

    // Refused, not lost: the session can still be discarded.
    assert_eq!(h.getter.session_state(&b), Some(SessionState::Ready));
    h.getter.delete(&b).await.unwrap();
    assert_eq!(store.list_versions(1).await.unwrap().len(), 3);
}
