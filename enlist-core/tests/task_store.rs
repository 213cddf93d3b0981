use std::collections::HashMap;

use enlist_core::{
    AutomationTask, CredentialSink, Credentials, SqliteTaskStore, StatusPatch, StepOutcome,
    StepRecord, StoreError, TaskStatus, TaskStore,
};

fn setup_store() -> SqliteTaskStore {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.sqlite");
    // Preserve directory on disk for the duration of the test runs.
    #[allow(deprecated)]
    let _persist = dir.into_path();
    let store = SqliteTaskStore::builder()
        .path(&path)
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    store
}

#[tokio::test]
async fn test_task_round_trip_and_patch() {
    let store = setup_store();
    let mut task = AutomationTask::new("forgecloud", 3);
    task.email_domain_hint = Some("mailinator.com".into());
    store.create(&task).await.unwrap();

    let fetched = store.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(fetched.software_id, "forgecloud");
    assert_eq!(fetched.status, TaskStatus::Pending);
    assert_eq!(fetched.email_domain_hint.as_deref(), Some("mailinator.com"));

    store
        .update_status(
            &task.task_id,
            TaskStatus::Running,
            StatusPatch {
                total_steps: Some(9),
                started_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // A patch with nothing set must leave every other column untouched.
    store
        .update_status(&task.task_id, TaskStatus::Running, StatusPatch::default())
        .await
        .unwrap();

    let fetched = store.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Running);
    assert_eq!(fetched.total_steps, 9);
    assert!(fetched.started_at.is_some());
}

#[tokio::test]
async fn test_success_clears_stale_error_message() {
    let store = setup_store();
    let task = AutomationTask::new("forgecloud", 3);
    store.create(&task).await.unwrap();

    store
        .update_status(
            &task.task_id,
            TaskStatus::RetryScheduled,
            StatusPatch {
                retry_count: Some(1),
                error_message: Some("selector wait timed out".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store
        .update_status(
            &task.task_id,
            TaskStatus::Success,
            StatusPatch {
                success: Some(true),
                completed_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let fetched = store.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Success);
    assert!(fetched.success);
    assert_eq!(fetched.error_message, None);
    assert_eq!(fetched.retry_count, 1);
}

#[tokio::test]
async fn test_trace_seq_grows_across_attempts() {
    let store = setup_store();
    let task = AutomationTask::new("hexlayer", 2);
    store.create(&task).await.unwrap();

    let first = StepRecord::new(1, 1, "navigate");
    let mut second = StepRecord::new(1, 2, "fill_form");
    second.outcome = StepOutcome::Failure;
    second.error = Some("element missing: input#email".into());
    // Second attempt restarts its local numbering at 1.
    let third = StepRecord::new(2, 1, "navigate");

    assert_eq!(store.append_step(&task.task_id, &first).await.unwrap(), 1);
    assert_eq!(store.append_step(&task.task_id, &second).await.unwrap(), 2);
    assert_eq!(store.append_step(&task.task_id, &third).await.unwrap(), 3);

    let steps = store.steps(&task.task_id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(
        steps.iter().map(|s| s.seq).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(steps[1].attempt, 1);
    assert_eq!(steps[1].step_number, 2);
    assert_eq!(steps[1].outcome, StepOutcome::Failure);
    assert_eq!(steps[2].attempt, 2);
    assert_eq!(steps[2].step_number, 1);
}

#[tokio::test]
async fn test_missing_task_is_reported() {
    let store = setup_store();

    assert!(store.get("task-unknown").await.unwrap().is_none());

    let step = StepRecord::new(1, 1, "navigate");
    let err = store.append_step("task-unknown", &step).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    let err = store
        .update_status("task-unknown", TaskStatus::Running, StatusPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn test_account_sink_persists_tokens() {
    let store = setup_store();
    let task = AutomationTask::new("forgecloud", 3);
    store.create(&task).await.unwrap();

    let credentials = Credentials::new("user9crj@mailinator.com", "N0tAReal#Passw0rd");
    let mut tokens = HashMap::new();
    tokens.insert("api_key".to_string(), "fc_live_1f2e3d".to_string());

    let account_id = CredentialSink::store(&store, &task.task_id, &credentials, &tokens)
        .await
        .unwrap();
    assert!(account_id.starts_with("acct-"));
    assert_eq!(
        store.fetch_account_email(&account_id).unwrap().as_deref(),
        Some("user9crj@mailinator.com")
    );

    // The token map rides along as a JSON column.
    let stored: Option<String> = {
        let conn = rusqlite::Connection::open(store_path(&store)).unwrap();
        conn.query_row(
            "SELECT tokens FROM accounts WHERE account_id = ?1",
            [&account_id],
            |row| row.get(0),
        )
        .unwrap()
    };
    let parsed: HashMap<String, String> = serde_json::from_str(&stored.unwrap()).unwrap();
    assert_eq!(parsed.get("api_key").map(String::as_str), Some("fc_live_1f2e3d"));

    // One account per task; an empty token map stores as NULL on a new task.
    let other = AutomationTask::new("hexlayer", 3);
    store.create(&other).await.unwrap();
    let empty = HashMap::new();
    let plain_id = CredentialSink::store(&store, &other.task_id, &credentials, &empty)
        .await
        .unwrap();
    let stored: Option<String> = {
        let conn = rusqlite::Connection::open(store_path(&store)).unwrap();
        conn.query_row(
            "SELECT tokens FROM accounts WHERE account_id = ?1",
            [&plain_id],
            |row| row.get(0),
        )
        .unwrap()
    };
    assert_eq!(stored, None);
}

fn store_path(store: &SqliteTaskStore) -> std::path::PathBuf {
    store.path().to_path_buf()
}
