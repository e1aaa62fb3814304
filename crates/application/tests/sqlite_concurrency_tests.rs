//! Races on a file-backed SQLite pool where transactions run on separate
//! connections at the same time.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use checkin_application::{AuditRequestDraft, CheckinCore, CheckinRequest, ServiceDeps, TaskDraft};
use checkin_domain::{
    CheckinError, RecordQuery, RecordStatus, TaskRecord, VerificationPayload, VerificationPolicy,
};
use checkin_infrastructure::{CacheConsistencyLayer, DatabaseManager, InMemoryCache};

struct FileBacked {
    core: Arc<CheckinCore>,
    group_id: i64,
    _manager: DatabaseManager,
    _dir: tempfile::TempDir,
}

impl FileBacked {
    async fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite://{}", dir.path().join("checkin.db").display());
        let manager = DatabaseManager::new(&url, 5).await?;
        manager.migrate().await?;

        let group_id: i64 = sqlx::query_scalar(
            "INSERT INTO groups (name, description, creator_id, creator_username, created_at) \
             VALUES ('研发部', '', 1, 'owner', 0) RETURNING id",
        )
        .fetch_one(manager.pool())
        .await?;

        let deps = ServiceDeps::new(
            manager.store(),
            CacheConsistencyLayer::with_defaults(Arc::new(InMemoryCache::new())),
        );
        Ok(Self {
            core: Arc::new(CheckinCore::new(deps)),
            group_id,
            _manager: manager,
            _dir: dir,
        })
    }

    async fn ongoing_task(&self) -> Result<i64> {
        let now = Utc::now();
        let view = self
            .core
            .create_task(
                self.group_id,
                TaskDraft {
                    name: "并发签到".to_string(),
                    description: String::new(),
                    start_time: now - Duration::minutes(5),
                    end_time: now + Duration::hours(1),
                    policy: VerificationPolicy::default(),
                },
            )
            .await?;
        Ok(view.task.id)
    }
}

/// 两个结果中恰好一个成功，返回失败的那个
fn single_loser<T>(outcomes: Vec<Result<T, CheckinError>>) -> CheckinError {
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    outcomes.into_iter().find_map(Result::err).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_check_ins_leave_one_record_and_one_conflict() -> Result<()> {
    let env = FileBacked::new().await?;
    let task_id = env.ongoing_task().await?;

    for user_id in 100..110 {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let core = Arc::clone(&env.core);
                let request = CheckinRequest {
                    task_id,
                    user_id,
                    username: format!("user{user_id}"),
                    group_id: env.group_id,
                    payload: VerificationPayload::default(),
                };
                tokio::spawn(async move { core.check_in(request).await })
            })
            .collect();

        let mut outcomes: Vec<Result<TaskRecord, CheckinError>> = Vec::new();
        for handle in handles {
            outcomes.push(handle.await?);
        }
        let loser = single_loser(outcomes);
        assert!(
            matches!(loser, CheckinError::AlreadyCheckedIn { .. }),
            "user {user_id}: {loser}"
        );
        assert_eq!(loser.status_code(), 409);
    }

    let records = env
        .core
        .list_checkin_records(RecordQuery::ByTask(task_id))
        .await?;
    assert_eq!(records.len(), 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_approvals_process_request_once() -> Result<()> {
    let env = FileBacked::new().await?;
    let task_id = env.ongoing_task().await?;

    for user_id in 200..210 {
        let application = env
            .core
            .create_audit_request(AuditRequestDraft {
                task_id,
                user_id,
                username: format!("user{user_id}"),
                reason: "忘记签到".to_string(),
                image: None,
            })
            .await?;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let core = Arc::clone(&env.core);
                let id = application.id;
                tokio::spawn(async move { core.approve_request(id).await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await?);
        }
        let loser = single_loser(outcomes);
        assert!(
            matches!(loser, CheckinError::AuditAlreadyProcessed { .. }),
            "user {user_id}: {loser}"
        );
        assert_eq!(loser.status_code(), 409);
    }

    let records = env
        .core
        .list_checkin_records(RecordQuery::ByTask(task_id))
        .await?;
    assert_eq!(records.len(), 10);
    assert!(records
        .iter()
        .all(|r| r.status == RecordStatus::AuditApproved));
    Ok(())
}
