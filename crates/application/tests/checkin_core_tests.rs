use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use checkin_application::{AuditRequestDraft, CheckinCore, CheckinRequest, ServiceDeps, TaskDraft};
use checkin_domain::{
    AuditFilter, AuditQuery, AuditStatus, CheckinError, ErrorKind, GpsPolicy, RecordQuery,
    RecordStatus, TaskFilter, TaskPhase, TaskScope, VerificationPayload, VerificationPolicy,
};
use checkin_infrastructure::{CacheConsistencyLayer, InMemoryCache};
use checkin_testing_utils::{
    point_north_of, FailingCache, FaultPoint, FixedClock, InMemoryDatabase, PayloadBuilder,
};

const CENTER: (f64, f64) = (39.90, 116.40);

struct Harness {
    core: CheckinCore,
    db: InMemoryDatabase,
    cache: InMemoryCache,
    clock: FixedClock,
    group_id: i64,
}

impl Harness {
    async fn new() -> Self {
        let db = InMemoryDatabase::new();
        let group = db.insert_group("研发部", 1, "owner").await;
        let cache = InMemoryCache::new();
        let clock = FixedClock::new(Utc::now());
        let deps = ServiceDeps::new(
            Arc::new(db.clone()),
            CacheConsistencyLayer::with_defaults(Arc::new(cache.clone())),
        )
        .with_clock(Arc::new(clock.clone()));
        Self {
            core: CheckinCore::new(deps),
            db,
            cache,
            clock,
            group_id: group.id,
        }
    }

    /// 一小时后开始、持续一小时、只启用GPS的任务
    async fn gps_task(&self) -> Result<i64> {
        let now = checkin_domain::Clock::now(&self.clock);
        let view = self
            .core
            .create_task(
                self.group_id,
                TaskDraft {
                    name: "晨会签到".to_string(),
                    description: "会议室".to_string(),
                    start_time: now + Duration::hours(1),
                    end_time: now + Duration::hours(2),
                    policy: VerificationPolicy {
                        gps: Some(GpsPolicy {
                            latitude: CENTER.0,
                            longitude: CENTER.1,
                            radius: 50,
                        }),
                        ..Default::default()
                    },
                },
            )
            .await?;
        Ok(view.task.id)
    }

    fn request_at(&self, task_id: i64, user_id: i64, meters_north: f64) -> CheckinRequest {
        let (lat, lng) = point_north_of(CENTER.0, CENTER.1, meters_north);
        CheckinRequest {
            task_id,
            user_id,
            username: format!("user{user_id}"),
            group_id: self.group_id,
            payload: PayloadBuilder::new().gps(lat, lng).build(),
        }
    }
}

#[tokio::test]
async fn test_gps_check_in_scenario() -> Result<()> {
    let h = Harness::new().await;
    let task_id = h.gps_task().await?;
    assert_eq!(h.core.get_task(task_id).await?.phase, TaskPhase::Upcoming);

    let err = h.core.check_in(h.request_at(task_id, 7, 60.0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(matches!(err, CheckinError::VerificationFailed { ref method, .. } if method == "gps"));

    let record = h.core.check_in(h.request_at(task_id, 7, 10.0)).await?;
    assert_eq!(record.status, RecordStatus::Normal);
    assert!(record.payload.gps.is_some());

    let err = h.core.check_in(h.request_at(task_id, 7, 10.0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.status_code(), 409);
    assert_eq!(h.db.record_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_audit_approval_scenario() -> Result<()> {
    let h = Harness::new().await;
    let task_id = h.gps_task().await?;

    let application = h
        .core
        .create_audit_request(AuditRequestDraft {
            task_id,
            user_id: 7,
            username: "user7".to_string(),
            reason: "network failure".to_string(),
            image: Some("https://img.example/evidence.png".to_string()),
        })
        .await?;
    assert_eq!(application.status, AuditStatus::Pending);

    // 先读一次，让列表进入缓存
    assert!(h.core.list_checkin_records(RecordQuery::ByTask(task_id)).await?.is_empty());

    let approved = h.core.approve_request(application.id).await?;
    assert_eq!(approved.status, AuditStatus::Approved);

    let records = h.core.list_checkin_records(RecordQuery::ByTask(task_id)).await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, 7);
    assert_eq!(records[0].status, RecordStatus::AuditApproved);

    let fetched = h.core.get_audit_request(application.id).await?;
    assert_eq!(fetched.status, AuditStatus::Approved);
    let pending = h
        .core
        .list_audit_requests(AuditQuery::ByGroup {
            group_id: h.group_id,
            filter: AuditFilter::Pending,
        })
        .await?;
    assert!(pending.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_approve_rolls_back_when_record_insert_fails() -> Result<()> {
    let h = Harness::new().await;
    let task_id = h.gps_task().await?;
    let application = h
        .core
        .create_audit_request(AuditRequestDraft {
            task_id,
            user_id: 7,
            username: "user7".to_string(),
            reason: "手机没电".to_string(),
            image: None,
        })
        .await?;

    h.db.fail_next(FaultPoint::CreateRecord);
    assert!(h.core.approve_request(application.id).await.is_err());

    assert_eq!(h.core.get_audit_request(application.id).await?.status, AuditStatus::Pending);
    assert!(h.core.list_checkin_records(RecordQuery::ByUser(7)).await?.is_empty());
    assert!(matches!(
        h.core.get_checkin_record(task_id, 7).await,
        Err(CheckinError::RecordNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_check_ins_yield_one_record() -> Result<()> {
    let h = Harness::new().await;
    let task_id = h.gps_task().await?;

    let (first, second) = futures::join!(
        h.core.check_in(h.request_at(task_id, 7, 5.0)),
        h.core.check_in(h.request_at(task_id, 7, 5.0)),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(CheckinError::AlreadyCheckedIn { .. })))
            .count(),
        1
    );
    assert_eq!(h.db.record_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_check_in_after_end_is_rejected() -> Result<()> {
    let h = Harness::new().await;
    let task_id = h.gps_task().await?;

    h.clock.advance(Duration::hours(2) + Duration::seconds(1));
    let err = h.core.check_in(h.request_at(task_id, 7, 1.0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(h.db.record_count().await, 0);
    assert_eq!(h.core.get_task(task_id).await?.phase, TaskPhase::Expired);
    Ok(())
}

#[tokio::test]
async fn test_record_views_refresh_after_check_in() -> Result<()> {
    let h = Harness::new().await;
    let task_id = h.gps_task().await?;
    let other_task = h.gps_task().await?;

    assert!(h.core.list_checkin_records(RecordQuery::ByTask(task_id)).await?.is_empty());
    assert!(h.core.list_checkin_records(RecordQuery::ByUser(7)).await?.is_empty());
    assert!(h.core.list_checkin_records(RecordQuery::ByTask(other_task)).await?.is_empty());
    let unrelated = format!("record:task:{other_task}");
    assert!(h.cache.contains_key(&unrelated).await);

    let record = h.core.check_in(h.request_at(task_id, 7, 0.0)).await?;

    let by_task = h.core.list_checkin_records(RecordQuery::ByTask(task_id)).await?;
    assert_eq!(by_task, vec![record.clone()]);
    let by_user = h.core.list_checkin_records(RecordQuery::ByUser(7)).await?;
    assert_eq!(by_user, vec![record.clone()]);
    assert_eq!(h.core.get_checkin_record(task_id, 7).await?, record);
    assert!(h.cache.contains_key(&unrelated).await);
    Ok(())
}

#[tokio::test]
async fn test_invalid_window_and_task_listing() -> Result<()> {
    let h = Harness::new().await;
    let now = checkin_domain::Clock::now(&h.clock);

    let err = h
        .core
        .create_task(
            h.group_id,
            TaskDraft {
                name: "倒置窗口".to_string(),
                description: String::new(),
                start_time: now + Duration::hours(2),
                end_time: now + Duration::hours(1),
                policy: VerificationPolicy::default(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let task_id = h.gps_task().await?;
    let all = h.core.list_tasks(TaskScope::Group(h.group_id), TaskFilter::All).await?;
    assert_eq!(all.len(), 1);
    assert!(h.core.list_tasks(TaskScope::Group(h.group_id), TaskFilter::Active).await?.is_empty());

    h.clock.advance(Duration::minutes(90));
    let active = h.core.list_tasks(TaskScope::User(1), TaskFilter::Active).await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].task.id, task_id);
    assert_eq!(active[0].phase, TaskPhase::Ongoing);

    let err = h
        .core
        .update_task(
            task_id,
            TaskDraft {
                name: "改名".to_string(),
                description: String::new(),
                start_time: now + Duration::hours(3),
                end_time: now + Duration::hours(4),
                policy: VerificationPolicy::default(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CheckinError::TaskAlreadyStarted { .. }));

    h.core.delete_task(task_id).await?;
    assert!(h.core.list_tasks(TaskScope::Group(h.group_id), TaskFilter::All).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cache_outage_does_not_fail_operations() -> Result<()> {
    let db = InMemoryDatabase::new();
    let group = db.insert_group("研发部", 1, "owner").await;
    let cache = FailingCache::new();
    let core = CheckinCore::new(ServiceDeps::new(
        Arc::new(db.clone()),
        CacheConsistencyLayer::with_defaults(Arc::new(cache.clone())),
    ));
    let now = Utc::now();

    let view = core
        .create_task(
            group.id,
            TaskDraft {
                name: "无缓存".to_string(),
                description: String::new(),
                start_time: now - Duration::minutes(5),
                end_time: now + Duration::hours(1),
                policy: VerificationPolicy::default(),
            },
        )
        .await?;
    core.check_in(CheckinRequest {
        task_id: view.task.id,
        user_id: 7,
        username: "user7".to_string(),
        group_id: group.id,
        payload: VerificationPayload::default(),
    })
    .await?;

    assert_eq!(core.list_checkin_records(RecordQuery::ByTask(view.task.id)).await?.len(), 1);
    assert!(cache.calls() > 0);
    Ok(())
}
