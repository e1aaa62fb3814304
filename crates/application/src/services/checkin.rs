use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use checkin_domain::{
    NewTaskRecord, RecordQuery, RecordStatus, TaskRecord, VerificationMethod, VerificationOutcome,
    VerificationPayload,
};
use checkin_errors::{CheckinError, CheckinResult};

use super::{Committed, ServiceDeps};

/// 一次签到请求
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckinRequest {
    pub task_id: i64,
    pub user_id: i64,
    pub username: String,
    pub group_id: i64,
    #[serde(default)]
    pub payload: VerificationPayload,
}

/// 签到记录服务
///
/// 每个 `(task_id, user_id)` 至多一条记录。先查后写只用于给出明确的错误，
/// 真正的唯一性由存储层的唯一约束保证。
pub struct CheckinService {
    deps: ServiceDeps,
}

impl CheckinService {
    pub fn new(deps: ServiceDeps) -> Self {
        Self { deps }
    }

    pub async fn check_in(&self, request: CheckinRequest, now: DateTime<Utc>) -> CheckinResult<TaskRecord> {
        let committed = self.commit_check_in(request, now).await?;
        Ok(committed.settle(&self.deps.cache).await)
    }

    #[instrument(skip(self, request), fields(task_id = request.task_id, user_id = request.user_id))]
    pub(crate) async fn commit_check_in(
        &self,
        request: CheckinRequest,
        now: DateTime<Utc>,
    ) -> CheckinResult<Committed<TaskRecord>> {
        self.deps
            .rate_limit
            .check_checkin(request.user_id, request.task_id)
            .await?;

        let tx = self.deps.db.begin().await?;
        let task = tx
            .get_task(request.task_id)
            .await?
            .ok_or_else(|| CheckinError::task_not_found(request.task_id))?;
        if task.group_id != request.group_id {
            return Err(CheckinError::validation_error(format!(
                "签到任务 {} 不属于群组 {}",
                task.id, request.group_id
            )));
        }
        if task.has_ended(now) {
            return Err(CheckinError::TaskHasEnded { task_id: task.id });
        }
        if tx.get_record(task.id, request.user_id).await?.is_some() {
            return Err(CheckinError::AlreadyCheckedIn {
                task_id: task.id,
                user_id: request.user_id,
            });
        }

        let methods = match self.deps.verification.verify_all(&task, &request.payload) {
            Ok(methods) => methods,
            Err(e) => {
                warn!(task_id = task.id, user_id = request.user_id, error = %e, "签到验证未通过");
                return Err(e);
            }
        };

        let record = tx
            .create_record(&NewTaskRecord {
                task_id: task.id,
                user_id: request.user_id,
                username: request.username,
                group_id: task.group_id,
                signed_time: now,
                status: RecordStatus::Normal,
                payload: request.payload.retain_methods(&methods),
            })
            .await?;
        tx.commit().await?;

        info!(
            "用户 {} 完成签到: 任务 {} (记录ID: {})",
            record.user_id, record.task_id, record.id
        );
        let stale = self.deps.cache.keys().record_keys(record.task_id, record.user_id);
        Ok(Committed::new(record, stale))
    }

    pub async fn get_record(&self, task_id: i64, user_id: i64) -> CheckinResult<TaskRecord> {
        let db = &self.deps.db;
        self.deps
            .cache
            .get_or_load(&self.deps.cache.keys().record(task_id, user_id), || async move {
                db.get_record(task_id, user_id).await
            })
            .await?
            .ok_or(CheckinError::RecordNotFound { task_id, user_id })
    }

    pub async fn list_records(&self, query: RecordQuery) -> CheckinResult<Vec<TaskRecord>> {
        let db = &self.deps.db;
        let keys = self.deps.cache.keys();
        match query {
            RecordQuery::ByTask(task_id) => {
                self.deps
                    .cache
                    .get_or_load_list(&keys.task_records(task_id), || async move {
                        db.list_records_by_task(task_id).await
                    })
                    .await
            }
            RecordQuery::ByUser(user_id) => {
                self.deps
                    .cache
                    .get_or_load_list(&keys.user_records(user_id), || async move {
                        db.list_records_by_user(user_id).await
                    })
                    .await
            }
        }
    }

    /// 单独验证某个方式，不写入任何数据
    pub async fn verify(
        &self,
        method: VerificationMethod,
        task_id: i64,
        supplied: &VerificationPayload,
    ) -> CheckinResult<VerificationOutcome> {
        let task = self.deps.cached_task(task_id).await?;
        let outcome = self.deps.verification.verify(method, &task, supplied)?;
        debug!(task_id, method = %method, valid = outcome.valid, "单项验证完成");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use checkin_domain::{Clock, TaskStore};
    use checkin_infrastructure::{CacheConsistencyLayer, InMemoryCache, InMemoryRateLimiter};
    use checkin_testing_utils::{FixedClock, InMemoryDatabase, NewTaskBuilder, PayloadBuilder};

    use crate::services::RateLimitPolicy;

    async fn setup() -> (CheckinService, InMemoryDatabase, FixedClock, i64) {
        let db = InMemoryDatabase::new();
        let group = db.insert_group("研发部", 1, "owner").await;
        let clock = FixedClock::new(Utc::now());
        let deps = ServiceDeps::new(
            Arc::new(db.clone()),
            CacheConsistencyLayer::with_defaults(Arc::new(InMemoryCache::new())),
        )
        .with_clock(Arc::new(clock.clone()));
        (CheckinService::new(deps), db, clock, group.id)
    }

    fn request(task_id: i64, group_id: i64, user_id: i64, payload: VerificationPayload) -> CheckinRequest {
        CheckinRequest {
            task_id,
            user_id,
            username: format!("user{user_id}"),
            group_id,
            payload,
        }
    }

    #[tokio::test]
    async fn test_check_in_keeps_only_verified_slices() {
        let (service, db, clock, group_id) = setup().await;
        let task = db
            .create_task(
                &NewTaskBuilder::new(group_id).with_wifi("office", "aa:bb").build(),
                clock.now(),
            )
            .await
            .unwrap();

        let payload = PayloadBuilder::new()
            .wifi("office", "aa:bb")
            .gps(39.9, 116.4)
            .build();
        let record = service
            .check_in(request(task.id, group_id, 10, payload), clock.now())
            .await
            .unwrap();
        assert_eq!(record.status, RecordStatus::Normal);
        assert!(record.payload.wifi.is_some());
        assert!(record.payload.gps.is_none());
        assert_eq!(record.signed_time, clock.now());
    }

    #[tokio::test]
    async fn test_check_in_after_end_writes_nothing() {
        let (service, db, clock, group_id) = setup().await;
        let task = db
            .create_task(&NewTaskBuilder::new(group_id).build(), clock.now())
            .await
            .unwrap();

        let after_end = task.end_time + Duration::seconds(1);
        let err = service
            .check_in(request(task.id, group_id, 10, VerificationPayload::default()), after_end)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::TaskHasEnded { .. }));
        assert_eq!(err.status_code(), 400);
        assert_eq!(db.record_count().await, 0);

        // 结束时刻本身仍可签到
        service
            .check_in(request(task.id, group_id, 10, VerificationPayload::default()), task.end_time)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_in_rejects_unknown_task_and_wrong_group() {
        let (service, db, clock, group_id) = setup().await;
        let err = service
            .check_in(request(404, group_id, 10, VerificationPayload::default()), clock.now())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::TaskNotFound { id: 404 }));

        let task = db
            .create_task(&NewTaskBuilder::new(group_id).build(), clock.now())
            .await
            .unwrap();
        let err = service
            .check_in(request(task.id, group_id + 1, 10, VerificationPayload::default()), clock.now())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::ValidationError(_)));
        assert_eq!(db.record_count().await, 0);
    }

    #[tokio::test]
    async fn test_verify_single_method() {
        let (service, db, clock, group_id) = setup().await;
        let task = db
            .create_task(
                &NewTaskBuilder::new(group_id).with_nfc("tag-1", Some("前台")).build(),
                clock.now(),
            )
            .await
            .unwrap();

        let ok = service
            .verify(
                VerificationMethod::Nfc,
                task.id,
                &PayloadBuilder::new().nfc("tag-1", Some("前台")).build(),
            )
            .await
            .unwrap();
        assert!(ok.valid);

        let wrong = service
            .verify(
                VerificationMethod::Nfc,
                task.id,
                &PayloadBuilder::new().nfc("tag-2", None).build(),
            )
            .await
            .unwrap();
        assert!(!wrong.valid);

        let err = service
            .verify(VerificationMethod::Gps, task.id, &VerificationPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::MethodNotEnabled { .. }));
    }

    #[tokio::test]
    async fn test_check_in_rate_limited_per_user_and_task() {
        let db = InMemoryDatabase::new();
        let group = db.insert_group("研发部", 1, "owner").await;
        let deps = ServiceDeps::new(Arc::new(db.clone()), CacheConsistencyLayer::disabled())
            .with_rate_limiter(
                Arc::new(InMemoryRateLimiter::new()),
                RateLimitPolicy {
                    checkin_attempts: 2,
                    audit_requests: 1,
                    window: StdDuration::from_secs(60),
                },
            );
        let service = CheckinService::new(deps);
        let now = Utc::now();
        let task = db
            .create_task(&NewTaskBuilder::new(group.id).with_face().build(), now)
            .await
            .unwrap();

        for _ in 0..2 {
            let err = service
                .check_in(request(task.id, group.id, 10, VerificationPayload::default()), now)
                .await
                .unwrap_err();
            assert!(matches!(err, CheckinError::VerificationFailed { .. }));
        }
        let err = service
            .check_in(request(task.id, group.id, 10, VerificationPayload::default()), now)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::RateLimited { .. }));
    }
}
