//! # 签到核心应用层
//!
//! [`CheckinCore`] 是对外暴露的唯一入口，组合任务生命周期、签到记录与补签审核
//! 三个服务。每个操作都受统一的超时约束；超时会丢弃未提交的事务。
//! 写操作的超时只覆盖到事务提交为止，提交后的缓存失效总会执行完。

pub mod services;

pub use services::*;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use checkin_domain::{
    AuditQuery, CheckApplication, Clock, RecordQuery, TaskFilter, TaskRecord, TaskScope, TaskView,
    VerificationMethod, VerificationOutcome, VerificationPayload,
};
use checkin_errors::{CheckinError, CheckinResult};
use checkin_infrastructure::CacheConsistencyLayer;
use tracing::warn;

/// 默认的单次操作超时
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CheckinCore {
    tasks: TaskLifecycleService,
    checkins: CheckinService,
    audits: AuditWorkflowService,
    clock: Arc<dyn Clock>,
    cache: CacheConsistencyLayer,
    operation_timeout: Duration,
}

impl CheckinCore {
    pub fn new(deps: ServiceDeps) -> Self {
        Self::with_timeout(deps, DEFAULT_OPERATION_TIMEOUT)
    }

    pub fn with_timeout(deps: ServiceDeps, operation_timeout: Duration) -> Self {
        Self {
            clock: Arc::clone(&deps.clock),
            cache: deps.cache.clone(),
            tasks: TaskLifecycleService::new(deps.clone()),
            checkins: CheckinService::new(deps.clone()),
            audits: AuditWorkflowService::new(deps),
            operation_timeout,
        }
    }

    pub async fn create_task(&self, group_id: i64, draft: TaskDraft) -> CheckinResult<TaskView> {
        self.bounded_write("create_task", self.tasks.commit_create_task(group_id, draft))
            .await
    }

    pub async fn get_task(&self, task_id: i64) -> CheckinResult<TaskView> {
        self.bounded("get_task", self.tasks.get_task(task_id)).await
    }

    pub async fn list_tasks(&self, scope: TaskScope, filter: TaskFilter) -> CheckinResult<Vec<TaskView>> {
        self.bounded("list_tasks", self.tasks.list_tasks(scope, filter))
            .await
    }

    pub async fn update_task(&self, task_id: i64, draft: TaskDraft) -> CheckinResult<TaskView> {
        self.bounded_write("update_task", self.tasks.commit_update_task(task_id, draft))
            .await
    }

    pub async fn delete_task(&self, task_id: i64) -> CheckinResult<()> {
        self.bounded_write("delete_task", self.tasks.commit_delete_task(task_id))
            .await
    }

    pub async fn verify(
        &self,
        method: VerificationMethod,
        task_id: i64,
        supplied: &VerificationPayload,
    ) -> CheckinResult<VerificationOutcome> {
        self.bounded("verify", self.checkins.verify(method, task_id, supplied))
            .await
    }

    pub async fn check_in(&self, request: CheckinRequest) -> CheckinResult<TaskRecord> {
        let now = self.clock.now();
        self.bounded_write("check_in", self.checkins.commit_check_in(request, now))
            .await
    }

    pub async fn list_checkin_records(&self, query: RecordQuery) -> CheckinResult<Vec<TaskRecord>> {
        self.bounded("list_checkin_records", self.checkins.list_records(query))
            .await
    }

    pub async fn get_checkin_record(&self, task_id: i64, user_id: i64) -> CheckinResult<TaskRecord> {
        self.bounded(
            "get_checkin_record",
            self.checkins.get_record(task_id, user_id),
        )
        .await
    }

    pub async fn create_audit_request(&self, draft: AuditRequestDraft) -> CheckinResult<CheckApplication> {
        self.bounded_write("create_audit_request", self.audits.commit_create_request(draft))
            .await
    }

    pub async fn list_audit_requests(&self, query: AuditQuery) -> CheckinResult<Vec<CheckApplication>> {
        self.bounded("list_audit_requests", self.audits.list_requests(query))
            .await
    }

    pub async fn get_audit_request(&self, application_id: i64) -> CheckinResult<CheckApplication> {
        self.bounded("get_audit_request", self.audits.get_request(application_id))
            .await
    }

    pub async fn approve_request(&self, application_id: i64) -> CheckinResult<CheckApplication> {
        self.bounded_write(
            "approve_request",
            self.audits.commit_approve_request(application_id),
        )
        .await
    }

    pub async fn reject_request(&self, application_id: i64) -> CheckinResult<CheckApplication> {
        self.bounded_write(
            "reject_request",
            self.audits.commit_reject_request(application_id),
        )
        .await
    }

    /// 超时只约束事务部分；提交成功后在期限之外删除失效的缓存键
    async fn bounded_write<T, F>(&self, operation: &'static str, fut: F) -> CheckinResult<T>
    where
        F: Future<Output = CheckinResult<Committed<T>>>,
    {
        let committed = self.bounded(operation, fut).await?;
        Ok(committed.settle(&self.cache).await)
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> CheckinResult<T>
    where
        F: Future<Output = CheckinResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout = ?self.operation_timeout, "操作超时，事务已回滚");
                Err(CheckinError::timeout_error(format!(
                    "{operation} 超过 {}ms",
                    self.operation_timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use checkin_domain::{
        AuditRequestStore, CheckApplication, CheckinRecordStore, Group, GroupMember, GroupMemberStore,
        GroupStore, NewCheckApplication, NewTask, NewTaskRecord, Task, TaskStore, Transaction,
        UnitOfWork, AuditFilter, AuditStatus, CacheStore,
    };
    use checkin_testing_utils::{InMemoryDatabase, NewTaskBuilder};

    /// 事务永远无法开启的存储
    struct StalledDatabase;

    #[async_trait]
    impl UnitOfWork for StalledDatabase {
        async fn begin(&self) -> CheckinResult<Box<dyn Transaction>> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl TaskStore for StalledDatabase {
        async fn create_task(&self, _task: &NewTask, _now: DateTime<Utc>) -> CheckinResult<Task> {
            std::future::pending().await
        }
        async fn get_task(&self, _id: i64) -> CheckinResult<Option<Task>> {
            std::future::pending().await
        }
        async fn list_tasks_by_group(&self, _g: i64, _f: TaskFilter, _n: DateTime<Utc>) -> CheckinResult<Vec<Task>> {
            std::future::pending().await
        }
        async fn list_tasks_by_user(&self, _u: i64, _f: TaskFilter, _n: DateTime<Utc>) -> CheckinResult<Vec<Task>> {
            std::future::pending().await
        }
        async fn update_task(&self, _task: &Task) -> CheckinResult<bool> {
            std::future::pending().await
        }
        async fn delete_task(&self, _id: i64) -> CheckinResult<bool> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl CheckinRecordStore for StalledDatabase {
        async fn create_record(&self, _r: &NewTaskRecord) -> CheckinResult<TaskRecord> {
            std::future::pending().await
        }
        async fn get_record(&self, _t: i64, _u: i64) -> CheckinResult<Option<TaskRecord>> {
            std::future::pending().await
        }
        async fn list_records_by_task(&self, _t: i64) -> CheckinResult<Vec<TaskRecord>> {
            std::future::pending().await
        }
        async fn list_records_by_user(&self, _u: i64) -> CheckinResult<Vec<TaskRecord>> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl AuditRequestStore for StalledDatabase {
        async fn create_application(&self, _a: &NewCheckApplication) -> CheckinResult<CheckApplication> {
            std::future::pending().await
        }
        async fn get_application(&self, _id: i64) -> CheckinResult<Option<CheckApplication>> {
            std::future::pending().await
        }
        async fn find_pending_application(&self, _t: i64, _u: i64) -> CheckinResult<Option<CheckApplication>> {
            std::future::pending().await
        }
        async fn list_applications_by_group(&self, _g: i64, _f: AuditFilter) -> CheckinResult<Vec<CheckApplication>> {
            std::future::pending().await
        }
        async fn list_applications_by_user(&self, _u: i64) -> CheckinResult<Vec<CheckApplication>> {
            std::future::pending().await
        }
        async fn transition_application(
            &self,
            _id: i64,
            _from: AuditStatus,
            _to: AuditStatus,
            _at: DateTime<Utc>,
        ) -> CheckinResult<bool> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl GroupStore for StalledDatabase {
        async fn get_group(&self, _id: i64) -> CheckinResult<Option<Group>> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl GroupMemberStore for StalledDatabase {
        async fn get_member(&self, _g: i64, _u: i64) -> CheckinResult<Option<GroupMember>> {
            std::future::pending().await
        }
        async fn list_group_ids_for_user(&self, _u: i64) -> CheckinResult<Vec<i64>> {
            std::future::pending().await
        }
    }

    /// 删除键需要很久的缓存
    #[derive(Default)]
    struct SlowDeleteCache {
        deleted: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CacheStore for SlowDeleteCache {
        async fn get(&self, _key: &str) -> CheckinResult<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> CheckinResult<()> {
            Ok(())
        }
        async fn delete(&self, keys: &[String]) -> CheckinResult<usize> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.deleted.lock().unwrap().extend(keys.iter().cloned());
            Ok(keys.len())
        }
    }

    #[tokio::test]
    async fn test_slow_invalidation_after_commit_is_not_a_timeout() {
        let db = InMemoryDatabase::new();
        let group = db.insert_group("研发部", 1, "owner").await;
        let task = db
            .create_task(&NewTaskBuilder::new(group.id).build(), Utc::now())
            .await
            .unwrap();

        let cache = Arc::new(SlowDeleteCache::default());
        let layer = CacheConsistencyLayer::with_defaults(cache.clone());
        let expected = layer.keys().record_keys(task.id, 7);
        let deps = ServiceDeps::new(Arc::new(db.clone()), layer);
        let core = CheckinCore::with_timeout(deps, Duration::from_millis(50));

        let record = core
            .check_in(CheckinRequest {
                task_id: task.id,
                user_id: 7,
                username: "user7".to_string(),
                group_id: group.id,
                payload: VerificationPayload::default(),
            })
            .await
            .unwrap();
        assert_eq!(record.task_id, task.id);
        assert_eq!(db.record_count().await, 1);
        assert_eq!(*cache.deleted.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_operations_time_out() {
        let deps = ServiceDeps::new(Arc::new(StalledDatabase), CacheConsistencyLayer::disabled());
        let core = CheckinCore::with_timeout(deps, Duration::from_millis(50));

        let err = core.approve_request(1).await.unwrap_err();
        assert!(matches!(err, CheckinError::Timeout(_)));
        assert_eq!(err.status_code(), 503);

        let err = core.get_task(1).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
