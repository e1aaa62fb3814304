use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, instrument};

use checkin_domain::{
    NewTask, Task, TaskFields, TaskFilter, TaskScope, TaskView, TaskWindow, VerificationPolicy,
};
use checkin_errors::{CheckinError, CheckinResult};

use super::{Committed, ServiceDeps};

/// 创建或整体更新任务时提交的字段
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub policy: VerificationPolicy,
}

impl TaskDraft {
    /// 校验时间窗口与验证参数
    pub fn into_fields(self) -> CheckinResult<TaskFields> {
        let window = TaskWindow::new(self.start_time, self.end_time)?;
        let fields = TaskFields {
            name: self.name.trim().to_string(),
            description: self.description,
            window,
            policy: self.policy,
        };
        fields.validate()?;
        Ok(fields)
    }
}

/// 任务生命周期管理
pub struct TaskLifecycleService {
    deps: ServiceDeps,
}

impl TaskLifecycleService {
    pub fn new(deps: ServiceDeps) -> Self {
        Self { deps }
    }

    pub async fn create_task(&self, group_id: i64, draft: TaskDraft) -> CheckinResult<TaskView> {
        let committed = self.commit_create_task(group_id, draft).await?;
        Ok(committed.settle(&self.deps.cache).await)
    }

    #[instrument(skip(self, draft))]
    pub(crate) async fn commit_create_task(
        &self,
        group_id: i64,
        draft: TaskDraft,
    ) -> CheckinResult<Committed<TaskView>> {
        let fields = draft.into_fields()?;
        let now = self.deps.clock.now();

        let tx = self.deps.db.begin().await?;
        if tx.get_group(group_id).await?.is_none() {
            return Err(CheckinError::group_not_found(group_id));
        }
        let task = tx.create_task(&NewTask { group_id, fields }, now).await?;
        tx.commit().await?;

        info!("创建签到任务: {} (ID: {}, 群组: {})", task.name, task.id, group_id);
        Ok(Committed::new(
            TaskView::at(task, now),
            vec![self.deps.cache.keys().group_tasks(group_id)],
        ))
    }

    pub async fn get_task(&self, task_id: i64) -> CheckinResult<TaskView> {
        let task = self.deps.cached_task(task_id).await?;
        Ok(TaskView::at(task, self.deps.clock.now()))
    }

    #[instrument(skip(self))]
    pub async fn list_tasks(&self, scope: TaskScope, filter: TaskFilter) -> CheckinResult<Vec<TaskView>> {
        let tasks = match scope {
            TaskScope::Group(group_id) => self.group_tasks(group_id).await?,
            TaskScope::User(user_id) => {
                let mut tasks = Vec::new();
                for group_id in self.deps.db.list_group_ids_for_user(user_id).await? {
                    tasks.extend(self.group_tasks(group_id).await?);
                }
                tasks.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
                tasks
            }
        };

        let now = self.deps.clock.now();
        Ok(filter
            .apply(tasks, now)
            .into_iter()
            .map(|task| TaskView::at(task, now))
            .collect())
    }

    pub async fn update_task(&self, task_id: i64, draft: TaskDraft) -> CheckinResult<TaskView> {
        let committed = self.commit_update_task(task_id, draft).await?;
        Ok(committed.settle(&self.deps.cache).await)
    }

    /// 整体替换可变字段，任务开始后不允许修改
    #[instrument(skip(self, draft))]
    pub(crate) async fn commit_update_task(
        &self,
        task_id: i64,
        draft: TaskDraft,
    ) -> CheckinResult<Committed<TaskView>> {
        let fields = draft.into_fields()?;
        let now = self.deps.clock.now();

        let tx = self.deps.db.begin().await?;
        let mut task = tx
            .get_task(task_id)
            .await?
            .ok_or_else(|| CheckinError::task_not_found(task_id))?;
        if task.has_started(now) {
            return Err(CheckinError::TaskAlreadyStarted { task_id });
        }
        task.apply(fields, now);
        if !tx.update_task(&task).await? {
            return Err(CheckinError::task_not_found(task_id));
        }
        tx.commit().await?;

        info!("更新签到任务: {} (ID: {})", task.name, task.id);
        let stale = self.task_keys(&task);
        Ok(Committed::new(TaskView::at(task, now), stale))
    }

    pub async fn delete_task(&self, task_id: i64) -> CheckinResult<()> {
        let committed = self.commit_delete_task(task_id).await?;
        Ok(committed.settle(&self.deps.cache).await)
    }

    /// 删除任务，不级联删除签到记录和审核申请
    #[instrument(skip(self))]
    pub(crate) async fn commit_delete_task(&self, task_id: i64) -> CheckinResult<Committed<()>> {
        let tx = self.deps.db.begin().await?;
        let task = tx
            .get_task(task_id)
            .await?
            .ok_or_else(|| CheckinError::task_not_found(task_id))?;
        tx.delete_task(task_id).await?;
        tx.commit().await?;

        info!("删除签到任务: {} (ID: {})", task.name, task.id);
        Ok(Committed::new((), self.task_keys(&task)))
    }

    /// 群组全部任务，按开始时间倒序
    async fn group_tasks(&self, group_id: i64) -> CheckinResult<Vec<Task>> {
        let db = &self.deps.db;
        let now = self.deps.clock.now();
        self.deps
            .cache
            .get_or_load_list(&self.deps.cache.keys().group_tasks(group_id), || async move {
                db.list_tasks_by_group(group_id, TaskFilter::All, now).await
            })
            .await
    }

    fn task_keys(&self, task: &Task) -> Vec<String> {
        let keys = self.deps.cache.keys();
        vec![keys.task(task.id), keys.group_tasks(task.group_id)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use checkin_domain::{Clock, GpsPolicy, TaskPhase};
    use checkin_infrastructure::{CacheConsistencyLayer, InMemoryCache};
    use checkin_testing_utils::{FixedClock, InMemoryDatabase};

    struct Fixture {
        service: TaskLifecycleService,
        db: InMemoryDatabase,
        cache: InMemoryCache,
        clock: FixedClock,
        group_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = InMemoryDatabase::new();
        let group = db.insert_group("研发部", 1, "owner").await;
        let cache = InMemoryCache::new();
        let clock = FixedClock::new(Utc::now());
        let deps = ServiceDeps::new(
            Arc::new(db.clone()),
            CacheConsistencyLayer::with_defaults(Arc::new(cache.clone())),
        )
        .with_clock(Arc::new(clock.clone()));
        Fixture {
            service: TaskLifecycleService::new(deps),
            db,
            cache,
            clock,
            group_id: group.id,
        }
    }

    fn draft(name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> TaskDraft {
        TaskDraft {
            name: name.to_string(),
            description: String::new(),
            start_time: start,
            end_time: end,
            policy: VerificationPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_create_task_rejects_invalid_window() {
        let f = fixture().await;
        let now = f.clock.now();

        let err = f
            .service
            .create_task(f.group_id, draft("周会", now, now))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::InvalidTimeWindow { .. }));
        assert_eq!(err.status_code(), 400);
        assert_eq!(f.db.commits(), 0);

        let view = f
            .service
            .create_task(f.group_id, draft("周会", now, now + Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(view.phase, TaskPhase::Ongoing);
    }

    #[tokio::test]
    async fn test_create_task_validates_policy_and_group() {
        let f = fixture().await;
        let now = f.clock.now();
        let mut bad = draft("周会", now, now + Duration::hours(1));
        bad.policy.gps = Some(GpsPolicy {
            latitude: 39.9,
            longitude: 116.4,
            radius: 0,
        });
        let err = f.service.create_task(f.group_id, bad).await.unwrap_err();
        assert!(matches!(err, CheckinError::ValidationError(_)));

        let err = f
            .service
            .create_task(999, draft("周会", now, now + Duration::hours(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::GroupNotFound { id: 999 }));
        assert_eq!(f.db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_update_rejected_once_started() {
        let f = fixture().await;
        let now = f.clock.now();
        let created = f
            .service
            .create_task(f.group_id, draft("周会", now + Duration::hours(1), now + Duration::hours(2)))
            .await
            .unwrap();
        let id = created.task.id;

        let updated = f
            .service
            .update_task(id, draft("周会（改）", now + Duration::hours(3), now + Duration::hours(4)))
            .await
            .unwrap();
        assert_eq!(updated.task.name, "周会（改）");
        assert_eq!(updated.phase, TaskPhase::Upcoming);

        f.clock.advance(Duration::hours(3));
        let err = f
            .service
            .update_task(id, draft("再改", now + Duration::hours(5), now + Duration::hours(6)))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::TaskAlreadyStarted { task_id } if task_id == id));

        let err = f
            .service
            .update_task(404, draft("x", now + Duration::hours(5), now + Duration::hours(6)))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckinError::TaskNotFound { id: 404 }));
    }

    #[tokio::test]
    async fn test_list_tasks_reflects_writes_through_cache() {
        let f = fixture().await;
        let now = f.clock.now();
        f.service
            .create_task(f.group_id, draft("进行中", now - Duration::hours(1), now + Duration::hours(1)))
            .await
            .unwrap();

        let all = f.service.list_tasks(TaskScope::Group(f.group_id), TaskFilter::All).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(f.cache.contains_key(&format!("task:group:{}", f.group_id)).await);

        let ended = f
            .service
            .create_task(f.group_id, draft("已结束", now - Duration::hours(3), now - Duration::hours(2)))
            .await
            .unwrap();
        let ended_only = f
            .service
            .list_tasks(TaskScope::Group(f.group_id), TaskFilter::Ended)
            .await
            .unwrap();
        assert_eq!(ended_only.len(), 1);
        assert_eq!(ended_only[0].task.id, ended.task.id);
        assert_eq!(ended_only[0].phase, TaskPhase::Expired);

        f.service.delete_task(ended.task.id).await.unwrap();
        let all = f.service.list_tasks(TaskScope::Group(f.group_id), TaskFilter::All).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(matches!(
            f.service.get_task(ended.task.id).await,
            Err(CheckinError::TaskNotFound { .. })
        ));
        assert!(matches!(
            f.service.delete_task(ended.task.id).await,
            Err(CheckinError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_tasks_by_user_merges_groups() {
        let f = fixture().await;
        let other = f.db.insert_group("市场部", 2, "other").await;
        f.db.add_member(f.group_id, 10, "alice", checkin_domain::MemberRole::Member).await;
        f.db.add_member(other.id, 10, "alice", checkin_domain::MemberRole::Member).await;
        let now = f.clock.now();

        let first = f
            .service
            .create_task(f.group_id, draft("A", now - Duration::hours(2), now + Duration::hours(1)))
            .await
            .unwrap();
        let second = f
            .service
            .create_task(other.id, draft("B", now - Duration::hours(1), now + Duration::hours(3)))
            .await
            .unwrap();

        let all = f.service.list_tasks(TaskScope::User(10), TaskFilter::All).await.unwrap();
        assert_eq!(
            all.iter().map(|v| v.task.id).collect::<Vec<_>>(),
            vec![second.task.id, first.task.id]
        );
        let active = f.service.list_tasks(TaskScope::User(10), TaskFilter::Active).await.unwrap();
        assert_eq!(
            active.iter().map(|v| v.task.id).collect::<Vec<_>>(),
            vec![first.task.id, second.task.id]
        );
        assert!(f.service.list_tasks(TaskScope::User(77), TaskFilter::All).await.unwrap().is_empty());
    }
}
