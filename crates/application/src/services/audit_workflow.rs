//! 补签审核流程
//!
//! 状态机只有两条迁移：`pending → approved`、`pending → rejected`，均为终态。
//! 审核通过时，状态迁移与补签记录的写入在同一个事务中提交。

use serde::Deserialize;
use tracing::{info, instrument, warn};

use checkin_domain::{
    AuditFilter, AuditQuery, AuditStatus, CheckApplication, NewCheckApplication, NewTaskRecord,
    RecordStatus, Transaction,
};
use checkin_errors::{CheckinError, CheckinResult};

use super::{Committed, ServiceDeps};

/// 用户提交的补签申请
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuditRequestDraft {
    pub task_id: i64,
    pub user_id: i64,
    pub username: String,
    pub reason: String,
    #[serde(default)]
    pub image: Option<String>,
}

pub struct AuditWorkflowService {
    deps: ServiceDeps,
}

impl AuditWorkflowService {
    pub fn new(deps: ServiceDeps) -> Self {
        Self { deps }
    }

    /// 提交补签申请
    ///
    /// 同一 `(task_id, user_id)` 只允许一个待审核申请；已通过或已拒绝的历史申请
    /// 不影响再次提交，也不检查用户是否已有签到记录。
    pub async fn create_request(&self, draft: AuditRequestDraft) -> CheckinResult<CheckApplication> {
        let committed = self.commit_create_request(draft).await?;
        Ok(committed.settle(&self.deps.cache).await)
    }

    #[instrument(skip(self, draft), fields(task_id = draft.task_id, user_id = draft.user_id))]
    pub(crate) async fn commit_create_request(
        &self,
        draft: AuditRequestDraft,
    ) -> CheckinResult<Committed<CheckApplication>> {
        if draft.reason.trim().is_empty() {
            return Err(CheckinError::validation_error("申请理由不能为空"));
        }
        self.deps.rate_limit.check_audit_request(draft.user_id).await?;
        let now = self.deps.clock.now();

        let tx = self.deps.db.begin().await?;
        let task = tx
            .get_task(draft.task_id)
            .await?
            .ok_or_else(|| CheckinError::task_not_found(draft.task_id))?;
        if tx
            .find_pending_application(task.id, draft.user_id)
            .await?
            .is_some()
        {
            return Err(CheckinError::PendingAuditExists {
                task_id: task.id,
                user_id: draft.user_id,
            });
        }
        let group = tx
            .get_group(task.group_id)
            .await?
            .ok_or_else(|| CheckinError::group_not_found(task.group_id))?;

        let application = tx
            .create_application(&NewCheckApplication {
                task_id: task.id,
                group_id: group.id,
                user_id: draft.user_id,
                username: draft.username,
                reason: draft.reason.trim().to_string(),
                image: draft.image,
                admin_id: group.creator_id,
                admin_username: group.creator_username,
                created_at: now,
            })
            .await?;
        tx.commit().await?;

        info!(
            "用户 {} 提交补签申请: 任务 {} (申请ID: {})",
            application.user_id, application.task_id, application.id
        );
        let keys = self.deps.cache.keys();
        let stale = vec![
            keys.group_audits(application.group_id),
            keys.user_audits(application.user_id),
        ];
        Ok(Committed::new(application, stale))
    }

    /// 审核通过并生成补签记录，两者一起提交
    pub async fn approve_request(&self, application_id: i64) -> CheckinResult<CheckApplication> {
        let committed = self.commit_approve_request(application_id).await?;
        Ok(committed.settle(&self.deps.cache).await)
    }

    #[instrument(skip(self))]
    pub(crate) async fn commit_approve_request(
        &self,
        application_id: i64,
    ) -> CheckinResult<Committed<CheckApplication>> {
        let now = self.deps.clock.now();
        let tx = self.deps.db.begin().await?;
        let mut application = self
            .transition(&*tx, application_id, AuditStatus::Approved, now)
            .await?;

        if let Err(e) = tx
            .create_record(&NewTaskRecord {
                task_id: application.task_id,
                user_id: application.user_id,
                username: application.username.clone(),
                group_id: application.group_id,
                signed_time: now,
                status: RecordStatus::AuditApproved,
                payload: Default::default(),
            })
            .await
        {
            warn!(application_id, error = %e, "补签记录写入失败，回滚审核状态");
            tx.rollback().await?;
            return Err(e);
        }
        tx.commit().await?;

        application.status = AuditStatus::Approved;
        application.processed_at = Some(now);
        info!(
            "补签申请已通过: {} (任务 {}, 用户 {})",
            application.id, application.task_id, application.user_id
        );

        let keys = self.deps.cache.keys();
        let mut stale = self.audit_keys(&application);
        stale.extend(keys.record_keys(application.task_id, application.user_id));
        Ok(Committed::new(application, stale))
    }

    pub async fn reject_request(&self, application_id: i64) -> CheckinResult<CheckApplication> {
        let committed = self.commit_reject_request(application_id).await?;
        Ok(committed.settle(&self.deps.cache).await)
    }

    #[instrument(skip(self))]
    pub(crate) async fn commit_reject_request(
        &self,
        application_id: i64,
    ) -> CheckinResult<Committed<CheckApplication>> {
        let now = self.deps.clock.now();
        let tx = self.deps.db.begin().await?;
        let mut application = self
            .transition(&*tx, application_id, AuditStatus::Rejected, now)
            .await?;
        tx.commit().await?;

        application.status = AuditStatus::Rejected;
        application.processed_at = Some(now);
        info!("补签申请已拒绝: {}", application.id);

        let stale = self.audit_keys(&application);
        Ok(Committed::new(application, stale))
    }

    pub async fn get_request(&self, application_id: i64) -> CheckinResult<CheckApplication> {
        let db = &self.deps.db;
        self.deps
            .cache
            .get_or_load(&self.deps.cache.keys().audit(application_id), || async move {
                db.get_application(application_id).await
            })
            .await?
            .ok_or_else(|| CheckinError::audit_request_not_found(application_id))
    }

    pub async fn list_requests(&self, query: AuditQuery) -> CheckinResult<Vec<CheckApplication>> {
        let db = &self.deps.db;
        let keys = self.deps.cache.keys();
        match query {
            AuditQuery::ByUser(user_id) => {
                self.deps
                    .cache
                    .get_or_load_list(&keys.user_audits(user_id), || async move {
                        db.list_applications_by_user(user_id).await
                    })
                    .await
            }
            AuditQuery::ByGroup { group_id, filter } => {
                let all = self
                    .deps
                    .cache
                    .get_or_load_list(&keys.group_audits(group_id), || async move {
                        db.list_applications_by_group(group_id, AuditFilter::All).await
                    })
                    .await?;
                Ok(all.into_iter().filter(|a| filter.matches(a.status)).collect())
            }
        }
    }

    /// 在事务内重新读取状态，只允许从 pending 迁移
    async fn transition(
        &self,
        tx: &dyn Transaction,
        application_id: i64,
        to: AuditStatus,
        now: chrono::DateTime<chrono::Utc>,
    ) -> CheckinResult<CheckApplication> {
        let application = tx
            .get_application(application_id)
            .await?
            .ok_or_else(|| CheckinError::audit_request_not_found(application_id))?;
        let already_processed = |status: AuditStatus| CheckinError::AuditAlreadyProcessed {
            id: application_id,
            status: status.to_string(),
        };
        if application.status.is_terminal() {
            return Err(already_processed(application.status));
        }
        if !tx
            .transition_application(application_id, AuditStatus::Pending, to, now)
            .await?
        {
            return Err(already_processed(to));
        }
        Ok(application)
    }

    fn audit_keys(&self, application: &CheckApplication) -> Vec<String> {
        let keys = self.deps.cache.keys();
        vec![
            keys.audit(application.id),
            keys.group_audits(application.group_id),
            keys.user_audits(application.user_id),
        ]
    }
}
