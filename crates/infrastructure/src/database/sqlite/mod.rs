//! SQLite store
//!
//! [`SqliteStore`] serves reads outside any transaction from the pool;
//! [`SqliteTransaction`] runs the same queries on one connection inside
//! `BEGIN IMMEDIATE ... COMMIT`. Both share the query functions of the submodules.

mod applications;
mod groups;
mod records;
mod tasks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use checkin_domain::{
    AuditFilter, AuditRequestStore, AuditStatus, CheckApplication, CheckinRecordStore, Group,
    GroupMember, GroupMemberStore, GroupStore, NewCheckApplication, NewTask, NewTaskRecord, Task,
    TaskFilter, TaskRecord, TaskStore, Transaction, UnitOfWork,
};
use checkin_errors::{CheckinError, CheckinResult};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn acquire(&self) -> CheckinResult<PoolConnection<Sqlite>> {
        self.pool.acquire().await.map_err(|e| {
            let context = OperationContext::new(RepositoryOperation::Read, EntityKind::Transaction);
            RepositoryErrorHelpers::database_error(&context, e)
        })
    }
}

#[async_trait]
impl UnitOfWork for SqliteStore {
    /// 以 `BEGIN IMMEDIATE` 开启事务，写者在读取之前就拿到写锁，
    /// 并发写入按 `busy_timeout` 排队，不会在提交时遇到快照冲突
    async fn begin(&self) -> CheckinResult<Box<dyn Transaction>> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(|e| {
            let context = OperationContext::new(RepositoryOperation::Begin, EntityKind::Transaction);
            RepositoryErrorHelpers::database_error(&context, e)
        })?;
        debug!("SQLite transaction started");
        Ok(Box::new(SqliteTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, task: &NewTask, now: DateTime<Utc>) -> CheckinResult<Task> {
        tasks::create(&mut *self.acquire().await?, task, now).await
    }

    async fn get_task(&self, id: i64) -> CheckinResult<Option<Task>> {
        tasks::get(&mut *self.acquire().await?, id).await
    }

    async fn list_tasks_by_group(
        &self,
        group_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>> {
        tasks::list_by_group(&mut *self.acquire().await?, group_id, filter, now).await
    }

    async fn list_tasks_by_user(
        &self,
        user_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>> {
        tasks::list_by_user(&mut *self.acquire().await?, user_id, filter, now).await
    }

    async fn update_task(&self, task: &Task) -> CheckinResult<bool> {
        tasks::update(&mut *self.acquire().await?, task).await
    }

    async fn delete_task(&self, id: i64) -> CheckinResult<bool> {
        tasks::delete(&mut *self.acquire().await?, id).await
    }
}

#[async_trait]
impl CheckinRecordStore for SqliteStore {
    async fn create_record(&self, record: &NewTaskRecord) -> CheckinResult<TaskRecord> {
        records::create(&mut *self.acquire().await?, record).await
    }

    async fn get_record(&self, task_id: i64, user_id: i64) -> CheckinResult<Option<TaskRecord>> {
        records::get(&mut *self.acquire().await?, task_id, user_id).await
    }

    async fn list_records_by_task(&self, task_id: i64) -> CheckinResult<Vec<TaskRecord>> {
        records::list_by_task(&mut *self.acquire().await?, task_id).await
    }

    async fn list_records_by_user(&self, user_id: i64) -> CheckinResult<Vec<TaskRecord>> {
        records::list_by_user(&mut *self.acquire().await?, user_id).await
    }
}

#[async_trait]
impl AuditRequestStore for SqliteStore {
    async fn create_application(
        &self,
        application: &NewCheckApplication,
    ) -> CheckinResult<CheckApplication> {
        applications::create(&mut *self.acquire().await?, application).await
    }

    async fn get_application(&self, id: i64) -> CheckinResult<Option<CheckApplication>> {
        applications::get(&mut *self.acquire().await?, id).await
    }

    async fn find_pending_application(
        &self,
        task_id: i64,
        user_id: i64,
    ) -> CheckinResult<Option<CheckApplication>> {
        applications::find_pending(&mut *self.acquire().await?, task_id, user_id).await
    }

    async fn list_applications_by_group(
        &self,
        group_id: i64,
        filter: AuditFilter,
    ) -> CheckinResult<Vec<CheckApplication>> {
        applications::list_by_group(&mut *self.acquire().await?, group_id, filter).await
    }

    async fn list_applications_by_user(&self, user_id: i64) -> CheckinResult<Vec<CheckApplication>> {
        applications::list_by_user(&mut *self.acquire().await?, user_id).await
    }

    async fn transition_application(
        &self,
        id: i64,
        from: AuditStatus,
        to: AuditStatus,
        at: DateTime<Utc>,
    ) -> CheckinResult<bool> {
        applications::transition(&mut *self.acquire().await?, id, from, to, at).await
    }
}

#[async_trait]
impl GroupStore for SqliteStore {
    async fn get_group(&self, id: i64) -> CheckinResult<Option<Group>> {
        groups::get_group(&mut *self.acquire().await?, id).await
    }
}

#[async_trait]
impl GroupMemberStore for SqliteStore {
    async fn get_member(&self, group_id: i64, user_id: i64) -> CheckinResult<Option<GroupMember>> {
        groups::get_member(&mut *self.acquire().await?, group_id, user_id).await
    }

    async fn list_group_ids_for_user(&self, user_id: i64) -> CheckinResult<Vec<i64>> {
        groups::list_group_ids_for_user(&mut *self.acquire().await?, user_id).await
    }
}

/// 事务句柄；未提交即被丢弃时由 sqlx 回滚
pub struct SqliteTransaction {
    tx: Mutex<TxSlot>,
}

type TxSlot = Option<sqlx::Transaction<'static, Sqlite>>;

/// 取出仍在进行中的事务连接
fn live(slot: &mut TxSlot) -> CheckinResult<&mut SqliteConnection> {
    slot.as_deref_mut()
        .ok_or_else(|| CheckinError::Internal("事务已结束".to_string()))
}

impl SqliteTransaction {
    async fn take(&self) -> CheckinResult<sqlx::Transaction<'static, Sqlite>> {
        self.tx
            .lock()
            .await
            .take()
            .ok_or_else(|| CheckinError::Internal("事务已结束".to_string()))
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(self: Box<Self>) -> CheckinResult<()> {
        let tx = self.take().await?;
        tx.commit().await.map_err(|e| {
            let context = OperationContext::new(RepositoryOperation::Commit, EntityKind::Transaction);
            RepositoryErrorHelpers::database_error(&context, e)
        })?;
        debug!("SQLite transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> CheckinResult<()> {
        let tx = self.take().await?;
        tx.rollback().await.map_err(|e| {
            let context =
                OperationContext::new(RepositoryOperation::Rollback, EntityKind::Transaction);
            RepositoryErrorHelpers::database_error(&context, e)
        })?;
        debug!("SQLite transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTransaction {
    async fn create_task(&self, task: &NewTask, now: DateTime<Utc>) -> CheckinResult<Task> {
        let mut slot = self.tx.lock().await;
        tasks::create(live(&mut slot)?, task, now).await
    }

    async fn get_task(&self, id: i64) -> CheckinResult<Option<Task>> {
        let mut slot = self.tx.lock().await;
        tasks::get(live(&mut slot)?, id).await
    }

    async fn list_tasks_by_group(
        &self,
        group_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>> {
        let mut slot = self.tx.lock().await;
        tasks::list_by_group(live(&mut slot)?, group_id, filter, now).await
    }

    async fn list_tasks_by_user(
        &self,
        user_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>> {
        let mut slot = self.tx.lock().await;
        tasks::list_by_user(live(&mut slot)?, user_id, filter, now).await
    }

    async fn update_task(&self, task: &Task) -> CheckinResult<bool> {
        let mut slot = self.tx.lock().await;
        tasks::update(live(&mut slot)?, task).await
    }

    async fn delete_task(&self, id: i64) -> CheckinResult<bool> {
        let mut slot = self.tx.lock().await;
        tasks::delete(live(&mut slot)?, id).await
    }
}

#[async_trait]
impl CheckinRecordStore for SqliteTransaction {
    async fn create_record(&self, record: &NewTaskRecord) -> CheckinResult<TaskRecord> {
        let mut slot = self.tx.lock().await;
        records::create(live(&mut slot)?, record).await
    }

    async fn get_record(&self, task_id: i64, user_id: i64) -> CheckinResult<Option<TaskRecord>> {
        let mut slot = self.tx.lock().await;
        records::get(live(&mut slot)?, task_id, user_id).await
    }

    async fn list_records_by_task(&self, task_id: i64) -> CheckinResult<Vec<TaskRecord>> {
        let mut slot = self.tx.lock().await;
        records::list_by_task(live(&mut slot)?, task_id).await
    }

    async fn list_records_by_user(&self, user_id: i64) -> CheckinResult<Vec<TaskRecord>> {
        let mut slot = self.tx.lock().await;
        records::list_by_user(live(&mut slot)?, user_id).await
    }
}

#[async_trait]
impl AuditRequestStore for SqliteTransaction {
    async fn create_application(
        &self,
        application: &NewCheckApplication,
    ) -> CheckinResult<CheckApplication> {
        let mut slot = self.tx.lock().await;
        applications::create(live(&mut slot)?, application).await
    }

    async fn get_application(&self, id: i64) -> CheckinResult<Option<CheckApplication>> {
        let mut slot = self.tx.lock().await;
        applications::get(live(&mut slot)?, id).await
    }

    async fn find_pending_application(
        &self,
        task_id: i64,
        user_id: i64,
    ) -> CheckinResult<Option<CheckApplication>> {
        let mut slot = self.tx.lock().await;
        applications::find_pending(live(&mut slot)?, task_id, user_id).await
    }

    async fn list_applications_by_group(
        &self,
        group_id: i64,
        filter: AuditFilter,
    ) -> CheckinResult<Vec<CheckApplication>> {
        let mut slot = self.tx.lock().await;
        applications::list_by_group(live(&mut slot)?, group_id, filter).await
    }

    async fn list_applications_by_user(&self, user_id: i64) -> CheckinResult<Vec<CheckApplication>> {
        let mut slot = self.tx.lock().await;
        applications::list_by_user(live(&mut slot)?, user_id).await
    }

    async fn transition_application(
        &self,
        id: i64,
        from: AuditStatus,
        to: AuditStatus,
        at: DateTime<Utc>,
    ) -> CheckinResult<bool> {
        let mut slot = self.tx.lock().await;
        applications::transition(live(&mut slot)?, id, from, to, at).await
    }
}

#[async_trait]
impl GroupStore for SqliteTransaction {
    async fn get_group(&self, id: i64) -> CheckinResult<Option<Group>> {
        let mut slot = self.tx.lock().await;
        groups::get_group(live(&mut slot)?, id).await
    }
}

#[async_trait]
impl GroupMemberStore for SqliteTransaction {
    async fn get_member(&self, group_id: i64, user_id: i64) -> CheckinResult<Option<GroupMember>> {
        let mut slot = self.tx.lock().await;
        groups::get_member(live(&mut slot)?, group_id, user_id).await
    }

    async fn list_group_ids_for_user(&self, user_id: i64) -> CheckinResult<Vec<i64>> {
        let mut slot = self.tx.lock().await;
        groups::list_group_ids_for_user(live(&mut slot)?, user_id).await
    }
}
