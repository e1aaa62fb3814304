//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，遵循依赖倒置原则。持久化存储（`*Store`）与缓存
//! （[`CacheStore`]）是两组独立的能力，由基础设施层的缓存一致性层组合使用。
//!
//! 写操作通过 [`UnitOfWork::begin`] 打开的 [`Transaction`] 执行：
//! 显式调用 [`Transaction::commit`] 才会提交，未提交即被丢弃的事务会回滚。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use checkin_errors::CheckinResult;

use crate::entities::{
    CheckApplication, Group, GroupMember, NewCheckApplication, NewTask, NewTaskRecord, Task,
    TaskRecord,
};
use crate::value_objects::{AuditFilter, AuditStatus, TaskFilter};

/// 签到任务仓储
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &NewTask, now: DateTime<Utc>) -> CheckinResult<Task>;
    async fn get_task(&self, id: i64) -> CheckinResult<Option<Task>>;
    /// 带过滤条件时按 `end_time` 升序，否则按 `start_time` 降序
    async fn list_tasks_by_group(
        &self,
        group_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>>;
    /// 用户所在全部群组的任务
    async fn list_tasks_by_user(
        &self,
        user_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>>;
    /// 返回是否有任务被更新
    async fn update_task(&self, task: &Task) -> CheckinResult<bool>;
    /// 返回是否有任务被删除；不级联删除签到记录和审核申请
    async fn delete_task(&self, id: i64) -> CheckinResult<bool>;
}

/// 签到记录仓储
#[async_trait]
pub trait CheckinRecordStore: Send + Sync {
    /// `(task_id, user_id)` 已存在记录时返回 `AlreadyCheckedIn`，
    /// 由存储层的唯一约束保证，而不是调用方的先查后写
    async fn create_record(&self, record: &NewTaskRecord) -> CheckinResult<TaskRecord>;
    async fn get_record(&self, task_id: i64, user_id: i64) -> CheckinResult<Option<TaskRecord>>;
    async fn list_records_by_task(&self, task_id: i64) -> CheckinResult<Vec<TaskRecord>>;
    async fn list_records_by_user(&self, user_id: i64) -> CheckinResult<Vec<TaskRecord>>;
}

/// 补签审核申请仓储
#[async_trait]
pub trait AuditRequestStore: Send + Sync {
    /// 同一 `(task_id, user_id)` 已有待审核申请时返回 `PendingAuditExists`
    async fn create_application(
        &self,
        application: &NewCheckApplication,
    ) -> CheckinResult<CheckApplication>;
    async fn get_application(&self, id: i64) -> CheckinResult<Option<CheckApplication>>;
    async fn find_pending_application(
        &self,
        task_id: i64,
        user_id: i64,
    ) -> CheckinResult<Option<CheckApplication>>;
    async fn list_applications_by_group(
        &self,
        group_id: i64,
        filter: AuditFilter,
    ) -> CheckinResult<Vec<CheckApplication>>;
    async fn list_applications_by_user(&self, user_id: i64) -> CheckinResult<Vec<CheckApplication>>;
    /// 条件状态迁移：仅当当前状态为 `from` 时更新为 `to`，返回是否迁移成功
    async fn transition_application(
        &self,
        id: i64,
        from: AuditStatus,
        to: AuditStatus,
        at: DateTime<Utc>,
    ) -> CheckinResult<bool>;
}

/// 群组只读查询
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn get_group(&self, id: i64) -> CheckinResult<Option<Group>>;
}

/// 群成员只读查询
#[async_trait]
pub trait GroupMemberStore: Send + Sync {
    async fn get_member(&self, group_id: i64, user_id: i64) -> CheckinResult<Option<GroupMember>>;
    async fn list_group_ids_for_user(&self, user_id: i64) -> CheckinResult<Vec<i64>>;
}

/// 事务作用域内的存储句柄
#[async_trait]
pub trait Transaction:
    TaskStore + CheckinRecordStore + AuditRequestStore + GroupStore + GroupMemberStore
{
    async fn commit(self: Box<Self>) -> CheckinResult<()>;
    async fn rollback(self: Box<Self>) -> CheckinResult<()>;
}

/// 事务协调器
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> CheckinResult<Box<dyn Transaction>>;
}

/// 持久化存储：事务外的读取加上事务入口
pub trait Database:
    UnitOfWork + TaskStore + CheckinRecordStore + AuditRequestStore + GroupStore + GroupMemberStore
{
}

impl<T> Database for T where
    T: UnitOfWork
        + TaskStore
        + CheckinRecordStore
        + AuditRequestStore
        + GroupStore
        + GroupMemberStore
{
}

/// 键值缓存，与具体技术无关
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CheckinResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CheckinResult<()>;
    /// 一次调用删除多个键，返回实际删除的数量
    async fn delete(&self, keys: &[String]) -> CheckinResult<usize>;
}

/// 限流器
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// 在固定窗口内计数，返回本次请求是否被允许
    async fn try_acquire(&self, key: &str, limit: u32, window: Duration) -> CheckinResult<bool>;
}

/// 时钟
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
