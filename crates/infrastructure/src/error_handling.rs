//! Error classification for store operations
//!
//! Every sqlx error is classified here, at the point of occurrence, into a
//! `CheckinError` carrying the operation context. Callers above the store
//! never inspect driver-specific error values.

use chrono::{DateTime, Utc};
use checkin_errors::CheckinError;
use sqlx::Error as SqlxError;
use std::fmt;
use tracing::error;

/// Operation context for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Delete,
    Query,
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "列表查询"),
            RepositoryOperation::Begin => write!(f, "开启事务"),
            RepositoryOperation::Commit => write!(f, "提交事务"),
            RepositoryOperation::Rollback => write!(f, "回滚事务"),
        }
    }
}

/// Entity touched by a repository operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Task,
    Record,
    Application,
    Group,
    GroupMember,
    Transaction,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Task => write!(f, "签到任务"),
            EntityKind::Record => write!(f, "签到记录"),
            EntityKind::Application => write!(f, "审核申请"),
            EntityKind::Group => write!(f, "群组"),
            EntityKind::GroupMember => write!(f, "群成员"),
            EntityKind::Transaction => write!(f, "事务"),
        }
    }
}

/// Context information for store operations
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: RepositoryOperation,
    pub entity: EntityKind,
    pub id: Option<i64>,
    pub task_id: Option<i64>,
    pub user_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(operation: RepositoryOperation, entity: EntityKind) -> Self {
        Self {
            operation,
            entity,
            id: None,
            task_id: None,
            user_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_task_user(mut self, task_id: i64, user_id: i64) -> Self {
        self.task_id = Some(task_id);
        self.user_id = Some(user_id);
        self
    }

    pub fn entity_description(&self) -> String {
        match (self.id, self.task_id, self.user_id) {
            (Some(id), _, _) => format!("{} (ID: {})", self.entity, id),
            (None, Some(task_id), Some(user_id)) => {
                format!("{} (任务ID: {}, 用户ID: {})", self.entity, task_id, user_id)
            }
            _ => self.entity.to_string(),
        }
    }

    pub fn describe(&self) -> String {
        format!("{}{}", self.operation, self.entity_description())
    }
}

/// Context-rich error helpers for store operations
pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    /// Whether the error is a unique-constraint violation
    pub fn is_unique_violation(error: &SqlxError) -> bool {
        match error {
            SqlxError::Database(db_error) => db_error.is_unique_violation(),
            _ => false,
        }
    }

    /// Classify a sqlx error as a persistence failure with operation context
    pub fn database_error(context: &OperationContext, error: SqlxError) -> CheckinError {
        let description = context.describe();
        let message = match &error {
            SqlxError::Database(db_error) => match db_error.constraint() {
                Some(constraint) => format!("数据库约束冲突 {constraint}: {db_error}"),
                None => format!("数据库错误: {db_error}"),
            },
            SqlxError::PoolClosed => "数据库连接池已关闭".to_string(),
            SqlxError::PoolTimedOut => "数据库连接池超时".to_string(),
            SqlxError::Io(io_error) => format!("I/O错误: {io_error}"),
            other => format!("未知数据库错误: {other}"),
        };

        error!(
            operation = %context.operation,
            entity = %context.entity,
            id = ?context.id,
            task_id = ?context.task_id,
            user_id = ?context.user_id,
            error = %error,
            "{}时发生{}",
            description,
            message
        );
        CheckinError::persistence(description, message)
    }

    pub fn serialization_error(context: &OperationContext, error: serde_json::Error) -> CheckinError {
        CheckinError::Serialization(format!("{}时序列化失败: {}", context.describe(), error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_description() {
        let ctx = OperationContext::new(RepositoryOperation::Create, EntityKind::Record)
            .with_task_user(3, 9);
        assert_eq!(ctx.describe(), "创建签到记录 (任务ID: 3, 用户ID: 9)");

        let ctx = OperationContext::new(RepositoryOperation::Update, EntityKind::Application)
            .with_id(42);
        assert_eq!(ctx.describe(), "更新审核申请 (ID: 42)");
    }

    #[test]
    fn test_database_error_is_persistence_kind() {
        let ctx = OperationContext::new(RepositoryOperation::Read, EntityKind::Task).with_id(1);
        let err = RepositoryErrorHelpers::database_error(&ctx, SqlxError::PoolTimedOut);
        assert_eq!(err.kind(), checkin_errors::ErrorKind::PersistenceFailure);
        assert!(err.to_string().contains("数据库连接池超时"));
        assert!(!RepositoryErrorHelpers::is_unique_violation(&SqlxError::RowNotFound));
    }
}
