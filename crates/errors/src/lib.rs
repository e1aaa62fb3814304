use thiserror::Error;

/// 错误类别
///
/// 上层（HTTP层等）只需要依据类别做映射，不需要关心底层存储的具体错误值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    ValidationFailed,
    PersistenceFailure,
    CacheFailure,
    RateLimited,
}

#[derive(Debug, Error)]
pub enum CheckinError {
    #[error("签到任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("签到记录未找到: task_id={task_id}, user_id={user_id}")]
    RecordNotFound { task_id: i64, user_id: i64 },
    #[error("审核申请未找到: {id}")]
    AuditRequestNotFound { id: i64 },
    #[error("群组未找到: {id}")]
    GroupNotFound { id: i64 },
    #[error("用户已签到: task_id={task_id}, user_id={user_id}")]
    AlreadyCheckedIn { task_id: i64, user_id: i64 },
    #[error("已存在待审核的申请: task_id={task_id}, user_id={user_id}")]
    PendingAuditExists { task_id: i64, user_id: i64 },
    #[error("数据冲突: {0}")]
    Conflict(String),
    #[error("签到任务已结束: {task_id}")]
    TaskHasEnded { task_id: i64 },
    #[error("签到任务已开始，不允许修改: {task_id}")]
    TaskAlreadyStarted { task_id: i64 },
    #[error("无效的时间窗口: 结束时间 {end} 必须晚于开始时间 {start}")]
    InvalidTimeWindow { start: String, end: String },
    #[error("审核申请已处理: id={id}, status={status}")]
    AuditAlreadyProcessed { id: i64, status: String },
    #[error("签到任务未启用该验证方式: {method}")]
    MethodNotEnabled { method: String },
    #[error("验证失败 [{method}]: {reason}")]
    VerificationFailed { method: String, reason: String },
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("请求过于频繁: {key}")]
    RateLimited { key: String },
    #[error("数据库操作错误 [{operation}]: {message}")]
    Persistence { operation: String, message: String },
    #[error("缓存错误: {0}")]
    CacheError(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type CheckinResult<T> = Result<T, CheckinError>;

impl CheckinError {
    pub fn persistence<O: Into<String>, M: ToString>(operation: O, message: M) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn audit_request_not_found(id: i64) -> Self {
        Self::AuditRequestNotFound { id }
    }
    pub fn group_not_found(id: i64) -> Self {
        Self::GroupNotFound { id }
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn verification_failed<M: Into<String>, R: Into<String>>(method: M, reason: R) -> Self {
        Self::VerificationFailed {
            method: method.into(),
            reason: reason.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn timeout_error<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckinError::TaskNotFound { .. }
            | CheckinError::RecordNotFound { .. }
            | CheckinError::AuditRequestNotFound { .. }
            | CheckinError::GroupNotFound { .. } => ErrorKind::NotFound,
            CheckinError::AlreadyCheckedIn { .. }
            | CheckinError::PendingAuditExists { .. }
            | CheckinError::Conflict(_) => ErrorKind::Conflict,
            CheckinError::TaskHasEnded { .. }
            | CheckinError::TaskAlreadyStarted { .. }
            | CheckinError::InvalidTimeWindow { .. }
            | CheckinError::AuditAlreadyProcessed { .. }
            | CheckinError::MethodNotEnabled { .. } => ErrorKind::InvalidState,
            CheckinError::VerificationFailed { .. } | CheckinError::ValidationError(_) => {
                ErrorKind::ValidationFailed
            }
            CheckinError::RateLimited { .. } => ErrorKind::RateLimited,
            CheckinError::CacheError(_) => ErrorKind::CacheFailure,
            CheckinError::Persistence { .. }
            | CheckinError::Serialization(_)
            | CheckinError::Configuration(_)
            | CheckinError::Timeout(_)
            | CheckinError::Internal(_) => ErrorKind::PersistenceFailure,
        }
    }

    /// 供HTTP层映射使用的状态码
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InvalidState | ErrorKind::ValidationFailed => 400,
            ErrorKind::RateLimited => 429,
            ErrorKind::PersistenceFailure | ErrorKind::CacheFailure => match self {
                CheckinError::Timeout(_) => 503,
                _ => 500,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CheckinError::Persistence { .. }
                | CheckinError::CacheError(_)
                | CheckinError::Timeout(_)
                | CheckinError::RateLimited { .. }
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            CheckinError::TaskNotFound { .. } => "签到任务不存在",
            CheckinError::RecordNotFound { .. } => "签到记录不存在",
            CheckinError::AuditRequestNotFound { .. } => "审核申请不存在",
            CheckinError::GroupNotFound { .. } => "群组不存在",
            CheckinError::AlreadyCheckedIn { .. } => "您已完成签到，请勿重复签到",
            CheckinError::PendingAuditExists { .. } => "您已提交过申请，请等待审核",
            CheckinError::TaskHasEnded { .. } => "签到任务已结束",
            CheckinError::TaskAlreadyStarted { .. } => "签到任务已开始，无法修改",
            CheckinError::AuditAlreadyProcessed { .. } => "该申请已处理",
            CheckinError::MethodNotEnabled { .. } => "该任务未启用此签到方式",
            CheckinError::VerificationFailed { .. } => "签到验证失败",
            CheckinError::ValidationError(_) | CheckinError::InvalidTimeWindow { .. } => {
                "输入数据验证失败"
            }
            CheckinError::RateLimited { .. } => "操作过于频繁，请稍后重试",
            CheckinError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for CheckinError {
    fn from(err: serde_json::Error) -> Self {
        CheckinError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CheckinError {
    fn from(err: anyhow::Error) -> Self {
        CheckinError::Internal(err.to_string())
    }
}
