use chrono::{DateTime, Utc};
use checkin_errors::{CheckinError, CheckinResult};
use serde::{Deserialize, Serialize};

use crate::value_objects::{
    AuditStatus, MemberRole, RecordStatus, TaskFilter, TaskPhase, TaskWindow, VerificationPayload,
    VerificationPolicy,
};

/// 签到任务
///
/// 属于某个群组的限时签到事件，配置了一组验证方式。
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符
/// - `group_id`: 所属群组
/// - `start_time` / `end_time`: 签到时间窗口，`end_time > start_time`
/// - `policy`: 验证策略（GPS、WiFi、NFC、人脸）
///
/// 任务的阶段（未开始/进行中/已结束）不持久化，通过 [`Task::phase_at`] 推导。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub policy: VerificationPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn phase_at(&self, now: DateTime<Utc>) -> TaskPhase {
        TaskPhase::at(self.start_time, self.end_time, now)
    }

    /// 当前时间是否已超过结束时间
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now > self.end_time
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time
    }

    /// 用新字段整体替换可变字段
    pub fn apply(&mut self, fields: TaskFields, now: DateTime<Utc>) {
        self.name = fields.name;
        self.description = fields.description;
        self.start_time = fields.window.start();
        self.end_time = fields.window.end();
        self.policy = fields.policy;
        self.updated_at = now;
    }
}

/// 任务的可变字段，创建和更新共用
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFields {
    pub name: String,
    pub description: String,
    pub window: TaskWindow,
    pub policy: VerificationPolicy,
}

impl TaskFields {
    pub fn validate(&self) -> CheckinResult<()> {
        if self.name.trim().is_empty() {
            return Err(CheckinError::validation_error("任务名称不能为空"));
        }
        self.policy.validate()
    }
}

/// 待创建的任务
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub group_id: i64,
    pub fields: TaskFields,
}

/// 对外返回的任务视图，附带推导出的阶段
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub phase: TaskPhase,
}

impl TaskView {
    pub fn at(task: Task, now: DateTime<Utc>) -> Self {
        let phase = task.phase_at(now);
        Self { task, phase }
    }
}

impl TaskFilter {
    pub fn matches(&self, task: &Task, now: DateTime<Utc>) -> bool {
        match self {
            TaskFilter::All => true,
            TaskFilter::Active => task.start_time <= now && now <= task.end_time,
            TaskFilter::Ended => task.end_time < now,
        }
    }

    /// 过滤任务列表；带过滤条件时按结束时间升序排列
    pub fn apply(&self, tasks: Vec<Task>, now: DateTime<Utc>) -> Vec<Task> {
        let mut tasks: Vec<Task> = tasks
            .into_iter()
            .filter(|t| self.matches(t, now))
            .collect();
        if *self != TaskFilter::All {
            tasks.sort_by_key(|t| (t.end_time, t.id));
        }
        tasks
    }
}

/// 签到记录
///
/// 用户完成某个任务签到的唯一凭证，`(task_id, user_id)` 唯一。
/// 只会被创建，不会被更新，正常流程中也不会被删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub task_id: i64,
    pub user_id: i64,
    pub username: String,
    pub group_id: i64,
    pub signed_time: DateTime<Utc>,
    pub status: RecordStatus,
    /// 实际参与验证的数据
    pub payload: VerificationPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskRecord {
    pub task_id: i64,
    pub user_id: i64,
    pub username: String,
    pub group_id: i64,
    pub signed_time: DateTime<Utc>,
    pub status: RecordStatus,
    pub payload: VerificationPayload,
}

/// 补签审核申请
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckApplication {
    pub id: i64,
    pub task_id: i64,
    pub group_id: i64,
    pub user_id: i64,
    pub username: String,
    pub reason: String,
    pub image: Option<String>,
    /// 申请时群组创建者的身份
    pub admin_id: i64,
    pub admin_username: String,
    pub status: AuditStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCheckApplication {
    pub task_id: i64,
    pub group_id: i64,
    pub user_id: i64,
    pub username: String,
    pub reason: String,
    pub image: Option<String>,
    pub admin_id: i64,
    pub admin_username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub creator_id: i64,
    pub creator_username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: i64,
    pub user_id: i64,
    pub username: String,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}
