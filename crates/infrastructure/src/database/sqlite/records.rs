use checkin_domain::{NewTaskRecord, TaskRecord};
use checkin_errors::{CheckinError, CheckinResult};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::database::mapping::{MappingHelpers, RECORD_COLUMNS};
use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

/// 插入签到记录；`(task_id, user_id)` 的唯一约束冲突映射为 `AlreadyCheckedIn`
pub async fn create(
    conn: &mut SqliteConnection,
    record: &NewTaskRecord,
) -> CheckinResult<TaskRecord> {
    let context = OperationContext::new(RepositoryOperation::Create, EntityKind::Record)
        .with_task_user(record.task_id, record.user_id);
    let payload = MappingHelpers::to_json(&record.payload)?;

    let sql = format!(
        "INSERT INTO task_records (task_id, user_id, username, group_id, signed_time, status, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING {RECORD_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(record.task_id)
        .bind(record.user_id)
        .bind(&record.username)
        .bind(record.group_id)
        .bind(MappingHelpers::to_millis(record.signed_time))
        .bind(record.status.as_i32())
        .bind(payload)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if RepositoryErrorHelpers::is_unique_violation(&e) {
                CheckinError::AlreadyCheckedIn {
                    task_id: record.task_id,
                    user_id: record.user_id,
                }
            } else {
                RepositoryErrorHelpers::database_error(&context, e)
            }
        })?;

    let created = MappingHelpers::row_to_record(&row)?;
    debug!(
        "创建签到记录成功: 任务 {} 用户 {} (ID: {})",
        created.task_id, created.user_id, created.id
    );
    Ok(created)
}

pub async fn get(
    conn: &mut SqliteConnection,
    task_id: i64,
    user_id: i64,
) -> CheckinResult<Option<TaskRecord>> {
    let context = OperationContext::new(RepositoryOperation::Read, EntityKind::Record)
        .with_task_user(task_id, user_id);
    let sql = format!("SELECT {RECORD_COLUMNS} FROM task_records WHERE task_id = ?1 AND user_id = ?2");
    let row = sqlx::query(&sql)
        .bind(task_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    row.as_ref().map(MappingHelpers::row_to_record).transpose()
}

pub async fn list_by_task(conn: &mut SqliteConnection, task_id: i64) -> CheckinResult<Vec<TaskRecord>> {
    let context = OperationContext::new(RepositoryOperation::Query, EntityKind::Record);
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM task_records WHERE task_id = ?1 ORDER BY signed_time ASC, id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(task_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    rows.iter().map(MappingHelpers::row_to_record).collect()
}

pub async fn list_by_user(conn: &mut SqliteConnection, user_id: i64) -> CheckinResult<Vec<TaskRecord>> {
    let context = OperationContext::new(RepositoryOperation::Query, EntityKind::Record);
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM task_records WHERE user_id = ?1 ORDER BY signed_time DESC, id DESC"
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    rows.iter().map(MappingHelpers::row_to_record).collect()
}
