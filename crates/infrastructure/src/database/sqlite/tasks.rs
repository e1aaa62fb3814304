use chrono::{DateTime, Utc};
use checkin_domain::{NewTask, Task, TaskFilter};
use checkin_errors::CheckinResult;
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::database::mapping::{MappingHelpers, TASK_COLUMNS};
use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

fn context(operation: RepositoryOperation) -> OperationContext {
    OperationContext::new(operation, EntityKind::Task)
}

/// 过滤条件对应的 WHERE 片段与排序；`?2` 绑定当前时间
fn filter_clause(filter: TaskFilter) -> &'static str {
    match filter {
        TaskFilter::All => " ORDER BY start_time DESC, id DESC",
        TaskFilter::Active => {
            " AND start_time <= ?2 AND end_time >= ?2 ORDER BY end_time ASC, id ASC"
        }
        TaskFilter::Ended => " AND end_time < ?2 ORDER BY end_time ASC, id ASC",
    }
}

#[instrument(skip(conn, task), fields(group_id = task.group_id))]
pub async fn create(
    conn: &mut SqliteConnection,
    task: &NewTask,
    now: DateTime<Utc>,
) -> CheckinResult<Task> {
    let context = context(RepositoryOperation::Create);
    let policy = MappingHelpers::to_json(&task.fields.policy)?;
    let now_millis = MappingHelpers::to_millis(now);

    let sql = format!(
        "INSERT INTO tasks (group_id, name, description, start_time, end_time, \
         verification_policy, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) RETURNING {TASK_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(task.group_id)
        .bind(&task.fields.name)
        .bind(&task.fields.description)
        .bind(MappingHelpers::to_millis(task.fields.window.start()))
        .bind(MappingHelpers::to_millis(task.fields.window.end()))
        .bind(policy)
        .bind(now_millis)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    let created = MappingHelpers::row_to_task(&row)?;
    debug!("创建签到任务成功: {} (ID: {})", created.name, created.id);
    Ok(created)
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> CheckinResult<Option<Task>> {
    let context = context(RepositoryOperation::Read).with_id(id);
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    row.as_ref().map(MappingHelpers::row_to_task).transpose()
}

pub async fn list_by_group(
    conn: &mut SqliteConnection,
    group_id: i64,
    filter: TaskFilter,
    now: DateTime<Utc>,
) -> CheckinResult<Vec<Task>> {
    let context = context(RepositoryOperation::Query);
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE group_id = ?1{}",
        filter_clause(filter)
    );
    let mut query = sqlx::query(&sql).bind(group_id);
    if filter != TaskFilter::All {
        query = query.bind(MappingHelpers::to_millis(now));
    }
    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    rows.iter().map(MappingHelpers::row_to_task).collect()
}

pub async fn list_by_user(
    conn: &mut SqliteConnection,
    user_id: i64,
    filter: TaskFilter,
    now: DateTime<Utc>,
) -> CheckinResult<Vec<Task>> {
    let context = context(RepositoryOperation::Query);
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE group_id IN (SELECT group_id FROM group_members WHERE user_id = ?1){}",
        filter_clause(filter)
    );
    let mut query = sqlx::query(&sql).bind(user_id);
    if filter != TaskFilter::All {
        query = query.bind(MappingHelpers::to_millis(now));
    }
    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    rows.iter().map(MappingHelpers::row_to_task).collect()
}

#[instrument(skip(conn, task), fields(task_id = task.id))]
pub async fn update(conn: &mut SqliteConnection, task: &Task) -> CheckinResult<bool> {
    let context = context(RepositoryOperation::Update).with_id(task.id);
    let policy = MappingHelpers::to_json(&task.policy)?;

    let result = sqlx::query(
        "UPDATE tasks SET name = ?1, description = ?2, start_time = ?3, end_time = ?4, \
         verification_policy = ?5, updated_at = ?6 WHERE id = ?7",
    )
    .bind(&task.name)
    .bind(&task.description)
    .bind(MappingHelpers::to_millis(task.start_time))
    .bind(MappingHelpers::to_millis(task.end_time))
    .bind(policy)
    .bind(MappingHelpers::to_millis(task.updated_at))
    .bind(task.id)
    .execute(&mut *conn)
    .await
    .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete(conn: &mut SqliteConnection, id: i64) -> CheckinResult<bool> {
    let context = context(RepositoryOperation::Delete).with_id(id);
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    if result.rows_affected() > 0 {
        debug!("删除签到任务成功: ID {}", id);
    }
    Ok(result.rows_affected() > 0)
}
