use chrono::{DateTime, Utc};
use checkin_domain::{AuditFilter, AuditStatus, CheckApplication, NewCheckApplication};
use checkin_errors::{CheckinError, CheckinResult};
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::database::mapping::{MappingHelpers, APPLICATION_COLUMNS};
use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

fn filter_clause(filter: AuditFilter) -> &'static str {
    match filter {
        AuditFilter::All => "",
        AuditFilter::Pending => " AND status = 'pending'",
        AuditFilter::Processed => " AND status IN ('approved', 'rejected')",
    }
}

/// 插入待审核申请；同一 `(task_id, user_id)` 已有待审核申请时返回 `PendingAuditExists`
pub async fn create(
    conn: &mut SqliteConnection,
    application: &NewCheckApplication,
) -> CheckinResult<CheckApplication> {
    let context = OperationContext::new(RepositoryOperation::Create, EntityKind::Application)
        .with_task_user(application.task_id, application.user_id);

    let sql = format!(
        "INSERT INTO check_applications (task_id, group_id, user_id, username, reason, image, \
         admin_id, admin_username, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) RETURNING {APPLICATION_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(application.task_id)
        .bind(application.group_id)
        .bind(application.user_id)
        .bind(&application.username)
        .bind(&application.reason)
        .bind(&application.image)
        .bind(application.admin_id)
        .bind(&application.admin_username)
        .bind(AuditStatus::Pending.as_str())
        .bind(MappingHelpers::to_millis(application.created_at))
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if RepositoryErrorHelpers::is_unique_violation(&e) {
                CheckinError::PendingAuditExists {
                    task_id: application.task_id,
                    user_id: application.user_id,
                }
            } else {
                RepositoryErrorHelpers::database_error(&context, e)
            }
        })?;

    let created = MappingHelpers::row_to_application(&row)?;
    debug!("创建审核申请成功: ID {}", created.id);
    Ok(created)
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> CheckinResult<Option<CheckApplication>> {
    let context =
        OperationContext::new(RepositoryOperation::Read, EntityKind::Application).with_id(id);
    let sql = format!("SELECT {APPLICATION_COLUMNS} FROM check_applications WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    row.as_ref().map(MappingHelpers::row_to_application).transpose()
}

pub async fn find_pending(
    conn: &mut SqliteConnection,
    task_id: i64,
    user_id: i64,
) -> CheckinResult<Option<CheckApplication>> {
    let context = OperationContext::new(RepositoryOperation::Read, EntityKind::Application)
        .with_task_user(task_id, user_id);
    let sql = format!(
        "SELECT {APPLICATION_COLUMNS} FROM check_applications \
         WHERE task_id = ?1 AND user_id = ?2 AND status = 'pending'"
    );
    let row = sqlx::query(&sql)
        .bind(task_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    row.as_ref().map(MappingHelpers::row_to_application).transpose()
}

pub async fn list_by_group(
    conn: &mut SqliteConnection,
    group_id: i64,
    filter: AuditFilter,
) -> CheckinResult<Vec<CheckApplication>> {
    let context = OperationContext::new(RepositoryOperation::Query, EntityKind::Application);
    let sql = format!(
        "SELECT {APPLICATION_COLUMNS} FROM check_applications WHERE group_id = ?1{} \
         ORDER BY created_at DESC, id DESC",
        filter_clause(filter)
    );
    let rows = sqlx::query(&sql)
        .bind(group_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    rows.iter().map(MappingHelpers::row_to_application).collect()
}

pub async fn list_by_user(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> CheckinResult<Vec<CheckApplication>> {
    let context = OperationContext::new(RepositoryOperation::Query, EntityKind::Application);
    let sql = format!(
        "SELECT {APPLICATION_COLUMNS} FROM check_applications WHERE user_id = ?1 \
         ORDER BY created_at DESC, id DESC"
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    rows.iter().map(MappingHelpers::row_to_application).collect()
}

/// 条件更新：只有当前状态等于 `from` 的申请才会被迁移
#[instrument(skip(conn))]
pub async fn transition(
    conn: &mut SqliteConnection,
    id: i64,
    from: AuditStatus,
    to: AuditStatus,
    at: DateTime<Utc>,
) -> CheckinResult<bool> {
    let context =
        OperationContext::new(RepositoryOperation::Update, EntityKind::Application).with_id(id);
    let result = sqlx::query(
        "UPDATE check_applications SET status = ?1, processed_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(to.as_str())
    .bind(MappingHelpers::to_millis(at))
    .bind(id)
    .bind(from.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    Ok(result.rows_affected() == 1)
}
