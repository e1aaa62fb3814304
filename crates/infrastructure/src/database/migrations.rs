use checkin_errors::CheckinResult;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

const SCHEMA: &[&str] = &[
    // 群组与成员由外部系统维护，这里只读
    r#"
    CREATE TABLE IF NOT EXISTS groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        creator_id INTEGER NOT NULL,
        creator_username TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_members (
        group_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        username TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'member',
        joined_at INTEGER NOT NULL,
        PRIMARY KEY (group_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        start_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        verification_policy TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK (end_time > start_time)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        username TEXT NOT NULL,
        group_id INTEGER NOT NULL,
        signed_time INTEGER NOT NULL,
        status INTEGER NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        UNIQUE (task_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS check_applications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        group_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        username TEXT NOT NULL,
        reason TEXT NOT NULL,
        image TEXT,
        admin_id INTEGER NOT NULL,
        admin_username TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL,
        processed_at INTEGER
    )
    "#,
    // 每个 (task_id, user_id) 至多一条待审核申请
    "CREATE UNIQUE INDEX IF NOT EXISTS uniq_check_applications_pending \
     ON check_applications(task_id, user_id) WHERE status = 'pending'",
    "CREATE INDEX IF NOT EXISTS idx_group_members_user_id ON group_members(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_group_id ON tasks(group_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_end_time ON tasks(end_time)",
    "CREATE INDEX IF NOT EXISTS idx_task_records_user_id ON task_records(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_check_applications_group_id ON check_applications(group_id)",
    "CREATE INDEX IF NOT EXISTS idx_check_applications_user_id ON check_applications(user_id)",
];

/// 运行数据库迁移，可重复执行
pub async fn run_migrations(pool: &SqlitePool) -> CheckinResult<()> {
    debug!("Running SQLite database migrations");
    let context = OperationContext::new(RepositoryOperation::Create, EntityKind::Transaction);

    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;
    }

    debug!("Successfully completed SQLite database migrations");
    Ok(())
}
