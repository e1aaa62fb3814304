use checkin_domain::{Group, GroupMember};
use checkin_errors::CheckinResult;
use sqlx::{Row, SqliteConnection};

use crate::database::mapping::{MappingHelpers, GROUP_COLUMNS, MEMBER_COLUMNS};
use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

pub async fn get_group(conn: &mut SqliteConnection, id: i64) -> CheckinResult<Option<Group>> {
    let context = OperationContext::new(RepositoryOperation::Read, EntityKind::Group).with_id(id);
    let sql = format!("SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    row.as_ref().map(MappingHelpers::row_to_group).transpose()
}

pub async fn get_member(
    conn: &mut SqliteConnection,
    group_id: i64,
    user_id: i64,
) -> CheckinResult<Option<GroupMember>> {
    let context = OperationContext::new(RepositoryOperation::Read, EntityKind::GroupMember)
        .with_id(group_id);
    let sql = format!("SELECT {MEMBER_COLUMNS} FROM group_members WHERE group_id = ?1 AND user_id = ?2");
    let row = sqlx::query(&sql)
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    row.as_ref().map(MappingHelpers::row_to_member).transpose()
}

pub async fn list_group_ids_for_user(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> CheckinResult<Vec<i64>> {
    let context = OperationContext::new(RepositoryOperation::Query, EntityKind::GroupMember);
    let rows = sqlx::query("SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY group_id")
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

    rows.iter()
        .map(|row| {
            row.try_get::<i64, _>("group_id")
                .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))
        })
        .collect()
}
