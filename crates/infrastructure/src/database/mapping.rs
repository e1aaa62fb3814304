//! Shared row mapping utilities for the SQLite store
//!
//! Timestamps are stored as INTEGER unix milliseconds so range predicates
//! compare numerically. Structured fields are stored as JSON TEXT.

use chrono::{DateTime, Utc};
use checkin_domain::{
    AuditStatus, CheckApplication, Group, GroupMember, MemberRole, RecordStatus, Task, TaskRecord,
    VerificationPayload, VerificationPolicy,
};
use checkin_errors::{CheckinError, CheckinResult};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub const TASK_COLUMNS: &str =
    "id, group_id, name, description, start_time, end_time, verification_policy, created_at, updated_at";
pub const RECORD_COLUMNS: &str =
    "id, task_id, user_id, username, group_id, signed_time, status, payload";
pub const APPLICATION_COLUMNS: &str = "id, task_id, group_id, user_id, username, reason, image, \
     admin_id, admin_username, status, created_at, processed_at";
pub const GROUP_COLUMNS: &str = "id, name, description, creator_id, creator_username, created_at";
pub const MEMBER_COLUMNS: &str = "group_id, user_id, username, role, joined_at";

/// Helper functions for converting between rows and domain entities
pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_millis(time: DateTime<Utc>) -> i64 {
        time.timestamp_millis()
    }

    pub fn from_millis(millis: i64) -> CheckinResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| CheckinError::Serialization(format!("无效的时间戳: {millis}")))
    }

    pub fn get_time(row: &SqliteRow, field_name: &str) -> CheckinResult<DateTime<Utc>> {
        let millis: i64 = Self::get(row, field_name)?;
        Self::from_millis(millis)
    }

    pub fn get_optional_time(
        row: &SqliteRow,
        field_name: &str,
    ) -> CheckinResult<Option<DateTime<Utc>>> {
        let millis: Option<i64> = Self::get(row, field_name)?;
        millis.map(Self::from_millis).transpose()
    }

    pub fn get<'r, T>(row: &'r SqliteRow, field_name: &str) -> CheckinResult<T>
    where
        T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
    {
        row.try_get(field_name)
            .map_err(|e| CheckinError::Serialization(format!("读取字段 {field_name} 失败: {e}")))
    }

    /// Parse a JSON TEXT column
    pub fn parse_json<T: DeserializeOwned>(row: &SqliteRow, field_name: &str) -> CheckinResult<T> {
        let json_str: String = Self::get(row, field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| CheckinError::Serialization(format!("解析字段 {field_name} 失败: {e}")))
    }

    pub fn to_json<T: serde::Serialize>(value: &T) -> CheckinResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    pub fn row_to_task(row: &SqliteRow) -> CheckinResult<Task> {
        let policy: VerificationPolicy = Self::parse_json(row, "verification_policy")?;
        Ok(Task {
            id: Self::get(row, "id")?,
            group_id: Self::get(row, "group_id")?,
            name: Self::get(row, "name")?,
            description: Self::get(row, "description")?,
            start_time: Self::get_time(row, "start_time")?,
            end_time: Self::get_time(row, "end_time")?,
            policy,
            created_at: Self::get_time(row, "created_at")?,
            updated_at: Self::get_time(row, "updated_at")?,
        })
    }

    pub fn row_to_record(row: &SqliteRow) -> CheckinResult<TaskRecord> {
        let payload: VerificationPayload = Self::parse_json(row, "payload")?;
        let status: i32 = Self::get(row, "status")?;
        Ok(TaskRecord {
            id: Self::get(row, "id")?,
            task_id: Self::get(row, "task_id")?,
            user_id: Self::get(row, "user_id")?,
            username: Self::get(row, "username")?,
            group_id: Self::get(row, "group_id")?,
            signed_time: Self::get_time(row, "signed_time")?,
            status: RecordStatus::from_i32(status)?,
            payload,
        })
    }

    pub fn row_to_application(row: &SqliteRow) -> CheckinResult<CheckApplication> {
        let status: String = Self::get(row, "status")?;
        Ok(CheckApplication {
            id: Self::get(row, "id")?,
            task_id: Self::get(row, "task_id")?,
            group_id: Self::get(row, "group_id")?,
            user_id: Self::get(row, "user_id")?,
            username: Self::get(row, "username")?,
            reason: Self::get(row, "reason")?,
            image: Self::get(row, "image")?,
            admin_id: Self::get(row, "admin_id")?,
            admin_username: Self::get(row, "admin_username")?,
            status: AuditStatus::parse(&status)?,
            created_at: Self::get_time(row, "created_at")?,
            processed_at: Self::get_optional_time(row, "processed_at")?,
        })
    }

    pub fn row_to_group(row: &SqliteRow) -> CheckinResult<Group> {
        Ok(Group {
            id: Self::get(row, "id")?,
            name: Self::get(row, "name")?,
            description: Self::get(row, "description")?,
            creator_id: Self::get(row, "creator_id")?,
            creator_username: Self::get(row, "creator_username")?,
            created_at: Self::get_time(row, "created_at")?,
        })
    }

    pub fn row_to_member(row: &SqliteRow) -> CheckinResult<GroupMember> {
        let role: String = Self::get(row, "role")?;
        Ok(GroupMember {
            group_id: Self::get(row, "group_id")?,
            user_id: Self::get(row, "user_id")?,
            username: Self::get(row, "username")?,
            role: MemberRole::parse(&role)?,
            joined_at: Self::get_time(row, "joined_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_conversion() {
        let millis = 1_700_000_000_123;
        let time = MappingHelpers::from_millis(millis).unwrap();
        assert_eq!(MappingHelpers::to_millis(time), millis);
    }
}
