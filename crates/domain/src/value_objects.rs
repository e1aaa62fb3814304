//! # 值对象
//!
//! 签到领域中不具备独立标识的概念：时间窗口、任务阶段、验证方式与验证策略、
//! 用户提交的验证数据，以及各类查询过滤条件。

use chrono::{DateTime, Utc};
use checkin_errors::{CheckinError, CheckinResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// GPS签到半径允许的最小值（米）
pub const MIN_GPS_RADIUS_METERS: u32 = 1;
/// GPS签到半径允许的最大值（米）
pub const MAX_GPS_RADIUS_METERS: u32 = 10_000;

/// 签到时间窗口
///
/// 构造时保证 `end > start`，两端在比较时均为闭区间。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TaskWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> CheckinResult<Self> {
        if end <= start {
            return Err(CheckinError::InvalidTimeWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn phase_at(&self, now: DateTime<Utc>) -> TaskPhase {
        TaskPhase::at(self.start, self.end, now)
    }
}

/// 任务阶段，由存储的时间与当前时间推导，从不持久化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Upcoming,
    Ongoing,
    Expired,
}

impl TaskPhase {
    pub fn at(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now < start {
            TaskPhase::Upcoming
        } else if now > end {
            TaskPhase::Expired
        } else {
            TaskPhase::Ongoing
        }
    }
}

/// 验证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    Gps,
    Wifi,
    Nfc,
    Face,
}

impl VerificationMethod {
    pub const ALL: [VerificationMethod; 4] = [
        VerificationMethod::Gps,
        VerificationMethod::Wifi,
        VerificationMethod::Nfc,
        VerificationMethod::Face,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMethod::Gps => "gps",
            VerificationMethod::Wifi => "wifi",
            VerificationMethod::Nfc => "nfc",
            VerificationMethod::Face => "face",
        }
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPS签到策略：中心点与半径
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsPolicy {
    pub latitude: f64,
    pub longitude: f64,
    /// 单位：米
    pub radius: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiPolicy {
    pub ssid: String,
    pub bssid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfcPolicy {
    pub tag_id: String,
    pub tag_name: Option<String>,
}

/// 任务的验证策略
///
/// 某种验证方式"启用"即对应字段为 `Some`（人脸为 `true`），
/// 因此不存在"启用了GPS却没有配置位置"这种状态。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub gps: Option<GpsPolicy>,
    pub wifi: Option<WifiPolicy>,
    pub nfc: Option<NfcPolicy>,
    pub face: bool,
}

impl VerificationPolicy {
    pub fn is_enabled(&self, method: VerificationMethod) -> bool {
        match method {
            VerificationMethod::Gps => self.gps.is_some(),
            VerificationMethod::Wifi => self.wifi.is_some(),
            VerificationMethod::Nfc => self.nfc.is_some(),
            VerificationMethod::Face => self.face,
        }
    }

    pub fn enabled_methods(&self) -> Vec<VerificationMethod> {
        VerificationMethod::ALL
            .into_iter()
            .filter(|m| self.is_enabled(*m))
            .collect()
    }

    /// 校验各验证方式的参数
    pub fn validate(&self) -> CheckinResult<()> {
        if let Some(gps) = &self.gps {
            if !(MIN_GPS_RADIUS_METERS..=MAX_GPS_RADIUS_METERS).contains(&gps.radius) {
                return Err(CheckinError::validation_error(format!(
                    "签到半径必须在{MIN_GPS_RADIUS_METERS}到{MAX_GPS_RADIUS_METERS}米之间: {}",
                    gps.radius
                )));
            }
            if !(-90.0..=90.0).contains(&gps.latitude) || !(-180.0..=180.0).contains(&gps.longitude)
            {
                return Err(CheckinError::validation_error(format!(
                    "无效的经纬度: ({}, {})",
                    gps.latitude, gps.longitude
                )));
            }
        }
        if let Some(wifi) = &self.wifi {
            if wifi.ssid.trim().is_empty() || wifi.bssid.trim().is_empty() {
                return Err(CheckinError::validation_error("WiFi的SSID和BSSID不能为空"));
            }
        }
        if let Some(nfc) = &self.nfc {
            if nfc.tag_id.trim().is_empty() {
                return Err(CheckinError::validation_error("NFC标签ID不能为空"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsData {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiData {
    pub ssid: String,
    pub bssid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfcData {
    pub tag_id: String,
    pub tag_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceData {
    /// 人脸图像（URL或编码后的图像数据）
    pub image: String,
}

/// 用户签到时提交的验证数据，每种验证方式一个可选切片
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationPayload {
    pub gps: Option<GpsData>,
    pub wifi: Option<WifiData>,
    pub nfc: Option<NfcData>,
    pub face: Option<FaceData>,
}

impl VerificationPayload {
    /// 只保留实际参与验证的数据切片
    pub fn retain_methods(&self, methods: &[VerificationMethod]) -> Self {
        let keep = |m: VerificationMethod| methods.contains(&m);
        Self {
            gps: self.gps.clone().filter(|_| keep(VerificationMethod::Gps)),
            wifi: self.wifi.clone().filter(|_| keep(VerificationMethod::Wifi)),
            nfc: self.nfc.clone().filter(|_| keep(VerificationMethod::Nfc)),
            face: self.face.clone().filter(|_| keep(VerificationMethod::Face)),
        }
    }
}

/// 签到记录状态：1 正常签到，2 审核通过补签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Normal = 1,
    AuditApproved = 2,
}

impl RecordStatus {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> CheckinResult<Self> {
        match value {
            1 => Ok(RecordStatus::Normal),
            2 => Ok(RecordStatus::AuditApproved),
            other => Err(CheckinError::Serialization(format!(
                "无效的签到记录状态: {other}"
            ))),
        }
    }
}

/// 审核申请状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Approved,
    Rejected,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::Approved => "approved",
            AuditStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> CheckinResult<Self> {
        match value {
            "pending" => Ok(AuditStatus::Pending),
            "approved" => Ok(AuditStatus::Approved),
            "rejected" => Ok(AuditStatus::Rejected),
            other => Err(CheckinError::Serialization(format!(
                "无效的审核状态: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuditStatus::Pending)
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 群成员角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(value: &str) -> CheckinResult<Self> {
        match value {
            "owner" => Ok(MemberRole::Owner),
            "admin" => Ok(MemberRole::Admin),
            "member" => Ok(MemberRole::Member),
            other => Err(CheckinError::Serialization(format!(
                "无效的成员角色: {other}"
            ))),
        }
    }

    pub fn can_manage(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

/// 任务列表过滤条件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskFilter {
    #[default]
    All,
    /// `now ∈ [start_time, end_time]`
    Active,
    /// `end_time < now`
    Ended,
}

/// 任务列表范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScope {
    Group(i64),
    User(i64),
}

/// 签到记录查询
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordQuery {
    ByTask(i64),
    ByUser(i64),
}

/// 审核申请列表过滤条件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditFilter {
    #[default]
    All,
    Pending,
    /// 已通过或已拒绝
    Processed,
}

impl AuditFilter {
    pub fn matches(&self, status: AuditStatus) -> bool {
        match self {
            AuditFilter::All => true,
            AuditFilter::Pending => status == AuditStatus::Pending,
            AuditFilter::Processed => status.is_terminal(),
        }
    }
}

/// 审核申请查询
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditQuery {
    ByUser(i64),
    ByGroup { group_id: i64, filter: AuditFilter },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_task_window_rejects_non_positive_duration() {
        let now = Utc::now();
        assert!(matches!(
            TaskWindow::new(now, now),
            Err(CheckinError::InvalidTimeWindow { .. })
        ));
        assert!(TaskWindow::new(now, now - Duration::seconds(1)).is_err());
        assert!(TaskWindow::new(now, now + Duration::seconds(1)).is_ok());
    }

    #[test]
    fn test_task_phase_boundaries_are_inclusive() {
        let start = Utc::now();
        let end = start + Duration::hours(1);
        assert_eq!(
            TaskPhase::at(start, end, start - Duration::seconds(1)),
            TaskPhase::Upcoming
        );
        assert_eq!(TaskPhase::at(start, end, start), TaskPhase::Ongoing);
        assert_eq!(TaskPhase::at(start, end, end), TaskPhase::Ongoing);
        assert_eq!(
            TaskPhase::at(start, end, end + Duration::seconds(1)),
            TaskPhase::Expired
        );
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = VerificationPolicy {
            gps: Some(GpsPolicy {
                latitude: 39.90,
                longitude: 116.40,
                radius: 50,
            }),
            ..Default::default()
        };
        assert!(policy.validate().is_ok());

        policy.gps.as_mut().unwrap().radius = 0;
        assert!(policy.validate().is_err());
        policy.gps.as_mut().unwrap().radius = 10_001;
        assert!(policy.validate().is_err());
        policy.gps.as_mut().unwrap().radius = 10_000;
        policy.gps.as_mut().unwrap().latitude = 91.0;
        assert!(policy.validate().is_err());

        let wifi_only = VerificationPolicy {
            wifi: Some(WifiPolicy {
                ssid: "office".to_string(),
                bssid: " ".to_string(),
            }),
            ..Default::default()
        };
        assert!(wifi_only.validate().is_err());
    }

    #[test]
    fn test_enabled_methods_order() {
        let policy = VerificationPolicy {
            nfc: Some(NfcPolicy {
                tag_id: "tag-1".to_string(),
                tag_name: None,
            }),
            face: true,
            ..Default::default()
        };
        assert_eq!(
            policy.enabled_methods(),
            vec![VerificationMethod::Nfc, VerificationMethod::Face]
        );
        assert!(!policy.is_enabled(VerificationMethod::Gps));
    }

    #[test]
    fn test_payload_retain_methods() {
        let payload = VerificationPayload {
            gps: Some(GpsData {
                latitude: 1.0,
                longitude: 2.0,
            }),
            wifi: Some(WifiData {
                ssid: "a".to_string(),
                bssid: "b".to_string(),
            }),
            nfc: None,
            face: None,
        };
        let kept = payload.retain_methods(&[VerificationMethod::Gps]);
        assert!(kept.gps.is_some());
        assert!(kept.wifi.is_none());
    }

    #[test]
    fn test_audit_filter() {
        assert!(AuditFilter::All.matches(AuditStatus::Rejected));
        assert!(AuditFilter::Pending.matches(AuditStatus::Pending));
        assert!(!AuditFilter::Pending.matches(AuditStatus::Approved));
        assert!(AuditFilter::Processed.matches(AuditStatus::Approved));
        assert!(AuditFilter::Processed.matches(AuditStatus::Rejected));
        assert!(!AuditFilter::Processed.matches(AuditStatus::Pending));
    }

    #[test]
    fn test_status_codes_round_trip_through_storage_values() {
        assert_eq!(RecordStatus::from_i32(2).unwrap(), RecordStatus::AuditApproved);
        assert!(RecordStatus::from_i32(3).is_err());
        assert_eq!(AuditStatus::parse("rejected").unwrap(), AuditStatus::Rejected);
        assert!(MemberRole::parse("admin").unwrap().can_manage());
        assert!(!MemberRole::Member.can_manage());
    }
}
