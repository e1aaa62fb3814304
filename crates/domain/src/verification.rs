//! # 签到验证引擎
//!
//! 判断用户为某种验证方式提交的数据是否满足任务上配置的策略。
//! 纯决策函数：不访问存储、没有副作用，可以在事务外安全调用。
//!
//! 人脸比对是外部协作方，引擎只通过 [`FaceMatcher`] 插槽调用，
//! 默认实现仅检查人脸数据是否存在。

use std::sync::Arc;

use checkin_errors::{CheckinError, CheckinResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entities::Task;
use crate::value_objects::{FaceData, VerificationMethod, VerificationPayload};

/// 地球平均半径（米）
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// 单个验证方式的判定结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

impl VerificationOutcome {
    pub fn passed() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn failed<S: Into<String>>(reason: S) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// 人脸比对插槽
pub trait FaceMatcher: Send + Sync {
    fn matches(&self, task: &Task, face: &FaceData) -> bool;
}

/// 只要求提交了人脸数据，不做真正的比对
#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceOnlyFaceMatcher;

impl FaceMatcher for PresenceOnlyFaceMatcher {
    fn matches(&self, _task: &Task, _face: &FaceData) -> bool {
        true
    }
}

/// 两个经纬度之间的球面距离（米），haversine公式
pub fn haversine_distance_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

#[derive(Clone)]
pub struct VerificationEngine {
    face_matcher: Arc<dyn FaceMatcher>,
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::new(Arc::new(PresenceOnlyFaceMatcher))
    }
}

impl VerificationEngine {
    pub fn new(face_matcher: Arc<dyn FaceMatcher>) -> Self {
        Self { face_matcher }
    }

    /// 验证单个方式
    ///
    /// 任务未启用该方式时返回 `MethodNotEnabled` 错误，这不是验证失败。
    /// 数据缺失或不匹配时返回 `valid = false` 的结果。
    pub fn verify(
        &self,
        method: VerificationMethod,
        task: &Task,
        supplied: &VerificationPayload,
    ) -> CheckinResult<VerificationOutcome> {
        if !task.policy.is_enabled(method) {
            return Err(CheckinError::MethodNotEnabled {
                method: method.to_string(),
            });
        }

        let outcome = match method {
            VerificationMethod::Gps => self.verify_gps(task, supplied),
            VerificationMethod::Wifi => self.verify_wifi(task, supplied),
            VerificationMethod::Nfc => self.verify_nfc(task, supplied),
            VerificationMethod::Face => self.verify_face(task, supplied),
        };
        debug!(
            task_id = task.id,
            method = %method,
            valid = outcome.valid,
            "verification evaluated"
        );
        Ok(outcome)
    }

    /// 依次验证任务启用的全部方式，遇到第一个失败即返回 `VerificationFailed`
    ///
    /// 成功时返回实际参与验证的方式。
    pub fn verify_all(
        &self,
        task: &Task,
        supplied: &VerificationPayload,
    ) -> CheckinResult<Vec<VerificationMethod>> {
        let methods = task.policy.enabled_methods();
        for method in &methods {
            let outcome = self.verify(*method, task, supplied)?;
            if !outcome.valid {
                return Err(CheckinError::verification_failed(
                    method.as_str(),
                    outcome.reason.unwrap_or_else(|| "验证未通过".to_string()),
                ));
            }
        }
        Ok(methods)
    }

    fn verify_gps(&self, task: &Task, supplied: &VerificationPayload) -> VerificationOutcome {
        let (Some(policy), Some(data)) = (&task.policy.gps, &supplied.gps) else {
            return VerificationOutcome::failed("缺少位置信息");
        };
        if !data.latitude.is_finite() || !data.longitude.is_finite() {
            return VerificationOutcome::failed("无效的经纬度");
        }
        let distance = haversine_distance_meters(
            policy.latitude,
            policy.longitude,
            data.latitude,
            data.longitude,
        );
        if distance <= f64::from(policy.radius) {
            VerificationOutcome::passed()
        } else {
            VerificationOutcome::failed(format!(
                "距离签到点{distance:.1}米，超出签到范围{}米",
                policy.radius
            ))
        }
    }

    fn verify_wifi(&self, task: &Task, supplied: &VerificationPayload) -> VerificationOutcome {
        let (Some(policy), Some(data)) = (&task.policy.wifi, &supplied.wifi) else {
            return VerificationOutcome::failed("缺少WiFi信息");
        };
        if policy.ssid == data.ssid && policy.bssid == data.bssid {
            VerificationOutcome::passed()
        } else {
            VerificationOutcome::failed("WiFi信息不匹配")
        }
    }

    fn verify_nfc(&self, task: &Task, supplied: &VerificationPayload) -> VerificationOutcome {
        let (Some(policy), Some(data)) = (&task.policy.nfc, &supplied.nfc) else {
            return VerificationOutcome::failed("缺少NFC标签信息");
        };
        if policy.tag_id != data.tag_id {
            return VerificationOutcome::failed("NFC标签不匹配");
        }
        match (&policy.tag_name, &data.tag_name) {
            (Some(expected), Some(actual)) if expected != actual => {
                VerificationOutcome::failed("NFC标签名称不匹配")
            }
            _ => VerificationOutcome::passed(),
        }
    }

    fn verify_face(&self, task: &Task, supplied: &VerificationPayload) -> VerificationOutcome {
        match &supplied.face {
            Some(face) if !face.image.trim().is_empty() => {
                if self.face_matcher.matches(task, face) {
                    VerificationOutcome::passed()
                } else {
                    VerificationOutcome::failed("人脸比对未通过")
                }
            }
            _ => VerificationOutcome::failed("缺少人脸数据"),
        }
    }
}
