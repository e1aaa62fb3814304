//! Test data builders for creating test entities
//!
//! Builders start from an ongoing task with no verification methods enabled.

use chrono::{DateTime, Duration, Utc};
use checkin_domain::{
    FaceData, GpsData, GpsPolicy, NewTask, NfcData, NfcPolicy, TaskFields, TaskWindow,
    VerificationPayload, VerificationPolicy, WifiData, WifiPolicy,
};

/// Builder for [`NewTask`] and [`TaskFields`]
pub struct NewTaskBuilder {
    group_id: i64,
    name: String,
    description: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: VerificationPolicy,
}

impl NewTaskBuilder {
    pub fn new(group_id: i64) -> Self {
        let now = Utc::now();
        Self {
            group_id,
            name: "test_task".to_string(),
            description: String::new(),
            start: now - Duration::hours(1),
            end: now + Duration::hours(1),
            policy: VerificationPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_gps(mut self, latitude: f64, longitude: f64, radius: u32) -> Self {
        self.policy.gps = Some(GpsPolicy {
            latitude,
            longitude,
            radius,
        });
        self
    }

    pub fn with_wifi(mut self, ssid: &str, bssid: &str) -> Self {
        self.policy.wifi = Some(WifiPolicy {
            ssid: ssid.to_string(),
            bssid: bssid.to_string(),
        });
        self
    }

    pub fn with_nfc(mut self, tag_id: &str, tag_name: Option<&str>) -> Self {
        self.policy.nfc = Some(NfcPolicy {
            tag_id: tag_id.to_string(),
            tag_name: tag_name.map(str::to_string),
        });
        self
    }

    pub fn with_face(mut self) -> Self {
        self.policy.face = true;
        self
    }

    pub fn fields(self) -> TaskFields {
        TaskFields {
            name: self.name,
            description: self.description,
            window: TaskWindow::new(self.start, self.end).expect("test window must be valid"),
            policy: self.policy,
        }
    }

    pub fn build(self) -> NewTask {
        let group_id = self.group_id;
        NewTask {
            group_id,
            fields: self.fields(),
        }
    }
}

/// Builder for [`VerificationPayload`]
#[derive(Default)]
pub struct PayloadBuilder {
    payload: VerificationPayload,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gps(mut self, latitude: f64, longitude: f64) -> Self {
        self.payload.gps = Some(GpsData {
            latitude,
            longitude,
        });
        self
    }

    pub fn wifi(mut self, ssid: &str, bssid: &str) -> Self {
        self.payload.wifi = Some(WifiData {
            ssid: ssid.to_string(),
            bssid: bssid.to_string(),
        });
        self
    }

    pub fn nfc(mut self, tag_id: &str, tag_name: Option<&str>) -> Self {
        self.payload.nfc = Some(NfcData {
            tag_id: tag_id.to_string(),
            tag_name: tag_name.map(str::to_string),
        });
        self
    }

    pub fn face(mut self, image: &str) -> Self {
        self.payload.face = Some(FaceData {
            image: image.to_string(),
        });
        self
    }

    pub fn build(self) -> VerificationPayload {
        self.payload
    }
}

/// Degrees of latitude per meter on the reference sphere
pub const DEGREES_PER_METER: f64 = 1.0 / 111_194.93;

/// A point `meters` north of `(latitude, longitude)`
pub fn point_north_of(latitude: f64, longitude: f64, meters: f64) -> (f64, f64) {
    (latitude + meters * DEGREES_PER_METER, longitude)
}
