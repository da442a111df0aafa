use crate::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const DEFAULT_PH: f64 = 0.0;
pub const DEFAULT_BOD: f64 = 0.0;
pub const DEFAULT_COD: f64 = 0.0;
pub const DEFAULT_TSS: f64 = 0.0;
pub const DEFAULT_FLOW: f64 = 0.0;
pub const DEFAULT_TEMPERATURE: f64 = 25.0;
pub const DEFAULT_DISSOLVED_OXYGEN: f64 = 6.0;
pub const DEFAULT_CONDUCTIVITY: f64 = 1000.0;
pub const DEFAULT_TURBIDITY: f64 = 2.0;

/// Field names written by the field HMI into the live feed.
pub mod live_keys {
    pub const PH: &str = "PH";
    pub const BOD: &str = "BOD";
    pub const COD: &str = "COD";
    pub const TSS: &str = "TSS";
    pub const FLOW: &str = "Flow";
    pub const TEMPERATURE: &str = "Temperature";
    pub const DISSOLVED_OXYGEN: &str = "DO";
    pub const CONDUCTIVITY: &str = "Conductivity";
    pub const TURBIDITY: &str = "Turbidity";
    pub const HARDNESS: &str = "Hardness";
    pub const TIMESTAMP: &str = "Timestamp";
}

/// Latest value pushed by a device, exactly as the HMI wrote it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSnapshot(pub Map<String, Value>);

impl RawSnapshot {
    /// Payloads must be a JSON object.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Numeric value of `key`. Numeric strings are accepted; anything
    /// absent, null, unparseable or non-finite is treated as missing.
    pub fn number(&self, key: &str) -> Option<f64> {
        let value = match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        value.is_finite().then_some(value)
    }

    /// Capture time reported by the device: RFC 3339 or epoch milliseconds.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.0.get(live_keys::TIMESTAMP)? {
            Value::String(s) => {
                let s = s.trim();
                DateTime::parse_from_rfc3339(s)
                    .map(|t| t.with_timezone(&Utc))
                    .ok()
                    .or_else(|| s.parse::<i64>().ok().and_then(DateTime::<Utc>::from_timestamp_millis))
            }
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            _ => None,
        }
    }
}

/// Row of the history store. Numeric columns are nullable; defaults are
/// applied only when a record becomes a [`SensorReading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoricalRecord {
    pub id: Uuid,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "pH")]
    pub ph: Option<f64>,
    #[serde(rename = "BOD")]
    pub bod: Option<f64>,
    #[serde(rename = "COD")]
    pub cod: Option<f64>,
    #[serde(rename = "TSS")]
    pub tss: Option<f64>,
    pub flow: Option<f64>,
    pub temperature: Option<f64>,
    #[serde(rename = "DO")]
    pub dissolved_oxygen: Option<f64>,
    pub conductivity: Option<f64>,
    pub turbidity: Option<f64>,
}

impl HistoricalRecord {
    /// History row for a live snapshot; missing fields stay missing.
    pub fn from_snapshot(device_id: &str, snapshot: &RawSnapshot, received_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            timestamp: snapshot.timestamp().unwrap_or(received_at),
            ph: snapshot.number(live_keys::PH),
            bod: snapshot.number(live_keys::BOD),
            cod: snapshot.number(live_keys::COD),
            tss: snapshot.number(live_keys::TSS),
            flow: snapshot.number(live_keys::FLOW),
            temperature: snapshot.number(live_keys::TEMPERATURE),
            dissolved_oxygen: snapshot.number(live_keys::DISSOLVED_OXYGEN),
            conductivity: snapshot.number(live_keys::CONDUCTIVITY),
            turbidity: snapshot.number(live_keys::TURBIDITY),
        }
    }
}

/// A point-in-time measurement for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub ph: f64,
    pub bod: f64,
    pub cod: f64,
    pub tss: f64,
    pub flow: f64,
    pub temperature: f64,
    pub dissolved_oxygen: f64,
    pub conductivity: f64,
    pub turbidity: f64,
    /// Reconstructed from history rather than the live feed.
    pub is_offline: bool,
    /// Set only when `is_offline`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_online_time: Option<DateTime<Utc>>,
}

impl SensorReading {
    pub fn from_live(device_id: &str, snapshot: &RawSnapshot, received_at: DateTime<Utc>) -> Self {
        Self {
            id: device_id.to_string(),
            device_id: device_id.to_string(),
            timestamp: snapshot.timestamp().unwrap_or(received_at),
            ph: snapshot.number(live_keys::PH).unwrap_or(DEFAULT_PH),
            bod: snapshot.number(live_keys::BOD).unwrap_or(DEFAULT_BOD),
            cod: snapshot.number(live_keys::COD).unwrap_or(DEFAULT_COD),
            tss: snapshot.number(live_keys::TSS).unwrap_or(DEFAULT_TSS),
            flow: snapshot.number(live_keys::FLOW).unwrap_or(DEFAULT_FLOW),
            temperature: snapshot
                .number(live_keys::TEMPERATURE)
                .unwrap_or(DEFAULT_TEMPERATURE),
            dissolved_oxygen: snapshot
                .number(live_keys::DISSOLVED_OXYGEN)
                .unwrap_or(DEFAULT_DISSOLVED_OXYGEN),
            conductivity: snapshot
                .number(live_keys::CONDUCTIVITY)
                .unwrap_or(DEFAULT_CONDUCTIVITY),
            turbidity: snapshot
                .number(live_keys::TURBIDITY)
                .unwrap_or(DEFAULT_TURBIDITY),
            is_offline: false,
            last_online_time: None,
        }
    }

    pub fn from_record(record: &HistoricalRecord) -> Self {
        Self {
            id: record.id.to_string(),
            device_id: record.device_id.clone(),
            timestamp: record.timestamp,
            ph: finite_or(record.ph, DEFAULT_PH),
            bod: finite_or(record.bod, DEFAULT_BOD),
            cod: finite_or(record.cod, DEFAULT_COD),
            tss: finite_or(record.tss, DEFAULT_TSS),
            flow: finite_or(record.flow, DEFAULT_FLOW),
            temperature: finite_or(record.temperature, DEFAULT_TEMPERATURE),
            dissolved_oxygen: finite_or(record.dissolved_oxygen, DEFAULT_DISSOLVED_OXYGEN),
            conductivity: finite_or(record.conductivity, DEFAULT_CONDUCTIVITY),
            turbidity: finite_or(record.turbidity, DEFAULT_TURBIDITY),
            is_offline: true,
            last_online_time: Some(record.timestamp),
        }
    }
}

fn finite_or(value: Option<f64>, default: f64) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(default)
}

/// What a consumer sees for the device it observes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveView {
    pub device_id: Option<String>,
    pub current_reading: Option<SensorReading>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_data_received_at: Option<DateTime<Utc>>,
    pub seconds_until_refresh: u32,
    pub is_offline: bool,
    pub offline_since: Option<DateTime<Utc>>,
    pub loading: bool,
    pub error: Option<String>,
    pub no_data: bool,
}

impl LiveView {
    /// View published while no device is observed.
    pub fn idle(refresh_period_secs: u32) -> Self {
        Self {
            device_id: None,
            current_reading: None,
            last_updated: None,
            last_data_received_at: None,
            seconds_until_refresh: refresh_period_secs,
            is_offline: false,
            offline_since: None,
            loading: false,
            error: None,
            no_data: false,
        }
    }
}

/// Process parameters handed to fault diagnosis, with their own defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessParameters {
    #[serde(rename = "pH")]
    pub ph: f64,
    pub temperature: f64,
    pub tss: f64,
    pub cod: f64,
    pub bod: f64,
    pub hardness: f64,
}

impl ProcessParameters {
    pub fn from_snapshot(snapshot: &RawSnapshot) -> Self {
        Self {
            ph: snapshot.number(live_keys::PH).unwrap_or(7.0),
            temperature: snapshot.number(live_keys::TEMPERATURE).unwrap_or(45.0),
            tss: snapshot.number(live_keys::TSS).unwrap_or(150.0),
            cod: snapshot.number(live_keys::COD).unwrap_or(350.0),
            bod: snapshot.number(live_keys::BOD).unwrap_or(120.0),
            hardness: snapshot.number(live_keys::HARDNESS).unwrap_or(200.0),
        }
    }
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<HistoricalRecord>,
    pub total: usize,
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use chrono::TimeZone;
    use serde_json::json;

    fn snapshot(value: Value) -> RawSnapshot {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_undecodable_payload_is_json_error() {
        assert!(matches!(RawSnapshot::from_slice(b"not json"), Err(Error::Json(_))));
        assert!(matches!(RawSnapshot::from_slice(b"[7.1, 8]"), Err(Error::Json(_))));
        assert_eq!(
            RawSnapshot::from_slice(br#"{"PH": 7.1}"#).unwrap().number("PH"),
            Some(7.1)
        );
    }

    #[test]
    fn test_live_defaults_for_missing_fields() {
        let received = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let reading = SensorReading::from_live("dev-1", &snapshot(json!({ "PH": 7.2 })), received);

        assert_eq!(reading.ph, 7.2);
        assert_eq!(reading.bod, 0.0);
        assert_eq!(reading.cod, 0.0);
        assert_eq!(reading.tss, 0.0);
        assert_eq!(reading.flow, 0.0);
        assert_eq!(reading.temperature, 25.0);
        assert_eq!(reading.dissolved_oxygen, 6.0);
        assert_eq!(reading.conductivity, 1000.0);
        assert_eq!(reading.turbidity, 2.0);
        assert!(!reading.is_offline);
        assert_eq!(reading.last_online_time, None);
        assert_eq!(reading.timestamp, received);
    }

    #[test]
    fn test_live_field_names_are_remapped() {
        let received = Utc::now();
        let reading = SensorReading::from_live(
            "dev-1",
            &snapshot(json!({
                "PH": 6.9, "BOD": 20, "COD": 80, "TSS": 12, "Flow": 3.5,
                "Temperature": 18.5, "DO": 4.2, "Conductivity": 850, "Turbidity": 1.1
            })),
            received,
        );

        assert_eq!(reading.ph, 6.9);
        assert_eq!(reading.bod, 20.0);
        assert_eq!(reading.flow, 3.5);
        assert_eq!(reading.temperature, 18.5);
        assert_eq!(reading.dissolved_oxygen, 4.2);
        assert_eq!(reading.conductivity, 850.0);
        assert_eq!(reading.turbidity, 1.1);
    }

    #[test]
    fn test_unusable_values_fall_back_to_defaults() {
        let reading = SensorReading::from_live(
            "dev-1",
            &snapshot(json!({ "Temperature": null, "DO": "n/a", "Conductivity": "NaN", "Turbidity": "3.5" })),
            Utc::now(),
        );

        assert_eq!(reading.temperature, 25.0);
        assert_eq!(reading.dissolved_oxygen, 6.0);
        assert_eq!(reading.conductivity, 1000.0);
        assert_eq!(reading.turbidity, 3.5);
    }

    #[test]
    fn test_explicit_zero_is_kept() {
        let reading =
            SensorReading::from_live("dev-1", &snapshot(json!({ "Temperature": 0 })), Utc::now());
        assert_eq!(reading.temperature, 0.0);
    }

    #[test]
    fn test_snapshot_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let rfc = snapshot(json!({ "Timestamp": "2024-03-01T12:00:00Z" }));
        assert_eq!(rfc.timestamp(), Some(expected));

        let millis = snapshot(json!({ "Timestamp": expected.timestamp_millis() }));
        assert_eq!(millis.timestamp(), Some(expected));

        let garbage = snapshot(json!({ "Timestamp": "yesterday" }));
        assert_eq!(garbage.timestamp(), None);
    }

    #[test]
    fn test_record_defaults_and_offline_marking() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let record: HistoricalRecord = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "deviceId": "dev-1",
            "timestamp": ts,
            "pH": 7.4,
            "flow": 2.0
        }))
        .unwrap();

        let reading = SensorReading::from_record(&record);
        assert_eq!(reading.ph, 7.4);
        assert_eq!(reading.flow, 2.0);
        assert_eq!(reading.temperature, 25.0);
        assert_eq!(reading.dissolved_oxygen, 6.0);
        assert_eq!(reading.conductivity, 1000.0);
        assert_eq!(reading.turbidity, 2.0);
        assert!(reading.is_offline);
        assert_eq!(reading.last_online_time, Some(ts));
    }

    #[test]
    fn test_process_parameters_defaults() {
        let params = ProcessParameters::from_snapshot(&snapshot(json!({ "PH": 8.1 })));
        assert_eq!(params.ph, 8.1);
        assert_eq!(params.temperature, 45.0);
        assert_eq!(params.tss, 150.0);
        assert_eq!(params.cod, 350.0);
        assert_eq!(params.bod, 120.0);
        assert_eq!(params.hardness, 200.0);
    }
}
