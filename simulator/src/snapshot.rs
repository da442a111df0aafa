use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// Retained live value as the plant HMI publishes it. Sensors that did not
/// report are left out of the payload.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(rename = "PH", skip_serializing_if = "Option::is_none")]
    pub ph: Option<f64>,
    #[serde(rename = "BOD", skip_serializing_if = "Option::is_none")]
    pub bod: Option<f64>,
    #[serde(rename = "COD", skip_serializing_if = "Option::is_none")]
    pub cod: Option<f64>,
    #[serde(rename = "TSS", skip_serializing_if = "Option::is_none")]
    pub tss: Option<f64>,
    #[serde(rename = "Flow", skip_serializing_if = "Option::is_none")]
    pub flow: Option<f64>,
    #[serde(rename = "Temperature", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "DO", skip_serializing_if = "Option::is_none")]
    pub dissolved_oxygen: Option<f64>,
    #[serde(rename = "Conductivity", skip_serializing_if = "Option::is_none")]
    pub conductivity: Option<f64>,
    #[serde(rename = "Turbidity", skip_serializing_if = "Option::is_none")]
    pub turbidity: Option<f64>,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// Plausible influent values. Each field is dropped with probability
    /// `drop_rate` and about 3% of pH values are out of range.
    pub fn generate(rng: &mut impl Rng, drop_rate: f64) -> Self {
        let mut field = |low: f64, high: f64| -> Option<f64> {
            if rng.gen_bool(drop_rate) {
                None
            } else {
                Some(round2(rng.gen_range(low..high)))
            }
        };

        let ph = field(6.0, 9.0);
        let bod = field(10.0, 60.0);
        let cod = field(40.0, 160.0);
        let tss = field(5.0, 50.0);
        let flow = field(0.5, 12.0);
        let temperature = field(12.0, 32.0);
        let dissolved_oxygen = field(2.0, 9.0);
        let conductivity = field(400.0, 1800.0);
        let turbidity = field(0.5, 8.0);

        let ph = if rng.gen_bool(0.03) {
            Some(round2(rng.gen_range(14.5..16.0)))
        } else {
            ph
        };

        Snapshot {
            ph,
            bod,
            cod,
            tss,
            flow,
            temperature,
            dissolved_oxygen,
            conductivity,
            turbidity,
            timestamp: Utc::now(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
