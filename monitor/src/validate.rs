use crate::errors::{Error, Result};
use crate::model::HistoricalRecord;

const PH_MIN: f64 = 0.0;
const PH_MAX: f64 = 14.0;
const TEMP_MIN: f64 = -10.0;
const TEMP_MAX: f64 = 100.0;

/// Validates a history row before it is archived. Missing fields pass.
pub fn validate(record: &HistoricalRecord) -> Result<()> {
    // Validate device_id
    if record.device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    // Validate pH
    if let Some(ph) = record.ph {
        if !(PH_MIN..=PH_MAX).contains(&ph) {
            return Err(Error::Validation(format!(
                "pH {} out of range [{}, {}]",
                ph, PH_MIN, PH_MAX
            )));
        }
    }

    // Validate temperature
    if let Some(temperature) = record.temperature {
        if !(TEMP_MIN..=TEMP_MAX).contains(&temperature) {
            return Err(Error::Validation(format!(
                "Temperature {} out of range [{}, {}]",
                temperature, TEMP_MIN, TEMP_MAX
            )));
        }
    }

    let non_negative = [
        ("BOD", record.bod),
        ("COD", record.cod),
        ("TSS", record.tss),
        ("Flow", record.flow),
        ("DO", record.dissolved_oxygen),
        ("Conductivity", record.conductivity),
        ("Turbidity", record.turbidity),
    ];
    for (name, value) in non_negative {
        if let Some(value) = value {
            if value < 0.0 {
                return Err(Error::Validation(format!("{} {} cannot be negative", name, value)));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn record() -> HistoricalRecord {
        HistoricalRecord {
            id: Uuid::new_v4(),
            device_id: "dev-1".to_string(),
            timestamp: Utc::now(),
            ph: Some(7.2),
            bod: Some(25.0),
            cod: Some(90.0),
            tss: Some(18.0),
            flow: Some(4.0),
            temperature: Some(22.0),
            dissolved_oxygen: Some(5.5),
            conductivity: Some(900.0),
            turbidity: Some(1.5),
        }
    }

    #[test]
    fn test_valid_record() {
        assert!(validate(&record()).is_ok());
    }

    #[test]
    fn test_missing_fields_pass() {
        let record = HistoricalRecord {
            ph: None,
            temperature: None,
            turbidity: None,
            ..record()
        };

        assert!(validate(&record).is_ok());
    }

    #[test]
    fn test_invalid_ph() {
        let record = HistoricalRecord {
            ph: Some(15.0), // Out of range
            ..record()
        };

        assert!(validate(&record).is_err());
    }

    #[test]
    fn test_invalid_temperature() {
        let record = HistoricalRecord {
            temperature: Some(150.0), // Out of range
            ..record()
        };

        assert!(validate(&record).is_err());
    }

    #[test]
    fn test_negative_concentration() {
        let record = HistoricalRecord {
            cod: Some(-1.0),
            ..record()
        };

        assert!(validate(&record).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        let record = HistoricalRecord {
            device_id: "".to_string(),
            ..record()
        };

        assert!(validate(&record).is_err());
    }
}
