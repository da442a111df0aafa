use crate::model::SensorReading;
use serde::Serialize;

/// Chemical dosing recommendation for a reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub chemical: String,
    pub quantity: f64,
    pub dosage_unit: String,
    pub fault: Option<String>,
    pub efficiency: f64,
}

/// Dosing/fault model. Implementations must be pure.
pub trait Predictor: Send + Sync {
    fn predict(&self, reading: &SensorReading) -> Prediction;
}

/// Fixed threshold rules used until a trained model is plugged in.
#[derive(Debug, Clone, Copy, Default)]
pub struct DosingRules;

impl Predictor for DosingRules {
    fn predict(&self, reading: &SensorReading) -> Prediction {
        let (chemical, quantity, mut efficiency) = if reading.ph < 6.5 {
            ("Lime", 50.0, 92.0)
        } else if reading.ph > 8.5 {
            ("Sulfuric Acid", 30.0, 90.0)
        } else {
            ("Alum", 40.0, 95.0)
        };

        let mut faults = Vec::new();
        if reading.bod > 40.0 || reading.cod > 100.0 {
            faults.push("High organic content detected");
            efficiency = 85.0;
        }
        if reading.tss > 30.0 {
            faults.push("High suspended solids");
            efficiency = 80.0;
        }

        Prediction {
            chemical: chemical.to_string(),
            quantity,
            dosage_unit: "ml/L".to_string(),
            fault: (!faults.is_empty()).then(|| faults.join(", ")),
            efficiency,
        }
    }
}
