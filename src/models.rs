use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// WHO/ESC blood pressure classification.
///
/// Rules are evaluated in order and short-circuit on first match, so an
/// isolated high systolic *or* diastolic value raises the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Optimal,
    Normal,
    HighNormal,
    Grade1Hypertension,
    Grade2Hypertension,
    Grade3Hypertension,
}

impl Category {
    pub fn classify(systolic: u32, diastolic: u32) -> Category {
        if systolic < 120 && diastolic < 80 {
            Category::Optimal
        } else if systolic < 130 && diastolic < 85 {
            Category::Normal
        } else if systolic < 140 && diastolic < 90 {
            Category::HighNormal
        } else if systolic < 160 && diastolic < 100 {
            Category::Grade1Hypertension
        } else if systolic < 180 && diastolic < 110 {
            Category::Grade2Hypertension
        } else {
            Category::Grade3Hypertension
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Optimal => "optimal",
            Category::Normal => "normal",
            Category::HighNormal => "high_normal",
            Category::Grade1Hypertension => "grade1_hypertension",
            Category::Grade2Hypertension => "grade2_hypertension",
            Category::Grade3Hypertension => "grade3_hypertension",
        }
    }
}

/// A single decoded blood-pressure measurement from an OMRON monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodPressureReading {
    pub timestamp: NaiveDateTime,
    pub systolic: u32,
    pub diastolic: u32,
    pub pulse: u32,
    pub irregular_heartbeat: bool,
    pub body_movement: bool,
    /// 1-indexed user slot on the device.
    pub user_slot: u32,
}

impl BloodPressureReading {
    pub fn category(&self) -> Category {
        Category::classify(self.systolic, self.diastolic)
    }

    /// Deterministic textual fingerprint used as the ledger's primary key.
    ///
    /// Depends on `user_slot`: identical vitals recorded under different
    /// user slots are distinct events.
    pub fn record_hash(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S"),
            self.systolic,
            self.diastolic,
            self.pulse,
            self.user_slot,
        )
    }
}

/// A ledger row as stored and returned by history/statistics queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    pub id: i64,
    pub fingerprint: String,
    pub timestamp: NaiveDateTime,
    pub systolic: u32,
    pub diastolic: u32,
    pub pulse: u32,
    pub irregular_heartbeat: bool,
    pub body_movement: bool,
    pub user_slot: u32,
    pub category: String,
    pub uploaded_at: NaiveDateTime,
    pub cloud_delivered: bool,
    pub bus_delivered: bool,
}

/// Aggregate statistics over a set of ledger rows.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerStatistics {
    pub total_records: i64,
    pub cloud_delivered: i64,
    pub bus_delivered: i64,
    pub first_record: Option<NaiveDateTime>,
    pub last_record: Option<NaiveDateTime>,
    pub avg_systolic: Option<f64>,
    pub avg_diastolic: Option<f64>,
    pub avg_pulse: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(sys: u32, dia: u32) -> BloodPressureReading {
        BloodPressureReading {
            timestamp: chrono::NaiveDate::from_ymd_opt(2025, 12, 26)
                .unwrap()
                .and_hms_opt(22, 59, 22)
                .unwrap(),
            systolic: sys,
            diastolic: dia,
            pulse: 73,
            irregular_heartbeat: false,
            body_movement: false,
            user_slot: 1,
        }
    }

    #[test]
    fn category_classification_s6() {
        assert_eq!(reading(110, 70).category(), Category::Optimal);
        assert_eq!(reading(120, 80).category(), Category::Normal);
        assert_eq!(reading(130, 85).category(), Category::HighNormal);
        assert_eq!(reading(140, 90).category(), Category::Grade1Hypertension);
        assert_eq!(reading(160, 100).category(), Category::Grade2Hypertension);
        assert_eq!(reading(180, 110).category(), Category::Grade3Hypertension);
        // Isolated high systolic rule
        assert_eq!(reading(180, 70).category(), Category::Grade3Hypertension);
    }

    #[test]
    fn fingerprint_determinism() {
        let a = reading(139, 83);
        let b = reading(139, 83);
        assert_eq!(a.record_hash(), b.record_hash());

        let mut c = reading(139, 83);
        c.user_slot = 2;
        assert_ne!(a.record_hash(), c.record_hash());

        let mut d = reading(139, 83);
        d.pulse = 99;
        assert_ne!(a.record_hash(), d.record_hash());
    }

    #[test]
    fn s1_decode_matches_expected_fingerprint_fields() {
        let r = reading(139, 83);
        assert_eq!(r.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(), "2025-12-26T22:59:22");
        assert_eq!(r.systolic, 139);
        assert_eq!(r.diastolic, 83);
        assert_eq!(r.pulse, 73);
        assert!(!r.irregular_heartbeat);
        assert!(!r.body_movement);
    }
}
