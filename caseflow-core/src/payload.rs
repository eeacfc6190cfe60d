//! Stage Result Payloads
//!
//! One concrete record type per stage, validated structurally at the
//! coordinator boundary. Each payload renders to a flat column map for the
//! store, plus a reduced fallback shape used when the store reports that
//! some columns are missing.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stage::{Stage, StageStatus};

/// Upper bound accepted for a single payment.
pub const MAX_PAYMENT_AMOUNT: i64 = 1_000_000;

/// Minimum length of an official receipt number.
pub const MIN_OR_NUMBER_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Gcash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub or_number: String,
    pub amount: Decimal,
    pub method: PaymentMethod,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageRecord {
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub systolic: Option<f64>,
    pub diastolic: Option<f64>,
    pub heart_rate: Option<f64>,
    pub temperature_c: Option<f64>,
    pub chief_complaint: Option<String>,
    pub allergies: Option<String>,
    pub fit_for_exam: Option<bool>,
    pub triage_notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreeningOutcome {
    Negative,
    Positive,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabResult {
    pub cbc_hemoglobin: Option<f64>,
    pub cbc_hematocrit: Option<f64>,
    pub cbc_platelet: Option<f64>,
    pub cbc_rbc_count: Option<f64>,
    pub cbc_wbc_count: Option<f64>,
    pub fbs: Option<f64>,
    pub rbs: Option<f64>,
    pub ua_ph: Option<f64>,
    pub ua_specific_gravity: Option<f64>,
    pub blood_typing: Option<String>,
    pub urinalysis: Option<String>,
    pub fecalysis: Option<String>,
    pub drug_test: Option<ScreeningOutcome>,
    pub hbsag: Option<ScreeningOutcome>,
    pub pregnancy_test: Option<ScreeningOutcome>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XrayResult {
    pub exam_date: Option<NaiveDate>,
    pub case_no: Option<String>,
    pub examination: Option<String>,
    pub findings: Option<String>,
    pub impression: Option<String>,
    pub normal: Option<bool>,
    pub remarks: Option<String>,
    /// Storage key of the radiograph; content lives in the artifact store
    pub artifact_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fitness {
    Fit,
    Unfit,
    PendingFurtherTests,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoctorReport {
    pub evaluation: Option<String>,
    pub remarks: Option<String>,
    pub recommendations: Option<String>,
    pub fitness: Option<Fitness>,
    pub examining_physician: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseRecord {
    pub released_to: Option<String>,
    pub notes: Option<String>,
}

/// Stage-specific result content, tagged by stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageResult {
    Payment(PaymentRecord),
    Triage(TriageRecord),
    Lab(LabResult),
    Xray(XrayResult),
    Doctor(DoctorReport),
    Release(ReleaseRecord),
}

/// Flat column map destined for one result table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub table: String,
    pub fields: Map<String, Value>,
}

impl ResultRecord {
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Drop the named columns.
    pub fn without_columns(mut self, columns: &[String]) -> Self {
        for col in columns {
            self.fields.remove(col);
        }
        self
    }
}

/// Result table that holds content for `stage`.
pub fn result_table(stage: Stage) -> &'static str {
    match stage {
        Stage::Payment => "payments",
        Stage::Triage => "triage_records",
        Stage::Lab => "lab_results",
        Stage::Xray => "xray_results",
        Stage::Doctor => "doctor_reports",
        Stage::Release => "report_releases",
    }
}

impl StageResult {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Payment(_) => Stage::Payment,
            Self::Triage(_) => Stage::Triage,
            Self::Lab(_) => Stage::Lab,
            Self::Xray(_) => Stage::Xray,
            Self::Doctor(_) => Stage::Doctor,
            Self::Release(_) => Stage::Release,
        }
    }

    /// Whether moving `stage` to `status` must carry result content.
    pub fn required_for(stage: Stage, status: StageStatus) -> bool {
        matches!(
            (stage, status),
            (Stage::Payment, StageStatus::Completed)
                | (Stage::Xray, StageStatus::Completed)
                | (Stage::Doctor, StageStatus::Completed)
        )
    }

    /// Structural checks for a payload accompanying `stage -> status`.
    pub fn validate_for(&self, stage: Stage, status: StageStatus) -> Result<(), String> {
        if self.stage() != stage {
            return Err(format!(
                "{} payload supplied for {} stage",
                self.stage(),
                stage
            ));
        }
        self.validate_draft()?;

        match (self, status) {
            (Self::Payment(p), StageStatus::Completed) => p.validate(),
            (Self::Xray(x), StageStatus::Uploaded) => {
                if non_blank(&x.artifact_key) {
                    Ok(())
                } else {
                    Err("an uploaded X-ray needs an artifact key".into())
                }
            }
            (Self::Xray(x), StageStatus::Completed) => {
                if non_blank(&x.findings) {
                    Ok(())
                } else {
                    Err("findings are required to finalize the reading".into())
                }
            }
            (Self::Doctor(d), StageStatus::Completed) => {
                if non_blank(&d.evaluation) {
                    Ok(())
                } else {
                    Err("evaluation is required".into())
                }
            }
            _ => Ok(()),
        }
    }

    /// Checks that apply to every save, including drafts.
    pub fn validate_draft(&self) -> Result<(), String> {
        match self {
            Self::Triage(t) => check_measurements(&[
                ("height_cm", t.height_cm),
                ("weight_kg", t.weight_kg),
                ("systolic", t.systolic),
                ("diastolic", t.diastolic),
                ("heart_rate", t.heart_rate),
                ("temperature_c", t.temperature_c),
            ]),
            Self::Lab(l) => check_measurements(&[
                ("cbc_hemoglobin", l.cbc_hemoglobin),
                ("cbc_hematocrit", l.cbc_hematocrit),
                ("cbc_platelet", l.cbc_platelet),
                ("cbc_rbc_count", l.cbc_rbc_count),
                ("cbc_wbc_count", l.cbc_wbc_count),
                ("fbs", l.fbs),
                ("rbs", l.rbs),
                ("ua_ph", l.ua_ph),
                ("ua_specific_gravity", l.ua_specific_gravity),
            ]),
            Self::Payment(p) if p.amount.is_sign_negative() => {
                Err("amount must not be negative".into())
            }
            _ => Ok(()),
        }
    }

    /// Full column map for the result table.
    pub fn to_record(&self) -> Result<ResultRecord, serde_json::Error> {
        let value = match self {
            Self::Payment(p) => serde_json::to_value(p)?,
            Self::Triage(t) => serde_json::to_value(t)?,
            Self::Lab(l) => serde_json::to_value(l)?,
            Self::Xray(x) => serde_json::to_value(x)?,
            Self::Doctor(d) => serde_json::to_value(d)?,
            Self::Release(r) => serde_json::to_value(r)?,
        };
        Ok(ResultRecord {
            table: result_table(self.stage()).to_string(),
            fields: into_object(value),
        })
    }

    /// Reduced shape accepted by older schemas.
    ///
    /// X-ray folds impression, exam and normal flag into `remarks`; the
    /// physician report folds its narrative fields into `notes`. Other
    /// stages keep their full shape and rely on column stripping.
    pub fn fallback_record(&self) -> Result<ResultRecord, serde_json::Error> {
        let table = result_table(self.stage()).to_string();
        let fields = match self {
            Self::Xray(x) => {
                let mut fields = Map::new();
                fields.insert("exam_date".into(), serde_json::to_value(x.exam_date)?);
                fields.insert("case_no".into(), serde_json::to_value(&x.case_no)?);
                fields.insert("findings".into(), serde_json::to_value(&x.findings)?);
                fields.insert("remarks".into(), serde_json::to_value(fold_xray_remarks(x))?);
                fields.insert("artifact_key".into(), serde_json::to_value(&x.artifact_key)?);
                fields
            }
            Self::Doctor(d) => {
                let mut fields = Map::new();
                fields.insert("notes".into(), serde_json::to_value(fold_doctor_notes(d))?);
                fields.insert("fitness".into(), serde_json::to_value(d.fitness)?);
                fields
            }
            _ => return self.to_record(),
        };
        Ok(ResultRecord { table, fields })
    }
}

impl PaymentRecord {
    fn validate(&self) -> Result<(), String> {
        if self.or_number.trim().len() < MIN_OR_NUMBER_LEN {
            return Err(format!(
                "OR number must be at least {} characters",
                MIN_OR_NUMBER_LEN
            ));
        }
        if self.amount <= Decimal::ZERO || self.amount > Decimal::from(MAX_PAYMENT_AMOUNT) {
            return Err(format!(
                "amount must be greater than 0 and at most {}",
                MAX_PAYMENT_AMOUNT
            ));
        }
        if self.method == PaymentMethod::Gcash && !non_blank(&self.reference) {
            return Err("GCash payments need a reference number".into());
        }
        Ok(())
    }
}

fn non_blank(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

fn check_measurements(values: &[(&str, Option<f64>)]) -> Result<(), String> {
    for (name, value) in values {
        if let Some(v) = value {
            if !v.is_finite() || *v < 0.0 {
                return Err(format!("{} must be a non-negative number", name));
            }
        }
    }
    Ok(())
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn fold_xray_remarks(x: &XrayResult) -> Option<String> {
    let mut remarks = x.impression.clone().unwrap_or_default();
    if let Some(exam) = x.examination.as_deref().filter(|s| !s.is_empty()) {
        remarks.push_str(&format!(" | Exam: {}", exam));
    }
    if let Some(normal) = x.normal {
        remarks.push_str(if normal { " | Normal: Yes" } else { " | Normal: No" });
    }
    if let Some(extra) = x.remarks.as_deref().filter(|s| !s.is_empty()) {
        remarks.push_str(&format!(" | {}", extra));
    }
    let remarks = remarks.trim().trim_start_matches('|').trim().to_string();
    (!remarks.is_empty()).then_some(remarks)
}

fn fold_doctor_notes(d: &DoctorReport) -> Option<String> {
    let lines: Vec<String> = [
        ("EVALUATION", &d.evaluation),
        ("REMARKS", &d.remarks),
        ("RECOMMENDATION", &d.recommendations),
    ]
    .into_iter()
    .filter_map(|(label, value)| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("{}: {}", label, s))
    })
    .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}
