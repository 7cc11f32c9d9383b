//! Domain records shared by the client, the server and the calculation engine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Schema-free measurement payload as it travels on the wire.
pub type MeasurementMap = serde_json::Map<String, serde_json::Value>;

/// Claim workflow status. Declaration order is the workflow order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Reported,
    Assigned,
    InProgress,
    Completed,
    Reviewed,
    Approved,
    Rejected,
}

impl ClaimStatus {
    /// Whether an assessor may still open a session against the claim.
    pub fn accepts_sessions(self) -> bool {
        self <= ClaimStatus::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Reported => "reported",
            ClaimStatus::Assigned => "assigned",
            ClaimStatus::InProgress => "in_progress",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Reviewed => "reviewed",
            ClaimStatus::Approved => "approved",
            ClaimStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PerilType {
    Drought,
    Hail,
    Flood,
    Wind,
    Frost,
    Pest,
    Disease,
    #[serde(other)]
    Other,
}

/// One insured loss event. Owned by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub id: Uuid,
    pub claim_number: String,
    pub tenant_id: Uuid,
    pub farm_id: Uuid,
    pub field_id: Uuid,
    pub peril_type: PerilType,
    pub date_of_loss: DateTime<Utc>,
    #[serde(default)]
    pub assigned_assessor_id: Option<Uuid>,
    pub status: ClaimStatus,
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    /// Move the claim forward to `next`. Returns false when `next` would be a regression.
    pub fn advance_status(&mut self, next: ClaimStatus) -> bool {
        if next > self.status {
            self.status = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Farm {
    pub id: Uuid,
    pub farm_code: String,
    pub farm_name: String,
    #[serde(default)]
    pub farmer_name: Option<String>,
    /// WKT point
    #[serde(default)]
    pub farm_location: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    pub id: Uuid,
    pub farm_id: Uuid,
    pub field_code: String,
    pub field_name: String,
    #[serde(default)]
    pub area_hectares: Option<f64>,
    /// WKT polygon
    #[serde(default)]
    pub field_boundary: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Assessment session lifecycle. Declaration order is the lifecycle order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    InProgress,
    Completed,
    Synced,
}

impl SessionStatus {
    /// Rank used by the server when deciding whether an incoming copy may
    /// replace the stored one. `completed` and `synced` carry the same content.
    pub fn completion_rank(self) -> u8 {
        match self {
            SessionStatus::Draft => 0,
            SessionStatus::InProgress => 1,
            SessionStatus::Completed | SessionStatus::Synced => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Draft => "draft",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Synced => "synced",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentMethod {
    StandReduction,
    HailDamage,
}

impl AssessmentMethod {
    /// Name of the reference curve this method reads its potential yield from.
    pub fn table_name(self) -> &'static str {
        match self {
            AssessmentMethod::StandReduction => "stand_reduction_potential",
            AssessmentMethod::HailDamage => "hail_damage_potential",
        }
    }

    pub fn has_direct_damage(self) -> bool {
        matches!(self, AssessmentMethod::HailDamage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssessmentMethod::StandReduction => "stand_reduction",
            AssessmentMethod::HailDamage => "hail_damage",
        }
    }
}

impl fmt::Display for AssessmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maize growth stage code (`VE`, `V1`..`V18`, `VT`, `R1`..`R6`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GrowthStage(String);

impl GrowthStage {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let code = raw.trim().to_ascii_uppercase();
        if code == "VE" || code == "VT" {
            return Ok(Self(code));
        }

        let mut chars = code.chars();
        let prefix = chars.next();
        let digits = chars.as_str();
        let number = if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            digits.parse::<u8>().ok()
        } else {
            None
        };
        match (prefix, number) {
            (Some('V'), Some(n)) if (1..=18).contains(&n) => Ok(Self(format!("V{}", n))),
            (Some('R'), Some(n)) if (1..=6).contains(&n) => Ok(Self(format!("R{}", n))),
            _ => Err(Error::UnknownGrowthStage(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GrowthStage {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GrowthStage::parse(&value)
    }
}

impl From<GrowthStage> for String {
    fn from(stage: GrowthStage) -> Self {
        stage.0
    }
}

impl fmt::Display for GrowthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Severity of an advisory quality flag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlagSeverity {
    Warning,
    Fail,
}

/// Advisory sampling-quality finding attached to a result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityFlag {
    pub check: String,
    pub severity: FlagSeverity,
    pub message: String,
    #[serde(default)]
    pub sample_number: Option<u32>,
}

/// Frozen outcome of a completed session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculatedResult {
    pub average_potential_yield_pct: f64,
    pub loss_percentage: f64,
    #[serde(default)]
    pub sample_count: usize,
    #[serde(default)]
    pub method: Option<AssessmentMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<CalculationBreakdown>,
}

/// How a result was reached; kept alongside the headline figures for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculationBreakdown {
    pub growth_stage: GrowthStage,
    pub table_used: String,
    pub stress_pct: f64,
    pub mean_reduction_pct: f64,
    #[serde(default)]
    pub mean_direct_damage_pct: Option<f64>,
    #[serde(default)]
    pub flags: Vec<QualityFlag>,
}

/// One assessment pass over a claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssessmentSession {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub assessor_id: Uuid,
    pub assessment_method: AssessmentMethod,
    #[serde(default)]
    pub growth_stage: Option<GrowthStage>,
    pub status: SessionStatus,
    #[serde(default)]
    pub sample_ids: Vec<Uuid>,
    #[serde(default)]
    pub calculated_result: Option<CalculatedResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub date_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_completed: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy_meters: Option<f64>,
}

/// One field measurement. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplePoint {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sample_number: u32,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    pub measurements: MeasurementMap,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub captured_at: DateTime<Utc>,
}
