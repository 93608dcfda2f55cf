use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::models::jobmodel::*;

fn validate_point(point: &GeoPoint) -> Result<(), ValidationError> {
    if crate::service::geofence::is_valid_point(*point) {
        Ok(())
    } else {
        Err(ValidationError::new("Coordinates are out of range"))
    }
}

//Job Dto
#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct CreateJobDto {
    #[validate(length(min = 3, max = 120, message = "Title must be between 3 and 120 characters"))]
    pub title: String,

    #[validate(length(min = 10, max = 2000, message = "Description must be between 10 and 2000 characters"))]
    pub description: String,

    #[validate(length(min = 1, max = 60, message = "Skill is required"))]
    pub skill: String,

    pub urgency: UrgencyLevel,

    #[validate(custom = "validate_point")]
    pub location: GeoPoint,

    #[validate(range(min = 1, max = 168, message = "Quotation window must be between 1 and 168 hours"))]
    pub quotation_window_hours: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct SubmitQuotationDto {
    #[validate(range(min = 0.01, message = "Quoted amount must be positive"))]
    pub amount: f64,

    #[validate(length(max = 500, message = "Note must be at most 500 characters"))]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct ReportDelayDto {
    #[validate(length(min = 3, max = 300, message = "Reason must be between 3 and 300 characters"))]
    pub reason: String,

    #[validate(range(min = 1, max = 240, message = "Delay must be between 1 and 240 minutes"))]
    pub minutes: i64,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct MaterialLineDto {
    #[validate(length(min = 1, max = 120, message = "Material name is required"))]
    pub name: String,

    #[validate(range(min = 0.0, message = "Material cost cannot be negative"))]
    pub estimated_cost: f64,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct DiagnosisReportDto {
    #[validate(length(min = 5, max = 2000, message = "Summary must be between 5 and 2000 characters"))]
    pub summary: String,

    #[validate]
    pub materials: Vec<MaterialLineDto>,

    #[validate(range(min = 0.0, message = "Labor cost cannot be negative"))]
    pub labor_cost: f64,

    pub warranty_offered: bool,

    pub warranty_duration_days: Option<i64>,

    #[validate(range(min = 0.0, message = "Warranty cost cannot be negative"))]
    pub warranty_cost: Option<f64>,

    #[validate(range(min = 0.0, message = "Total cannot be negative"))]
    pub declared_total: f64,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct MaterialRequestDto {
    #[validate(length(min = 1, max = 120, message = "Item is required"))]
    pub item: String,

    #[validate(range(min = 0.01, message = "Material cost must be positive"))]
    pub cost: f64,

    #[validate(url(message = "Invalid proof URL"))]
    pub proof_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct SubmitCompletionDto {
    #[validate(length(min = 1, message = "At least one completion photo is required"))]
    pub photos: Vec<String>,

    #[validate(length(min = 5, max = 2000, message = "Summary must be between 5 and 2000 characters"))]
    pub summary: String,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct RaiseDisputeDto {
    #[validate(length(min = 10, max = 1000, message = "Reason must be between 10 and 1000 characters"))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct ResolveDisputeDto {
    pub decision: DisputeDecision,

    #[validate(length(min = 1, max = 2000, message = "Resolution notes are required"))]
    pub notes: String,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct CancelJobDto {
    #[validate(length(min = 3, max = 500, message = "Reason must be between 3 and 500 characters"))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct ClaimWarrantyDto {
    #[validate(length(min = 10, max = 1000, message = "Reason must be between 10 and 1000 characters"))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarrantyDecision {
    Honored,
    Rejected,
}

#[derive(Debug, Deserialize, Serialize, Validate, Clone)]
pub struct ResolveWarrantyDto {
    pub decision: WarrantyDecision,

    #[validate(length(min = 1, max = 2000, message = "Resolution notes are required"))]
    pub notes: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ArrivalDto {
    pub location: GeoPoint,
    pub is_mock_location: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StartJourneyDto {
    pub location: Option<GeoPoint>,
    pub is_mock_location: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConfirmEtaDto {
    pub eta: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_requires_a_photo() {
        let dto = SubmitCompletionDto { photos: vec![], summary: "Replaced the valve".to_string() };
        assert!(dto.validate().is_err());
    }

    #[test]
    fn test_create_job_rejects_bad_coordinates() {
        let dto = CreateJobDto {
            title: "Fix sink".to_string(),
            description: "Kitchen sink is leaking badly".to_string(),
            skill: "plumbing".to_string(),
            urgency: UrgencyLevel::High,
            location: GeoPoint { latitude: 120.0, longitude: 3.0 },
            quotation_window_hours: None,
        };
        assert!(dto.validate().is_err());
    }

    #[test]
    fn test_nested_material_lines_are_validated() {
        let dto = DiagnosisReportDto {
            summary: "Broken pipe".to_string(),
            materials: vec![MaterialLineDto { name: "".to_string(), estimated_cost: 10.0 }],
            labor_cost: 10.0,
            warranty_offered: false,
            warranty_duration_days: None,
            warranty_cost: None,
            declared_total: 20.0,
        };
        assert!(dto.validate().is_err());
    }
}
