// service/diagnosis.rs
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    dtos::jobdtos::{DiagnosisReportDto, MaterialRequestDto},
    models::jobmodel::{ApprovalStatus, DiagnosisReport, Job, MaterialLine, MaterialRequest},
    service::error::ServiceError,
    utils::currency::round_currency,
};

/// Largest gap between a declared diagnosis total and the computed one that is still accepted.
pub const TOTAL_TOLERANCE: f64 = 1.0;

/// Builds a pending report from the worker's submission.
///
/// A declared total within `TOTAL_TOLERANCE` of materials + labor + warranty
/// is replaced by the computed sum; anything further off is rejected.
// TODO: product wants a decision on whether near-miss totals should be rejected instead of corrected.
pub fn build_report(dto: &DiagnosisReportDto, now: DateTime<Utc>) -> Result<DiagnosisReport, ServiceError> {
    let warranty_duration_days = if dto.warranty_offered {
        match dto.warranty_duration_days {
            Some(days) if days > 0 => Some(days),
            _ => {
                return Err(ServiceError::Validation(
                    "Warranty duration is required when a warranty is offered".to_string(),
                ))
            }
        }
    } else {
        None
    };

    let warranty_cost = if dto.warranty_offered { dto.warranty_cost.unwrap_or(0.0) } else { 0.0 };
    let materials_cost: f64 = dto.materials.iter().map(|m| m.estimated_cost).sum();
    let computed = round_currency(materials_cost + dto.labor_cost + warranty_cost);

    let difference = (dto.declared_total - computed).abs();
    if difference > TOTAL_TOLERANCE {
        return Err(ServiceError::Validation(format!(
            "Declared total {:.2} does not match materials + labor + warranty ({:.2})",
            dto.declared_total, computed
        )));
    }
    if difference > 0.0 {
        tracing::debug!(
            "Diagnosis total corrected from {:.2} to {:.2}",
            dto.declared_total,
            computed
        );
    }

    Ok(DiagnosisReport {
        summary: dto.summary.clone(),
        materials: dto
            .materials
            .iter()
            .map(|m| MaterialLine { name: m.name.clone(), estimated_cost: m.estimated_cost })
            .collect(),
        labor_cost: dto.labor_cost,
        warranty_offered: dto.warranty_offered,
        warranty_duration_days,
        warranty_cost,
        total_cost: computed,
        approval_status: ApprovalStatus::Pending,
        rejection_reason: None,
        submitted_at: now,
        decided_at: None,
    })
}

pub fn new_material_request(dto: &MaterialRequestDto, now: DateTime<Utc>) -> MaterialRequest {
    MaterialRequest {
        id: Uuid::new_v4(),
        item: dto.item.clone(),
        cost: round_currency(dto.cost),
        proof_url: dto.proof_url.clone(),
        status: ApprovalStatus::Pending,
        requested_at: now,
        responded_at: None,
    }
}

/// Looks up a request that is still waiting for the client.
pub fn pending_request(job: &Job, request_id: Uuid) -> Result<&MaterialRequest, ServiceError> {
    let request = job
        .material_requests
        .iter()
        .find(|r| r.id == request_id)
        .ok_or_else(|| ServiceError::Validation(format!("Material request {} not found", request_id)))?;

    if request.status != ApprovalStatus::Pending {
        return Err(ServiceError::Validation(format!(
            "Material request {} was already {:?}",
            request_id, request.status
        )));
    }
    Ok(request)
}

/// Returns `job` with the request decided.
pub fn decide_material_request(
    mut job: Job,
    request_id: Uuid,
    approved: bool,
    now: DateTime<Utc>,
) -> Result<Job, ServiceError> {
    pending_request(&job, request_id)?;

    if let Some(request) = job.material_requests.iter_mut().find(|r| r.id == request_id) {
        request.status = if approved { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
        request.responded_at = Some(now);
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtos::jobdtos::MaterialLineDto;
    use crate::service::test_support::sample_job;

    fn report(materials: f64, labor: f64, warranty: Option<(i64, f64)>, declared: f64) -> DiagnosisReportDto {
        DiagnosisReportDto {
            summary: "Burst pipe under sink".to_string(),
            materials: vec![MaterialLineDto { name: "PVC pipe".to_string(), estimated_cost: materials }],
            labor_cost: labor,
            warranty_offered: warranty.is_some(),
            warranty_duration_days: warranty.map(|(days, _)| days),
            warranty_cost: warranty.map(|(_, cost)| cost),
            declared_total: declared,
        }
    }

    #[test]
    fn test_near_match_total_is_corrected() {
        let built = build_report(&report(300.0, 700.0, None, 1000.5), Utc::now()).unwrap();
        assert_eq!(built.total_cost, 1000.0);
        assert_eq!(built.approval_status, ApprovalStatus::Pending);
    }

    #[test]
    fn test_mismatch_beyond_tolerance_is_rejected() {
        let err = build_report(&report(300.0, 700.0, None, 1001.5), Utc::now()).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn test_warranty_cost_is_part_of_total() {
        let built = build_report(&report(300.0, 700.0, Some((90, 50.0)), 1050.0), Utc::now()).unwrap();
        assert_eq!(built.total_cost, 1050.0);
        assert_eq!(built.warranty_duration_days, Some(90));
    }

    #[test]
    fn test_warranty_without_duration_is_rejected() {
        let mut dto = report(300.0, 700.0, Some((90, 0.0)), 1000.0);
        dto.warranty_duration_days = None;
        let err = build_report(&dto, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("Warranty duration"));
    }

    #[test]
    fn test_material_request_can_only_be_decided_once() {
        let now = Utc::now();
        let mut job = sample_job(now);
        let request = new_material_request(
            &MaterialRequestDto { item: "Valve".to_string(), cost: 45.0, proof_url: None },
            now,
        );
        let id = request.id;
        job.material_requests.push(request);
        assert!(job.has_pending_material_request());

        let job = decide_material_request(job, id, true, now).unwrap();
        assert!(!job.has_pending_material_request());
        assert_eq!(job.material_requests[0].status, ApprovalStatus::Approved);
        assert!(decide_material_request(job, id, false, now).is_err());
    }
}
