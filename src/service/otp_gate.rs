// service/otp_gate.rs
use chrono::{DateTime, Duration, Utc};
use subtle::ConstantTimeEq;

use crate::{
    models::jobmodel::StartOtp,
    service::error::ServiceError,
    utils::otp_generator::generate_start_otp,
};

pub const OTP_TTL_HOURS: i64 = 72;
pub const MAX_FAILED_ATTEMPTS: u32 = 3;
pub const LOCKOUT_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum OtpOutcome {
    Accepted,
    /// Wrong code. The updated bookkeeping must be persisted before reporting the failure.
    Rejected {
        otp: StartOtp,
        remaining_attempts: u32,
        locked_until: Option<DateTime<Utc>>,
    },
}

impl OtpOutcome {
    pub fn rejection_message(&self) -> Option<String> {
        match self {
            OtpOutcome::Accepted => None,
            OtpOutcome::Rejected { locked_until: Some(until), .. } => Some(format!(
                "Incorrect start code. Too many failed attempts, try again after {}",
                until.to_rfc3339()
            )),
            OtpOutcome::Rejected { remaining_attempts, .. } => Some(format!(
                "Incorrect start code. {} attempt(s) remaining before lockout",
                remaining_attempts
            )),
        }
    }
}

pub fn issue(now: DateTime<Utc>) -> StartOtp {
    StartOtp {
        code: generate_start_otp(),
        expires_at: now + Duration::hours(OTP_TTL_HOURS),
        failed_attempts: 0,
        locked_until: None,
    }
}

fn minutes_until(until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (until - now).num_seconds().max(0);
    (seconds + 59) / 60
}

/// Checks `supplied` against the issued code.
///
/// A lockout in effect or an expired code is an error and changes nothing.
pub fn verify(otp: &StartOtp, supplied: &str, now: DateTime<Utc>) -> Result<OtpOutcome, ServiceError> {
    if let Some(until) = otp.locked_until {
        if now < until {
            return Err(ServiceError::Security(format!(
                "Start code entry is locked, try again in {} minute(s)",
                minutes_until(until, now)
            )));
        }
    }

    if now >= otp.expires_at {
        return Err(ServiceError::Security(
            "Start code has expired, ask the client to generate a new one".to_string(),
        ));
    }

    let matches: bool = otp.code.as_bytes().ct_eq(supplied.trim().as_bytes()).into();
    if matches {
        return Ok(OtpOutcome::Accepted);
    }

    let mut updated = otp.clone();
    updated.locked_until = None;
    updated.failed_attempts += 1;

    if updated.failed_attempts >= MAX_FAILED_ATTEMPTS {
        let until = now + Duration::minutes(LOCKOUT_MINUTES);
        updated.failed_attempts = 0;
        updated.locked_until = Some(until);
        return Ok(OtpOutcome::Rejected {
            otp: updated,
            remaining_attempts: 0,
            locked_until: Some(until),
        });
    }

    Ok(OtpOutcome::Rejected {
        remaining_attempts: MAX_FAILED_ATTEMPTS - updated.failed_attempts,
        otp: updated,
        locked_until: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn otp_with_code(code: &str, now: DateTime<Utc>) -> StartOtp {
        StartOtp { code: code.to_string(), ..issue(now) }
    }

    fn fail(otp: &StartOtp, now: DateTime<Utc>) -> StartOtp {
        match verify(otp, "0000", now).unwrap() {
            OtpOutcome::Rejected { otp, .. } => otp,
            OtpOutcome::Accepted => panic!("wrong code accepted"),
        }
    }

    #[test]
    fn test_issue_sets_expiry() {
        let now = Utc::now();
        let otp = issue(now);
        assert_eq!(otp.expires_at, now + Duration::hours(72));
        assert_eq!(otp.failed_attempts, 0);
        assert!(otp.locked_until.is_none());
    }

    #[test]
    fn test_correct_code_is_accepted() {
        let now = Utc::now();
        let otp = otp_with_code("4821", now);
        assert_eq!(verify(&otp, "4821", now).unwrap(), OtpOutcome::Accepted);
        assert_eq!(verify(&otp, " 4821 ", now).unwrap(), OtpOutcome::Accepted);
    }

    #[test]
    fn test_three_failures_lock_for_five_minutes() {
        let now = Utc::now();
        let otp = otp_with_code("4821", now);
        let otp = fail(&otp, now);
        assert_eq!(otp.failed_attempts, 1);
        let otp = fail(&otp, now);
        assert_eq!(otp.failed_attempts, 2);

        match verify(&otp, "1111", now).unwrap() {
            OtpOutcome::Rejected { otp: locked, remaining_attempts, locked_until } => {
                assert_eq!(remaining_attempts, 0);
                assert_eq!(locked.failed_attempts, 0);
                assert_eq!(locked_until, Some(now + Duration::minutes(5)));

                let err = verify(&locked, "4821", now + Duration::seconds(299)).unwrap_err();
                assert!(matches!(err, ServiceError::Security(_)));
                assert!(err.to_string().contains("1 minute"));

                let after = now + Duration::minutes(5);
                assert_eq!(verify(&locked, "4821", after).unwrap(), OtpOutcome::Accepted);
                let retried = fail(&locked, after);
                assert_eq!(retried.failed_attempts, 1);
                assert!(retried.locked_until.is_none());
            }
            OtpOutcome::Accepted => panic!("wrong code accepted"),
        }
    }

    #[test]
    fn test_expired_code_is_rejected() {
        let now = Utc::now();
        let otp = otp_with_code("4821", now);
        let err = verify(&otp, "4821", now + Duration::hours(73)).unwrap_err();
        assert!(matches!(err, ServiceError::Security(_)));
    }

    #[test]
    fn test_rejection_message_reports_remaining_attempts() {
        let now = Utc::now();
        let otp = otp_with_code("4821", now);
        let outcome = verify(&otp, "9999", now).unwrap();
        assert!(outcome.rejection_message().unwrap().contains("2 attempt(s) remaining"));
    }
}
