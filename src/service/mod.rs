pub mod background_jobs;
pub mod cooling;
pub mod diagnosis;
pub mod error;
pub mod escrow_service;
pub mod geofence;
pub mod job_service;
pub mod notification_service;
pub mod otp_gate;
pub mod penalty;
pub mod state_machine;
pub mod timeline;
pub mod trust_service;

#[cfg(test)]
pub mod test_support;
