// service/geofence.rs
use chrono::{DateTime, Duration, Utc};

use crate::models::{
    jobmodel::{ArrivalRecord, GeoPoint, Job},
    reliabilitymodel::ReliabilityEvent,
};

pub const GEOFENCE_RADIUS_METERS: f64 = 500.0;
pub const ARRIVAL_GRACE_MINUTES: i64 = 15;
pub const DEFAULT_ETA_OFFSET_HOURS: i64 = 1;
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().atan2((1.0 - h).sqrt())
}

pub fn is_valid_point(point: GeoPoint) -> bool {
    point.latitude.is_finite()
        && point.longitude.is_finite()
        && (-90.0..=90.0).contains(&point.latitude)
        && (-180.0..=180.0).contains(&point.longitude)
}

/// When the worker was due on site: the confirmed ETA, otherwise an hour after
/// the journey started (or after assignment).
pub fn expected_arrival(job: &Job, now: DateTime<Utc>) -> DateTime<Utc> {
    let offset = Duration::hours(DEFAULT_ETA_OFFSET_HOURS);
    job.journey
        .confirmed_eta
        .or_else(|| job.journey.started_at.map(|t| t + offset))
        .or_else(|| job.assigned_at.map(|t| t + offset))
        .unwrap_or(now)
}

/// Distance and punctuality for an arrival report. Never blocks the arrival.
pub fn evaluate_arrival(job: &Job, reported: GeoPoint, now: DateTime<Utc>) -> ArrivalRecord {
    let distance_meters = haversine_meters(job.location, reported);
    let expected_at = expected_arrival(job, now);
    let delay_minutes = (now - expected_at).num_minutes().max(0);
    let is_late = delay_minutes > ARRIVAL_GRACE_MINUTES;

    ArrivalRecord {
        arrived_at: now,
        expected_at,
        distance_meters,
        within_geofence: distance_meters <= GEOFENCE_RADIUS_METERS,
        is_late,
        delay_minutes,
    }
}

pub fn punctuality_event(arrival: &ArrivalRecord) -> ReliabilityEvent {
    if arrival.is_late {
        ReliabilityEvent::ArrivedLate { delay_minutes: arrival.delay_minutes }
    } else {
        ReliabilityEvent::ArrivedOnTime
    }
}

pub fn arrival_metadata(arrival: &ArrivalRecord) -> serde_json::Value {
    serde_json::json!({
        "distance_check": if arrival.within_geofence { "passed" } else { "failed" },
        "distance_meters": arrival.distance_meters.round(),
        "is_late": arrival.is_late,
        "delay_minutes": arrival.delay_minutes,
        "expected_at": arrival.expected_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::sample_job;

    #[test]
    fn test_haversine_known_distance() {
        // Lagos to Abuja is roughly 525 km.
        let lagos = GeoPoint { latitude: 6.5244, longitude: 3.3792 };
        let abuja = GeoPoint { latitude: 9.0765, longitude: 7.3986 };
        let km = haversine_meters(lagos, abuja) / 1000.0;
        assert!((km - 525.0).abs() < 15.0, "got {km}");
        assert_eq!(haversine_meters(lagos, lagos), 0.0);
    }

    #[test]
    fn test_far_arrival_warns_but_is_recorded() {
        let now = Utc::now();
        let mut job = sample_job(now);
        job.journey.confirmed_eta = Some(now);
        let far = GeoPoint { latitude: job.location.latitude + 0.01, longitude: job.location.longitude };

        let arrival = evaluate_arrival(&job, far, now);
        assert!(!arrival.within_geofence);
        assert!(arrival.distance_meters > 1000.0);
        assert_eq!(arrival_metadata(&arrival)["distance_check"], "failed");
    }

    #[test]
    fn test_twenty_minutes_late() {
        let now = Utc::now();
        let mut job = sample_job(now);
        job.journey.confirmed_eta = Some(now - Duration::minutes(20));

        let arrival = evaluate_arrival(&job, job.location, now);
        assert!(arrival.within_geofence);
        assert!(arrival.is_late);
        assert_eq!(arrival.delay_minutes, 20);
        assert_eq!(punctuality_event(&arrival), ReliabilityEvent::ArrivedLate { delay_minutes: 20 });
    }

    #[test]
    fn test_grace_period_counts_as_on_time() {
        let now = Utc::now();
        let mut job = sample_job(now);
        job.journey.confirmed_eta = Some(now - Duration::minutes(15));

        let arrival = evaluate_arrival(&job, job.location, now);
        assert!(!arrival.is_late);
        assert_eq!(punctuality_event(&arrival), ReliabilityEvent::ArrivedOnTime);
    }

    #[test]
    fn test_missing_eta_falls_back_to_journey_start() {
        let now = Utc::now();
        let mut job = sample_job(now);
        job.journey.started_at = Some(now - Duration::hours(2));

        assert_eq!(expected_arrival(&job, now), now - Duration::hours(1));
        assert!(evaluate_arrival(&job, job.location, now).is_late);
    }

    #[test]
    fn test_point_validation() {
        assert!(is_valid_point(GeoPoint { latitude: 6.5, longitude: 3.3 }));
        assert!(!is_valid_point(GeoPoint { latitude: 91.0, longitude: 3.3 }));
        assert!(!is_valid_point(GeoPoint { latitude: f64::NAN, longitude: 0.0 }));
    }
}
