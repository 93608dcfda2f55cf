pub mod jobmodel;
pub mod reliabilitymodel;
