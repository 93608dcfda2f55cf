pub mod clock;
pub mod currency;
pub mod otp_generator;
