// utils/otp_generator.rs
use rand::Rng;

pub const START_OTP_DIGITS: usize = 4;

/// Four digit start code shared by the client with the worker on site.
pub fn generate_start_otp() -> String {
    let mut rng = rand::rng();
    format!("{:04}", rng.random_range(0..10_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_otp_is_four_digits() {
        for _ in 0..200 {
            let code = generate_start_otp();
            assert_eq!(code.len(), START_OTP_DIGITS);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
