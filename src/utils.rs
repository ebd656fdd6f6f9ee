//! Utility functions for outbound requests.

use rand::Rng;

const USER_AGENT_BASE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_5 like Mac OS X) \
AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.4 Mobile/15E148 Safari/604.2";

/// Generate a mobile Safari User-Agent with a random 16 hex digit suffix, so
/// that consecutive requests do not share one fingerprint.
pub fn generate_user_agent() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..16)
        .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
        .collect();
    format!("{} {}", USER_AGENT_BASE, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_has_hex_suffix() {
        let ua = generate_user_agent();
        let (base, suffix) = ua.rsplit_once(' ').unwrap();
        assert_eq!(base, USER_AGENT_BASE);
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
