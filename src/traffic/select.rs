//! Version selection algorithms.
//!
//! - A/B: SHA-256 of `service:key` folded into `[0, weight_a + weight_b)`;
//!   the same key lands in the same bucket for the life of the policy
//! - Canary: uniform draw in `[0, 100)` against `current_weight`, per call
//! - Split: weighted random choice, weights normalized by their sum

use std::net::IpAddr;

use axum::http::{header, HeaderMap};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::traffic::policy::{AbTestConfig, CanaryConfig, WeightedVersion};

/// Request attributes a routing decision may depend on.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub headers: &'a HeaderMap,
    pub source_ip: Option<IpAddr>,
}

impl<'a> RequestContext<'a> {
    pub fn new(headers: &'a HeaderMap, source_ip: Option<IpAddr>) -> Self {
        Self { headers, source_ip }
    }

    /// Value of `name` as a header, else as a cookie.
    pub fn attribute(&self, name: &str) -> Option<String> {
        if let Some(value) = self.headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
        self.cookie(name)
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, v)| *k == name && !v.is_empty())
            .map(|(_, v)| v.to_string())
    }

    /// Sticky key for A/B assignment: the split attribute, else the source IP.
    pub fn sticky_key(&self, split_key: &str) -> Option<String> {
        self.attribute(split_key)
            .or_else(|| self.source_ip.map(|ip| ip.to_string()))
    }
}

/// Deterministic bucket of `key` within `[0, modulus)`.
pub fn sticky_bucket(service: &str, key: &str, modulus: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % modulus.max(1)
}

/// Pick the A/B variant for a caller.
pub fn select_ab(service: &str, ab: &AbTestConfig, ctx: &RequestContext<'_>) -> String {
    let total = u64::from(ab.weight_a) + u64::from(ab.weight_b);
    let bucket = match ctx.sticky_key(&ab.split_key) {
        Some(key) => sticky_bucket(service, &key, total),
        // Nothing to pin on; fall back to a weighted draw.
        None => rand::thread_rng().gen_range(0..total.max(1)),
    };
    if bucket < u64::from(ab.weight_a) {
        ab.version_a.clone()
    } else {
        ab.version_b.clone()
    }
}

/// Pick stable or new version for one canary request.
pub fn select_canary(canary: &CanaryConfig) -> String {
    let roll: u32 = rand::thread_rng().gen_range(0..100);
    if roll < canary.current_weight {
        canary.new_version.clone()
    } else {
        canary.stable_version.clone()
    }
}

/// Weighted random choice over a split. `None` if every weight is zero.
pub fn select_split(splits: &[WeightedVersion]) -> Option<String> {
    let total: u64 = splits.iter().map(|s| u64::from(s.weight)).sum();
    if total == 0 {
        return None;
    }
    let mut roll = rand::thread_rng().gen_range(0..total);
    for split in splits {
        let weight = u64::from(split.weight);
        if roll < weight {
            return Some(split.version.clone());
        }
        roll -= weight;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn header_wins_over_cookie_and_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-cohort", HeaderValue::from_static("gold"));
        headers.insert(header::COOKIE, HeaderValue::from_static("x-user-cohort=silver; theme=dark"));
        let ctx = RequestContext::new(&headers, Some("10.1.1.1".parse().unwrap()));
        assert_eq!(ctx.sticky_key("x-user-cohort").as_deref(), Some("gold"));

        headers.remove("x-user-cohort");
        let ctx = RequestContext::new(&headers, Some("10.1.1.1".parse().unwrap()));
        assert_eq!(ctx.sticky_key("x-user-cohort").as_deref(), Some("silver"));
        assert_eq!(ctx.sticky_key("session").as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn bucket_is_stable_and_bounded() {
        let a = sticky_bucket("users", "cohort-7", 100);
        for _ in 0..10 {
            assert_eq!(sticky_bucket("users", "cohort-7", 100), a);
        }
        assert!(a < 100);
    }

    #[test]
    fn split_skips_zero_weights() {
        let splits = vec![WeightedVersion::new("v1", 0), WeightedVersion::new("v2", 5)];
        for _ in 0..50 {
            assert_eq!(select_split(&splits).as_deref(), Some("v2"));
        }
        assert_eq!(select_split(&[WeightedVersion::new("v1", 0)]), None);
    }

    #[test]
    fn canary_extremes_are_deterministic() {
        let mut canary = CanaryConfig::new("v1", "v2");
        canary.current_weight = 0;
        assert!((0..50).all(|_| select_canary(&canary) == "v1"));
        canary.current_weight = 100;
        assert!((0..50).all(|_| select_canary(&canary) == "v2"));
    }
}
