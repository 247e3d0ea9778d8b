//! Shared guardrails for query payload bounds and traversal limits.

use crate::errors::QueryError;

pub const MAX_PATTERN_LENGTH: usize = 512;
/// Compiled regex size ceiling, in bytes.
pub const MAX_REGEX_SIZE: usize = 1 << 20;
pub const MAX_QUERY_RESULTS: i64 = 1000;
pub const MAX_TRAVERSE_HOPS: i64 = 16;
pub const MAX_CAP_PER_HOP: i64 = 500;
pub const MAX_TRAVERSE_SEEDS: usize = 64;
pub const MAX_GRAPH_VISITED: i64 = 2000;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

pub fn clamp_limit(value: i64, maximum: i64) -> i64 {
    clamp_int(value, 1, maximum)
}

/// Traversal arguments are rejected, not clamped: a silently shortened walk
/// would misreport the graph. Zero hops or a zero cap are valid and return
/// just the seeds.
pub fn check_traversal(
    max_hops: u32,
    cap_per_hop: u32,
    seed_count: usize,
) -> Result<(), QueryError> {
    if i64::from(max_hops) > MAX_TRAVERSE_HOPS {
        return Err(QueryError::InvalidRequest(format!(
            "max_hops {max_hops} exceeds {MAX_TRAVERSE_HOPS}"
        )));
    }
    if i64::from(cap_per_hop) > MAX_CAP_PER_HOP {
        return Err(QueryError::InvalidRequest(format!(
            "cap_per_hop {cap_per_hop} exceeds {MAX_CAP_PER_HOP}"
        )));
    }
    if seed_count > MAX_TRAVERSE_SEEDS {
        return Err(QueryError::InvalidRequest(format!(
            "{seed_count} seeds exceed {MAX_TRAVERSE_SEEDS}"
        )));
    }
    Ok(())
}

/// Reject over-long patterns instead of truncating them; a cut regex means
/// something else entirely.
pub fn check_pattern(pattern: &str) -> Result<(), QueryError> {
    if pattern.len() > MAX_PATTERN_LENGTH {
        return Err(QueryError::InvalidPattern {
            pattern: pattern.chars().take(32).collect::<String>() + "...",
            reason: format!("pattern exceeds {MAX_PATTERN_LENGTH} bytes"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps() {
        assert_eq!(clamp_int(-3, 0, 5), 0);
        assert_eq!(clamp_int(99, 0, 5), 5);
        assert_eq!(clamp_limit(0, 10), 1);
        assert_eq!(clamp_limit(7, 10), 7);
    }

    #[test]
    fn test_traversal_bounds_are_inclusive() {
        let hops = MAX_TRAVERSE_HOPS as u32;
        let cap = MAX_CAP_PER_HOP as u32;
        assert!(check_traversal(0, 0, 1).is_ok());
        assert!(check_traversal(hops, cap, MAX_TRAVERSE_SEEDS).is_ok());
        for bad in [
            check_traversal(hops + 1, 1, 1),
            check_traversal(1, cap + 1, 1),
            check_traversal(1, 1, MAX_TRAVERSE_SEEDS + 1),
        ] {
            assert!(matches!(bad, Err(QueryError::InvalidRequest(_))));
        }
    }

    #[test]
    fn test_long_pattern_rejected() {
        assert!(check_pattern("foo").is_ok());
        let long = "a".repeat(MAX_PATTERN_LENGTH + 1);
        assert!(matches!(
            check_pattern(&long),
            Err(QueryError::InvalidPattern { .. })
        ));
    }
}
