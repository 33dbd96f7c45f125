//! Numeric semantics for resource-limit config keys.

use crate::error::{CoreError, CoreResult};

/// Parse a `limits.memory`-style value: a byte-size string (`256MB`, `1GiB`,
/// a bare byte count) or a `<N>%` percentage of `total_host_memory`.
pub fn parse_memory_size(value: &str, total_host_memory: u64) -> CoreResult<u64> {
    let value = value.trim();
    if let Some(pct) = value.strip_suffix('%') {
        let pct: f64 = pct
            .parse()
            .map_err(|_| CoreError::InvalidConfig(format!("invalid memory percentage: {value}")))?;
        if !(0.0..=100.0).contains(&pct) {
            return Err(CoreError::InvalidConfig(format!(
                "memory percentage out of range: {value}"
            )));
        }
        return Ok(((total_host_memory as f64) * pct / 100.0) as u64);
    }

    parse_byte_size(value)
}

fn parse_byte_size(value: &str) -> CoreResult<u64> {
    const UNITS: &[(&str, u64)] = &[
        ("TiB", 1u64 << 40),
        ("GiB", 1u64 << 30),
        ("MiB", 1u64 << 20),
        ("KiB", 1u64 << 10),
        ("TB", 1_000_000_000_000),
        ("GB", 1_000_000_000),
        ("MB", 1_000_000),
        ("KB", 1_000),
        ("T", 1u64 << 40),
        ("G", 1u64 << 30),
        ("M", 1u64 << 20),
        ("K", 1u64 << 10),
    ];

    for (suffix, scale) in UNITS {
        if let Some(num) = value.strip_suffix(suffix) {
            let n: f64 = num
                .trim()
                .parse()
                .map_err(|_| CoreError::InvalidConfig(format!("invalid memory size: {value}")))?;
            return Ok((n * *scale as f64) as u64);
        }
    }

    value
        .parse()
        .map_err(|_| CoreError::InvalidConfig(format!("invalid memory size: {value}")))
}

/// The resolved set of memory-related cgroup directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub hard: u64,
    pub soft: u64,
    /// `Some(0)` when swap is enabled (no extra swap budget beyond `hard`);
    /// `None` when swap is disabled and no swap directive should be set.
    pub swap: Option<u64>,
    pub swappiness: u8,
}

/// Compute hard/soft/swap limits and swappiness from `limits.memory` and
/// `limits.memory.swap.priority`:
/// soft = floor(hard * 0.9); when swap is enabled the swap limit is pinned
/// to 0 (no extra swap budget beyond the hard limit); swappiness is
/// `70 - priority` when swap is enabled, `0` otherwise.
pub fn memory_limits(hard: u64, swap_enabled: bool, swap_priority: u8) -> CoreResult<MemoryLimits> {
    if hard == 0 {
        return Err(CoreError::InvalidConfig("limits.memory resolves to a 0-byte hard limit".to_string()));
    }
    if swap_priority > 10 {
        return Err(CoreError::InvalidConfig(format!(
            "limits.memory.swap.priority out of range 0-10: {swap_priority}"
        )));
    }

    let soft = (hard as f64 * 0.9).floor() as u64;
    let (swap, swappiness) = if swap_enabled {
        (Some(0), 70u8.saturating_sub(swap_priority))
    } else {
        (None, 0)
    };

    Ok(MemoryLimits { hard, soft, swap, swappiness })
}

/// `limits.disk.priority` (0-10) to a blkio/io weight:
/// `max(priority * 100, 10)`.
pub fn disk_priority_to_weight(priority: u8) -> CoreResult<u32> {
    if priority > 10 {
        return Err(CoreError::InvalidConfig(format!(
            "limits.disk.priority out of range 0-10: {priority}"
        )));
    }
    Ok((priority as u32 * 100).max(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_byte_suffixes() {
        assert_eq!(parse_memory_size("256MB", 0).unwrap(), 256_000_000);
        assert_eq!(parse_memory_size("1GiB", 0).unwrap(), 1 << 30);
        assert_eq!(parse_memory_size("1024", 0).unwrap(), 1024);
    }

    #[test]
    fn parses_percentage_of_host_memory() {
        assert_eq!(parse_memory_size("50%", 1000).unwrap(), 500);
    }

    #[test]
    fn rejects_out_of_range_percentage() {
        assert!(parse_memory_size("150%", 1000).is_err());
    }

    #[test]
    fn swap_enabled_pins_swap_to_zero_and_sets_soft_limit() {
        let limits = memory_limits(1_000_000_000, true, 0).unwrap();
        assert_eq!(limits.swap, Some(0));
        assert_eq!(limits.soft, 900_000_000);
    }

    #[test]
    fn swap_disabled_has_no_swap_directive_and_zero_swappiness() {
        let limits = memory_limits(1_000_000_000, false, 5).unwrap();
        assert_eq!(limits.swap, None);
        assert_eq!(limits.swappiness, 0);
    }

    #[test]
    fn swappiness_formula_matches_priority_ten() {
        let limits = memory_limits(1_000_000_000, true, 10).unwrap();
        assert_eq!(limits.swappiness, 60);
    }

    #[test]
    fn zero_hard_limit_is_rejected() {
        assert!(memory_limits(0, true, 0).is_err());
    }

    #[test]
    fn disk_priority_weight_floors_at_ten() {
        assert_eq!(disk_priority_to_weight(0).unwrap(), 10);
        assert_eq!(disk_priority_to_weight(5).unwrap(), 500);
        assert_eq!(disk_priority_to_weight(10).unwrap(), 1000);
    }
}
