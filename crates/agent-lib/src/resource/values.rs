//! QoS level to resource value calculators
//!
//! Pure functions and tables; the only place policy values live. Everything
//! else in the resource layer is mechanism.

use serde::{Deserialize, Serialize};

/// CFS scheduling period in microseconds
pub const CPU_PERIOD_US: i64 = 100_000;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// `cpu.weight` for a QoS level; out-of-range levels get the level-0 default
pub fn cpu_weight_for_level(qos_level: i64) -> u64 {
    match qos_level {
        2 => 1000,
        1 => 500,
        0 => 100,
        -1 => 50,
        _ => 100,
    }
}

/// CPU quota in microseconds per period for a QoS level; 0 means "no quota"
pub fn cpu_quota_for_level(qos_level: i64) -> u64 {
    match qos_level {
        -1 => 50_000,
        _ => 0,
    }
}

/// Collapse a QoS level onto the two states the v1 memory controller knows
pub fn normalize_memory_qos_level(qos_level: i64) -> i64 {
    if qos_level < 0 {
        -1
    } else {
        0
    }
}

/// Memory bounds for one QoS level, in bytes; `high == 0` means "no limit"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBounds {
    pub high: u64,
    pub low: u64,
    pub min: u64,
}

/// The `memory.high`/`memory.low`/`memory.min` table, overridable through
/// agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryQosTable {
    pub level_2: MemoryBounds,
    pub level_1: MemoryBounds,
    pub level_0: MemoryBounds,
    pub idle: MemoryBounds,
}

impl Default for MemoryQosTable {
    fn default() -> Self {
        Self {
            level_2: MemoryBounds {
                high: 0,
                low: 2 * GIB,
                min: GIB,
            },
            level_1: MemoryBounds {
                high: 0,
                low: GIB,
                min: 512 * MIB,
            },
            level_0: MemoryBounds {
                high: 0,
                low: 512 * MIB,
                min: 256 * MIB,
            },
            idle: MemoryBounds {
                high: GIB,
                low: 0,
                min: 0,
            },
        }
    }
}

impl MemoryQosTable {
    /// Bounds for a QoS level; out-of-range levels get the level-0 defaults
    pub fn bounds_for_level(&self, qos_level: i64) -> MemoryBounds {
        match qos_level {
            2 => self.level_2,
            1 => self.level_1,
            0 => self.level_0,
            -1 => self.idle,
            _ => self.level_0,
        }
    }
}
