use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JudgeError, Result};

/// Time and memory ceilings for one judged submission.
///
/// Built once from the problem's stored limits and never mutated afterwards.
/// Construction is the only place the values are validated, so a judge that
/// holds a `ResourceLimits` can rely on both fields being positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLimits")]
pub struct ResourceLimits {
    time_limit_ms: u64,
    memory_limit_mb: u64,
}

#[derive(Deserialize)]
struct RawLimits {
    time_limit_ms: u64,
    memory_limit_mb: u64,
}

impl TryFrom<RawLimits> for ResourceLimits {
    type Error = JudgeError;

    fn try_from(raw: RawLimits) -> Result<Self> {
        Self::new(raw.time_limit_ms, raw.memory_limit_mb)
    }
}

impl ResourceLimits {
    pub fn new(time_limit_ms: u64, memory_limit_mb: u64) -> Result<Self> {
        if time_limit_ms == 0 {
            return Err(JudgeError::InvalidLimits("time limit must be positive"));
        }
        if memory_limit_mb == 0 {
            return Err(JudgeError::InvalidLimits("memory limit must be positive"));
        }
        Ok(Self {
            time_limit_ms,
            memory_limit_mb,
        })
    }

    pub fn time_limit_ms(&self) -> u64 {
        self.time_limit_ms
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    /// Wall-clock budget for the compile phase: half the run limit, but never
    /// below `floor_ms`.
    pub fn compile_time_limit(&self, floor_ms: u64) -> Duration {
        Duration::from_millis(floor_ms.max(self.time_limit_ms / 2))
    }

    /// Memory ceiling for the compile phase. Compilers routinely need more
    /// than the solution itself is allowed.
    pub fn compile_memory_limit_mb(&self, floor_mb: u64) -> u64 {
        floor_mb.max(self.memory_limit_mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_values() {
        assert!(matches!(
            ResourceLimits::new(0, 256),
            Err(JudgeError::InvalidLimits(_))
        ));
        assert!(matches!(
            ResourceLimits::new(1000, 0),
            Err(JudgeError::InvalidLimits(_))
        ));
    }

    #[test]
    fn compile_budget_uses_floor_or_half() {
        let limits = ResourceLimits::new(1000, 256).unwrap();
        assert_eq!(limits.compile_time_limit(5000), Duration::from_millis(5000));

        let limits = ResourceLimits::new(20_000, 256).unwrap();
        assert_eq!(
            limits.compile_time_limit(5000),
            Duration::from_millis(10_000)
        );
        assert_eq!(limits.compile_memory_limit_mb(512), 512);
        assert_eq!(limits.compile_memory_limit_mb(128), 256);
    }

    #[test]
    fn deserialization_validates() {
        let ok: ResourceLimits =
            serde_json::from_str(r#"{"time_limit_ms":1000,"memory_limit_mb":64}"#).unwrap();
        assert_eq!(ok.time_limit_ms(), 1000);

        let bad = serde_json::from_str::<ResourceLimits>(
            r#"{"time_limit_ms":0,"memory_limit_mb":64}"#,
        );
        assert!(bad.is_err());
    }
}
