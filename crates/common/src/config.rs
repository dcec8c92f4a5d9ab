use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of partition chain instances a compiled plan fans out to.
    pub concurrency: usize,
    pub batch_size_rows: usize,
    pub mem_budget_bytes: usize,
    /// Upper bound on how long execution waits for every partition to signal completion.
    pub barrier_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size_rows: 8192,
            mem_budget_bytes: 512 * 1024 * 1024,
            barrier_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Reject settings that would make execution impossible.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(StrataError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.batch_size_rows == 0 {
            return Err(StrataError::InvalidConfig(
                "batch_size_rows must be at least 1".to_string(),
            ));
        }
        if self.barrier_timeout_ms == 0 {
            return Err(StrataError::InvalidConfig(
                "barrier_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"concurrency": 8}"#).expect("config");
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.batch_size_rows, 8192);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = EngineConfig {
            concurrency: 0,
            ..EngineConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("concurrency"));
    }
}
