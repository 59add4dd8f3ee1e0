use serde::{Deserialize, Serialize};
use utils::{bail_libc, SysError, SysResult};

pub const DEFAULT_ARENA_SIZE: u64 = 0x1000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonStrategy {
    // carve anonymous memory out of one large dataspace at a time
    SharedArena,
    // allocate one dataspace per mapping
    PerMapping,
}

impl Default for AnonStrategy {
    fn default() -> Self {
        AnonStrategy::SharedArena
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmapConfig {
    pub arena_size: u64,
    // commit backing at map time so that later faults cannot run out of memory
    pub early_commit: bool,
    pub strategy: AnonStrategy,
}

impl Default for MmapConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            early_commit: true,
            strategy: AnonStrategy::default(),
        }
    }
}

impl MmapConfig {
    pub fn validate(&self) -> SysResult<()> {
        if self.arena_size == 0 || self.arena_size % mem::PAGE_SIZE as u64 != 0 {
            bail_libc!(libc::EINVAL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: MmapConfig =
            serde_json::from_str(r#"{"strategy": "per_mapping"}"#).expect("failed to parse");
        assert_eq!(config.strategy, AnonStrategy::PerMapping);
        assert_eq!(config.arena_size, DEFAULT_ARENA_SIZE);
        assert!(config.early_commit);
    }

    #[test]
    fn arena_size_must_be_pages() {
        assert!(MmapConfig::default().validate().is_ok());
        let config = MmapConfig {
            arena_size: 4097,
            ..MmapConfig::default()
        };
        assert_eq!(config.validate(), Err(SysError::new(libc::EINVAL)));
    }
}
