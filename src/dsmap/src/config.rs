use std::path::Path;

use anyhow::Context;
use mm::MmapConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_ADDR: u64 = 0x1000;
pub const DEFAULT_MAX_ADDR: u64 = 1 << 47;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsmapConfig {
    // address-space window managed by the region manager
    pub min_addr: u64,
    pub max_addr: u64,
    // limit on the bytes of live dataspaces; unlimited when absent
    pub quota: Option<u64>,
    pub max_fds: i32,
    pub mmap: MmapConfig,
}

impl Default for DsmapConfig {
    fn default() -> Self {
        Self {
            min_addr: DEFAULT_MIN_ADDR,
            max_addr: DEFAULT_MAX_ADDR,
            quota: None,
            max_fds: vfs::DEFAULT_MAX_FDS,
            mmap: MmapConfig::default(),
        }
    }
}

impl DsmapConfig {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(&file, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open config {:?}", path))?;
        let config: Self = serde_json::from_reader(&file)
            .with_context(|| format!("Failed to load DsmapConfig from {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let page = mem::PAGE_SIZE as u64;
        if self.min_addr == 0 || self.min_addr % page != 0 || self.max_addr % page != 0 {
            anyhow::bail!(
                "address window [{:#x}, {:#x}) must be page aligned and exclude address 0",
                self.min_addr,
                self.max_addr
            );
        }
        if self.min_addr >= self.max_addr {
            anyhow::bail!(
                "empty address window [{:#x}, {:#x})",
                self.min_addr,
                self.max_addr
            );
        }
        if self.max_fds <= 0 {
            anyhow::bail!("max_fds must be positive, got {}", self.max_fds);
        }
        self.mmap
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid mmap config: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm::AnonStrategy;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dsmap-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn save_then_load() {
        let config = DsmapConfig {
            quota: Some(1 << 30),
            mmap: MmapConfig {
                arena_size: 0x10_0000,
                early_commit: false,
                strategy: AnonStrategy::PerMapping,
            },
            ..DsmapConfig::default()
        };
        let path = scratch_path("save");
        config.save(&path).expect("failed to save config");
        let loaded = DsmapConfig::load(&path).expect("failed to load config");
        std::fs::remove_file(&path).expect("failed to remove config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: DsmapConfig =
            serde_json::from_str(r#"{"quota": 65536, "mmap": {"early_commit": false}}"#)
                .expect("failed to parse config");
        assert_eq!(config.quota, Some(65536));
        assert_eq!(config.min_addr, DEFAULT_MIN_ADDR);
        assert!(!config.mmap.early_commit);
        assert_eq!(config.mmap.arena_size, mm::DEFAULT_ARENA_SIZE);
    }

    #[test]
    fn bad_window_is_rejected() {
        let path = scratch_path("bad-window");
        std::fs::write(&path, r#"{"min_addr": 0}"#).expect("failed to write config");
        let res = DsmapConfig::load(&path);
        std::fs::remove_file(&path).expect("failed to remove config");
        assert!(res.is_err());

        let config = DsmapConfig {
            min_addr: 0x2000,
            max_addr: 0x2000,
            ..DsmapConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
