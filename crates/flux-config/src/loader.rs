use anyhow::{anyhow, Result};
use config::{Config, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::GlobalConfig;

/// 配置加载器
pub struct ConfigLoader {
    config_dir: PathBuf,
}

/// `cameras.toml` 的顶层结构
#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct CamerasFile<T> {
    #[serde(default = "Vec::new")]
    cameras: Vec<T>,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    /// 加载全局配置
    pub fn load_global(&self) -> Result<GlobalConfig> {
        let config_path = self.config_dir.join("global.toml");

        if !config_path.exists() {
            // 如果配置文件不存在，返回默认配置
            return Ok(GlobalConfig::default());
        }

        Self::read_toml(&config_path)
    }

    /// 加载摄像头列表
    ///
    /// 文件不存在时返回空列表
    pub fn load_cameras<T>(&self) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let config_path = self.config_dir.join("cameras.toml");

        if !config_path.exists() {
            return Ok(Vec::new());
        }

        let file: CamerasFile<T> = Self::read_toml(&config_path)?;
        Ok(file.cameras)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        let global = self.load_global()?;
        Self::validate_global(&global)
    }

    /// 验证已加载的全局配置
    pub fn validate_global(global: &GlobalConfig) -> Result<()> {
        let engine = &global.engine;
        if engine.reconnect_interval_secs == 0 || engine.housekeeping_interval_secs == 0 {
            return Err(anyhow!("engine intervals must be greater than 0"));
        }

        if engine.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than 0"));
        }

        if engine.max_open_channels == 0 {
            return Err(anyhow!("max_open_channels must be greater than 0"));
        }

        if global.ffmpeg.path.as_os_str().is_empty() {
            return Err(anyhow!("ffmpeg path must not be empty"));
        }

        if global.ffmpeg.restart_backoff_initial_ms > global.ffmpeg.restart_backoff_max_ms {
            return Err(anyhow!(
                "restart_backoff_initial_ms ({}) cannot be greater than restart_backoff_max_ms ({})",
                global.ffmpeg.restart_backoff_initial_ms,
                global.ffmpeg.restart_backoff_max_ms
            ));
        }

        Ok(())
    }

    fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
