pub mod global;
pub mod loader;

pub use global::{
    EngineConfig, FfmpegGlobalConfig, GlobalConfig, MediaConfig, ServerConfig, SystemConfig,
};
pub use loader::ConfigLoader;
