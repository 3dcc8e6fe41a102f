pub mod command;
pub mod transcode;

pub use command::{inject_credentials, mask_password, FfmpegCommand, HlsOptions, InputSpec};
pub use transcode::{ProcessExit, TranscodeProcess};
