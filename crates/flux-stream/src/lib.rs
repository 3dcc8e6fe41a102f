pub mod backoff;
pub mod context;
pub mod error;
pub mod job;
pub mod manager;
pub mod probe;
pub mod processor;

pub use backoff::RestartBackoff;
pub use context::{JobContext, SubscriberInfo};
pub use error::{Result, StreamError};
pub use job::{Cleanup, JobKey, JobSpec, KeepAlive, Purpose, TranscodeJob};
pub use manager::{ManagerConfig, TranscodeEvent, TranscodeManager};
pub use probe::{AlarmProbeParser, ProbeSignal};
pub use processor::{
    inject_credentials, mask_password, FfmpegCommand, HlsOptions, InputSpec, TranscodeProcess,
};
