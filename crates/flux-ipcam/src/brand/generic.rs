use super::{AdapterContext, BrandAdapter};
use crate::error::{CameraError, Result};
use crate::model::{Brand, CameraCommand, Device};
use crate::transport::{VendorReply, VendorRequest};

/// 只有视频流的设备，没有厂商 API
#[derive(Debug, Default)]
pub struct GenericAdapter;

impl GenericAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl BrandAdapter for GenericAdapter {
    fn brand(&self) -> Brand {
        Brand::Generic
    }

    /// 有快照地址时以抓图作为握手，否则直接在线
    fn handshake(&self, device: &Device) -> Option<VendorRequest> {
        device.snapshot_url.as_ref().map(VendorRequest::get)
    }

    fn verify_handshake(&mut self, reply: &VendorReply, _ctx: &mut AdapterContext<'_>) -> Result<()> {
        if reply.is_success() {
            Ok(())
        } else {
            Err(CameraError::transport(format!(
                "snapshot returned status {}",
                reply.status
            )))
        }
    }

    fn on_connected(&mut self, _ctx: &mut AdapterContext<'_>) {}

    fn poll_camera(&mut self, _ctx: &mut AdapterContext<'_>) {}

    fn ingest(&mut self, _target: &str, _body: &str, _ctx: &mut AdapterContext<'_>) {}

    fn build_command(&mut self, command: &CameraCommand, _ctx: &mut AdapterContext<'_>) -> Result<()> {
        Err(CameraError::Unsupported(command.name().to_string()))
    }
}
