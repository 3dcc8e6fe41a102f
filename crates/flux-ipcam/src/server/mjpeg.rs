use bytes::{BufMut, Bytes, BytesMut};
use flux_stream::{JobKey, TranscodeManager};
use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

pub const BOUNDARY: &str = "thisMjpegStream";

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// 一帧 multipart 数据
pub fn encode_frame(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\ncontent-type: image/jpeg\r\ncontent-length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut frame = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    frame.put_slice(header.as_bytes());
    frame.put_slice(jpeg);
    frame.put_slice(b"\r\n");
    frame.freeze()
}

/// 观看者连接断开时从转码任务摘除
pub struct SubscriberGuard {
    manager: TranscodeManager,
    key: JobKey,
    subscriber_id: String,
}

impl SubscriberGuard {
    pub fn new(manager: TranscodeManager, key: JobKey, subscriber_id: String) -> Self {
        Self {
            manager,
            key,
            subscriber_id,
        }
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let key = self.key.clone();
        let subscriber_id = std::mem::take(&mut self.subscriber_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                manager.detach(&key, &subscriber_id).await;
            });
        }
    }
}

/// 把广播的 JPEG 帧编码为 multipart 流；慢速观看者跳过积压的帧
pub fn frame_stream(
    frames: broadcast::Receiver<Bytes>,
    guard: SubscriberGuard,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let _guard = guard;
        let mut frames = BroadcastStream::new(frames);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(jpeg) => yield Ok(encode_frame(&jpeg)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(target: "ipcam_media", skipped, "MJPEG viewer lagging, frames skipped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(b"JPEG");
        assert_eq!(
            frame,
            Bytes::from_static(
                b"--thisMjpegStream\r\ncontent-type: image/jpeg\r\ncontent-length: 4\r\n\r\nJPEG\r\n"
            )
        );
        assert_eq!(content_type(), "multipart/x-mixed-replace; boundary=thisMjpegStream");
    }
}
