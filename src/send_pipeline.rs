use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

/// Abstraction for writing one encoded frame to the connection, introduced to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_frame(&self, frame_buf: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl<W> SendSocket for Mutex<W>
where W: AsyncWrite + Unpin + Send + 'static
{
    async fn do_send_frame(&self, frame_buf: &[u8]) -> anyhow::Result<()> {
        let mut socket = self.lock().await;
        socket.write_all(frame_buf).await?;
        socket.flush().await?;
        Ok(())
    }
}

/// The shared outbound path of one connection: the session's handshake replies and the ack
///  scheduler's periodic frames all go through the same pipeline.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub async fn send_frame(&self, frame_buf: &[u8]) -> anyhow::Result<()> {
        trace!("sending frame of {} bytes", frame_buf.len());
        self.socket.do_send_frame(frame_buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_writes_through_to_the_socket() {
        let (mut read_side, write_side) = tokio::io::duplex(64);
        let pipeline = SendPipeline::new(Arc::new(Mutex::new(write_side)));

        pipeline.send_frame(&[1, 2, 3, 4]).await.unwrap();

        let mut received = [0u8; 4];
        read_side.read_exact(&mut received).await.unwrap();
        assert_eq!(received, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let (read_side, write_side) = tokio::io::duplex(64);
        drop(read_side);
        let pipeline = SendPipeline::new(Arc::new(Mutex::new(write_side)));

        assert!(pipeline.send_frame(&[1, 2, 3, 4]).await.is_err());
    }
}
