//! Frame writes that track how much of the frame reached the socket
//!
//! A frame that stops part way leaves the peer mid-frame. Resending it or moving
//! on to the next frame would corrupt the peer's stream, so callers only retry a
//! failure that wrote nothing.

use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::timeout;

use crate::error::NetworkError;

/// A failed frame write
#[derive(Debug)]
pub(crate) struct WriteFailure {
    /// Bytes of the frame already handed to the socket
    pub written: usize,
    pub error: NetworkError,
}

impl WriteFailure {
    /// Part of the frame went out before the failure
    pub(crate) fn is_torn(&self) -> bool {
        self.written > 0
    }
}

/// Write one whole frame within `write_timeout`
pub(crate) async fn write_frame(
    write_half: &mut OwnedWriteHalf,
    frame: &[u8],
    write_timeout: Duration,
) -> Result<(), WriteFailure> {
    let mut written = 0;
    let outcome = timeout(write_timeout, async {
        while written < frame.len() {
            let n = write_half.write(&frame[written..]).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            written += n;
        }
        Ok::<(), io::Error>(())
    })
    .await;

    let error = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => NetworkError::Io(e),
        Err(_) => NetworkError::timeout(format!("Write timed out after {:?}", write_timeout)),
    };
    Err(WriteFailure { written, error })
}
