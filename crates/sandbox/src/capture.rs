//! Bounded capture of a child's output stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Default)]
struct Buffer {
    kept: Vec<u8>,
    omitted: u64,
}

/// Captured text and whether anything was cut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

/// Reads a stream to the end, keeping at most `limit` bytes.
///
/// The reader keeps draining past the limit so the child never blocks on a
/// full pipe; excess bytes are only counted.
pub struct BoundedCapture {
    buffer: Arc<Mutex<Buffer>>,
    handle: Option<JoinHandle<()>>,
}

impl BoundedCapture {
    pub fn spawn<R>(reader: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Buffer::default()));
        let handle = reader.map(|mut reader| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    let n = match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let mut buf = buffer.lock().unwrap_or_else(|p| p.into_inner());
                    let room = limit.saturating_sub(buf.kept.len());
                    let take = room.min(n);
                    buf.kept.extend_from_slice(&chunk[..take]);
                    buf.omitted += (n - take) as u64;
                }
            })
        });
        Self { buffer, handle }
    }

    /// Wait for the stream to close, at most `grace`. A descendant that
    /// escaped the process group may hold the pipe open; in that case the
    /// reader is abandoned and whatever was read so far is returned.
    pub async fn finish(mut self, grace: Duration) -> CapturedOutput {
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!("Output pipe still open after teardown; abandoning reader");
                handle.abort();
            }
        }
        let buf = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        render(&buf)
    }
}

impl Drop for BoundedCapture {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn render(buf: &Buffer) -> CapturedOutput {
    let mut text = String::from_utf8_lossy(&buf.kept).into_owned();
    let truncated = buf.omitted > 0;
    if truncated {
        text.push_str(&format!("\n[output truncated: {} bytes omitted]", buf.omitted));
    }
    CapturedOutput { text, truncated }
}
