use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 8192;

/// Bytes captured from one output stream, never more than the cap.
#[derive(Debug, Default)]
pub struct CapturedStream {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedStream {
    /// Decodes lossily. Only a stream that overflowed is cut, back to a char
    /// boundary within `cap`; replacement chars never count against the cap.
    pub fn into_text(self, cap: usize) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated && text.len() > cap {
            let mut end = cap;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        (text, self.truncated)
    }
}

pub type SharedStream = Arc<Mutex<CapturedStream>>;

/// Drains `reader` into `sink` until EOF or until more than `cap` bytes arrived.
/// On overflow the excess is dropped, the stream is flagged and `overflow` fires.
pub async fn capture<R>(mut reader: R, cap: usize, sink: SharedStream, overflow: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Output capture stopped: {}", e);
                break;
            }
        };

        let mut stream = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let room = cap.saturating_sub(stream.bytes.len());
        if n > room {
            stream.bytes.extend_from_slice(&buf[..room]);
            stream.truncated = true;
            drop(stream);
            overflow.cancel();
            break;
        }
        stream.bytes.extend_from_slice(&buf[..n]);
    }
}

pub fn take(sink: &SharedStream) -> CapturedStream {
    let mut stream = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut *stream)
}
