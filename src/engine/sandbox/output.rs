use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc::UnboundedSender,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Forwards everything read from `reader` as chunks. Keeps draining until EOF
/// so a chatty child never blocks on a full pipe.
pub async fn pump<R>(mut reader: R, stream: Stream, tx: UnboundedSender<(Stream, Bytes)>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, Bytes::copy_from_slice(&chunk[..n]))).is_err() {
                    break;
                }
            }
        }
    }
}

const STDERR_TAIL_BYTES: usize = 512;

/// Bounded capture of stdout, stderr and their interleaving.
#[derive(Debug)]
pub struct OutputSink {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
    /// Last bytes of stderr, kept even past the limit for diagnostics.
    stderr_tail: Vec<u8>,
    truncated: bool,
}

impl OutputSink {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::with_capacity(limit.min(8192)),
            stderr: Vec::with_capacity(limit.min(8192)),
            combined: Vec::with_capacity(limit.min(8192)),
            stderr_tail: Vec::with_capacity(STDERR_TAIL_BYTES),
            truncated: false,
        }
    }

    pub fn push(&mut self, stream: Stream, data: &[u8]) {
        let limit = self.limit;
        let target = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        self.truncated |= append_bounded(target, data, limit);
        self.truncated |= append_bounded(&mut self.combined, data, limit);
        if stream == Stream::Stderr {
            self.stderr_tail.extend_from_slice(data);
            let excess = self.stderr_tail.len().saturating_sub(STDERR_TAIL_BYTES);
            self.stderr_tail.drain(..excess);
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn stderr_tail(&self) -> &[u8] {
        &self.stderr_tail
    }

    pub fn finish(self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            combined: String::from_utf8_lossy(&self.combined).into_owned(),
        }
    }
}

/// Returns true when some of `data` did not fit.
fn append_bounded(target: &mut Vec<u8>, data: &[u8], limit: usize) -> bool {
    let remaining = limit.saturating_sub(target.len());
    target.extend_from_slice(&data[..remaining.min(data.len())]);
    data.len() > remaining
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub combined: String,
}
