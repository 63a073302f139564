use serde::Serialize;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: Option<u64>,
    pub bytes_per_sec: f64,
}

impl TransferProgress {
    pub fn percent(&self) -> Option<f64> {
        self.total
            .filter(|total| *total > 0)
            .map(|total| self.transferred as f64 * 100.0 / total as f64)
    }
}

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

struct Tracker {
    callback: Option<ProgressCallback>,
    transferred: u64,
    total: Option<u64>,
    started: Instant,
}

impl Tracker {
    fn new(callback: Option<ProgressCallback>, start_at: u64, total: Option<u64>) -> Self {
        Self {
            callback,
            transferred: start_at,
            total,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.transferred += n as u64;
        if let Some(callback) = &self.callback {
            let secs = self.started.elapsed().as_secs_f64();
            callback(TransferProgress {
                transferred: self.transferred,
                total: self.total,
                bytes_per_sec: if secs > 0.0 {
                    self.transferred as f64 / secs
                } else {
                    0.0
                },
            });
        }
    }
}

/// Reports every chunk read through it.
pub struct ProgressReader<R> {
    inner: R,
    tracker: Tracker,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, total: Option<u64>, callback: Option<ProgressCallback>) -> Self {
        Self::resuming(inner, 0, total, callback)
    }

    /// Starts counting from `start_at`, for continuations.
    pub fn resuming(
        inner: R,
        start_at: u64,
        total: Option<u64>,
        callback: Option<ProgressCallback>,
    ) -> Self {
        Self {
            inner,
            tracker: Tracker::new(callback, start_at, total),
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.tracker.advance(n);
        Ok(n)
    }
}

/// Reports every chunk written through it.
pub struct ProgressWriter<W> {
    inner: W,
    tracker: Tracker,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(
        inner: W,
        start_at: u64,
        total: Option<u64>,
        callback: Option<ProgressCallback>,
    ) -> Self {
        Self {
            inner,
            tracker: Tracker::new(callback, start_at, total),
        }
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.tracker.advance(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_reader_reports_cumulative_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |p: TransferProgress| sink.lock().unwrap().push(p.transferred));

        let data = vec![7_u8; 10_000];
        let mut reader = ProgressReader::new(&data[..], Some(10_000), Some(callback));
        let mut out = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out.len(), 10_000);
        assert_eq!(*seen.lock().unwrap(), vec![4096, 8192, 10_000]);
    }

    #[test]
    fn test_writer_resumes_from_offset() {
        let last = Arc::new(Mutex::new(None));
        let sink = last.clone();
        let callback: ProgressCallback = Arc::new(move |p: TransferProgress| *sink.lock().unwrap() = Some(p));

        let mut writer = ProgressWriter::new(Vec::new(), 4000, Some(10_000), Some(callback));
        writer.write_all(&[1_u8; 6000]).unwrap();

        let progress = last.lock().unwrap().unwrap();
        assert_eq!(progress.transferred, 10_000);
        assert_eq!(progress.percent(), Some(100.0));
    }
}
