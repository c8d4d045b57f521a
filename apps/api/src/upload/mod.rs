//! Resumable chunked upload of a local file to object storage.
//!
//! Files at or below `threshold_bytes` go up in one request. Larger files are
//! split into `chunk_size_bytes` parts sent through a multipart upload; each
//! part is retried on its own with exponential backoff. Pause and cancel are
//! cooperative and take effect between parts.

pub mod handlers;
pub mod transport;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::{info, warn};

pub use transport::{S3Transport, UploadTransport, UploadedPart};

pub const DEFAULT_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Ceiling on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upload cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub threshold_bytes: u64,
    pub chunk_size_bytes: u64,
    /// Retries per chunk after the first attempt fails.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadState {
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub current_chunk: u32,
    pub percent: f64,
    pub paused: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Control {
    paused: bool,
    cancelled: bool,
}

/// Shared control and progress for one upload. Clone it to drive the upload
/// from another task; state stays readable after the upload ends.
#[derive(Clone)]
pub struct UploadHandle {
    control: Arc<watch::Sender<Control>>,
    state: Arc<Mutex<UploadState>>,
}

impl Default for UploadHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Control::default());
        Self {
            control: Arc::new(tx),
            state: Arc::new(Mutex::new(UploadState::default())),
        }
    }

    pub fn pause(&self) {
        self.control.send_modify(|c| c.paused = true);
    }

    pub fn resume(&self) {
        self.control.send_modify(|c| c.paused = false);
    }

    /// Stops after the attempt in flight. Parts already stored are not removed.
    pub fn cancel(&self) {
        self.control.send_modify(|c| c.cancelled = true);
    }

    pub fn state(&self) -> UploadState {
        let control = *self.control.borrow();
        let mut state = self.lock_state().clone();
        state.paused = control.paused;
        state.cancelled = control.cancelled;
        state
    }

    fn is_cancelled(&self) -> bool {
        self.control.borrow().cancelled
    }

    /// Waits while paused. Errors if the upload is cancelled meanwhile.
    async fn checkpoint(&self) -> Result<(), UploadError> {
        let mut rx = self.control.subscribe();
        let control = rx
            .wait_for(|c| c.cancelled || !c.paused)
            .await
            .map(|c| *c)
            .unwrap_or(Control {
                paused: false,
                cancelled: true,
            });
        if control.cancelled {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, UploadState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut UploadState)) {
        let mut state = self.lock_state();
        f(&mut state);
        state.percent = if state.total_chunks == 0 {
            0.0
        } else {
            f64::from(state.completed_chunks) * 100.0 / f64::from(state.total_chunks)
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadReceipt {
    pub key: String,
    pub bytes: u64,
    pub chunks: u32,
    pub multipart: bool,
}

/// Completion and error callbacks. Each is `FnOnce`, and exactly one of
/// them runs for a given upload.
#[derive(Default)]
pub struct UploadCallbacks {
    pub on_complete: Option<Box<dyn FnOnce(&UploadReceipt) + Send>>,
    pub on_error: Option<Box<dyn FnOnce(&UploadError) + Send>>,
}

pub struct ChunkedUploader {
    transport: Arc<dyn UploadTransport>,
    options: UploadOptions,
}

/// Number of chunks a file of `size` bytes is split into.
pub fn chunk_count(size: u64, options: &UploadOptions) -> u32 {
    if size <= options.threshold_bytes {
        return 1;
    }
    let chunk = options.chunk_size_bytes.max(1);
    size.div_ceil(chunk) as u32
}

impl ChunkedUploader {
    pub fn new(transport: Arc<dyn UploadTransport>, options: UploadOptions) -> Self {
        Self { transport, options }
    }

    pub async fn upload_with_callbacks(
        &self,
        path: &Path,
        key: &str,
        handle: &UploadHandle,
        callbacks: UploadCallbacks,
    ) -> Result<UploadReceipt, UploadError> {
        let result = self.upload(path, key, handle).await;
        match &result {
            Ok(receipt) => {
                if let Some(cb) = callbacks.on_complete {
                    cb(receipt);
                }
            }
            Err(e) => {
                if let Some(cb) = callbacks.on_error {
                    cb(e);
                }
            }
        }
        result
    }

    pub async fn upload(
        &self,
        path: &Path,
        key: &str,
        handle: &UploadHandle,
    ) -> Result<UploadReceipt, UploadError> {
        let size = tokio::fs::metadata(path).await?.len();
        let total = chunk_count(size, &self.options);
        handle.update(|s| {
            s.total_chunks = total;
            s.completed_chunks = 0;
            s.current_chunk = 0;
        });

        let multipart = size > self.options.threshold_bytes;
        info!(
            "Uploading {} ({} bytes) to {} in {} chunk(s)",
            path.display(),
            size,
            key,
            total
        );

        let result = if multipart {
            self.upload_multipart(path, key, size, total, handle).await
        } else {
            self.upload_direct(path, key, handle).await
        };

        match &result {
            Ok(()) => info!("Upload of {} complete", key),
            Err(e) => warn!("Upload of {} stopped: {}", key, e),
        }
        result.map(|()| UploadReceipt {
            key: key.to_string(),
            bytes: size,
            chunks: total,
            multipart,
        })
    }

    async fn upload_direct(
        &self,
        path: &Path,
        key: &str,
        handle: &UploadHandle,
    ) -> Result<(), UploadError> {
        handle.checkpoint().await?;
        let body = Bytes::from(tokio::fs::read(path).await?);
        self.with_retry(handle, 0, || self.transport.put_object(key, body.clone()))
            .await?;
        handle.update(|s| s.completed_chunks = 1);
        Ok(())
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        total: u32,
        handle: &UploadHandle,
    ) -> Result<(), UploadError> {
        handle.checkpoint().await?;
        let upload_id = self.transport.create_multipart(key).await?;
        let mut file = tokio::fs::File::open(path).await?;
        let mut parts = Vec::with_capacity(total as usize);

        for index in 0..total {
            handle.checkpoint().await?;
            handle.update(|s| s.current_chunk = index);

            let offset = u64::from(index) * self.options.chunk_size_bytes;
            let len = self.options.chunk_size_bytes.min(size - offset) as usize;
            let mut buf = vec![0u8; len];
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf).await?;
            let body = Bytes::from(buf);

            let part_number = index as i32 + 1;
            let part = self
                .with_retry(handle, index, || {
                    self.transport
                        .upload_part(key, &upload_id, part_number, body.clone())
                })
                .await?;
            parts.push(part);
            handle.update(|s| s.completed_chunks = index + 1);
        }

        self.transport
            .complete_multipart(key, &upload_id, &parts)
            .await
    }

    /// Runs one chunk's transfer, retrying failures with exponential backoff.
    /// Cancellation is checked between attempts.
    async fn with_retry<T, F, Fut>(
        &self,
        handle: &UploadHandle,
        chunk: u32,
        mut attempt_fn: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, UploadError>>,
    {
        let attempts = self.options.max_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                if handle.is_cancelled() {
                    return Err(UploadError::Cancelled);
                }
                let delay = backoff_delay(self.options.base_delay, attempt);
                warn!(
                    "Chunk {} attempt {} failed, retrying after {}ms...",
                    chunk,
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or(UploadError::Cancelled))
    }
}

/// Sleep before retry number `retry` (1-based): `base * 2^(retry-1)`,
/// capped at [`MAX_BACKOFF`].
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let factor = 1u32
        .checked_shl(retry.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    /// Transport that fails the first `n` attempts of selected parts.
    #[derive(Default)]
    struct ScriptedTransport {
        failures: Mutex<HashMap<i32, usize>>,
        puts: Mutex<Vec<Bytes>>,
        parts: Mutex<Vec<(i32, Bytes)>>,
        completed: Mutex<Option<Vec<UploadedPart>>>,
        attempts: AtomicUsize,
        cancel_after_part: Mutex<Option<(i32, UploadHandle)>>,
    }

    impl ScriptedTransport {
        fn fail_part(self, part: i32, times: usize) -> Self {
            self.failures.lock().unwrap().insert(part, times);
            self
        }

        fn take_failure(&self, part: i32) -> bool {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&part) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        }
    }

    #[async_trait]
    impl UploadTransport for ScriptedTransport {
        async fn put_object(&self, _key: &str, body: Bytes) -> Result<(), UploadError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.take_failure(0) {
                return Err(UploadError::Transport("connection reset".to_string()));
            }
            self.puts.lock().unwrap().push(body);
            Ok(())
        }

        async fn create_multipart(&self, _key: &str) -> Result<String, UploadError> {
            Ok("upload-1".to_string())
        }

        async fn upload_part(
            &self,
            _key: &str,
            _upload_id: &str,
            part_number: i32,
            body: Bytes,
        ) -> Result<UploadedPart, UploadError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.take_failure(part_number) {
                return Err(UploadError::Transport(format!("part {part_number} timed out")));
            }
            self.parts.lock().unwrap().push((part_number, body));
            if let Some((after, handle)) = self.cancel_after_part.lock().unwrap().as_ref() {
                if *after == part_number {
                    handle.cancel();
                }
            }
            Ok(UploadedPart {
                part_number,
                etag: format!("etag-{part_number}"),
            })
        }

        async fn complete_multipart(
            &self,
            _key: &str,
            _upload_id: &str,
            parts: &[UploadedPart],
        ) -> Result<(), UploadError> {
            *self.completed.lock().unwrap() = Some(parts.to_vec());
            Ok(())
        }

        async fn object_exists(&self, _key: &str) -> Result<bool, UploadError> {
            Ok(true)
        }
    }

    fn file_of(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn small_options() -> UploadOptions {
        UploadOptions {
            threshold_bytes: 10,
            chunk_size_bytes: 4,
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_chunk_count_threshold_rule() {
        let opts = UploadOptions::default();
        assert_eq!(chunk_count(0, &opts), 1);
        assert_eq!(chunk_count(DEFAULT_THRESHOLD_BYTES, &opts), 1);
        // 101 MiB over 5 MiB chunks
        assert_eq!(chunk_count(101 * 1024 * 1024, &opts), 21);
        assert_eq!(chunk_count(11, &small_options()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_file_uses_single_request() {
        let transport = Arc::new(ScriptedTransport::default());
        let uploader = ChunkedUploader::new(transport.clone(), small_options());
        let file = file_of(10);
        let handle = UploadHandle::new();

        let receipt = uploader
            .upload(file.path(), "videos/a.mp4", &handle)
            .await
            .unwrap();

        assert!(!receipt.multipart);
        assert_eq!(receipt.chunks, 1);
        assert_eq!(transport.puts.lock().unwrap()[0].len(), 10);
        assert_eq!(handle.state().percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_file_sends_ordered_parts() {
        let transport = Arc::new(ScriptedTransport::default());
        let uploader = ChunkedUploader::new(transport.clone(), small_options());
        let file = file_of(11);
        let handle = UploadHandle::new();

        let receipt = uploader
            .upload(file.path(), "videos/b.mp4", &handle)
            .await
            .unwrap();

        assert!(receipt.multipart);
        assert_eq!(receipt.chunks, 3);
        let parts = transport.parts.lock().unwrap();
        let sizes: Vec<usize> = parts.iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 3]);
        let completed = transport.completed.lock().unwrap().clone().unwrap();
        let numbers: Vec<i32> = completed.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        let state = handle.state();
        assert_eq!(state.completed_chunks, 3);
        assert_eq!(state.percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_failing_chunk_is_retried() {
        let transport = Arc::new(ScriptedTransport::default().fail_part(2, 2));
        let uploader = ChunkedUploader::new(transport.clone(), small_options());
        let file = file_of(11);
        let handle = UploadHandle::new();
        let started = tokio::time::Instant::now();

        uploader
            .upload(file.path(), "videos/c.mp4", &handle)
            .await
            .unwrap();

        // 3 parts + 2 retries of part 2
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 5);
        // backoff 100ms then 200ms
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_survives_exactly_max_retries_failures() {
        let transport = Arc::new(ScriptedTransport::default().fail_part(0, 3));
        let uploader = ChunkedUploader::new(transport.clone(), small_options());
        let file = file_of(10);
        let handle = UploadHandle::new();

        let receipt = uploader
            .upload(file.path(), "videos/f.mp4", &handle)
            .await
            .unwrap();

        assert!(!receipt.multipart);
        // first attempt + 3 retries
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(transport.puts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::MAX, 2), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_with_last_error_and_keep_state() {
        let transport = Arc::new(ScriptedTransport::default().fail_part(2, 10));
        let uploader = ChunkedUploader::new(transport.clone(), small_options());
        let file = file_of(11);
        let handle = UploadHandle::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let callbacks = UploadCallbacks {
            on_complete: Some(Box::new({
                let completed = completed.clone();
                move |_: &UploadReceipt| {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            })),
            on_error: Some(Box::new({
                let errors = errors.clone();
                move |_: &UploadError| {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
            })),
        };

        let err = uploader
            .upload_with_callbacks(file.path(), "videos/d.mp4", &handle, callbacks)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("part 2 timed out"));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        let state = handle.state();
        assert_eq!(state.total_chunks, 3);
        assert_eq!(state.completed_chunks, 1);
        assert_eq!(state.current_chunk, 1);
        assert!(transport.completed.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_before_next_chunk() {
        let transport = Arc::new(ScriptedTransport::default());
        let handle = UploadHandle::new();
        *transport.cancel_after_part.lock().unwrap() = Some((1, handle.clone()));
        let uploader = ChunkedUploader::new(transport.clone(), small_options());
        let file = file_of(11);

        let err = uploader
            .upload(file.path(), "videos/e.mp4", &handle)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Cancelled));
        assert_eq!(transport.parts.lock().unwrap().len(), 1);
        let state = handle.state();
        assert!(state.cancelled);
        assert_eq!(state.completed_chunks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_upload_until_resume() {
        let transport = Arc::new(ScriptedTransport::default());
        let uploader = Arc::new(ChunkedUploader::new(transport.clone(), small_options()));
        let file = file_of(11);
        let path = file.path().to_path_buf();
        let handle = UploadHandle::new();
        handle.pause();

        let task = tokio::spawn({
            let uploader = uploader.clone();
            let handle = handle.clone();
            async move { uploader.upload(&path, "videos/f.mp4", &handle).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.state().paused);
        assert!(transport.parts.lock().unwrap().is_empty());

        handle.resume();
        let receipt = task.await.unwrap().unwrap();
        assert_eq!(receipt.chunks, 3);
        assert!(!handle.state().paused);
    }
}
