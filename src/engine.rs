//! Single-shot asynchronous download engine.
//!
//! Each `start` call runs one curl GET on a blocking task, streams the body
//! into a private temp file, and bridges progress and the terminal outcome
//! back into the caller's future. One session per engine instance at a time;
//! the per-session completion slot guarantees the pending result resolves
//! exactly once even if the transport misbehaves.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::SaverConfig;
use crate::error::SaveError;

/// Progress report for one in-flight download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Fraction complete in [0, 1]; reported only while the total size is
    /// known.
    Fraction(f64),
    /// Total size unknown; no fraction can be computed.
    Indeterminate,
}

/// Cancels an in-flight transfer. The pending result then resolves as
/// `Cancelled` and no further progress is delivered. Idempotent, safe to
/// call from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A finished download: the temp file plus the response metadata needed for
/// extension resolution. The file lives in the engine's scratch directory
/// until placement moves it.
#[derive(Debug)]
pub struct TempPayload {
    pub path: PathBuf,
    /// `Content-Type` reported by the server, if any.
    pub content_type: Option<String>,
    pub bytes_written: u64,
}

/// Book-keeping for one download, owned by its transfer for the duration of
/// a single `start` call and dropped once the outcome is delivered.
struct DownloadSession {
    id: u64,
    bytes_written: u64,
    bytes_expected: Option<u64>,
    last_fraction: f64,
    indeterminate: bool,
}

impl DownloadSession {
    fn new(id: u64) -> Self {
        Self {
            id,
            bytes_written: 0,
            bytes_expected: None,
            last_fraction: 0.0,
            indeterminate: false,
        }
    }

    /// Folds a raw transport report into the session invariants: fractions
    /// stay within [0, 1] and never decrease, and once a report arrives with
    /// an unknown total the session stays indeterminate for its lifetime.
    fn observe(&mut self, bytes_now: u64, bytes_total: u64) -> Progress {
        self.bytes_written = bytes_now;
        if self.indeterminate || bytes_total == 0 {
            self.indeterminate = true;
            self.bytes_expected = None;
            return Progress::Indeterminate;
        }
        self.bytes_expected = Some(bytes_total);
        let fraction = (bytes_now as f64 / bytes_total as f64).clamp(0.0, 1.0);
        if fraction > self.last_fraction {
            self.last_fraction = fraction;
        }
        Progress::Fraction(self.last_fraction)
    }
}

/// Per-session completion slot. The first terminal notification takes the
/// sender and resolves the caller's future; a later notification finds the
/// slot empty and is dropped instead of re-resolving.
struct CompletionSlot {
    tx: Mutex<Option<oneshot::Sender<Result<TempPayload, SaveError>>>>,
}

impl CompletionSlot {
    fn new(tx: oneshot::Sender<Result<TempPayload, SaveError>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn resolve(&self, session_id: u64, outcome: Result<TempPayload, SaveError>) {
        match self.tx.lock().unwrap().take() {
            // The caller may have dropped the receiver; nothing to do then.
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => warn!(session_id, "dropped late terminal notification"),
        }
    }
}

/// Releases the engine's in-flight flag when the transfer ends.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy)]
struct Timeouts {
    connect: Duration,
    stall: Duration,
    resource: Duration,
}

/// Drives one asynchronous fetch at a time. Construct one engine per
/// concurrent download; sessions never share mutable state.
pub struct DownloadEngine {
    scratch_dir: PathBuf,
    timeouts: Timeouts,
    in_flight: Arc<AtomicBool>,
    next_session_id: AtomicU64,
}

impl DownloadEngine {
    /// Creates an engine writing in-flight payloads under the configured
    /// scratch directory, creating it if needed.
    pub fn new(config: &SaverConfig) -> Result<Self> {
        let scratch_dir = config.scratch_dir();
        std::fs::create_dir_all(&scratch_dir)
            .with_context(|| format!("failed to create scratch dir: {}", scratch_dir.display()))?;
        Ok(Self {
            scratch_dir,
            timeouts: Timeouts {
                connect: Duration::from_secs(config.connect_timeout_secs),
                stall: Duration::from_secs(config.stall_timeout_secs),
                resource: Duration::from_secs(config.resource_timeout_secs),
            },
            in_flight: Arc::new(AtomicBool::new(false)),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Directory holding in-flight and placed payloads.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Fetches `url` into a temp file, calling `on_progress` zero or more
    /// times from the transfer's execution context. The caller redirects
    /// reports onto a serialized context if it needs one for display.
    ///
    /// Returns `Busy` immediately when a session is already in flight.
    /// One attempt per call; dropping the returned future does not abort the
    /// transfer (use [`DownloadEngine::start_cancellable`] for that).
    pub async fn start<F>(&self, url: &str, on_progress: F) -> Result<TempPayload, SaveError>
    where
        F: Fn(Progress) + Send + 'static,
    {
        self.start_cancellable(url, on_progress, CancelHandle::new())
            .await
    }

    /// Like [`DownloadEngine::start`], with a caller-held handle that aborts
    /// the transfer and resolves the outcome as `Cancelled`.
    pub async fn start_cancellable<F>(
        &self,
        url: &str,
        on_progress: F,
        cancel: CancelHandle,
    ) -> Result<TempPayload, SaveError>
    where
        F: Fn(Progress) + Send + 'static,
    {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(SaveError::Busy);
        }
        let flight_guard = FlightGuard(Arc::clone(&self.in_flight));

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(CompletionSlot::new(tx));

        let url = url.to_string();
        let scratch_dir = self.scratch_dir.clone();
        let timeouts = self.timeouts;
        let task_slot = Arc::clone(&slot);

        debug!(session_id, %url, "starting download");
        tokio::task::spawn_blocking(move || {
            let mut session = DownloadSession::new(session_id);
            let outcome =
                run_transfer(&url, &scratch_dir, timeouts, &cancel, &mut session, &on_progress);
            // Free the single-flight slot before resolving, so a caller that
            // sees the outcome can start the next session without a spurious
            // Busy.
            drop(flight_guard);
            task_slot.resolve(session_id, outcome);
        });

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SaveError::network(
                "transfer task ended without delivering a result",
            )),
        }
    }
}

/// Runs the blocking curl transfer for one session. Every terminal path
/// returns exactly once; on any failure the temp file is dropped and thus
/// removed from disk.
fn run_transfer<F>(
    url: &str,
    scratch_dir: &Path,
    timeouts: Timeouts,
    cancel: &CancelHandle,
    session: &mut DownloadSession,
    on_progress: &F,
) -> Result<TempPayload, SaveError>
where
    F: Fn(Progress),
{
    let temp = NamedTempFile::new_in(scratch_dir).map_err(SaveError::Storage)?;

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(SaveError::network)?;
    easy.follow_location(true).map_err(SaveError::network)?;
    easy.max_redirections(10).map_err(SaveError::network)?;
    easy.connect_timeout(timeouts.connect)
        .map_err(SaveError::network)?;
    // Per-request stall timeout: abort when no data arrives for the window.
    easy.low_speed_limit(1).map_err(SaveError::network)?;
    easy.low_speed_time(timeouts.stall)
        .map_err(SaveError::network)?;
    // Hard cap on the whole transfer.
    easy.timeout(timeouts.resource).map_err(SaveError::network)?;
    easy.progress(true).map_err(SaveError::network)?;

    let mut io_error: Option<std::io::Error> = None;
    let perform_result = {
        let mut file = temp.as_file();
        let io_error = &mut io_error;
        let mut transfer = easy.transfer();
        transfer
            .write_function(move |data| match file.write_all(data) {
                Ok(()) => Ok(data.len()),
                Err(e) => {
                    warn!("payload write failed: {}", e);
                    *io_error = Some(e);
                    Ok(0) // abort transfer
                }
            })
            .map_err(SaveError::network)?;
        transfer
            .progress_function(|dl_total, dl_now, _ul_total, _ul_now| {
                if cancel.is_cancelled() {
                    return false; // abort transfer
                }
                if dl_now > 0.0 || dl_total > 0.0 {
                    let report = session.observe(dl_now as u64, dl_total as u64);
                    on_progress(report);
                }
                true
            })
            .map_err(SaveError::network)?;
        transfer.perform()
    };

    if let Some(e) = io_error {
        return Err(SaveError::Storage(e));
    }
    if let Err(e) = perform_result {
        if cancel.is_cancelled() {
            debug!(session_id = session.id, "transfer aborted by cancel handle");
            return Err(SaveError::Cancelled);
        }
        return Err(SaveError::network(e));
    }

    let code = easy.response_code().map_err(SaveError::network)?;
    if !(200..300).contains(&code) {
        return Err(SaveError::network(format!(
            "GET {} returned HTTP {}",
            url, code
        )));
    }
    let content_type = easy
        .content_type()
        .ok()
        .flatten()
        .map(|s| s.to_string());

    temp.as_file().sync_all().map_err(SaveError::Storage)?;
    let bytes_written = temp.as_file().metadata().map_err(SaveError::Storage)?.len();
    // Persist the temp file before control leaves the transfer; from here on
    // the engine owns its lifetime.
    let (_file, path) = temp.keep().map_err(|e| SaveError::Storage(e.error))?;

    debug!(
        session_id = session.id,
        bytes_written,
        path = %path.display(),
        "download completed"
    );
    Ok(TempPayload {
        path,
        content_type,
        bytes_written,
    })
}


#[cfg(test)]
mod tests {
    use super::test_server::{ok_response, spawn_server};
    use super::*;

    fn test_engine(dir: &Path) -> DownloadEngine {
        let config = SaverConfig {
            connect_timeout_secs: 5,
            stall_timeout_secs: 5,
            resource_timeout_secs: 20,
            scratch_dir: Some(dir.to_path_buf()),
            library_dir: None,
        };
        DownloadEngine::new(&config).unwrap()
    }

    #[tokio::test]
    async fn successful_fetch_writes_payload_and_reports_monotonic_progress() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![7u8; 4096];
        let (base, server) = spawn_server(ok_response("image/png", &body), Duration::ZERO, Duration::ZERO);
        let engine = test_engine(dir.path());

        let reports: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let payload = engine
            .start(&format!("{}/a.bin", base), move |p| {
                sink.lock().unwrap().push(p)
            })
            .await
            .unwrap();
        server.join().unwrap();

        assert_eq!(payload.bytes_written, 4096);
        assert_eq!(payload.content_type.as_deref(), Some("image/png"));
        assert_eq!(std::fs::read(&payload.path).unwrap(), body);

        let reports = reports.lock().unwrap();
        let mut last = 0.0;
        for p in reports.iter() {
            match p {
                Progress::Fraction(f) => {
                    assert!(*f >= last && *f <= 1.0);
                    last = *f;
                }
                Progress::Indeterminate => panic!("total size was known"),
            }
        }
        assert_eq!(*reports.last().unwrap(), Progress::Fraction(1.0));
    }

    #[tokio::test]
    async fn non_success_status_is_a_network_error_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let response = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let (base, server) = spawn_server(response.to_vec(), Duration::ZERO, Duration::ZERO);
        let engine = test_engine(dir.path());

        let err = engine
            .start(&format!("{}/a.bin", base), |_| {})
            .await
            .unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, SaveError::Network(_)), "{}", err);
        assert!(err.to_string().contains("404"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn truncated_body_is_a_network_error_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // Declares 100 bytes, delivers 10, then closes mid-transfer.
        let response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n0123456789";
        let (base, server) = spawn_server(response.to_vec(), Duration::ZERO, Duration::ZERO);
        let engine = test_engine(dir.path());

        let err = engine
            .start(&format!("{}/a.bin", base), |_| {})
            .await
            .unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, SaveError::Network(_)), "{}", err);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn second_start_while_in_flight_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (base, server) = spawn_server(
            ok_response("video/mp4", b"abc"),
            Duration::from_millis(1500),
            Duration::ZERO,
        );
        let engine = Arc::new(test_engine(dir.path()));

        let first = {
            let engine = Arc::clone(&engine);
            let url = format!("{}/a.bin", base);
            tokio::spawn(async move { engine.start(&url, |_| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = engine
            .start(&format!("{}/b.bin", base), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SaveError::Busy));

        // The first session proceeds to its own outcome undisturbed.
        let payload = first.await.unwrap().unwrap();
        assert_eq!(payload.bytes_written, 3);
        server.join().unwrap();
    }

    #[tokio::test]
    async fn cancel_resolves_as_cancelled_and_removes_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // Headers promise more data than ever arrives; the transfer idles
        // until the cancel handle aborts it from the progress callback.
        let response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\nConnection: close\r\n\r\npartial";
        let (base, server) =
            spawn_server(response.to_vec(), Duration::ZERO, Duration::from_secs(10));
        let engine = Arc::new(test_engine(dir.path()));

        let cancel = CancelHandle::new();
        let task = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            let url = format!("{}/a.bin", base);
            tokio::spawn(async move { engine.start_cancellable(&url, |_| {}, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SaveError::Cancelled), "{}", err);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        drop(server);
    }

    #[test]
    fn session_progress_is_monotonic_and_clamped() {
        let mut s = DownloadSession::new(1);
        assert_eq!(s.observe(100, 1000), Progress::Fraction(0.1));
        assert_eq!(s.observe(500, 1000), Progress::Fraction(0.5));
        // A lower raw report never moves the fraction backwards.
        assert_eq!(s.observe(400, 1000), Progress::Fraction(0.5));
        // Overshoot clamps at 1.0.
        assert_eq!(s.observe(2000, 1000), Progress::Fraction(1.0));
        assert_eq!(s.bytes_expected, Some(1000));
    }

    #[test]
    fn session_latches_indeterminate_mode() {
        let mut s = DownloadSession::new(2);
        assert_eq!(s.observe(100, 0), Progress::Indeterminate);
        // Even a later report with a total stays indeterminate.
        assert_eq!(s.observe(200, 1000), Progress::Indeterminate);
        assert_eq!(s.bytes_expected, None);
        assert_eq!(s.bytes_written, 200);
    }

    #[tokio::test]
    async fn completion_slot_resolves_exactly_once() {
        let (tx, rx) = oneshot::channel();
        let slot = CompletionSlot::new(tx);
        slot.resolve(7, Err(SaveError::Cancelled));
        // Double delivery from the transport must be ignored, not re-resolved.
        slot.resolve(
            7,
            Err(SaveError::network("late duplicate from the transport")),
        );
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(SaveError::Cancelled)));
    }
}
