//! Distributed share counter
//!
//! Estimates how many hosts serve the same shared storage path, using only
//! the shared filesystem:
//! - every host owns one heartbeat marker `<path>/dfsc-<sha256(host)>.csv`
//! - a background task rewrites the marker every `timeout / 4`
//! - the count is the number of markers refreshed within `timeout`
//!
//! Stale foreign markers are never deleted, only ignored. A released counter
//! removes its own marker.

use crate::state::{new_state, Shared};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors raised while refreshing a marker
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid marker pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("failed to lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// Default staleness timeout of markers
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const MARKER_PREFIX: &str = "dfsc-";
const MARKER_SUFFIX: &str = ".csv";

/// Locks of markers owned by this process, keyed by marker path
static LOCAL_LOCKS: Lazy<parking_lot::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    Lazy::new(|| parking_lot::Mutex::new(HashMap::new()));

fn local_lock(marker: &Path) -> Arc<tokio::sync::Mutex<()>> {
    LOCAL_LOCKS
        .lock()
        .entry(marker.to_path_buf())
        .or_default()
        .clone()
}

/// Give back a lock from [`local_lock`], forgetting it once nobody else holds it
fn release_local_lock(marker: &Path, lock: Arc<tokio::sync::Mutex<()>>) {
    drop(lock);
    let mut locks = LOCAL_LOCKS.lock();
    if locks.get(marker).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        locks.remove(marker);
    }
}

/// Identity of the local host in marker files
pub fn host_identity() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Marker file of `identity` below `path`
pub fn marker_path(path: &Path, identity: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(identity.as_bytes()));
    path.join(format!("{}{}{}", MARKER_PREFIX, digest, MARKER_SUFFIX))
}

/// Number of markers below `path` modified within `timeout`
pub fn count_markers(path: &Path, timeout: Duration) -> Result<usize, CounterError> {
    let pattern = format!(
        "{}/{}*{}",
        glob::Pattern::escape(&path.to_string_lossy()),
        MARKER_PREFIX,
        MARKER_SUFFIX
    );
    let min_mtime = SystemTime::now()
        .checked_sub(timeout)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut count = 0;
    for entry in glob::glob(&pattern)? {
        // markers may vanish between listing and stat
        let Ok(marker) = entry else { continue };
        let Ok(modified) = std::fs::metadata(&marker).and_then(|meta| meta.modified()) else {
            continue;
        };
        if modified > min_mtime {
            count += 1;
        }
    }
    Ok(count)
}

/// Cheap clonable read handle of a [`ShareCounter`]
///
/// While any handle is alive, a [`SharePool`] keeps the counter running.
#[derive(Debug, Clone)]
pub struct ShareCount {
    value: Arc<AtomicUsize>,
    _interest: Arc<()>,
}

impl ShareCount {
    /// Most recent peer count, at most one refresh interval old
    pub fn current_count(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}

/// Heartbeat counter for one shared path
#[derive(Debug)]
pub struct ShareCounter {
    path: PathBuf,
    timeout: Duration,
    marker: PathBuf,
    value: Arc<AtomicUsize>,
    interest: Arc<()>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ShareCounter {
    /// Start counting hosts serving `path` under the local host identity
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::with_identity(path, timeout, host_identity())
    }

    /// Start counting with an explicit host identity
    pub fn with_identity(path: impl Into<PathBuf>, timeout: Duration, identity: impl Into<String>) -> Self {
        let path = path.into();
        let identity = identity.into();
        let marker = marker_path(&path, &identity);
        let value = Arc::new(AtomicUsize::new(0));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let heartbeat = Heartbeat {
            path: path.clone(),
            marker: marker.clone(),
            identity,
            timeout,
            value: value.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(heartbeat.run());

        Self {
            path,
            timeout,
            marker,
            value,
            interest: Arc::new(()),
            shutdown,
            task: Some(task),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn current_count(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }

    /// New read handle
    pub fn reader(&self) -> ShareCount {
        ShareCount {
            value: self.value.clone(),
            _interest: self.interest.clone(),
        }
    }

    /// Number of live read handles
    pub fn readers(&self) -> usize {
        Arc::strong_count(&self.interest) - 1
    }

    /// Signal the background task to remove the marker and stop
    pub fn release(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Release and wait until the marker is removed
    pub async fn join(mut self) {
        self.release();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("share counter task for {:?} failed: {}", self.path, e);
            }
        }
    }
}

impl Drop for ShareCounter {
    fn drop(&mut self) {
        self.release();
    }
}

/// State owned by the background task of one counter
struct Heartbeat {
    path: PathBuf,
    marker: PathBuf,
    identity: String,
    timeout: Duration,
    value: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

impl Heartbeat {
    fn interval(&self) -> Duration {
        self.timeout / 4
    }

    /// Wait for `delay` or shutdown; returns `true` on shutdown
    async fn pause(&mut self, delay: Duration) -> bool {
        if *self.shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            // a dropped sender also means shutdown
            _ = self.shutdown.changed() => true,
        }
    }

    async fn run(self) {
        let marker = self.marker.clone();
        let local = local_lock(&marker);
        self.serve(local.clone()).await;
        release_local_lock(&marker, local);
    }

    async fn serve(mut self, local: Arc<tokio::sync::Mutex<()>>) {
        let _guard = tokio::select! {
            guard = local.lock_owned() => guard,
            _ = self.shutdown.changed() => return,
        };
        let Some(_host_lock) = self.acquire_host_lock().await else {
            return;
        };

        info!("acquiring share counter for {:?} @ {:?}", self.path, self.marker);
        loop {
            let marker = self.marker.clone();
            let path = self.path.clone();
            let line = format!("{} {}", self.identity, std::process::id());
            let timeout = self.timeout;
            let refreshed = tokio::task::spawn_blocking(move || {
                write_marker(&marker, &line)?;
                count_markers(&path, timeout)
            })
            .await;

            match refreshed {
                Ok(Ok(count)) => {
                    debug!("{} hosts serving {:?}", count, self.path);
                    self.value.store(count, Ordering::Relaxed);
                }
                Ok(Err(e)) => warn!("failed updating share counter for {:?}: {}", self.path, e),
                Err(e) => warn!("share counter refresh for {:?} panicked: {}", self.path, e),
            }

            let delay = self.interval();
            if self.pause(delay).await {
                break;
            }
        }

        match std::fs::remove_file(&self.marker) {
            Ok(()) => debug!("removed marker {:?}", self.marker),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove marker {:?}: {}", self.marker, e),
        }
        info!("released share counter for {:?}", self.path);
    }

    /// Advisory lock on `<marker>.lock`, retried until shutdown
    async fn acquire_host_lock(&mut self) -> Option<File> {
        let mut lock_path = self.marker.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        loop {
            match try_flock(&lock_path) {
                Ok(Some(file)) => return Some(file),
                Ok(None) => debug!("{:?} is locked, waiting", lock_path),
                Err(e) => warn!("cannot lock share counter: {}", e),
            }
            let delay = self.interval();
            if self.pause(delay).await {
                return None;
            }
        }
    }
}

fn try_flock(lock_path: &Path) -> Result<Option<File>, CounterError> {
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)
        .map_err(|source| CounterError::Io {
            path: lock_path.to_path_buf(),
            source,
        })?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(Some(file)),
        Err(errno) if errno == Errno::EWOULDBLOCK => Ok(None),
        Err(source) => Err(CounterError::Lock {
            path: lock_path.to_path_buf(),
            source,
        }),
    }
}

fn write_marker(marker: &Path, line: &str) -> Result<(), CounterError> {
    std::fs::write(marker, line).map_err(|source| CounterError::Io {
        path: marker.to_path_buf(),
        source,
    })
}

/// Per-process registry of share counters, one per path
#[derive(Debug, Clone)]
pub struct SharePool {
    timeout: Duration,
    counters: Shared<HashMap<PathBuf, ShareCounter>>,
}

impl Default for SharePool {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl SharePool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            counters: new_state(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read handle for `path`, starting a counter on first observation
    pub fn counter(&self, path: impl AsRef<Path>) -> ShareCount {
        let path = path.as_ref();
        let mut counters = self.counters.lock();
        if let Some(counter) = counters.get(path) {
            return counter.reader();
        }
        let counter = ShareCounter::spawn(path, self.timeout);
        let reader = counter.reader();
        counters.insert(path.to_path_buf(), counter);
        reader
    }

    /// Release counters without any live read handle
    pub fn reclaim(&self) -> usize {
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|path, counter| {
            let keep = counter.readers() > 0;
            if !keep {
                debug!("reclaiming share counter for {:?}", path);
                counter.release();
            }
            keep
        });
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.lock().is_empty()
    }

    /// Release every counter and wait until all markers are removed
    pub async fn shutdown(&self) {
        let counters: Vec<ShareCounter> = self.counters.lock().drain().map(|(_, counter)| counter).collect();
        for counter in counters {
            counter.join().await;
        }
    }
}

/// Share handles for the storage paths of consecutive reports
///
/// Keeps a reader for every path of the latest observation and lets the pool
/// reclaim counters of paths that disappeared.
#[derive(Debug)]
pub struct PathShares {
    pool: SharePool,
    counts: HashMap<String, ShareCount>,
}

impl PathShares {
    pub fn new(pool: SharePool) -> Self {
        Self {
            pool,
            counts: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &SharePool {
        &self.pool
    }

    /// Largest peer count over `paths`, at least 1
    pub fn observe(&mut self, paths: impl IntoIterator<Item = String>) -> usize {
        let mut counts = HashMap::new();
        for path in paths {
            let count = match self.counts.remove(&path) {
                Some(count) => count,
                None => self.pool.counter(&path),
            };
            counts.insert(path, count);
        }
        let released = !self.counts.is_empty();
        self.counts = counts;
        if released {
            self.pool.reclaim();
        }

        self.counts
            .values()
            .map(ShareCount::current_count)
            .max()
            .unwrap_or(1)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    const TIMEOUT: Duration = Duration::from_millis(400);

    async fn wait_for(count: &ShareCount, expected: usize) -> bool {
        for _ in 0..100 {
            if count.current_count() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_marker_path() {
        let marker = marker_path(Path::new("/data"), "host.example.org");
        let name = marker.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dfsc-"));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "dfsc-".len() + 64 + ".csv".len());
        assert_eq!(marker, marker_path(Path::new("/data"), "host.example.org"));
    }

    #[test]
    fn test_count_ignores_stale_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dfsc-fresh.csv"), "a 1").unwrap();
        let stale = dir.path().join("dfsc-stale.csv");
        std::fs::write(&stale, "b 2").unwrap();
        set_file_mtime(&stale, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        std::fs::write(dir.path().join("unrelated.csv"), "c 3").unwrap();

        assert_eq!(count_markers(dir.path(), Duration::from_secs(60)).unwrap(), 1);
        assert!(stale.exists());
    }

    #[tokio::test]
    async fn test_counter_writes_and_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let counter = ShareCounter::with_identity(dir.path(), TIMEOUT, "host-a");
        let reader = counter.reader();
        assert!(wait_for(&reader, 1).await);

        let marker = counter.marker_path().to_path_buf();
        let content = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(content, format!("host-a {}", std::process::id()));

        counter.join().await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_convergence_and_departure() {
        let dir = tempfile::tempdir().unwrap();
        let hosts: Vec<_> = ["host-a", "host-b", "host-c"]
            .iter()
            .map(|host| ShareCounter::with_identity(dir.path(), TIMEOUT, *host))
            .collect();
        let readers: Vec<_> = hosts.iter().map(ShareCounter::reader).collect();
        for reader in &readers {
            assert!(wait_for(reader, 3).await);
        }

        let mut hosts = hosts.into_iter();
        hosts.next().unwrap().join().await;
        assert!(wait_for(&readers[1], 2).await);
        assert!(wait_for(&readers[2], 2).await);

        for host in hosts {
            host.join().await;
        }
    }

    #[tokio::test]
    async fn test_same_marker_is_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let first = ShareCounter::with_identity(dir.path(), TIMEOUT, "host-a");
        assert!(wait_for(&first.reader(), 1).await);

        // second counter for the same marker waits for the first
        let second = ShareCounter::with_identity(dir.path(), TIMEOUT, "host-a");
        tokio::time::sleep(TIMEOUT).await;
        assert_eq!(second.current_count(), 0);

        first.join().await;
        assert!(wait_for(&second.reader(), 1).await);
        let marker = second.marker_path().to_path_buf();
        assert!(LOCAL_LOCKS.lock().contains_key(&marker));
        second.join().await;
        assert!(!LOCAL_LOCKS.lock().contains_key(&marker));
    }

    #[tokio::test]
    async fn test_released_markers_leave_no_local_lock() {
        let dir = tempfile::tempdir().unwrap();
        let counter = ShareCounter::with_identity(dir.path(), TIMEOUT, "host-short-lived");
        let marker = counter.marker_path().to_path_buf();
        assert!(wait_for(&counter.reader(), 1).await);
        counter.join().await;
        assert!(!LOCAL_LOCKS.lock().contains_key(&marker));

        // released before the heartbeat even started
        let counter = ShareCounter::with_identity(dir.path(), TIMEOUT, "host-cancelled");
        let marker = counter.marker_path().to_path_buf();
        counter.join().await;
        assert!(!LOCAL_LOCKS.lock().contains_key(&marker));
        assert_eq!(count_markers(dir.path(), TIMEOUT).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_reclaim_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a");
        let second = dir.path().join("b");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();

        let pool = SharePool::new(TIMEOUT);
        let kept = pool.counter(&first);
        let again = pool.counter(&first);
        drop(pool.counter(&second));
        assert_eq!(pool.len(), 2);
        assert!(wait_for(&kept, 1).await);
        assert_eq!(again.current_count(), 1);

        assert_eq!(pool.reclaim(), 1);
        assert_eq!(pool.len(), 1);

        pool.shutdown().await;
        assert!(pool.is_empty());
        assert_eq!(count_markers(&first, TIMEOUT).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_path_shares_follow_reports() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a").to_string_lossy().into_owned();
        let second = dir.path().join("b").to_string_lossy().into_owned();
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();

        let pool = SharePool::new(TIMEOUT);
        let mut shares = PathShares::new(pool.clone());
        assert_eq!(shares.observe(Vec::new()), 1);
        assert!(shares.observe(vec![first.clone(), second.clone()]) >= 1);
        assert_eq!(pool.len(), 2);

        // the second path is gone from the next report
        shares.observe(vec![first.clone()]);
        assert_eq!(pool.len(), 1);
        assert_eq!(shares.pool().len(), 1);
        pool.shutdown().await;
    }
}
