//! Monitored XRootD daemon processes
//!
//! Handles:
//! - Daemon flavours (`cmsd`, `xrootd`) and their construction from reports
//! - Target identity: (flavour, instance name, pid, port)
//! - Lazily queried, cached storage space of `xrootd` daemons

use crate::liveness::LivenessProbe;
use crate::report::{Report, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Errors raised while building or querying targets
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("report without \"pgm\" identifier for flavour")]
    MissingFlavour,
    #[error("unknown \"pgm\" flavour: {0:?}")]
    UnknownFlavour(String),
    #[error("report for {flavour} is missing key {key:?}")]
    MissingKey { flavour: Flavour, key: &'static str },
    #[error("report key {key:?} has invalid value {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("target {0} has no port to query")]
    NoPort(String),
    #[error("space query timed out after {0:?}")]
    QueryTimeout(Duration),
    #[error("space query failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of XRootD daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flavour {
    Cmsd,
    Xrootd,
}

impl Flavour {
    pub const ALL: [Flavour; 2] = [Flavour::Cmsd, Flavour::Xrootd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Flavour::Cmsd => "cmsd",
            Flavour::Xrootd => "xrootd",
        }
    }

    /// Name of the daemon executable as seen in the process table
    pub fn process_name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Flavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flavour {
    type Err = TargetError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Flavour::ALL
            .into_iter()
            .find(|flavour| flavour.as_str() == name)
            .ok_or_else(|| TargetError::UnknownFlavour(name.to_string()))
    }
}

/// Identification fields shared by every flavour
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub name: String,
    pub pid: u32,
    pub port: Option<u16>,
    pub version: String,
}

type Constructor = fn(DaemonInfo) -> Target;

fn constructor(flavour: Flavour) -> Constructor {
    match flavour {
        Flavour::Cmsd => Target::cmsd,
        Flavour::Xrootd => Target::xrootd,
    }
}

/// Flavour specific state
#[derive(Debug, Clone)]
pub enum TargetKind {
    Cmsd,
    Xrootd(SpaceCache),
}

/// Identity tuple of a target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId {
    pub flavour: Flavour,
    pub name: String,
    pub pid: u32,
    pub port: Option<u16>,
}

/// One monitored daemon process
#[derive(Debug, Clone)]
pub struct Target {
    id: TargetId,
    version: String,
    kind: TargetKind,
}

impl Target {
    /// Build a target of the given flavour
    pub fn new(flavour: Flavour, info: DaemonInfo) -> Self {
        constructor(flavour)(info)
    }

    fn cmsd(info: DaemonInfo) -> Self {
        Self::with_kind(Flavour::Cmsd, info, TargetKind::Cmsd)
    }

    fn xrootd(info: DaemonInfo) -> Self {
        Self::with_kind(Flavour::Xrootd, info, TargetKind::Xrootd(SpaceCache::default()))
    }

    fn with_kind(flavour: Flavour, info: DaemonInfo, kind: TargetKind) -> Self {
        Self {
            id: TargetId {
                flavour,
                name: info.name,
                pid: info.pid,
                port: info.port,
            },
            version: info.version,
            kind,
        }
    }

    /// Instantiate the matching flavour from a daemon report
    ///
    /// Requires `pgm`, `ins`, `pid` and `ver`; `info.port` is optional.
    pub fn from_report(report: &Report) -> Result<Self, TargetError> {
        let pgm = report.get("pgm").ok_or(TargetError::MissingFlavour)?;
        let flavour = Flavour::from_str(&pgm.to_string())?;

        let field = |key: &'static str| {
            report
                .get(key)
                .ok_or(TargetError::MissingKey { flavour, key })
        };
        let pid = field("pid")?;
        let pid = pid
            .as_i64()
            .and_then(|pid| u32::try_from(pid).ok())
            .ok_or_else(|| TargetError::InvalidValue {
                key: "pid",
                value: pid.to_string(),
            })?;
        let port = match report.get("info.port") {
            None => None,
            Some(port) => Some(
                port.as_i64()
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or_else(|| TargetError::InvalidValue {
                        key: "info.port",
                        value: port.to_string(),
                    })?,
            ),
        };

        Ok(Self::new(
            flavour,
            DaemonInfo {
                name: field("ins")?.to_string(),
                pid,
                port,
                version: field("ver")?.to_string(),
            },
        ))
    }

    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn flavour(&self) -> Flavour {
        self.id.flavour
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn pid(&self) -> u32 {
        self.id.pid
    }

    pub fn port(&self) -> Option<u16> {
        self.id.port
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    /// Whether the daemon process is still running
    pub fn is_alive(&self, probe: &dyn LivenessProbe) -> bool {
        probe.is_alive(self.pid(), Some(self.flavour().process_name()))
    }

    pub fn space_total(&self) -> f64 {
        self.space_value("Total")
    }

    pub fn space_free(&self) -> f64 {
        self.space_value("Free")
    }

    pub fn space_largest_free_chunk(&self) -> f64 {
        self.space_value("Largest free chunk")
    }

    fn space_value(&self, key: &str) -> f64 {
        match &self.kind {
            TargetKind::Xrootd(cache) => cache.info.get(key).and_then(Value::as_f64).unwrap_or(0.0),
            TargetKind::Cmsd => 0.0,
        }
    }

    /// Re-query storage space if the cached answer is older than `query.ttl`
    ///
    /// Only `xrootd` daemons carry space information; other flavours are a no-op.
    pub async fn ensure_space(&mut self, query: &SpaceQuery) -> Result<(), TargetError> {
        let port = self.port();
        let label = self.to_string();
        let TargetKind::Xrootd(cache) = &mut self.kind else {
            return Ok(());
        };
        if !cache.is_stale(query.ttl) {
            return Ok(());
        }
        let port = port.ok_or(TargetError::NoPort(label))?;
        cache.info = query.run(port).await?;
        cache.queried_at = Some(Instant::now());
        Ok(())
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, pid={}", self.flavour(), self.name(), self.pid())?;
        if let Some(port) = self.port() {
            write!(f, ", port={}", port)?;
        }
        write!(f, ", ver={})", self.version)
    }
}

/// Last answer of a daemon space query
#[derive(Debug, Clone, Default)]
pub struct SpaceCache {
    queried_at: Option<Instant>,
    info: BTreeMap<String, Value>,
}

impl SpaceCache {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.queried_at.map_or(true, |at| at.elapsed() > ttl)
    }
}

/// How to ask an `xrootd` daemon for its storage space
#[derive(Debug, Clone)]
pub struct SpaceQuery {
    /// Control shell executable, `xrdfs` by default
    pub program: PathBuf,
    /// Maximum age of a cached answer
    pub ttl: Duration,
    /// Upper bound for one query
    pub timeout: Duration,
}

impl Default for SpaceQuery {
    fn default() -> Self {
        Self {
            program: PathBuf::from("xrdfs"),
            ttl: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(30),
        }
    }
}

impl SpaceQuery {
    /// Run `spaceinfo /` against the daemon listening on `port`
    pub async fn run(&self, port: u16) -> Result<BTreeMap<String, Value>, TargetError> {
        debug!("querying space of localhost:{} via {:?}", port, self.program);
        let query = async {
            let mut child = Command::new(&self.program)
                .arg(format!("localhost:{}", port))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(b"spaceinfo /\nexit\n").await?;
            }

            let mut info = BTreeMap::new();
            if let Some(stdout) = child.stdout.take() {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    if let Some((key, value)) = parse_space_line(&line) {
                        info.insert(key, value);
                    }
                }
            }

            let status = child.wait().await?;
            if !status.success() {
                warn!("space query for localhost:{} exited with {}", port, status);
            }
            Ok::<_, TargetError>(info)
        };

        tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| TargetError::QueryTimeout(self.timeout))?
    }
}

/// Parse one line of `xrdfs` output, ignoring the command prompt
fn parse_space_line(line: &str) -> Option<(String, Value)> {
    if line.starts_with("[localhost:") {
        return None;
    }
    let (key, value) = line.split_once(':')?;
    Some((key.trim().to_string(), Value::parse_literal(value.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xrootd_report(version: &str) -> Report {
        [
            ("pgm", Value::from("xrootd")),
            ("ins", Value::from("server1")),
            ("pid", Value::Int(4321)),
            ("ver", Value::from(version)),
            ("info.port", Value::Int(1094)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_from_report() {
        let target = Target::from_report(&xrootd_report("4.8.1")).unwrap();
        assert_eq!(target.flavour(), Flavour::Xrootd);
        assert_eq!(target.name(), "server1");
        assert_eq!(target.pid(), 4321);
        assert_eq!(target.port(), Some(1094));
        assert_eq!(target.version(), "4.8.1");
        assert!(matches!(target.kind(), TargetKind::Xrootd(_)));
    }

    #[test]
    fn test_every_flavour_builds_its_own_kind() {
        for flavour in Flavour::ALL {
            assert_eq!(flavour.as_str().parse::<Flavour>().unwrap(), flavour);
            let target = Target::new(
                flavour,
                DaemonInfo {
                    name: "server1".to_string(),
                    pid: 1,
                    port: None,
                    version: "5".to_string(),
                },
            );
            assert_eq!(target.flavour(), flavour);
            match (flavour, target.kind()) {
                (Flavour::Cmsd, TargetKind::Cmsd) | (Flavour::Xrootd, TargetKind::Xrootd(_)) => {}
                (flavour, kind) => panic!("{} built as {:?}", flavour, kind),
            }
        }
    }

    #[test]
    fn test_identity_ignores_version() {
        let first = Target::from_report(&xrootd_report("4.8.1")).unwrap();
        let second = Target::from_report(&xrootd_report("5.0.0")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_identity_includes_port() {
        let first = Target::from_report(&xrootd_report("4.8.1")).unwrap();
        let mut report = xrootd_report("4.8.1");
        report.remove("info.port");
        let second = Target::from_report(&report).unwrap();
        assert_eq!(second.port(), None);
        assert_ne!(first, second);
    }

    #[test]
    fn test_unknown_flavour() {
        let mut report = xrootd_report("4.8.1");
        report.insert("pgm", "frm_xfrd");
        let err = Target::from_report(&report).unwrap_err();
        assert!(matches!(err, TargetError::UnknownFlavour(ref name) if name == "frm_xfrd"));
    }

    #[test]
    fn test_missing_keys() {
        let mut report = xrootd_report("4.8.1");
        report.remove("ins");
        assert!(matches!(
            Target::from_report(&report),
            Err(TargetError::MissingKey { key: "ins", .. })
        ));
        report.remove("pgm");
        assert!(matches!(Target::from_report(&report), Err(TargetError::MissingFlavour)));
    }

    #[test]
    fn test_numeric_version_kept_as_text() {
        let mut report = xrootd_report("4.8.1");
        report.insert("pgm", "cmsd");
        report.insert("ver", Value::Float(4.8));
        let target = Target::from_report(&report).unwrap();
        assert_eq!(target.flavour(), Flavour::Cmsd);
        assert_eq!(target.version(), "4.8");
        assert_eq!(target.space_total(), 0.0);
    }

    #[test]
    fn test_parse_space_line() {
        assert!(parse_space_line("[localhost:1094] / > spaceinfo /").is_none());
        assert_eq!(
            parse_space_line("Total:              1000"),
            Some(("Total".to_string(), Value::Int(1000)))
        );
        assert_eq!(
            parse_space_line("Largest free chunk: 250"),
            Some(("Largest free chunk".to_string(), Value::Int(250)))
        );
        assert!(parse_space_line("no separator").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_space_query_caches_answer() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("xrdfs");
        let counter = dir.path().join("calls");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat > /dev/null\necho x >> {}\necho '[localhost:1094] / > spaceinfo /'\necho 'Total: 1000'\necho 'Free: 400'\necho 'Largest free chunk: 250'\n",
                counter.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let query = SpaceQuery {
            program: script,
            ..SpaceQuery::default()
        };
        let mut target = Target::from_report(&xrootd_report("4.8.1")).unwrap();
        target.ensure_space(&query).await.unwrap();
        target.ensure_space(&query).await.unwrap();

        assert_eq!(target.space_total(), 1000.0);
        assert_eq!(target.space_free(), 400.0);
        assert_eq!(target.space_largest_free_chunk(), 250.0);
        let calls = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }
}
