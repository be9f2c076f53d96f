/*!
Datagram builders and a fake report producer

`DatagramBuilder` writes summary datagrams the way the daemons do
(`key=value` joined by `&`). `FakeProducer` replays datagrams through a
shell so the agent loop can be driven without `mpxstats`.
*/

use std::fmt::Display;
use std::time::Duration;
use xrdmon_core::{MalformedPolicy, Report, ReportError, ReportSource};

/// Builder of one summary datagram
#[derive(Debug, Clone, Default)]
pub struct DatagramBuilder {
    fields: Vec<(String, String)>,
}

impl DatagramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identification of an `xrootd` daemon
    pub fn xrootd(name: &str, pid: u32, port: u16, version: &str) -> Self {
        Self::new()
            .field("pgm", "xrootd")
            .field("ins", name)
            .field("pid", pid)
            .field("ver", version)
            .field("info.port", port)
    }

    /// Identification of a `cmsd` daemon
    pub fn cmsd(name: &str, pid: u32, version: &str) -> Self {
        Self::new()
            .field("pgm", "cmsd")
            .field("ins", name)
            .field("pid", pid)
            .field("ver", version)
    }

    pub fn field(mut self, key: &str, value: impl Display) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    /// Storage space group, sizes in kiB; call with consecutive indexes
    pub fn space(self, index: usize, total: u64, free: u64, largest_free: u64) -> Self {
        let count = index + 1;
        self.set("oss.space", count)
            .field(&format!("oss.space.{}.tot", index), total)
            .field(&format!("oss.space.{}.free", index), free)
            .field(&format!("oss.space.{}.maxf", index), largest_free)
    }

    /// Exported storage path; call with consecutive indexes
    pub fn path(self, index: usize, path: &str) -> Self {
        self.set("oss.paths", index + 1)
            .field(&format!("oss.paths.{}.rp", index), path)
    }

    fn set(mut self, key: &str, value: impl Display) -> Self {
        let value = value.to_string();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some(field) => field.1 = value,
            None => self.fields.push((key.to_string(), value)),
        }
        self
    }

    pub fn build(&self) -> String {
        self.fields
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn report(&self) -> Result<Report, ReportError> {
        Report::parse(&self.build(), MalformedPolicy::FailFast)
    }
}

/// Report producer replaying fixed lines, then exiting
#[derive(Debug, Clone, Default)]
pub struct FakeProducer {
    lines: Vec<String>,
    linger: Option<Duration>,
    exit_code: i32,
}

impl FakeProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn datagram(self, datagram: &DatagramBuilder) -> Self {
        self.line(datagram.build())
    }

    /// Keep the stream open after the last line
    pub fn linger(mut self, duration: Duration) -> Self {
        self.linger = Some(duration);
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Source running this producer on `port`
    pub fn into_source(self, port: u16) -> ReportSource {
        let mut script = String::from(r#"[ "$#" -gt 0 ] && printf '%s\n' "$@""#);
        if let Some(linger) = self.linger {
            script.push_str(&format!("; sleep {}", linger.as_secs_f64()));
        }
        script.push_str(&format!("; exit {}", self.exit_code));

        let mut args = vec!["-c".to_string(), script, "fake-mpxstats".to_string()];
        args.extend(self.lines);
        ReportSource::new(port).with_program("sh", args)
    }
}

/// Source replaying `lines` and then ending the stream
pub fn fake_report_producer<I, S>(lines: I) -> ReportSource
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    lines
        .into_iter()
        .fold(FakeProducer::new(), |producer, line| producer.line(line))
        .into_source(1094)
}
