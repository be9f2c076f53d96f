//! Line-protocol sink for telegraf style socket listeners
//!
//! Each report becomes one line:
//! `name[,tag=value...] field=value[,field=value...] timestamp_ns`

use crate::pipeline::{Flow, Link, LinkError, Template, TemplateError, Update};
use crate::report::{Report, Value};
use crate::target::Flavour;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Socket type used to reach the listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// `host:port`, one datagram per line
    #[default]
    Udp,
    /// `host:port`, streamed
    Tcp,
    /// socket path, streamed
    Unix,
    /// socket path, one datagram per line
    Unixgram,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Unix => "unix",
            Transport::Unixgram => "unixgram",
        })
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "unix" => Ok(Transport::Unix),
            "unixgram" => Ok(Transport::Unixgram),
            other => Err(format!("unknown transport {:?}", other)),
        }
    }
}

enum Socket {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Unix(UnixStream),
    Unixgram(UnixDatagram),
}

impl Socket {
    fn connect(transport: Transport, address: &str) -> std::io::Result<Self> {
        Ok(match transport {
            Transport::Udp => Socket::Udp(connect_udp(address)?),
            Transport::Tcp => Socket::Tcp(TcpStream::connect(address)?),
            Transport::Unix => Socket::Unix(UnixStream::connect(address)?),
            Transport::Unixgram => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(address)?;
                Socket::Unixgram(socket)
            }
        })
    }

    fn send(&mut self, message: &[u8]) -> std::io::Result<()> {
        match self {
            Socket::Udp(socket) => socket.send(message).map(|_| ()),
            Socket::Tcp(stream) => stream.write_all(message),
            Socket::Unix(stream) => stream.write_all(message),
            Socket::Unixgram(socket) => socket.send(message).map(|_| ()),
        }
    }
}

/// UDP socket bound in the address family of the first reachable target
fn connect_udp(address: &str) -> std::io::Result<UdpSocket> {
    let mut last_error = None;
    for target in address.to_socket_addrs()? {
        let local: SocketAddr = if target.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        match UdpSocket::bind(local).and_then(|socket| socket.connect(target).map(|()| socket)) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} resolves to no address", address),
        )
    }))
}

/// Escape measurement names, tag keys and tag values
fn escape_identifier(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Encode a field value: plain integers, floats with a decimal point,
/// quoted strings
fn field_value(value: &Value) -> String {
    match value {
        Value::Int(int) => int.to_string(),
        Value::Float(float) => format!("{:?}", float),
        Value::Str(text) => format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

/// Format one line-protocol record
pub fn line_format(
    name: &str,
    tags: &BTreeMap<String, String>,
    fields: &BTreeMap<String, Value>,
    timestamp_ns: Option<i64>,
) -> String {
    let mut line = escape_identifier(name);
    // empty tag values are not valid line protocol
    for (key, value) in tags.iter().filter(|(key, value)| !key.is_empty() && !value.is_empty()) {
        line.push_str(&format!(",{}={}", escape_identifier(key), escape_identifier(value)));
    }
    line.push(' ');
    let fields: Vec<String> = fields
        .iter()
        .map(|(key, value)| format!("{}={}", escape_identifier(key), field_value(value)))
        .collect();
    line.push_str(&fields.join(","));
    if let Some(timestamp) = timestamp_ns {
        line.push_str(&format!(" {}", timestamp));
    }
    line.push('\n');
    line
}

/// Round `now_ns` down to a multiple of `resolution`
fn floor_timestamp(now_ns: i64, resolution: Duration) -> i64 {
    let step = i64::try_from(resolution.as_nanos()).unwrap_or(i64::MAX).max(1);
    now_ns - now_ns.rem_euclid(step)
}

/// Send reports to a line-protocol socket listener
pub struct LineProtocolSink {
    transport: Transport,
    address: String,
    name: Template,
    tags: BTreeMap<String, String>,
    tag_keys: BTreeSet<String>,
    fields: Option<BTreeSet<String>>,
    resolution: Duration,
    summary: bool,
    socket: Option<Socket>,
}

impl LineProtocolSink {
    pub const DEFAULT_NAME: &'static str = "%(pgm)s";

    /// Sink named by the `name` template, sending to `address`
    pub fn new(transport: Transport, address: impl Into<String>, name: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            transport,
            address: address.into(),
            name: Template::parse(name)?,
            tags: BTreeMap::new(),
            tag_keys: BTreeSet::new(),
            fields: None,
            resolution: Duration::from_secs(1),
            summary: false,
            socket: None,
        })
    }

    /// Fixed tags added to every record
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = (String, String)>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Report keys turned into tags
    pub fn with_tag_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.tag_keys.extend(keys);
        self
    }

    /// Restrict fields to `keys`; by default all non-tag keys are fields
    pub fn with_fields(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.fields = Some(keys.into_iter().collect());
        self
    }

    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }

    /// Emit a summary record of the monitored targets on every update
    pub fn with_summary(mut self, summary: bool) -> Self {
        self.summary = summary;
        self
    }

    /// Format a report at `now_ns`
    pub fn format(&self, report: &Report, now_ns: i64) -> Result<Option<String>, LinkError> {
        let name = self.name.render(report, None)?;
        let mut tags = self.tags.clone();
        let mut fields = BTreeMap::new();
        for (key, value) in report.iter() {
            if self.tag_keys.contains(key) {
                tags.insert(key.to_string(), value.to_string());
            } else if self.fields.as_ref().map_or(true, |fields| fields.contains(key)) {
                fields.insert(key.to_string(), value.clone());
            }
        }
        if fields.is_empty() {
            return Ok(None);
        }
        let timestamp = floor_timestamp(now_ns, self.resolution);
        Ok(Some(line_format(&name, &tags, &fields, Some(timestamp))))
    }

    fn transmit(&mut self, line: &str) -> std::io::Result<()> {
        if self.socket.is_none() {
            info!("connecting line-protocol sink to {} {}", self.transport, self.address);
            self.socket = Some(Socket::connect(self.transport, &self.address)?);
        }
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        let sent = socket.send(line.as_bytes());
        if sent.is_err() {
            // reconnect on the next record
            self.socket = None;
        }
        sent
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

impl Link for LineProtocolSink {
    fn send(&mut self, report: Report) -> Result<Flow, LinkError> {
        match self.format(&report, now_ns())? {
            Some(line) => {
                debug!("line-protocol record: {}", line.trim_end());
                self.transmit(&line)?;
            }
            None => debug!("report without fields, nothing to send"),
        }
        Ok(Flow::Done)
    }

    fn summarize(&mut self, update: &Update<'_>) -> Result<Option<Report>, LinkError> {
        if !self.summary {
            return Ok(None);
        }
        let mut report = Report::new();
        report.insert("pgm", "xrdmon");
        report.insert("update", update.elapsed.as_secs_f64());
        report.insert("targets", update.targets.len() as i64);
        for target in update.targets.iter().filter(|t| t.flavour() == Flavour::Xrootd) {
            let name = target.name();
            report.insert(format!("{}.space_total", name), target.space_total());
            report.insert(format!("{}.space_free", name), target.space_free());
            report.insert(format!("{}.space_largestfreechunk", name), target.space_largest_free_chunk());
        }
        Ok(Some(report))
    }

    fn describe(&self) -> String {
        format!(
            "LineProtocolSink({}://{}, name={:?})",
            self.transport,
            self.address,
            self.name.as_str()
        )
    }
}
