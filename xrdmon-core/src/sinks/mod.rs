//! Terminal links delivering reports out of the agent

mod collector;
mod file;
mod line_protocol;
mod sysmon;

pub use collector::{Collector, CollectorError, CollectorSink, MqttCollector, MqttCollectorConfig};
pub use file::FileSink;
pub use line_protocol::{line_format, LineProtocolSink, Transport};
pub use sysmon::{HostMetrics, ProcessMetrics};
