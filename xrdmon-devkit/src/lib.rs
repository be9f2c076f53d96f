/*!
# xrdmon DevKit - test doubles and helpers

Helpers for testing pipelines and the agent loop without real daemons:
- collector stub recording every submission
- liveness probe driven by the test
- recording sink capturing reports and target events
- datagram builders and a fake report producer
*/

pub mod collector_stub;
pub mod probe;
pub mod recording;
pub mod report_helpers;
pub mod test_utils;

pub use collector_stub::{CollectorCall, MockCollector};
pub use probe::FakeProbe;
pub use recording::{Recorded, RecordingSink};
pub use report_helpers::{fake_report_producer, DatagramBuilder, FakeProducer};
pub use test_utils::{init_test_logging, TestHarness};
