/*!
# xrdmon core - XRootD site monitoring

Library behind the `xrdmon` agent:
- `source`: spawns the summary report producer and decodes its lines
- `registry`: tracks the live `xrootd`/`cmsd` daemons behind the reports
- `pipeline`: tree of links transforming and delivering reports
- `sinks`: file, line protocol and collector outputs
- `counter`: cooperative counting of hosts sharing a storage path
- `core`: the loop tying everything together
*/

pub mod core;
pub mod counter;
pub mod liveness;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod sinks;
pub mod source;
pub mod state;
pub mod target;

pub use crate::core::{Core, CoreError, DEFAULT_UPDATE_INTERVAL};
pub use counter::{PathShares, ShareCount, ShareCounter, SharePool};
pub use liveness::{LivenessProbe, ProcProbe};
pub use pipeline::{DispatchStats, Flow, Link, LinkError, NodeId, Pipeline, PipelineError, Update};
pub use registry::{TargetEvent, TargetRegistry};
pub use report::{MalformedPolicy, Report, ReportError, Value};
pub use source::{ReportSource, SourceError};
pub use target::{Flavour, SpaceQuery, Target, TargetError};
