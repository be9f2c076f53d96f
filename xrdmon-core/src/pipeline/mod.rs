//! Dataflow pipeline: a tree of links rooted at a pass-through entry
//!
//! Handles:
//! - Graph building (`add`, `connect`, `attach`) with single-parent and
//!   cycle checks
//! - Depth-first dispatch with a per-branch copy of each report
//! - Target notifications and periodic updates of every link
//!
//! A failing link is logged and only drops the report on its own branch.

mod share;
mod template;
mod transform;

pub use share::ShareScale;
pub use template::{Template, TemplateError, THIS_KEY};
pub use transform::{Condition, FormatTransform, KeyFilter, LogLink, ReportBlock, Translate};

use crate::registry::TargetEvent;
use crate::report::Report;
use crate::sinks::CollectorError;
use crate::target::Target;
use std::fmt::{self, Write as _};
use std::ops::AddAssign;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a link for one report
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Pass the (possibly rewritten) report to all children
    Forward(Report),
    /// Stop propagation on this branch
    Drop,
    /// Report consumed by a terminal link
    Done,
}

/// Failure of a single link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("report has no key {0:?}")]
    MissingKey(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Collector(#[from] CollectorError),
}

/// Graph building errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("node {0} already has a parent")]
    SecondParent(NodeId),
    #[error("connecting {from} -> {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },
}

/// Periodic update passed to every link
#[derive(Debug, Clone)]
pub struct Update<'a> {
    /// Time since the previous update
    pub elapsed: Duration,
    /// Current targets, with refreshed space caches
    pub targets: Vec<&'a Target>,
}

/// A node of the pipeline
pub trait Link: Send {
    /// Process one report
    fn send(&mut self, report: Report) -> Result<Flow, LinkError>;

    fn insert_target(&mut self, _target: &Target) -> Result<(), LinkError> {
        Ok(())
    }

    fn remove_target(&mut self, _target: &Target) -> Result<(), LinkError> {
        Ok(())
    }

    /// React to a periodic update
    ///
    /// A returned report is dispatched starting at this link.
    fn summarize(&mut self, _update: &Update<'_>) -> Result<Option<Report>, LinkError> {
        Ok(None)
    }

    /// Human readable description used in logs and [`Pipeline::describe`]
    fn describe(&self) -> String;
}

/// Index of a node in a [`Pipeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parent -> child connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

/// Counters of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Branches that ran to completion
    pub delivered: usize,
    /// Branches stopped by a link
    pub dropped: usize,
    /// Branches stopped by a link error
    pub failed: usize,
}

impl AddAssign for DispatchStats {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.failed += other.failed;
    }
}

struct Node {
    link: Option<Box<dyn Link>>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    fn describe(&self) -> String {
        self.link
            .as_ref()
            .map_or_else(|| "root".to_string(), |link| link.describe())
    }
}

/// Tree of links below a pass-through root
pub struct Pipeline {
    nodes: Vec<Node>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                link: None,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Add an unconnected node
    pub fn add(&mut self, link: impl Link + 'static) -> NodeId {
        self.add_boxed(Box::new(link))
    }

    pub fn add_boxed(&mut self, link: Box<dyn Link>) -> NodeId {
        self.nodes.push(Node {
            link: Some(link),
            parent: None,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    fn node(&self, id: NodeId) -> Result<&Node, PipelineError> {
        self.nodes.get(id.0).ok_or(PipelineError::UnknownNode(id))
    }

    /// Make `to` a child of `from`
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<Edge, PipelineError> {
        self.node(from)?;
        let child = self.node(to)?;
        if child.parent.is_some() || to == self.root() {
            return Err(PipelineError::SecondParent(to));
        }

        let mut ancestor = Some(from);
        while let Some(id) = ancestor {
            if id == to {
                return Err(PipelineError::Cycle { from, to });
            }
            ancestor = self.nodes[id.0].parent;
        }

        self.nodes[to.0].parent = Some(from);
        self.nodes[from.0].children.push(to);
        Ok(Edge { from, to })
    }

    /// Add a node as a new child of `parent`
    pub fn attach(&mut self, parent: NodeId, link: impl Link + 'static) -> Result<NodeId, PipelineError> {
        self.attach_boxed(parent, Box::new(link))
    }

    pub fn attach_boxed(&mut self, parent: NodeId, link: Box<dyn Link>) -> Result<NodeId, PipelineError> {
        self.node(parent)?;
        let id = self.add_boxed(link);
        self.connect(parent, id)?;
        Ok(id)
    }

    /// Dispatch a report from the root
    pub fn push(&mut self, report: Report) -> DispatchStats {
        self.dispatch(self.root(), report)
    }

    /// Dispatch a report starting at `node`, bypassing its ancestors
    pub fn inject(&mut self, node: NodeId, report: Report) -> Result<DispatchStats, PipelineError> {
        self.node(node)?;
        Ok(self.dispatch(node, report))
    }

    fn dispatch(&mut self, start: NodeId, report: Report) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut pending = vec![(start, report)];

        while let Some((id, report)) = pending.pop() {
            let node = &mut self.nodes[id.0];
            let flow = match node.link.as_mut() {
                None => Ok(Flow::Forward(report)),
                Some(link) => link.send(report),
            };

            match flow {
                Ok(Flow::Forward(report)) => {
                    let Some(first) = node.children.first().copied() else {
                        stats.delivered += 1;
                        continue;
                    };
                    // first child ends on top of the stack
                    for child in node.children.iter().skip(1).rev() {
                        pending.push((*child, report.clone()));
                    }
                    pending.push((first, report));
                }
                Ok(Flow::Drop) => {
                    debug!("report dropped by {}", node.describe());
                    stats.dropped += 1;
                }
                Ok(Flow::Done) => stats.delivered += 1,
                Err(e) => {
                    warn!("{} failed: {}", node.describe(), e);
                    stats.failed += 1;
                }
            }
        }

        stats
    }

    /// Forward a registry event to every link
    pub fn notify(&mut self, event: &TargetEvent) {
        for node in &mut self.nodes {
            let Some(link) = node.link.as_mut() else {
                continue;
            };
            let result = match event {
                TargetEvent::Inserted(target) => link.insert_target(target),
                TargetEvent::Removed(target) => link.remove_target(target),
            };
            if let Err(e) = result {
                warn!("{} failed to handle {:?}: {}", link.describe(), event.target().id(), e);
            }
        }
    }

    /// Run a periodic update through every link
    pub fn update(&mut self, update: &Update<'_>) -> DispatchStats {
        let mut stats = DispatchStats::default();
        for index in 0..self.nodes.len() {
            let Some(link) = self.nodes[index].link.as_mut() else {
                continue;
            };
            match link.summarize(update) {
                Ok(Some(summary)) => stats += self.dispatch(NodeId(index), summary),
                Ok(None) => {}
                Err(e) => {
                    warn!("{} failed to update: {}", link.describe(), e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    /// Indented rendering of the tree below the root
    pub fn describe(&self) -> String {
        let mut output = String::new();
        let mut pending = vec![(self.root(), 0usize)];
        while let Some((id, depth)) = pending.pop() {
            let node = &self.nodes[id.0];
            let _ = writeln!(output, "{:indent$}{}", "", node.describe(), indent = depth * 2);
            for child in node.children.iter().rev() {
                pending.push((*child, depth + 1));
            }
        }
        output
    }
}
