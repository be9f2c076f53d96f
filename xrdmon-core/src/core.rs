//! Agent loop: source -> registry -> pipeline
//!
//! Every report is fully handled before the next one is read:
//! 1. the registry classifies it and emits target events
//! 2. target events are forwarded to every link
//! 3. the report is pushed through the pipeline
//! 4. if an update is due, space caches are refreshed and links are updated

use crate::pipeline::{DispatchStats, Pipeline, Update};
use crate::registry::TargetRegistry;
use crate::report::Report;
use crate::source::{ReportSource, SourceError};
use crate::target::SpaceQuery;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Errors ending the agent loop
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("report stream ended (producer exit status: {})", .0.map_or_else(|| "unknown".to_string(), |s| s.to_string()))]
    StreamEnded(Option<ExitStatus>),
}

/// Default period of pipeline updates
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Main data chain collecting reports and driving the pipeline
pub struct Core {
    source: ReportSource,
    registry: TargetRegistry,
    pipeline: Pipeline,
    space_query: SpaceQuery,
    update_interval: Duration,
    last_update: Option<Instant>,
}

impl Core {
    pub fn new(source: ReportSource, registry: TargetRegistry, pipeline: Pipeline) -> Self {
        Self {
            source,
            registry,
            pipeline,
            space_query: SpaceQuery::default(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
            last_update: None,
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_space_query(mut self, query: SpaceQuery) -> Self {
        self.space_query = query;
        self
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// Time since the last update if one is due now
    ///
    /// The first call is always due. Afterwards the schedule advances by whole
    /// intervals, so missed intervals are skipped rather than replayed.
    fn due_update(&mut self, now: Instant) -> Option<Duration> {
        let interval = self.update_interval;
        match self.last_update {
            None => {
                self.last_update = Some(now);
                Some(interval)
            }
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed <= interval {
                    return None;
                }
                // elapsed > interval, so at least one whole interval passed
                let next = elapsed
                    .as_nanos()
                    .checked_div(interval.as_nanos())
                    .and_then(|intervals| u32::try_from(intervals).ok())
                    .and_then(|intervals| interval.checked_mul(intervals))
                    .and_then(|advance| last.checked_add(advance));
                self.last_update = Some(next.unwrap_or(now));
                Some(elapsed)
            }
        }
    }

    /// Handle one report
    pub async fn process(&mut self, report: Report) -> DispatchStats {
        for event in self.registry.observe(&report) {
            self.pipeline.notify(&event);
        }
        let mut stats = self.pipeline.push(report);

        if let Some(elapsed) = self.due_update(Instant::now()) {
            debug!("running update after {:?}", elapsed);
            self.registry.refresh_space(&self.space_query).await;
            let update = Update {
                elapsed,
                targets: self.registry.targets().collect(),
            };
            stats += self.pipeline.update(&update);
        }
        stats
    }

    /// Read and process reports until the stream fails or ends
    pub async fn run(&mut self) -> Result<(), CoreError> {
        info!("starting xrdmon main loop on port {}", self.source.port());
        debug!("pipeline:\n{}", self.pipeline.describe());
        loop {
            match self.source.next_report().await {
                Ok(Some(report)) => {
                    self.process(report).await;
                }
                Ok(None) => {
                    error!("report stream ended");
                    return Err(CoreError::StreamEnded(self.source.exit_status()));
                }
                Err(e) => {
                    error!("report ingestion failed: {}", e);
                    self.source.close().await?;
                    return Err(e.into());
                }
            }
        }
    }

    /// Stop the report producer
    pub async fn shutdown(&mut self) -> Result<(), CoreError> {
        info!("stopping xrdmon main loop");
        self.source.close().await?;
        Ok(())
    }
}
