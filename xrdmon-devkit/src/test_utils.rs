/*!
Test harness for the agent loop

Wires a fake producer, a [`FakeProbe`] and a [`RecordingSink`] attached to
the pipeline root into a [`Core`], then runs it until the stream ends.
*/

use crate::probe::FakeProbe;
use crate::recording::RecordingSink;
use crate::report_helpers::FakeProducer;
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xrdmon_core::{Core, CoreError, MalformedPolicy, Pipeline, SpaceQuery, TargetRegistry};

/// Install a subscriber writing through the test harness output capture
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Harness around one agent loop
pub struct TestHarness {
    pub probe: FakeProbe,
    pub sink: RecordingSink,
    pub policy: MalformedPolicy,
    pub update_interval: Duration,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        init_test_logging();
        Self {
            probe: FakeProbe::new(),
            sink: RecordingSink::new(),
            policy: MalformedPolicy::FailFast,
            update_interval: Duration::from_secs(60),
        }
    }

    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pipeline with the recording sink under the root
    pub fn pipeline(&self) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new();
        let root = pipeline.root();
        pipeline.attach(root, self.sink.clone())?;
        Ok(pipeline)
    }

    /// Agent loop over `producer`, feeding `pipeline`
    ///
    /// Space queries point at a missing program so they fail immediately.
    pub fn core_with(&self, producer: FakeProducer, pipeline: Pipeline) -> Core {
        let source = producer.into_source(1094).with_policy(self.policy);
        let space_query = SpaceQuery {
            program: "/nonexistent/xrdfs".into(),
            ..SpaceQuery::default()
        };
        Core::new(source, TargetRegistry::new(Arc::new(self.probe.clone())), pipeline)
            .with_update_interval(self.update_interval)
            .with_space_query(space_query)
    }

    /// Run `producer` to the end of its stream and hand back the loop
    pub async fn run(&self, producer: FakeProducer) -> Result<Core> {
        let core = self.core_with(producer, self.pipeline()?);
        self.run_core(core).await
    }

    pub async fn run_core(&self, mut core: Core) -> Result<Core> {
        let outcome = tokio::time::timeout(Duration::from_secs(10), core.run()).await;
        match outcome {
            Err(_) => bail!("agent loop did not finish in time"),
            Ok(Ok(())) => bail!("agent loop returned without the stream ending"),
            Ok(Err(CoreError::StreamEnded(_))) => {
                core.shutdown().await?;
                Ok(core)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }
}
