use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use drover::{
    Actor, ActorContext, ActorError, ActorId, ActorKind, Cast, ConfigError, MetricsError,
    MetricsSink, Operation, PhaseLoop, RunError, RunSummary, SetupError, StateError, StateKey,
    Workload, WorkloadConfig, macros::phase_config, metric::OperationEvent,
};

#[phase_config]
struct StepConfig {
    #[serde(default)]
    fail_at: Option<u64>,
    #[serde(default)]
    panic_at: Option<u64>,
    #[serde(default)]
    exit_early: bool,
}

/// Does nothing per iteration unless told to fail, panic or leave.
struct Flaky {
    phase_loop: PhaseLoop<StepConfig>,
    operation: Operation,
}

impl ActorKind for Flaky {
    const DEFAULT_NAME: &'static str = "Flaky";

    fn build(ctx: &ActorContext<'_>, id: ActorId) -> Result<Self, SetupError> {
        Ok(Self {
            phase_loop: PhaseLoop::new(ctx, id)?,
            operation: ctx.operation("step", id),
        })
    }
}

#[async_trait]
impl Actor for Flaky {
    async fn run(&mut self) -> Result<(), ActorError> {
        while let Some(mut phase) = self.phase_loop.next_phase().await? {
            if phase.exit_early {
                return Ok(());
            }
            while phase.next_iteration().await {
                let n = phase.iterations();
                if phase.fail_at == Some(n) {
                    return Err(ActorError::workload(format!("step {n} failed")));
                }
                if phase.panic_at == Some(n) {
                    panic!("step {n} blew up");
                }
                self.operation.start().success()?;
            }
        }
        Ok(())
    }
}

/// Holds a barrier token but fails before ever reaching a barrier.
struct Broken {
    _phase_loop: PhaseLoop<StepConfig>,
}

impl ActorKind for Broken {
    const DEFAULT_NAME: &'static str = "Broken";

    fn build(ctx: &ActorContext<'_>, id: ActorId) -> Result<Self, SetupError> {
        Ok(Self {
            _phase_loop: PhaseLoop::new(ctx, id)?,
        })
    }
}

#[async_trait]
impl Actor for Broken {
    async fn run(&mut self) -> Result<(), ActorError> {
        Err(ActorError::workload("connection refused"))
    }
}

static DATABASE: StateKey<String> = StateKey::new("Database");

/// Needs shared state that can never be built.
struct NeedsDatabase;

impl ActorKind for NeedsDatabase {
    const DEFAULT_NAME: &'static str = "NeedsDatabase";

    fn build(ctx: &ActorContext<'_>, _id: ActorId) -> Result<Self, SetupError> {
        ctx.shared_state()
            .get_or_init(&DATABASE, || Err("no database configured".into()))?;
        Ok(Self)
    }
}

#[async_trait]
impl Actor for NeedsDatabase {
    async fn run(&mut self) -> Result<(), ActorError> {
        Ok(())
    }
}

fn cast() -> Cast {
    Cast::with_builtins()
        .register::<Flaky>()
        .register::<Broken>()
        .register::<NeedsDatabase>()
}

async fn run(toml: &str) -> Result<RunSummary, RunError> {
    let context = Workload::builder()
        .config(WorkloadConfig::from_toml_str(toml).unwrap())
        .cast(cast())
        .build()
        .setup()?;
    tokio::time::timeout(Duration::from_secs(10), context.run())
        .await
        .expect("siblings were left waiting")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_mid_phase_releases_siblings() {
    let err = run(r#"
[[Actors]]
Type = "HelloWorld"
Threads = 2
[[Actors.Phases]]
Repeat = 3
[[Actors.Phases]]
Repeat = 3

[[Actors]]
Type = "Flaky"
[[Actors.Phases]]
Repeat = 3
[[Actors.Phases]]
Repeat = 3
FailAt = 2
"#)
    .await
    .unwrap_err();

    match err {
        RunError::ActorFailed {
            actor,
            phase,
            source,
            ..
        } => {
            assert_eq!(actor, "Flaky");
            assert_eq!(phase, 1);
            assert!(source.to_string().contains("step 2 failed"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn failure_before_the_first_barrier() {
    let err = run(r#"
[[Actors]]
Type = "HelloWorld"
Threads = 3
[[Actors.Phases]]
Repeat = 5

[[Actors]]
Type = "Broken"
[[Actors.Phases]]
Repeat = 5
"#)
    .await
    .unwrap_err();

    assert!(
        matches!(err, RunError::ActorFailed { ref actor, phase: 0, .. } if actor == "Broken"),
        "{err}"
    );
    assert!(err.to_string().contains("connection refused"));
}

#[tokio::test]
async fn panic_is_reported_as_failure() {
    let err = run(r#"
[[Actors]]
Type = "HelloWorld"
[[Actors.Phases]]
Repeat = 2

[[Actors]]
Type = "Flaky"
[[Actors.Phases]]
Repeat = 2
PanicAt = 1
"#)
    .await
    .unwrap_err();

    match err {
        RunError::ActorPanicked { actor, message, .. } => {
            assert_eq!(actor, "Flaky");
            assert!(message.contains("blew up"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn leaving_the_schedule_early_fails_the_run() {
    let err = run(r#"
[[Actors]]
Type = "HelloWorld"
[[Actors.Phases]]
Repeat = 2
[[Actors.Phases]]
Repeat = 2

[[Actors]]
Type = "Flaky"
Name = "Quitter"
[[Actors.Phases]]
Repeat = 2
[[Actors.Phases]]
ExitEarly = true
Repeat = 2
"#)
    .await
    .unwrap_err();

    assert!(
        matches!(err, RunError::ActorExited { ref actor, phase: 1, .. } if actor == "Quitter"),
        "{err}"
    );
}

#[tokio::test]
async fn shared_state_failure_aborts_setup() {
    let err = run(r#"
[[Actors]]
Type = "NeedsDatabase"
Threads = 2
"#)
    .await
    .unwrap_err();

    match err {
        RunError::Setup {
            actor,
            source: SetupError::State(StateError::Construction { key, .. }),
        } => {
            assert_eq!(actor, "NeedsDatabase");
            assert_eq!(key, "Database");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn invalid_phase_is_a_config_error() {
    let err = run(r#"
[[Actors]]
Type = "HelloWorld"
[[Actors.Phases]]
Blocking = "Sometimes"
Repeat = 1
"#)
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        RunError::Config(ConfigError::InvalidPhase { phase: 0, .. })
    ));
}

/// A metrics backend that refuses every event.
#[derive(Debug)]
struct DownSink;

impl MetricsSink for DownSink {
    fn record(&self, event: OperationEvent) -> Result<(), MetricsError> {
        Err(MetricsError::Rejected {
            operation: event.key(),
            reason: "backend down".to_string(),
        })
    }
}

#[tokio::test]
async fn rejected_metrics_fail_the_run() {
    let context = Workload::builder()
        .config(
            WorkloadConfig::from_toml_str(
                r#"
[[Actors]]
Type = "HelloWorld"
Threads = 2
[[Actors.Phases]]
Repeat = 3
"#,
            )
            .unwrap(),
        )
        .cast(cast())
        .sink(Arc::new(DownSink))
        .build()
        .setup()
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(10), context.run())
        .await
        .expect("siblings were left waiting")
        .unwrap_err();

    match err {
        RunError::ActorFailed {
            actor,
            phase,
            source: ActorError::Metrics(MetricsError::Rejected { operation, reason }),
            ..
        } => {
            assert_eq!(actor, "HelloWorld");
            assert_eq!(phase, 0);
            assert_eq!(operation, "HelloWorld.hello");
            assert_eq!(reason, "backend down");
        }
        other => panic!("unexpected error: {other}"),
    }
}
