use std::sync::Arc;

use drover::{
    Cast, MemorySink, Reporter, Workload, WorkloadConfig,
    report::{JsonReporter, RunReport, StdoutReporter},
};
use tracing_subscriber::EnvFilter;

const WORKLOAD: &str = r#"
Timeout = "30s"

[[Actors]]
Type = "HelloWorld"
Threads = 4

# Warm up with a fixed number of greetings per thread
[[Actors.Phases]]
Repeat = 10
Message = "Hello, World!"

# Then greet at a steady rate for two seconds
[[Actors.Phases]]
Duration = "2 seconds"
GlobalRate = "50 per 1 second"
Message = "Hello again"

[[Actors]]
Type = "HelloWorld"
Name = "Heckler"

[[Actors.Phases]]
Phase = 1
Blocking = "None"
SleepAfter = "100ms"
Message = "Boo"
"#;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = WorkloadConfig::from_toml_str(WORKLOAD).unwrap();
    let sink = Arc::new(MemorySink::new());

    let summary = Workload::builder()
        .config(config)
        .cast(Cast::with_builtins())
        .sink(sink.clone())
        .build()
        .setup()
        .unwrap()
        .run()
        .await
        .unwrap();
    println!(
        "{} phases in {:?} across {} actors",
        summary.phases_completed,
        summary.elapsed,
        summary.actors.len()
    );

    let report = RunReport::from(sink.aggregate());
    StdoutReporter.report(&report).await.unwrap();
    // Set DROVER_JSON=1 for machine readable output
    if std::env::var_os("DROVER_JSON").is_some() {
        JsonReporter { pretty: true }.report(&report).await.unwrap();
    }
}
