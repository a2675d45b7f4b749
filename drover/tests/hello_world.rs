use std::{collections::BTreeMap, sync::Arc, sync::atomic::Ordering, time::Duration};

use drover::{
    ActorState, Cast, MemorySink, Workload, WorkloadConfig, actors::HELLO_WORLD_COUNTER,
};

const TWO_PHASES: &str = r#"
[[Actors]]
Type = "HelloWorld"
Threads = 3

[[Actors.Phases]]
Repeat = 10

[[Actors.Phases]]
Repeat = 5
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_actors_two_phases() {
    let sink = Arc::new(MemorySink::new());
    let context = Workload::builder()
        .config(WorkloadConfig::from_toml_str(TWO_PHASES).unwrap())
        .cast(Cast::with_builtins())
        .sink(sink.clone())
        .build()
        .setup()
        .unwrap();
    let registry = Arc::clone(context.shared_state());

    let summary = tokio::time::timeout(Duration::from_secs(10), context.run())
        .await
        .expect("run did not finish")
        .unwrap();

    assert_eq!(summary.phases_completed, 2);
    assert!(!summary.stopped);
    assert_eq!(summary.actors.len(), 3);
    assert!(summary.actors.iter().all(|a| a.state == ActorState::Terminated));

    let counter = registry.get_or_default(&HELLO_WORLD_COUNTER).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 45);

    let events = sink.events();
    let mut per_actor = BTreeMap::new();
    for event in &events {
        *per_actor.entry(event.actor_id).or_insert(0) += 1;
    }
    assert_eq!(per_actor.len(), 3);
    assert!(per_actor.values().all(|&n| n == 15), "{per_actor:?}");

    let last_phase_zero_end = events
        .iter()
        .filter(|e| e.phase == Some(0))
        .map(|e| e.finished)
        .max()
        .unwrap();
    let first_phase_one_start = events
        .iter()
        .filter(|e| e.phase == Some(1))
        .map(|e| e.started)
        .min()
        .unwrap();
    assert!(first_phase_one_start >= last_phase_zero_end);
    assert_eq!(events.iter().filter(|e| e.phase == Some(0)).count(), 30);
    assert_eq!(events.iter().filter(|e| e.phase == Some(1)).count(), 15);
}

#[tokio::test]
async fn aggregate_counts_every_operation() {
    let sink = Arc::new(MemorySink::new());
    Workload::builder()
        .config(WorkloadConfig::from_toml_str(TWO_PHASES).unwrap())
        .cast(Cast::with_builtins())
        .sink(sink.clone())
        .build()
        .setup()
        .unwrap()
        .run()
        .await
        .unwrap();

    let agg = sink.aggregate();
    let hello = agg.get("HelloWorld.hello").unwrap();
    assert_eq!(hello.count, 45);
    assert_eq!(hello.successes, 45);
    assert_eq!(hello.documents, 45);
    assert_eq!(hello.bytes, 45 * "Hello, World!".len() as u64);

    let report = drover::report::RunReport::from(agg);
    assert_eq!(report.operations["HelloWorld.hello"].success_ratio, 100.0);
}

#[tokio::test]
async fn channel_sink_sees_the_same_operations() {
    let (sink, aggregator) = drover::metrics::ChannelSink::spawn(16);
    Workload::builder()
        .config(WorkloadConfig::from_toml_str(TWO_PHASES).unwrap())
        .cast(Cast::with_builtins())
        .sink(Arc::new(sink))
        .build()
        .setup()
        .unwrap()
        .run()
        .await
        .unwrap();

    // The run consumed the workload, so the last sender is gone.
    let agg = aggregator.await.unwrap();
    assert_eq!(agg.total_count(), 45);
}
