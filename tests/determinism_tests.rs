use durable_replay::providers::HistoryStore;
use durable_replay::providers::fs::FsHistoryStore;
use durable_replay::providers::in_memory::InMemoryHistoryStore;
use durable_replay::runtime::registry::ActivityRegistry;
use durable_replay::runtime::{self, OrchestrationStatus};
use durable_replay::{Action, Event, OrchestrationContext, OrchestrationRegistry, run_turn, run_turn_with};
use std::sync::Arc as StdArc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
mod common;

async fn city_chain(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    let a = ctx.schedule_activity("Capitalize", "tokyo").await?;
    let b = ctx.schedule_activity("Capitalize", "london").await?;
    let joined = ctx
        .join(vec![
            ctx.schedule_activity("Capitalize", "seattle"),
            ctx.schedule_activity("Capitalize", "austin"),
        ])
        .await;
    let mut out = vec![a, b];
    for r in joined {
        out.push(r?);
    }
    Ok(out.join(", "))
}

async fn orchestration_completes_and_replays_deterministically_with(store: StdArc<dyn HistoryStore>) {
    let activity_registry = ActivityRegistry::builder()
        .register("Capitalize", |input: String| async move { Ok(input.to_uppercase()) })
        .build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("CityChain", city_chain)
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(activity_registry), orchestration_registry).await;
    rt.schedule_new_orchestration_instance_with_id("inst-det-1", "CityChain", "")
        .await
        .unwrap();
    let status = rt
        .wait_for_orchestration("inst-det-1", Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("unexpected status: {status:?}");
    };
    assert_eq!(output, "TOKYO, LONDON, SEATTLE, AUSTIN");

    let final_history = store.read("inst-det-1").await.unwrap();
    // Started + 4 schedule/complete pairs + Completed
    assert_eq!(final_history.len(), 10);

    // Replaying the persisted history reproduces the output with no new work
    let turn = run_turn_with("inst-det-1", final_history.clone(), |ctx| city_chain(ctx, String::new()));
    assert!(turn.mismatch.is_none(), "{:?}", turn.mismatch);
    assert!(turn.actions.is_empty(), "replay should not produce new actions");
    assert_eq!(turn.history, final_history);
    assert_eq!(turn.output, Some(Ok(output)));
    rt.shutdown().await;
}

#[tokio::test]
async fn orchestration_completes_and_replays_deterministically_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    orchestration_completes_and_replays_deterministically_with(store).await;
}

#[tokio::test]
async fn orchestration_completes_and_replays_deterministically_inmem() {
    let store = StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>;
    orchestration_completes_and_replays_deterministically_with(store).await;
}

#[test]
fn action_order_is_deterministic_in_first_turn() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let futs = vec![
            ctx.schedule_activity("A", "1"),
            ctx.schedule_activity("B", "2"),
            ctx.schedule_activity("C", "3"),
        ];
        let _ = ctx.join(futs).await;
        unreachable!("should not complete in the first turn");
    };

    let first = run_turn::<(), _>(Vec::new(), orchestrator);
    let second = run_turn::<(), _>(Vec::new(), orchestrator);
    let calls: Vec<(u64, &str)> = first
        .actions
        .iter()
        .filter_map(|a| match a {
            Action::CallActivity { seq, name, .. } => Some((*seq, name.as_str())),
            Action::CreateTimer { .. } => None,
        })
        .collect();
    assert_eq!(
        calls,
        vec![(1, "A"), (2, "B"), (3, "C")],
        "actions must be recorded in declaration order"
    );
    assert_eq!(first.actions, second.actions);
    assert_eq!(first.history, second.history);
}

#[test]
fn changed_activity_name_is_a_mismatch() {
    let history = vec![
        Event::OrchestratorStarted {
            name: "O".into(),
            input: String::new(),
            timestamp_ms: 10,
            execution_id: String::new(),
        },
        Event::ActivityScheduled {
            seq: 1,
            name: "Capitalize".into(),
            input: "tokyo".into(),
        },
    ];
    let turn = run_turn(history.clone(), |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("Lowercase", "tokyo").await
    });
    let mismatch = turn.mismatch.expect("renamed activity must be detected");
    assert!(mismatch.to_string().starts_with("nondeterministic:"));
    assert!(turn.output.is_none());
    assert!(turn.actions.is_empty(), "no new work after a mismatch");
    assert_eq!(turn.history, history);
}

#[test]
fn changed_activity_input_is_a_mismatch() {
    let history = vec![Event::ActivityScheduled {
        seq: 1,
        name: "Capitalize".into(),
        input: "tokyo".into(),
    }];
    let turn = run_turn(history, |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("Capitalize", "osaka").await
    });
    assert!(turn.mismatch.is_some());
}

#[test]
fn dropped_schedule_is_a_mismatch() {
    // History recorded two calls; the orchestrator now only makes one and returns
    let history = vec![
        Event::ActivityScheduled {
            seq: 1,
            name: "A".into(),
            input: String::new(),
        },
        Event::ActivityScheduled {
            seq: 2,
            name: "B".into(),
            input: String::new(),
        },
        Event::ActivityCompleted {
            seq: 1,
            result: "a".into(),
        },
    ];
    let turn = run_turn(history, |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("A", "").await
    });
    assert_eq!(turn.output, Some(Ok("a".to_string())));
    let mismatch = turn.mismatch.expect("unclaimed schedule must be detected");
    assert!(mismatch.0.contains("'B'"), "{mismatch}");
}

#[tokio::test]
async fn runtime_fails_instance_on_replay_mismatch() {
    let store = StdArc::new(InMemoryHistoryStore::default());
    // Simulate history written by an older version of the orchestrator
    store.create_instance("inst-old").await.unwrap();
    store
        .append(
            "inst-old",
            0,
            vec![
                Event::OrchestratorStarted {
                    name: "Evolving".into(),
                    input: String::new(),
                    timestamp_ms: 1,
                    execution_id: String::new(),
                },
                Event::ActivityScheduled {
                    seq: 1,
                    name: "OldStep".into(),
                    input: String::new(),
                },
            ],
        )
        .await
        .unwrap();

    let activity_registry = ActivityRegistry::builder()
        .register("OldStep", |_input: String| async move { Ok("old".to_string()) })
        .register("NewStep", |_input: String| async move { Ok("new".to_string()) })
        .build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("Evolving", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("NewStep", "").await
        })
        .build();
    let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(activity_registry), orchestration_registry).await;

    let status = rt
        .wait_for_orchestration("inst-old", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Failed { error } => assert!(error.starts_with("nondeterministic:"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }
    let hist = store.read("inst-old").await.unwrap();
    assert!(
        !hist.iter().any(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "NewStep")),
        "mismatching history must never be patched"
    );
    rt.shutdown().await;
}

#[test]
fn is_replaying_tracks_recorded_completions() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let history = vec![
        Event::ActivityScheduled {
            seq: 1,
            name: "A".into(),
            input: String::new(),
        },
        Event::ActivityCompleted {
            seq: 1,
            result: "a".into(),
        },
    ];
    let seen_c = seen.clone();
    let turn = run_turn::<Result<String, String>, _>(history, move |ctx: OrchestrationContext| async move {
        seen_c.lock().unwrap().push(ctx.is_replaying());
        let a = ctx.schedule_activity("A", "").await?;
        seen_c.lock().unwrap().push(ctx.is_replaying());
        let b = ctx.schedule_activity("B", a).await?;
        Ok(b)
    });
    assert!(turn.output.is_none());
    assert_eq!(turn.actions.len(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}

#[test]
fn new_guid_is_stable_across_replays() {
    let history = vec![Event::OrchestratorStarted {
        name: "G".into(),
        input: String::new(),
        timestamp_ms: 1_700_000_000_000,
        execution_id: String::new(),
    }];
    let guids = |instance: &str| {
        run_turn_with(instance, history.clone(), |ctx: OrchestrationContext| async move {
            (ctx.new_guid(), ctx.new_guid(), ctx.current_utc_ms())
        })
        .output
        .unwrap()
    };
    let (a1, b1, t1) = guids("inst-g");
    let (a2, b2, _) = guids("inst-g");
    let (a3, _, _) = guids("inst-other");
    assert_eq!((&a1, &b1), (&a2, &b2));
    assert_ne!(a1, b1);
    assert_ne!(a1, a3);
    assert_eq!(t1, 1_700_000_000_000);
}
