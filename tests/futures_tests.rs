use durable_replay::providers::HistoryStore;
use durable_replay::providers::fs::FsHistoryStore;
use durable_replay::runtime::registry::ActivityRegistry;
use durable_replay::runtime::{self, OrchestrationStatus};
use durable_replay::{Action, Event, OrchestrationContext, OrchestrationRegistry, run_turn};
use std::sync::Arc;
use std::sync::Arc as StdArc;
use std::time::Duration;
mod common;

fn sched(seq: u64, name: &str) -> Event {
    Event::ActivityScheduled {
        seq,
        name: name.into(),
        input: String::new(),
    }
}

fn done(seq: u64, result: &str) -> Event {
    Event::ActivityCompleted {
        seq,
        result: result.into(),
    }
}

async fn three_way_join(ctx: OrchestrationContext) -> Vec<Result<String, String>> {
    let futs = vec![
        ctx.schedule_activity("A", ""),
        ctx.schedule_activity("B", ""),
        ctx.schedule_activity("C", ""),
    ];
    ctx.join(futs).await
}

#[test]
fn join_waits_for_every_child() {
    // Two of three completions recorded, in reverse order
    let history = vec![sched(1, "A"), sched(2, "B"), sched(3, "C"), done(3, "c"), done(2, "b")];
    let turn = run_turn(history.clone(), three_way_join);
    assert!(turn.mismatch.is_none());
    assert!(turn.output.is_none(), "join must stay pending until all children complete");
    assert!(turn.actions.is_empty());
    assert_eq!(turn.history, history);
}

#[test]
fn join_returns_input_order() {
    let history = vec![
        sched(1, "A"),
        sched(2, "B"),
        sched(3, "C"),
        done(3, "c"),
        Event::ActivityFailed {
            seq: 1,
            error: "a-err".into(),
        },
        done(2, "b"),
    ];
    let turn = run_turn(history, three_way_join);
    assert_eq!(
        turn.output.unwrap(),
        vec![Err("a-err".to_string()), Ok("b".to_string()), Ok("c".to_string())]
    );
}

#[test]
fn work_after_join_continues_sequence() {
    let history = vec![sched(1, "A"), sched(2, "B"), sched(3, "C"), done(1, "a"), done(2, "b"), done(3, "c")];
    let turn = run_turn::<(), _>(history, |ctx: OrchestrationContext| async move {
        let results = three_way_join(ctx.clone()).await;
        let _ = ctx.schedule_activity("D", results.len().to_string()).await;
    });
    assert_eq!(
        turn.actions,
        vec![Action::CallActivity {
            seq: 4,
            name: "D".into(),
            input: "3".into()
        }]
    );
}

#[test]
fn foreign_combinators_schedule_in_poll_order() {
    // DurableFuture is a plain Future, so futures::join works as well
    let turn = run_turn::<(), _>(Vec::new(), |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "1");
        let b = ctx.schedule_activity("B", "2");
        let _ = futures::future::join(a, b).await;
    });
    let names: Vec<&str> = turn
        .actions
        .iter()
        .filter_map(|a| match a {
            Action::CallActivity { name, .. } => Some(name.as_str()),
            Action::CreateTimer { .. } => None,
        })
        .collect();
    assert_eq!(names, vec!["A", "B"]);
}

#[test]
fn unpolled_future_records_nothing() {
    let turn = run_turn(Vec::new(), |ctx: OrchestrationContext| async move {
        let _never_awaited = ctx.schedule_activity("Ghost", "");
        "done".to_string()
    });
    assert_eq!(turn.output.as_deref(), Some("done"));
    assert!(turn.actions.is_empty());
    assert!(turn.history.is_empty());
}

#[tokio::test]
async fn join_fan_out_through_runtime_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    let activity_registry = ActivityRegistry::builder()
        .register("Square", |input: String| async move {
            let n: u64 = input.parse().map_err(|e| format!("bad input: {e}"))?;
            tokio::time::sleep(Duration::from_millis(10 * (5 - n))).await;
            Ok((n * n).to_string())
        })
        .build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("Squares", |ctx: OrchestrationContext, _input: String| async move {
            let futs = (1..=4).map(|n| ctx.schedule_activity("Square", n.to_string())).collect();
            let mut total = 0u64;
            for r in ctx.join(futs).await {
                total += r?.parse::<u64>().map_err(|e| e.to_string())?;
            }
            Ok(total.to_string())
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(activity_registry), orchestration_registry).await;
    rt.schedule_new_orchestration_instance_with_id("inst-squares", "Squares", "")
        .await
        .unwrap();
    let status = rt
        .wait_for_orchestration("inst-squares", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "30".into() });
    let hist = store.read("inst-squares").await.unwrap();
    for seq in 1..=4 {
        assert_eq!(common::count_completions(&hist, seq), 1);
    }
    rt.shutdown().await;
}
