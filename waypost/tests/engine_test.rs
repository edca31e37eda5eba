//! End-to-end tests of the engine over the in-memory run store.
//!
//! Workers are driven with `tick()` so every step is deterministic.

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use waypost::executor::{ActivityTickOutcome, TickOutcome};
use waypost::prelude::*;
use waypost::storage::{ClaimOrder, ClaimParams, LeaseParams};
use waypost::{ActivityStatus, EngineError, RegistryError, StorageError};

fn memory_engine() -> Engine<InMemoryRunStore> {
    Engine::with_store(Arc::new(InMemoryRunStore::new()))
}

/// Ticks both workers until neither has anything left to do.
async fn drain(engine: &Engine<InMemoryRunStore>) {
    let workflows = engine.workflow_worker();
    let activities = engine.activity_worker();

    for _ in 0..50 {
        let workflow = workflows.tick().await.unwrap();
        let activity = activities.tick().await.unwrap();
        if matches!(workflow, TickOutcome::Idle) && matches!(activity, ActivityTickOutcome::Idle) {
            return;
        }
    }
    panic!("workers did not settle");
}

async fn status_of(engine: &Engine<InMemoryRunStore>, run_id: &str) -> WorkflowStatus {
    engine
        .get_workflow_run(run_id)
        .await
        .unwrap()
        .expect("run should exist")
        .status
}

#[tokio::test]
async fn workflow_without_activities_finishes_in_one_tick() {
    let engine = memory_engine();
    let greet = engine
        .register_workflow(
            "greet",
            |_ctx: ReplayContext, (name, count): (String, u32)| async move {
                Ok(format!("Hello {name} {count}"))
            },
        )
        .unwrap();

    let run_id = engine
        .invoke_workflow(&greet, ("test".to_string(), 42))
        .await
        .unwrap();

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Pending);
    let input = run.input.to_string();
    assert!(input.contains("\"test\"") && input.contains("42"));

    let outcome = engine.workflow_worker().tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Finished { run_id: ref id } if *id == run_id));

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Finished);
    assert_eq!(run.output, Some(json!("Hello test 42")));
    assert!(engine.get_activity_history(&run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn greet_workflow_runs_to_completion() {
    let engine = memory_engine();
    let greet = engine
        .register_activity(
            "greet",
            |_ctx: ActivityContext, (name, age): (String, u32)| async move {
                Ok::<_, String>(format!("Hello {name}, you are {age}"))
            },
        )
        .unwrap();
    let welcome = engine
        .register_workflow(
            "welcome",
            move |ctx: ReplayContext, (name, age): (String, u32)| {
                let greet = greet.clone();
                async move { ctx.execute_activity(&greet, (name, age)).await }
            },
        )
        .unwrap();

    let run_id = engine
        .invoke_workflow(&welcome, ("test".to_string(), 42))
        .await
        .unwrap();

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Pending);
    assert_eq!(run.workflow_name, "welcome");
    assert_eq!(run.input, json!(["test", 42]));

    drain(&engine).await;

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Finished);
    assert_eq!(
        run.output_as::<String>().unwrap().as_deref(),
        Some("Hello test, you are 42")
    );
    assert!(run.claimed_by.is_none());

    let history = engine.get_activity_history(&run_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].activity_name, "greet");
    assert_eq!(history[0].status, ActivityStatus::Finished);
}

#[tokio::test]
async fn workflow_suspends_then_resumes_from_history() {
    let engine = memory_engine();
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let answer = engine
        .register_activity("answer", move |_ctx: ActivityContext, (): ()| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            }
        })
        .unwrap();
    let ask = engine
        .register_workflow("ask", move |ctx: ReplayContext, (): ()| {
            let answer = answer.clone();
            async move { ctx.execute_activity(&answer, ()).await }
        })
        .unwrap();

    let run_id = engine.invoke_workflow(&ask, ()).await.unwrap();
    let workflows = engine.workflow_worker();
    let activities = engine.activity_worker();

    let outcome = workflows.tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Suspended { .. }));
    assert_eq!(status_of(&engine, &run_id).await, WorkflowStatus::WaitingActivity);

    // Nothing is claimable while the activity is pending.
    assert!(matches!(workflows.tick().await.unwrap(), TickOutcome::Idle));

    let outcome = activities.tick().await.unwrap();
    assert!(matches!(outcome, ActivityTickOutcome::Finished { .. }));
    assert_eq!(status_of(&engine, &run_id).await, WorkflowStatus::Pending);

    let outcome = workflows.tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Finished { .. }));

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.output, Some(json!(42)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_activities_are_recorded_in_order() {
    let engine = memory_engine();
    let double = engine
        .register_activity("double", |_ctx: ActivityContext, (n,): (i64,)| async move {
            Ok::<_, String>(n * 2)
        })
        .unwrap();
    let chain = engine
        .register_workflow("chain", move |ctx: ReplayContext, (n,): (i64,)| {
            let double = double.clone();
            async move {
                let a = ctx.execute_activity(&double, (n,)).await?;
                let b = ctx.execute_activity(&double, (a,)).await?;
                ctx.execute_activity(&double, (b,)).await
            }
        })
        .unwrap();

    let run_id = engine.invoke_workflow(&chain, (3,)).await.unwrap();
    drain(&engine).await;

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Finished);
    assert_eq!(run.output, Some(json!(24)));

    let inputs: Vec<_> = engine
        .get_activity_history(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|activity| activity.input)
        .collect();
    assert_eq!(inputs, vec![json!([3]), json!([6]), json!([12])]);
}

#[tokio::test]
async fn changed_activity_name_aborts_the_run() {
    let engine = memory_engine();
    let first = engine
        .register_activity("first", |_ctx: ActivityContext, (): ()| async move {
            Ok::<_, String>(1)
        })
        .unwrap();
    let second = engine
        .register_activity("second", |_ctx: ActivityContext, (): ()| async move {
            Ok::<_, String>(2)
        })
        .unwrap();

    let deployed_v2 = Arc::new(AtomicBool::new(false));
    let flag = deployed_v2.clone();
    let drifting = engine
        .register_workflow("drifting", move |ctx: ReplayContext, (): ()| {
            let (first, second) = (first.clone(), second.clone());
            let v2 = flag.load(Ordering::SeqCst);
            async move {
                if v2 {
                    ctx.execute_activity(&second, ()).await
                } else {
                    ctx.execute_activity(&first, ()).await
                }
            }
        })
        .unwrap();

    let run_id = engine.invoke_workflow(&drifting, ()).await.unwrap();
    let workflows = engine.workflow_worker();
    workflows.tick().await.unwrap();
    engine.activity_worker().tick().await.unwrap();

    deployed_v2.store(true, Ordering::SeqCst);
    let outcome = workflows.tick().await.unwrap();
    match outcome {
        TickOutcome::Errored { status, message, .. } => {
            assert_eq!(status, WorkflowStatus::Aborted);
            assert!(message.contains("first"), "unexpected message: {message}");
        }
        other => panic!("expected an aborted run, got {other:?}"),
    }

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Aborted);
    assert!(run.error_message.is_some());
    assert_eq!(engine.get_activity_history(&run_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn changed_activity_input_aborts_the_run() {
    let engine = memory_engine();
    let echo = engine
        .register_activity("echo", |_ctx: ActivityContext, (n,): (u32,)| async move {
            Ok::<_, String>(n)
        })
        .unwrap();

    let bump = Arc::new(AtomicBool::new(false));
    let flag = bump.clone();
    let flaky = engine
        .register_workflow("flaky", move |ctx: ReplayContext, (n,): (u32,)| {
            let echo = echo.clone();
            let n = if flag.load(Ordering::SeqCst) { n + 1 } else { n };
            async move { ctx.execute_activity(&echo, (n,)).await }
        })
        .unwrap();

    let run_id = engine.invoke_workflow(&flaky, (7,)).await.unwrap();
    let workflows = engine.workflow_worker();
    workflows.tick().await.unwrap();
    engine.activity_worker().tick().await.unwrap();

    bump.store(true, Ordering::SeqCst);
    workflows.tick().await.unwrap();

    assert_eq!(status_of(&engine, &run_id).await, WorkflowStatus::Aborted);
}

#[tokio::test]
async fn failed_activity_fails_the_workflow() {
    let engine = memory_engine();
    let charge = engine
        .register_activity("charge", |_ctx: ActivityContext, (): ()| async move {
            Err::<u32, _>("card declined")
        })
        .unwrap();
    let checkout = engine
        .register_workflow("checkout", move |ctx: ReplayContext, (): ()| {
            let charge = charge.clone();
            async move { ctx.execute_activity(&charge, ()).await }
        })
        .unwrap();

    let run_id = engine.invoke_workflow(&checkout, ()).await.unwrap();
    drain(&engine).await;

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Failed);
    let message = run.error_message.unwrap();
    assert!(message.contains("card declined"), "unexpected message: {message}");

    let history = engine.get_activity_history(&run_id).await.unwrap();
    assert_eq!(history[0].status, ActivityStatus::Failed);
    assert_eq!(history[0].error_message.as_deref(), Some("card declined"));
}

#[tokio::test]
async fn workflow_can_recover_from_a_failed_activity() {
    let engine = memory_engine();
    let charge = engine
        .register_activity("charge", |_ctx: ActivityContext, (): ()| async move {
            Err::<u32, _>("card declined")
        })
        .unwrap();
    let checkout = engine
        .register_workflow("checkout", move |ctx: ReplayContext, (): ()| {
            let charge = charge.clone();
            async move {
                match ctx.execute_activity(&charge, ()).await {
                    Ok(_) => Ok("charged".to_string()),
                    Err(WorkflowError::ActivityFailed { .. }) => Ok("declined".to_string()),
                    Err(e) => Err(e),
                }
            }
        })
        .unwrap();

    let run_id = engine.invoke_workflow(&checkout, ()).await.unwrap();
    drain(&engine).await;

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Finished);
    assert_eq!(run.output, Some(json!("declined")));
}

#[tokio::test]
async fn invoking_an_unregistered_workflow_writes_nothing() {
    let engine = memory_engine();

    let err = engine
        .invoke_workflow_by_name("missing", json!([]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Registry(RegistryError::NotRegistered { ref name, .. }) if name == "missing"
    ));

    let typed = WorkflowRef::<(), ()>::new("also_missing");
    assert!(engine.invoke_workflow(&typed, ()).await.is_err());

    assert!(matches!(
        engine.workflow_worker().tick().await.unwrap(),
        TickOutcome::Idle
    ));
}

#[tokio::test]
async fn invoking_with_mismatched_arguments_writes_nothing() {
    let engine = memory_engine();
    engine
        .register_workflow(
            "welcome",
            |_ctx: ReplayContext, (name, age): (String, u32)| async move {
                Ok(format!("{name} {age}"))
            },
        )
        .unwrap();

    for args in [json!(["test"]), json!(["test", "forty-two"]), json!({"name": "test"})] {
        let err = engine
            .invoke_workflow_by_name("welcome", args.clone())
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::Registry(RegistryError::InvalidArguments { .. })),
            "{args} should be rejected"
        );
    }

    assert!(matches!(
        engine.workflow_worker().tick().await.unwrap(),
        TickOutcome::Idle
    ));

    let run_id = engine
        .invoke_workflow_by_name("welcome", json!(["test", 42]))
        .await
        .unwrap();
    assert_eq!(status_of(&engine, &run_id).await, WorkflowStatus::Pending);
}

#[tokio::test]
async fn concurrent_claims_hand_a_run_to_exactly_one_worker() {
    let engine = memory_engine();
    engine
        .register_workflow("noop", |_ctx: ReplayContext, (): ()| async move { Ok(()) })
        .unwrap();
    engine.invoke_workflow_by_name("noop", json!(null)).await.unwrap();

    let store = engine.store().clone();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let worker_id = format!("worker-{i}");
            let mut tx = store.begin().await.unwrap();
            let next = tx
                .workflows()
                .get_next_workflow_run(ClaimParams::new(ClaimOrder::OldestFirst))
                .await
                .unwrap();
            let claimed = match next {
                Some(run) => {
                    let lease = LeaseParams {
                        worker_id: &worker_id,
                        expires_at: chrono::Utc::now() + chrono::Duration::seconds(30),
                    };
                    tx.workflows().claim_workflow_run(&run.id, lease).await.unwrap();
                    true
                }
                None => false,
            };
            tx.commit().await.unwrap();
            claimed
        }));
    }

    let mut claims = 0;
    for task in tasks {
        if task.await.unwrap() {
            claims += 1;
        }
    }
    assert_eq!(claims, 1);
}

#[tokio::test]
async fn expired_lease_is_reclaimed() {
    let engine = memory_engine();
    engine
        .register_workflow("noop", |_ctx: ReplayContext, (): ()| async move { Ok(()) })
        .unwrap();
    let run_id = engine
        .invoke_workflow_by_name("noop", json!(null))
        .await
        .unwrap();

    // A worker that claimed the run and vanished.
    {
        let mut tx = engine.store().begin().await.unwrap();
        let lease = LeaseParams {
            worker_id: "crashed",
            expires_at: chrono::Utc::now() - chrono::Duration::seconds(1),
        };
        tx.workflows().claim_workflow_run(&run_id, lease).await.unwrap();
        tx.commit().await.unwrap();
    }

    let outcome = engine.workflow_worker().tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Finished { .. }));
    assert_eq!(status_of(&engine, &run_id).await, WorkflowStatus::Finished);
}

#[tokio::test]
async fn started_engine_completes_runs_and_shuts_down() {
    let engine = memory_engine().with_worker_config(WorkerConfig {
        poll_interval: Duration::from_millis(10),
        ..WorkerConfig::default()
    });
    let greet = engine
        .register_activity("greet", |_ctx: ActivityContext, (name,): (String,)| async move {
            Ok::<_, String>(format!("Hello {name}"))
        })
        .unwrap();
    let welcome = engine
        .register_workflow("welcome", move |ctx: ReplayContext, (name,): (String,)| {
            let greet = greet.clone();
            async move { ctx.execute_activity(&greet, (name,)).await }
        })
        .unwrap();

    let handle = engine.start().await;
    assert!(handle.is_running());
    assert!(engine.registry().is_sealed());

    let run_id = engine
        .invoke_workflow(&welcome, ("test".to_string(),))
        .await
        .unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if status_of(&engine, &run_id).await == WorkflowStatus::Finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "run did not finish in time");

    handle.shutdown().await;
    engine.close().await.unwrap();
}

#[tokio::test]
async fn swallowed_scheduling_signal_still_waits_for_the_activity() {
    let engine = memory_engine();
    let add = engine
        .register_activity("add", |_ctx: ActivityContext, (a, b): (i64, i64)| async move {
            Ok::<_, String>(a + b)
        })
        .unwrap();
    let sum = engine
        .register_workflow("sum", move |ctx: ReplayContext, (a, b): (i64, i64)| {
            let add = add.clone();
            async move {
                let total = ctx.execute_activity(&add, (a, b)).await.unwrap_or(-1);
                Ok::<_, WorkflowError>(total)
            }
        })
        .unwrap();

    let run_id = engine.invoke_workflow(&sum, (40, 2)).await.unwrap();

    let outcome = engine.workflow_worker().tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Suspended { .. }));
    assert_eq!(status_of(&engine, &run_id).await, WorkflowStatus::WaitingActivity);

    drain(&engine).await;

    let run = engine.get_workflow_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Finished);
    assert_eq!(run.output, Some(json!(42)));
    assert_eq!(engine.get_activity_history(&run_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failing_runs_do_not_stop_the_started_engine() {
    let engine = memory_engine().with_worker_config(WorkerConfig {
        poll_interval: Duration::from_millis(10),
        ..WorkerConfig::default()
    });
    let boom = engine
        .register_workflow("boom", |_ctx: ReplayContext, (): ()| async move {
            if true {
                panic!("boom");
            }
            Ok::<(), WorkflowError>(())
        })
        .unwrap();
    let poison = engine
        .register_workflow("poison", |_ctx: ReplayContext, (): ()| async move {
            Err::<(), _>(WorkflowError::from(StorageError::Constraint(
                "duplicate key".into(),
            )))
        })
        .unwrap();
    let echo = engine
        .register_workflow("echo", |_ctx: ReplayContext, (word,): (String,)| async move {
            Ok::<_, WorkflowError>(word)
        })
        .unwrap();

    let boom_id = engine.invoke_workflow(&boom, ()).await.unwrap();
    let poison_id = engine.invoke_workflow(&poison, ()).await.unwrap();
    let echo_id = engine
        .invoke_workflow(&echo, ("still here".to_string(),))
        .await
        .unwrap();

    let handle = engine.start().await;
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while status_of(&engine, &echo_id).await != WorkflowStatus::Finished {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "run did not finish in time");

    let boom_run = engine.get_workflow_run(&boom_id).await.unwrap().unwrap();
    assert_eq!(boom_run.status, WorkflowStatus::Failed);
    assert!(boom_run
        .error_message
        .is_some_and(|message| message.contains("workflow panicked")));
    assert_eq!(status_of(&engine, &poison_id).await, WorkflowStatus::Failed);
    assert!(handle.is_running());

    handle.shutdown().await;
}
