//! Resuming a workflow after a restart, with the in-memory store
//!
//! The first activity of an order runs under a pair of workers that then
//! stop. Background workers started afterwards replay the recorded history:
//! the reservation is not made a second time and the run continues with
//! shipping.
//!
//! ## Run with
//! ```bash
//! cargo run --example restart_memory
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use waypost::prelude::*;

static RESERVATIONS: AtomicUsize = AtomicUsize::new(0);
static SHIPMENTS: AtomicUsize = AtomicUsize::new(0);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let worker_config = WorkerConfig {
        poll_interval: Duration::from_millis(20),
        ..WorkerConfig::default()
    };
    let engine =
        Engine::with_store(Arc::new(InMemoryRunStore::new())).with_worker_config(worker_config);

    let reserve = engine.register_activity(
        "reserve",
        |_ctx: ActivityContext, (order,): (String,)| async move {
            RESERVATIONS.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(format!("{order}-R"))
        },
    )?;
    let ship = engine.register_activity(
        "ship",
        |ctx: ActivityContext, (reservation,): (String,)| async move {
            SHIPMENTS.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = ctx.cancelled() => Err("shipping interrupted".to_string()),
                _ = tokio::time::sleep(Duration::from_millis(100)) => Ok(format!("{reservation}-S")),
            }
        },
    )?;
    let order = engine.register_workflow(
        "order",
        move |ctx: ReplayContext, (order,): (String,)| {
            let (reserve, ship) = (reserve.clone(), ship.clone());
            async move {
                let reservation = ctx.execute_activity(&reserve, (order,)).await?;
                ctx.execute_activity(&ship, (reservation,)).await
            }
        },
    )?;

    let run_id = engine
        .invoke_workflow(&order, ("order-7".to_string(),))
        .await?;

    engine.workflow_worker().with_worker_id("first").tick().await?;
    engine.activity_worker().with_worker_id("first").tick().await?;
    println!("first workers reserved stock and stopped");

    let handle = engine.start().await;
    loop {
        let run = engine
            .get_workflow_run(&run_id)
            .await?
            .ok_or("workflow run disappeared")?;
        if run.status.is_terminal() {
            println!("Run {} ended as {} with {:?}", run.id, run.status, run.output);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.shutdown().await;

    println!(
        "reserve ran {} time(s), ship ran {} time(s)",
        RESERVATIONS.load(Ordering::SeqCst),
        SHIPMENTS.load(Ordering::SeqCst)
    );
    for activity in engine.get_activity_history(&run_id).await? {
        println!(
            "  {} {} -> {:?}",
            activity.activity_name, activity.status, activity.output
        );
    }
    Ok(())
}
