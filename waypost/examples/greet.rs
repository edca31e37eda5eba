//! Greet workflow against Postgres
//!
//! Registers one activity and one workflow, invokes the workflow and waits
//! until a worker finishes it.
//!
//! ## Run with
//! ```bash
//! export WAYPOST_DB_USER=postgres WAYPOST_DB_PASSWORD=postgres WAYPOST_DB_NAME=waypost
//! RUST_LOG=info cargo run --example greet
//! ```

use std::time::Duration;
use tracing_subscriber::EnvFilter;
use waypost::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let engine = Engine::connect(EngineConfig::new(DbConfig::from_env()?, true)).await?;

    let greet = engine.register_activity(
        "greet",
        |ctx: ActivityContext, (name, age): (String, u32)| async move {
            tracing::info!("Running activity run {}", ctx.activity_run_id());
            Ok::<_, String>(format!("Hello {name}, you are {age} years old"))
        },
    )?;
    let welcome = engine.register_workflow(
        "welcome",
        move |ctx: ReplayContext, (name, age): (String, u32)| {
            let greet = greet.clone();
            async move {
                let greeting = ctx.execute_activity(&greet, (name, age)).await?;
                Ok(greeting.to_uppercase())
            }
        },
    )?;

    let handle = engine.start().await;
    let run_id = engine
        .invoke_workflow(&welcome, ("test".to_string(), 42))
        .await?;
    println!("Invoked workflow run {run_id}");

    loop {
        let run = engine
            .get_workflow_run(&run_id)
            .await?
            .ok_or("workflow run disappeared")?;
        if run.status.is_terminal() {
            println!("Run {} ended as {}: {:?}", run.id, run.status, run.output);
            if let Some(message) = run.error_message {
                println!("  error: {message}");
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    handle.shutdown().await;
    engine.close().await?;
    Ok(())
}
