use std::time::Duration;

use volley::{
    Coordinator, HttpRequest, HttpTransport, LoadProfile, RampPoint, RunConfig, TaskSet,
    TaskSpec, TracingSink, WaitTime,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let target =
        std::env::var("VOLLEY_TARGET").unwrap_or_else(|_| "http://localhost:3000".into());
    // One client for the whole run, shared by every user
    let transport = HttpTransport::new(target);

    let hello_world = TaskSpec::<HttpTransport>::new("hello_world", 1, |ctx| async move {
        ctx.execute(HttpRequest::get("/hello")).await?;
        ctx.execute(HttpRequest::get("/world")).await?;
        Ok(())
    });
    let tasks = TaskSet::weighted(vec![hello_world])?;

    let config = RunConfig::builder()
        .load(LoadProfile::Ramp(vec![
            // ramp up to 10 users over 5 seconds
            RampPoint::new(Duration::from_secs(5), 10),
            // hold
            RampPoint::new(Duration::from_secs(20), 10),
            // spike
            RampPoint::new(Duration::from_secs(20), 50),
            RampPoint::new(Duration::from_secs(30), 50),
            // and back down
            RampPoint::new(Duration::from_secs(35), 0),
        ]))
        .spawn_rate(20.0)
        .wait_time(WaitTime::between(
            Duration::from_millis(100),
            Duration::from_millis(500),
        ))
        .run_time(Duration::from_secs(40))
        .build();

    let report = Coordinator::new(tasks, transport, TracingSink)
        .start(config)?
        .wait()
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
