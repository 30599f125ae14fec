use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use hdrhistogram::Histogram;
use shape_limit::MemoryStore;
use shape_limit::Pacing;
use shape_limit::ShapeError;
use shape_limit::ShaperOptions;
use shape_limit::StoreOptions;
use shape_limit::TrafficShaper;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower::service_fn;
use tower_shape::ShapeLayer;
use tracing_subscriber::EnvFilter;

async fn mock_db_call(_req: u64) -> Result<&'static str, BoxError> {
    // Simulate real-world work (20ms of DB latency)
    sleep(Duration::from_millis(20)).await;
    Ok("success")
}

#[derive(Default)]
struct RejectionCounter {
    timeouts: usize,
    unavailable: usize,
    other: usize,
}

async fn run_load_test<S>(name: &str, svc: S, total_reqs: u64)
where
    S: Service<u64, Response = &'static str, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();

    let mut tasks = JoinSet::new();
    let mut rejections = RejectionCounter::default();

    let start = Instant::now();

    let barrier = Arc::new(Barrier::new(total_reqs as usize));

    for req in 0..total_reqs {
        let svc = svc.clone();
        let bar = barrier.clone();
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let res = svc.oneshot(req).await;
            (res, req_start.elapsed())
        });
    }

    let mut success_count = 0;

    while let Some(task) = tasks.join_next().await {
        let (res, elapsed) = task.expect("Task panicked");
        match res {
            Ok(_) => {
                success_count += 1;
                hist_elapsed.record(elapsed.as_micros() as u64).unwrap();
            }
            Err(e) => match e.downcast_ref::<ShapeError>() {
                Some(ShapeError::Timeout) => rejections.timeouts += 1,
                Some(ShapeError::ShapingUnavailable(_)) => rejections.unavailable += 1,
                _ => rejections.other += 1,
            },
        }
    }

    let total_duration = start.elapsed();
    let goodput = success_count as f64 / total_duration.as_secs_f64();

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", success_count, total_reqs);
    println!("Success Rate:    {:.2} req/sec (Goodput)", goodput);

    if success_count > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!(
            "P99 (Elapsed):   {}µs",
            hist_elapsed.value_at_quantile(0.99)
        );
        println!("Max (Elapsed):   {}µs", hist_elapsed.max());
    }

    let total_errors = rejections.timeouts + rejections.unavailable + rejections.other;
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ Timeouts:   {}", rejections.timeouts);
        println!("  └─ Unavailable:{}", rejections.unavailable);
        if rejections.other > 0 {
            println!("  └─ Other:      {}", rejections.other);
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let total_reqs = 2_000;
    let store = Arc::new(MemoryStore::new());

    // 1. Concurrency cap, comfortably within the timeout
    let shaper = TrafficShaper::new(
        ShaperOptions::new(StoreOptions::shared(store.clone()))
            .with_namespace("stress:cap:")
            .with_capacity(200)
            .with_timeout_ms(2_000),
    )?;
    let svc = ShapeLayer::new(Arc::new(shaper)).layer(service_fn(mock_db_call));
    run_load_test("Concurrency Cap (200)", svc, total_reqs).await;

    // 2. Concurrency cap, starved: most callers should time out
    let shaper = TrafficShaper::new(
        ShaperOptions::new(StoreOptions::shared(store.clone()))
            .with_namespace("stress:starved:")
            .with_capacity(10)
            .with_timeout_ms(500),
    )?;
    let svc = ShapeLayer::new(Arc::new(shaper)).layer(service_fn(mock_db_call));
    run_load_test("Concurrency Cap (10, 500ms)", svc, total_reqs).await;

    // 3. Two shapers on one store behave like two processes
    let options = ShaperOptions::new(StoreOptions::shared(store.clone()))
        .with_namespace("stress:shared:")
        .with_capacity(100);
    let here = Arc::new(TrafficShaper::new(options.clone())?);
    let there = Arc::new(TrafficShaper::new(options)?);
    let svc_here = ShapeLayer::new(here).layer(service_fn(mock_db_call));
    let svc_there = ShapeLayer::new(there).layer(service_fn(mock_db_call));
    tokio::join!(
        run_load_test("Shared Cap (here)", svc_here, total_reqs / 2),
        run_load_test("Shared Cap (there)", svc_there, total_reqs / 2),
    );

    // 4. Median-gap pacing, one id per tenth of the requests
    let shaper = TrafficShaper::new(
        ShaperOptions::new(StoreOptions::shared(store.clone()))
            .with_namespace("stress:median:")
            .with_pacing(Pacing::MedianGap),
    )?;
    let svc = ShapeLayer::new(Arc::new(shaper))
        .with_id(|req: &u64| (req % 10).to_string())
        .layer(service_fn(mock_db_call));
    run_load_test("Median Gap Pacing", svc, total_reqs).await;

    // 5. Gain pacing
    let shaper = TrafficShaper::new(
        ShaperOptions::new(StoreOptions::shared(store))
            .with_namespace("stress:gain:")
            .with_pacing(Pacing::Gain)
            .with_gain(0.1),
    )?;
    let svc = ShapeLayer::new(Arc::new(shaper)).layer(service_fn(mock_db_call));
    run_load_test("Gain Pacing", svc, total_reqs).await;

    Ok(())
}
