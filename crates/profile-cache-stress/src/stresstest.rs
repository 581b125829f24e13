use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use profile_cache::config::Config;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Cluster, Counters, WorkloadsConfig};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // start one cluster per workload, each with its own coordination ensemble
    let mut clusters = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let cluster = Cluster::start(&config, &workload, i)
            .await
            .with_context(|| format!("failed to start cluster for workload {i}"))?;
        clusters.push((workload, Arc::new(cluster)));
    }

    // warmup: run each workload once to make sure all nodes are connected
    {
        let start = Instant::now();

        let futures = clusters.iter().map(|(_, cluster)| {
            let cluster = Arc::clone(cluster);
            tokio::spawn(async move {
                cluster.process_request().await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(clusters.len());
    for (workload, cluster) in &clusters {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let concurrency = workload.concurrency.max(1);
        let cluster = Arc::clone(cluster);

        if let Some(interval) = workload.chaos_interval {
            let cluster = Arc::clone(&cluster);
            tokio::spawn(async move {
                let first = tokio::time::Instant::now() + interval;
                let mut ticker = tokio::time::interval_at(first, interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => cluster.inject_session_loss().await,
                        _ = tokio::time::sleep_until(deadline) => break,
                    }
                }
            });
        }

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let Ok(permit) = permit else {
                            break;
                        };
                        let cluster = Arc::clone(&cluster);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            cluster.process_request().await;

                            transaction.finish();

                            if let Ok(mut durations) = task_durations.lock() {
                                durations.add(task_start.elapsed().as_secs_f64());
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = match task_durations.lock() {
                Ok(mut task_durations) => std::mem::take(&mut *task_durations),
                Err(_) => DDSketch::default(),
            };

            (concurrency, task_durations)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, (_, cluster))) in finished_tasks.into_iter().zip(&clusters).enumerate() {
        let (concurrency, task_durations) = task.context("stresstest task failed")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops > 0 {
            let quantile = |q| {
                let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let avg = task_durations.sum().unwrap_or_default() / ops as f64;
            let avg = Duration::from_secs_f64(avg);
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let counters = &cluster.counters;
        println!(
            "  loads: {}; served: {}; redirects: {}; in progress: {}; unavailable: {}; failed: {}; gave up: {}",
            cluster.loads(),
            Counters::get(&counters.served),
            Counters::get(&counters.redirects),
            Counters::get(&counters.in_progress),
            Counters::get(&counters.unavailable),
            Counters::get(&counters.failed),
            Counters::get(&counters.gave_up),
        );
    }

    Ok(())
}
