//! repohost Pipeline Stress Test
//!
//! Drives the full write → sequence → dispatch → index pipeline under load and
//! checks that the index converges.
//! Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default: 50 accounts, 20 posts each, 10 concurrent writers
//! cargo run --release --bin stress_test
//!
//! # Many accounts, few partitions
//! cargo run --release --bin stress_test -- --accounts 500 --posts 10 --partitions 4
//!
//! # With logs
//! RUST_LOG=repohost=debug cargo run --release --bin stress_test
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing_subscriber::EnvFilter;

use repohost::{
    Did, DispatchQueue, HostConfig, IndexingService, QueueConfig, RecordWrite, RepoHost,
    RepoSubscription, Seq, SubscriptionConfig,
};

/// Stress test configuration
struct Config {
    /// Number of accounts to create
    accounts: usize,
    /// Posts written per account
    posts: usize,
    /// Number of concurrent writer tasks
    concurrency: usize,
    /// Dispatch partitions
    partitions: usize,
    /// How long to wait for the index to converge
    timeout_secs: u64,
    /// Path to database file (or temp if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accounts: 50,
            posts: 20,
            concurrency: 10,
            partitions: 16,
            timeout_secs: 120,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--accounts" | "-a" => {
                i += 1;
                config.accounts = args[i].parse().expect("Invalid --accounts value");
            }
            "--posts" | "-p" => {
                i += 1;
                config.posts = args[i].parse().expect("Invalid --posts value");
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = args[i].parse().expect("Invalid --concurrency value");
            }
            "--partitions" => {
                i += 1;
                config.partitions = args[i].parse().expect("Invalid --partitions value");
            }
            "--timeout" | "-t" => {
                i += 1;
                config.timeout_secs = args[i].parse().expect("Invalid --timeout value");
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"repohost Pipeline Stress Test

Usage: stress_test [OPTIONS]

Options:
  -a, --accounts <N>    Accounts to create (default: 50)
  -p, --posts <N>       Posts per account (default: 20)
  -c, --concurrency <N> Concurrent writer tasks (default: 10)
      --partitions <N>  Dispatch partitions (default: 16)
  -t, --timeout <SECS>  Convergence timeout (default: 120)
  -d, --db <PATH>       Database path (default: temp file)
  -h, --help            Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn account(n: usize) -> Did {
    Did::new(format!("did:example:stress{:05}", n))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = parse_args();

    println!("repohost Pipeline Stress Test");
    println!("=============================");
    println!("Accounts:    {}", config.accounts);
    println!("Posts:       {} per account", config.posts);
    println!("Concurrency: {}", config.concurrency);
    println!("Partitions:  {}", config.partitions);
    println!();

    let temp_dir = std::env::temp_dir().join(format!("repohost-stress-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir).expect("create temp dir");
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.join("stress.db").to_string_lossy().to_string());

    println!("Database:    {}", db_path);
    println!();

    let host = RepoHost::open(&db_path, HostConfig::default()).expect("open host");
    let queue = DispatchQueue::open(&db_path, QueueConfig::default())
        .await
        .expect("open queue");
    let indexer = IndexingService::open(&db_path, Arc::new(host.clone())).expect("open indexer");
    let subscription = RepoSubscription::start(
        host.sequencer().clone(),
        queue.clone(),
        indexer.clone(),
        SubscriptionConfig {
            partitions: config.partitions,
            ..SubscriptionConfig::default()
        },
    );

    // Metrics
    let commits = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    println!("Writing...");
    let start = Instant::now();

    let mut handles = Vec::new();
    let concurrency = config.concurrency.max(1);
    for task_id in 0..concurrency {
        let host = host.clone();
        let commits = commits.clone();
        let errors = errors.clone();
        let (accounts, posts) = (config.accounts, config.posts);

        handles.push(tokio::spawn(async move {
            for n in (task_id..accounts).step_by(concurrency) {
                let did = account(n);
                let handle = format!("stress{:05}.test", n);
                if host.create_repo(&did, Some(handle), vec![]).await.is_err() {
                    errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                commits.fetch_add(1, Ordering::Relaxed);

                for i in 0..posts {
                    let record = json!({
                        "$type": "app.bsky.feed.post",
                        "text": format!("post {} of {}", i, did),
                        "createdAt": "2024-01-01T00:00:00Z",
                    });
                    let write = RecordWrite::create("app.bsky.feed.post", format!("{:06}", i), record);
                    match host.apply_writes(&did, vec![write]).await {
                        Ok(_) => commits.fetch_add(1, Ordering::Relaxed),
                        Err(_) => errors.fetch_add(1, Ordering::Relaxed),
                    };
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    let write_elapsed = start.elapsed();
    let committed = commits.load(Ordering::Relaxed);

    println!("Waiting for the index to converge...");
    let deadline = Instant::now() + Duration::from_secs(config.timeout_secs);
    let mut converged = 0;
    while Instant::now() < deadline {
        converged = 0;
        for n in 0..config.accounts {
            if let Ok(aggs) = indexer.get_profile_aggregates(&account(n)).await {
                if aggs.posts_count == config.posts as u64 {
                    converged += 1;
                }
            }
        }
        if converged == config.accounts {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let total_elapsed = start.elapsed();

    println!();
    println!("Results");
    println!("-------");
    println!("Commits:         {}", committed);
    println!("Errors:          {}", errors.load(Ordering::Relaxed));
    println!("Write duration:  {:?}", write_elapsed);
    println!(
        "Throughput:      {:.2} commits/sec",
        committed as f64 / write_elapsed.as_secs_f64()
    );
    println!("Index lag:       {:?}", total_elapsed - write_elapsed);
    println!();

    println!("Verifying invariants...");

    let rows = host
        .sequencer()
        .read_events(Seq::FIRST, usize::MAX / 2)
        .await
        .expect("read log");
    assert!(
        rows.windows(2).all(|w| w[0].seq < w[1].seq),
        "log seqs are not strictly increasing"
    );
    println!("  Log order:         {} events, strictly increasing ✓", rows.len());

    assert_eq!(
        converged, config.accounts,
        "only {} of {} accounts converged",
        converged, config.accounts
    );
    println!("  Index convergence: {} accounts ✓", converged);

    for n in 0..config.accounts {
        let actor = indexer.get_actor(&account(n)).await.expect("actor indexed");
        assert_eq!(actor.handle, Some(format!("stress{:05}.test", n)));
    }
    println!("  Handles:           verified ✓");

    subscription.stop();
    queue.on_idle().await;
    let pruned = queue.prune().await.expect("prune");
    println!("  Queue:             {} messages pruned ✓", pruned);
    queue.destroy();
    host.shutdown().await;

    println!();
    println!("Stress test PASSED ✓");
}
