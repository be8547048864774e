use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use clap::Parser;
use latchtree::{LatchTreeError, Tree, TreeConfig, View};
use log::{error, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Debug, Parser, PartialEq)]
#[clap(author, version, about = "Concurrent insert workload against an in-memory tree", long_about = None)]
struct Args {
    #[clap(short, long, default_value_t = 4, help = "Number of writer threads")]
    threads: usize,
    #[clap(short, long, default_value_t = 100_000, help = "Total number of keys to insert")]
    keys: usize,
    #[clap(long, default_value_t = 4096, help = "Node size in bytes")]
    page_size: usize,
    #[clap(long, default_value_t = 16, help = "Value size in bytes")]
    value_size: usize,
    #[clap(long, default_value_t = 64 * 1024 * 1024, help = "Soft cache budget in bytes")]
    max_cache_size: usize,
    #[clap(long, help = "Seed for the key shuffle")]
    seed: Option<u64>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("stress run failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), LatchTreeError> {
    let config = TreeConfig::default()
        .page_size(args.page_size)
        .min_cache_size(0)
        .max_cache_size(args.max_cache_size);
    let tree = Arc::new(Tree::new(config)?);

    let mut keys: Vec<usize> = (0..args.keys).collect();
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    keys.shuffle(&mut rng);
    let value = Bytes::from(vec![b'v'; args.value_size]);

    let threads = args.threads.max(1);
    let chunk = keys.len().div_ceil(threads).max(1);
    let started = Instant::now();
    std::thread::scope(|scope| -> Result<(), LatchTreeError> {
        let workers: Vec<_> = keys
            .chunks(chunk)
            .map(|part| {
                let tree = Arc::clone(&tree);
                let value = value.clone();
                scope.spawn(move || -> Result<(), LatchTreeError> {
                    let mut cursor = tree.new_cursor();
                    for key in part {
                        cursor.find(format!("key-{:012}", key))?;
                        cursor.store(value.clone())?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            worker
                .join()
                .map_err(|_| LatchTreeError::Internal("writer thread panicked".to_string()))??;
        }
        Ok(())
    })?;
    let elapsed = started.elapsed();

    tree.check_invariants()?;
    let entries = tree.entries()?;
    if entries.len() != args.keys {
        return Err(LatchTreeError::Internal(format!(
            "expected {} entries, found {}",
            args.keys,
            entries.len()
        )));
    }
    info!(
        "inserted {} keys with {} threads in {:?} ({:.0} ops/s)",
        args.keys,
        threads,
        elapsed,
        args.keys as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "keys={} threads={} elapsed={:?} height={} nodes={} dirty={} cached_bytes={}",
        args.keys,
        threads,
        elapsed,
        tree.height()?,
        tree.store().node_count(),
        tree.store().dirty_pages().len(),
        tree.store().cached_bytes()
    );
    Ok(())
}
