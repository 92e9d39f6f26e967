//! Exercises a `brk-heap` arena the way a test program would: numbered
//! sequential checks, a multi-threaded round, deliberate corruption, and a
//! guard page summary at the end.

use std::process;

use argh::FromArgs;
use brk_heap::{Heap, HeapConfig, config::DEFAULT_PAGES};
use log::LevelFilter;
use snafu::{Report, ResultExt as _, Whatever};

mod corruption;
mod logger;
mod scenario;
mod steps;
mod stress;

/// Run the brk-heap test rounds.
#[derive(Debug, FromArgs)]
struct Args {
    /// number of usable pages in the arena
    #[argh(option, default = "DEFAULT_PAGES")]
    pages: usize,
    /// number of threads in the concurrency round
    #[argh(option, default = "4")]
    threads: usize,
    /// seed for the guard page contents
    #[argh(option)]
    guard_seed: Option<u64>,
    /// maximum log level (off, error, warn, info, debug, trace)
    #[argh(option, default = "LevelFilter::Warn")]
    log_level: LevelFilter,
    /// print the heap layout around the concurrency round
    #[argh(switch)]
    dump: bool,
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = Report::from_error(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Whatever> {
    logger::init(args.log_level).whatever_context("failed to install logger")?;

    let mut config = HeapConfig::new().with_pages(args.pages);
    if let Some(seed) = args.guard_seed {
        config = config.with_guard_seed(seed);
    }
    let heap = Heap::new(config);
    let mut steps = steps::Steps::default();

    scenario::run(&heap, &mut steps)?;
    stress::run(&heap, &mut steps, args.threads, args.dump)?;
    corruption::run(&heap, &mut steps)?;

    let info = heap.space_info();
    let guards = heap.guard_pages();
    println!("{} checks passed", steps.passed());
    println!(
        "arena: {} of {} bytes reserved by the break",
        info.reserved(),
        info.capacity()
    );
    println!(
        "guard pages: first {}, last {}",
        if guards.first_intact { "intact" } else { "CORRUPTED" },
        if guards.last_intact { "intact" } else { "CORRUPTED" },
    );
    Ok(())
}
