mod checkpoint;
mod config;
mod dataset;
mod error;
mod eval;
mod metrics;
mod model;
mod train;
mod voxel;

use clap::Parser;

use crate::config::{Mode, RunConfig, RunContext};

fn main() -> anyhow::Result<()> {
    if cfg!(debug_assertions) {
        eprintln!(
            "Warning: running a debug build. Training can be much slower. Use `cargo run --release ...`."
        );
    }
    let cfg = RunConfig::parse();
    let ctx = RunContext::new(cfg)?;
    println!("Using device: {:?}", ctx.device);

    match ctx.cfg.mode {
        Mode::Train => train::run_training(&ctx),
        Mode::Test => eval::run_test(&ctx),
    }
}
