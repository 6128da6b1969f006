#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use cluster_agent_runtime::{Args, Fatal};
use std::process::ExitCode;

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() -> ExitCode {
    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(error) => {
            eprintln!("failed to start runtime: {error}");
            return ExitCode::from(Fatal::Bootstrap(error.into()).exit_code());
        }
    };

    match rt.block_on(Args::parse_and_run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::from(error.exit_code())
        }
    }
}
