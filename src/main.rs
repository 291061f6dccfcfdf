//! Apilar CLI — stack-set orchestration.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "apilar",
    version,
    about = "Plan, build, and destroy interdependent cloud stacks as a DAG"
)]
struct Cli {
    #[command(subcommand)]
    command: apilar::cli::Commands,
}

fn main() {
    let code = apilar::cli::dispatch(Cli::parse().command);
    if code != 0 {
        std::process::exit(code);
    }
}
