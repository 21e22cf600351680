use clap::{Parser, Subcommand};

use commands::GlobalArgs;

mod commands;
mod output;
mod tty;

use commands::{deploy, join, logs, nodes, steps, verify};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "clusterup")]
#[command(version = VERSION)]
#[command(about = "Deploy multi-node Kubernetes clusters over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a cluster to inventory nodes
    Deploy(deploy::DeployArgs),
    /// Run cluster verification on the primary
    Verify(verify::VerifyArgs),
    /// Show the deployment pipeline and the script each step resolves to
    Steps(steps::StepsArgs),
    /// Inspect the node inventory
    #[command(visible_alias = "node")]
    Nodes(nodes::NodesArgs),
    /// Print a join command for the running cluster
    JoinCommand(join::JoinArgs),
    /// Show recorded remote command logs
    Logs(logs::LogsArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let global = GlobalArgs {};

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    let _ = output::print_json_result(json_result);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
