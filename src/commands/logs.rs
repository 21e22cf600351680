use clap::Args;
use serde::Serialize;

use clusterup::logs::{LogRecord, SqliteLogSink};
use clusterup::paths;

use super::CmdResult;

#[derive(Args)]
pub struct LogsArgs {
    /// Only show records for this node
    #[arg(long, value_name = "ID")]
    pub node: Option<String>,

    /// Only show records from this deployment run
    #[arg(long, value_name = "RUN_ID")]
    pub run: Option<String>,

    /// Number of records to show
    #[arg(short = 'n', long, default_value = "50")]
    pub limit: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsOutput {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub entries: Vec<LogRecord>,
}

pub fn run(args: LogsArgs, _global: &super::GlobalArgs) -> CmdResult<LogsOutput> {
    let sink = SqliteLogSink::open(&paths::logs_db()?)?;
    let entries = sink.query(args.node.as_deref(), args.run.as_deref(), args.limit)?;

    Ok((
        LogsOutput {
            command: "logs".to_string(),
            node_id: args.node,
            entries,
        },
        0,
    ))
}
