use std::path::PathBuf;

use argh::FromArgs;

/// lumber collects log entries, runs them through an operator pipeline,
/// and ships them to configured outputs.
#[derive(Debug, FromArgs)]
pub struct RootCommand {
    #[argh(subcommand)]
    pub command: Option<Command>,

    /// print version and exit
    #[argh(switch, short = 'V')]
    pub version: bool,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
pub enum Command {
    Run(RunCommand),
    Graph(GraphCommand),
    Offsets(OffsetsCommand),
    Version(VersionCommand),
}

/// Start the agent.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
pub struct RunCommand {
    /// path to the pipeline configuration
    #[argh(option, default = "PathBuf::from(\"config.yaml\")")]
    pub config: PathBuf,

    /// path to the offsets database; omit to run without durable offsets
    #[argh(option)]
    pub database: Option<PathBuf>,

    /// log level when LUMBER_LOG is not set
    #[argh(option, default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Print the pipeline graph in dot format.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "graph")]
pub struct GraphCommand {
    /// path to the pipeline configuration
    #[argh(option, default = "PathBuf::from(\"config.yaml\")")]
    pub config: PathBuf,
}

/// Inspect or clear persisted input-operator offsets.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "offsets")]
pub struct OffsetsCommand {
    #[argh(subcommand)]
    pub command: OffsetsSubcommand,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
pub enum OffsetsSubcommand {
    List(OffsetsListCommand),
    Clear(OffsetsClearCommand),
}

/// List input operator ids that have persisted offsets.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "list")]
pub struct OffsetsListCommand {
    /// path to the offsets database
    #[argh(option, default = "PathBuf::from(\"lumber.db\")")]
    pub database: PathBuf,
}

/// Delete persisted offsets, either for the named operators or all.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "clear")]
pub struct OffsetsClearCommand {
    /// path to the offsets database
    #[argh(option, default = "PathBuf::from(\"lumber.db\")")]
    pub database: PathBuf,

    /// clear offsets for every operator
    #[argh(switch)]
    pub all: bool,

    /// operator ids to clear
    #[argh(positional)]
    pub operator_ids: Vec<String>,
}

/// Print version.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "version")]
pub struct VersionCommand {}
