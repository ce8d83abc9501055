use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "hubctl")]
#[command(version)]
#[command(about = "Provision a hub network topology, in dependency-safe order", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Hub parameters file (.toml or .json)
    #[arg(
        short = 'f',
        long,
        global = true,
        env = "HUBCTL_PARAMS",
        default_value = "hub.toml"
    )]
    pub params: String,

    /// REST control-plane endpoint (uses the local state file when unset)
    #[arg(long, global = true, env = "HUBCTL_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Local control-plane state file [default: ~/.local/state/hubctl/control-plane.json]
    #[arg(long, global = true, env = "HUBCTL_STATE")]
    pub state: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check parameters and build the resource graph without contacting the control plane
    Validate,

    /// Show what apply would change, stage by stage
    Plan(PlanArgs),

    /// Converge the control plane to the parameters
    Apply(ApplyArgs),

    /// Show the dependency graph
    Graph(GraphArgs),

    /// Evaluate a flow against the configured firewall rules
    CheckFlow(FlowArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    #[default]
    Text,
    Dot,
}

#[derive(Args)]
pub struct PlanArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Show a line diff for each resource that changes
    #[arg(long)]
    pub detailed: bool,

    /// Limit to a kind, kind.name or node id (plus what it needs)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Number of parallel reads
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Show what would change without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Number of parallel writes per stage
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Limit to a kind, kind.name or node id (plus what it needs)
    #[arg(short, long)]
    pub target: Option<String>,
}

#[derive(Args)]
pub struct GraphArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = GraphFormat::Text)]
    pub format: GraphFormat,
}

#[derive(Args)]
pub struct FlowArgs {
    /// tcp, udp, icmp, http, https or mssql
    #[arg(long)]
    pub protocol: String,

    /// Source address
    #[arg(long)]
    pub source: String,

    /// Destination address
    #[arg(long)]
    pub destination: Option<String>,

    /// Destination port
    #[arg(long)]
    pub port: Option<u16>,

    /// Requested host name
    #[arg(long)]
    pub fqdn: Option<String>,

    /// Service tag of the destination, e.g. AzureCloud.westeurope
    #[arg(long)]
    pub service_tag: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "hubctl", "-vv", "apply", "--dry-run", "-j", "8", "--target", "ipGroups",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Apply(args) => {
                assert!(args.dry_run);
                assert_eq!(args.jobs, Some(8));
                assert_eq!(args.target.as_deref(), Some("ipGroups"));
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_global_backend_flags() {
        let cli = Cli::try_parse_from([
            "hubctl",
            "graph",
            "--format",
            "dot",
            "--endpoint",
            "https://cp.test",
            "-f",
            "prod.toml",
        ])
        .unwrap();
        assert_eq!(cli.endpoint.as_deref(), Some("https://cp.test"));
        assert_eq!(cli.params, "prod.toml");
        assert!(matches!(
            cli.command,
            Command::Graph(GraphArgs {
                format: GraphFormat::Dot
            })
        ));
    }
}
