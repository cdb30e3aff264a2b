//! CLI module for standctl
//!
//! Subcommands:
//! - `standctl validate` - Check a stand file without touching the cluster
//! - `standctl deploy` - Create one stand per user
//! - `standctl delete` - Tear stands down again
//! - `standctl plan` - Show the node assignment a deployment would use
//! - `standctl templates` - Inspect and manage prepared template copies

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::config::ConnectionSettings;

#[derive(Parser, Debug)]
#[command(name = "standctl")]
#[command(about = "Provision per-user lab stands on a Proxmox VE cluster")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to settings file (default: ~/.standctl/config)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Path to a .env file with connection variables
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a stand file
    Validate(ValidateArgs),

    /// Deploy a stand for every user
    Deploy(DeployArgs),

    /// Delete the stands of the given users
    Delete(DeleteArgs),

    /// Show the node assignment without creating anything
    Plan(PlanArgs),

    /// Manage prepared template copies
    Templates(TemplatesArgs),
}

/// Connection overrides; unset values fall back to the settings file
#[derive(Args, Debug, Default, Clone)]
pub struct ConnectionArgs {
    /// Proxmox API host
    #[arg(long, env = "PVE_HOST", global = true)]
    pub host: Option<String>,

    /// API user, e.g. root@pam
    #[arg(long = "api-user", env = "PVE_USER", global = true)]
    pub user: Option<String>,

    /// API token name
    #[arg(long, env = "PVE_TOKEN_NAME", global = true)]
    pub token_name: Option<String>,

    /// API token secret
    #[arg(long, env = "PVE_TOKEN_VALUE", hide_env_values = true, global = true)]
    pub token_value: Option<String>,
}

impl ConnectionArgs {
    /// Overlay flags and environment onto the configured connection.
    ///
    /// The environment is read again here so variables loaded from
    /// `--env-file` after argument parsing are honored.
    pub fn apply(&self, connection: &mut ConnectionSettings) {
        let pick = |flag: &Option<String>, var: &str| {
            flag.clone()
                .or_else(|| std::env::var(var).ok())
                .filter(|v| !v.is_empty())
        };
        if let Some(host) = pick(&self.host, "PVE_HOST") {
            connection.host = host;
        }
        if let Some(user) = pick(&self.user, "PVE_USER") {
            connection.user = user;
        }
        if let Some(name) = pick(&self.token_name, "PVE_TOKEN_NAME") {
            connection.token_name = Some(name);
        }
        if let Some(value) = pick(&self.token_value, "PVE_TOKEN_VALUE") {
            connection.token_value = Some(value);
        }
    }
}

/// Where the user list comes from
#[derive(Args, Debug, Default, Clone)]
pub struct UserArgs {
    /// Comma separated users (bare names get the @pve realm)
    #[arg(long, conflicts_with = "users_file")]
    pub users: Option<String>,

    /// YAML file with a `users:` list
    #[arg(long, value_name = "FILE")]
    pub users_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to the stand file (YAML)
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    Local,
    Remote,
    Balanced,
    Smart,
}

impl StrategyArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyArg::Local => "local",
            StrategyArg::Remote => "remote",
            StrategyArg::Balanced => "balanced",
            StrategyArg::Smart => "smart",
        }
    }
}

#[derive(Parser, Debug)]
pub struct DeployArgs {
    /// Path to the stand file (YAML)
    pub file: PathBuf,

    #[command(flatten)]
    pub users: UserArgs,

    /// Placement strategy
    #[arg(short, long, value_enum, default_value_t = StrategyArg::Local)]
    pub strategy: StrategyArg,

    /// Target node for the remote strategy
    #[arg(long)]
    pub target_node: Option<String>,
}

#[derive(Parser, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub users: UserArgs,
}

#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Path to the stand file (YAML)
    pub file: PathBuf,

    #[command(flatten)]
    pub users: UserArgs,

    /// Score nodes by load instead of round robin
    #[arg(long)]
    pub weighted: bool,

    /// Re-plan the initial assignment from fresh metrics
    #[arg(long)]
    pub optimize: bool,
}

#[derive(Parser, Debug)]
pub struct TemplatesArgs {
    #[command(subcommand)]
    pub action: TemplatesAction,
}

#[derive(Subcommand, Debug)]
pub enum TemplatesAction {
    /// List persisted template mappings
    List,

    /// Drop one mapping (the template VM itself is left alone)
    Forget {
        /// Original template vmid
        vmid: u32,
        /// Node the copy lives on
        node: String,
    },

    /// Prepare every template of a stand on a node
    Prepare {
        /// Path to the stand file (YAML)
        file: PathBuf,

        /// Target node
        #[arg(long)]
        node: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validate() {
        let cli = Cli::parse_from(["standctl", "validate", "stand.yaml"]);
        match cli.command {
            Commands::Validate(args) => assert_eq!(args.file, PathBuf::from("stand.yaml")),
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::parse_from([
            "standctl",
            "-vv",
            "deploy",
            "stand.yaml",
            "--users",
            "alice,bob",
            "--strategy",
            "remote",
            "--target-node",
            "pve2",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Deploy(args) => {
                assert_eq!(args.users.users.as_deref(), Some("alice,bob"));
                assert_eq!(args.strategy, StrategyArg::Remote);
                assert_eq!(args.target_node.as_deref(), Some("pve2"));
            }
            _ => panic!("Expected Deploy command"),
        }
    }

    #[test]
    fn test_deploy_defaults_to_local() {
        let cli = Cli::parse_from(["standctl", "deploy", "stand.yaml", "--users", "a"]);
        match cli.command {
            Commands::Deploy(args) => assert_eq!(args.strategy, StrategyArg::Local),
            _ => panic!("Expected Deploy command"),
        }
    }

    #[test]
    fn test_users_and_users_file_conflict() {
        let result = Cli::try_parse_from([
            "standctl",
            "delete",
            "--users",
            "a",
            "--users-file",
            "users.yaml",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::parse_from([
            "standctl", "plan", "stand.yaml", "--users", "a,b", "--weighted", "--optimize",
        ]);
        match cli.command {
            Commands::Plan(args) => {
                assert!(args.weighted);
                assert!(args.optimize);
            }
            _ => panic!("Expected Plan command"),
        }
    }

    #[test]
    fn test_parse_templates_forget() {
        let cli = Cli::parse_from(["standctl", "templates", "forget", "100", "pve2"]);
        match cli.command {
            Commands::Templates(args) => match args.action {
                TemplatesAction::Forget { vmid, node } => {
                    assert_eq!(vmid, 100);
                    assert_eq!(node, "pve2");
                }
                _ => panic!("Expected Forget action"),
            },
            _ => panic!("Expected Templates command"),
        }
    }

    #[test]
    fn test_connection_flags_override_settings() {
        let args = ConnectionArgs {
            host: Some("pve.lab".to_string()),
            token_name: Some("ci".to_string()),
            ..Default::default()
        };
        let mut connection = ConnectionSettings::default();
        args.apply(&mut connection);
        assert_eq!(connection.host, "pve.lab");
        assert_eq!(connection.token_name.as_deref(), Some("ci"));
    }
}
