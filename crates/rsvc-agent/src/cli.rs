//! CLI command definitions and argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use rsvc_core::config::AuthConfig;

use crate::demo::DemoArgs;
use crate::identity::IdentityArgs;
use crate::output::OutputFormat;
use crate::rules::{CheckArgs, RulesArgs};
use crate::ExitCode;

/// rsvc agent - administer identity and authorization rules
#[derive(Parser, Debug)]
#[command(name = "rsvc-agent")]
#[command(version, about = "rsvc agent - administer identity and authorization rules")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json or quiet
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path
    #[arg(long, global = true, env = "RSVC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter (overrides [logging] level)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Local identity
    Identity(IdentityArgs),
    /// Persisted authorization rules
    Rules(RulesArgs),
    /// Show how a caller would be authorized for a service
    Check(CheckArgs),
    /// Run a provider and client in-process against the clock service
    Demo(DemoArgs),
}

impl Cli {
    /// Short command name for JSON envelopes
    pub fn command_name(&self) -> &'static str {
        match self.command {
            Commands::Identity(_) => "identity",
            Commands::Rules(_) => "rules",
            Commands::Check(_) => "check",
            Commands::Demo(_) => "demo",
        }
    }

    /// Execute the CLI command with a loaded configuration
    pub async fn execute_with_config(self, config: AuthConfig) -> anyhow::Result<ExitCode> {
        match self.command {
            Commands::Identity(args) => args.execute(&config, self.output, self.verbose).await,
            Commands::Rules(args) => args.execute(&config, self.output, self.verbose).await,
            Commands::Check(args) => args.execute(&config, self.output, self.verbose).await,
            Commands::Demo(args) => args.execute(self.output, self.verbose).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RulesAction;

    #[test]
    fn test_parse_rules_add() {
        let cli = Cli::try_parse_from([
            "rsvc-agent",
            "--output",
            "json",
            "rules",
            "add",
            "--service",
            "clock",
            "--identity",
            "*",
            "--policy",
            "pin-required",
            "--all-users",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.command_name(), "rules");
        match cli.command {
            Commands::Rules(RulesArgs {
                action: RulesAction::Add { service, all_users, all_services, .. },
            }) => {
                assert_eq!(service, "clock");
                assert!(all_users);
                assert!(!all_services);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_policy() {
        let result = Cli::try_parse_from([
            "rsvc-agent", "rules", "add", "--service", "clock", "--identity", "a", "--policy", "maybe",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rsvc-agent", "check", "--service", "clock", "--identity", "a", "-v"])
            .unwrap();
        assert!(cli.verbose);
    }
}
