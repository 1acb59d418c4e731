//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - daemon: run the capture daemon until Ctrl-C
//! - submit/status/history: capture jobs
//! - retry-stats/retry-scan: the auto-retry service
//! - sync-priorities/backfill/health: placement, backfills and limiters
//! - repo/workspace: seed repository metadata

use clap::{Parser, Subcommand};
use hubcapture::store::{JobStatus, JobType, PriorityClass};
use std::path::PathBuf;

/// hubcapture - GitHub capture job routing and lifecycle engine
#[derive(Parser, Debug)]
#[command(name = "hubcapture")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon: drain queues, scan for retries
    Daemon,

    /// Submit a capture job
    Submit {
        /// Repository id or owner/name
        repo: String,

        /// Job type
        #[arg(short = 't', long = "type", default_value = "recent-sync")]
        job_type: JobType,

        /// Capture window in days
        #[arg(short, long)]
        days: Option<f64>,

        #[arg(short, long)]
        max_items: Option<u32>,

        /// Priority class; derived from repository placement when omitted
        #[arg(short, long)]
        priority: Option<PriorityClass>,
    },

    /// Show a job
    Status {
        job_id: String,
    },

    /// List recent jobs, newest first
    History {
        /// Repository id or owner/name
        #[arg(short, long)]
        repo: Option<String>,

        #[arg(short, long)]
        status: Option<JobStatus>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Retry statistics over a trailing window
    RetryStats {
        /// Window in days (default from config)
        #[arg(short, long)]
        days: Option<u64>,
    },

    /// Run one auto-retry scan
    RetryScan,

    /// Recompute repository placement from workspace memberships
    SyncPriorities,

    /// Start a backfill for a repository
    Backfill {
        /// Repository id or owner/name
        repo: String,

        /// Items already captured
        #[arg(long, default_value_t = 0)]
        captured: u64,
    },

    /// Limiter health per processor
    Health,

    /// Repository metadata
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },

    /// Workspace membership
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum RepoCommands {
    /// Add or update a tracked repository
    Add {
        /// owner/name
        full_name: String,

        /// Known number of capturable items
        #[arg(long)]
        items: u64,

        #[arg(long, default_value_t = 0)]
        stars: u64,

        /// Repository id (defaults to owner/name)
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum WorkspaceCommands {
    /// Add a repository to a workspace
    Add { workspace: String, repo: String },

    /// Remove a repository from a workspace
    Remove { workspace: String, repo: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["hubcapture"]).is_err());
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from(["hubcapture", "health", "-v", "-c", "/etc/hubcapture.yml"]).unwrap();
        assert!(cli.is_verbose());
        assert_eq!(cli.config, Some(PathBuf::from("/etc/hubcapture.yml")));
    }

    #[test]
    fn test_submit_defaults() {
        let cli = Cli::try_parse_from(["hubcapture", "submit", "octo/hello"]).unwrap();
        match cli.command {
            Commands::Submit {
                repo,
                job_type,
                days,
                max_items,
                priority,
            } => {
                assert_eq!(repo, "octo/hello");
                assert_eq!(job_type, JobType::RecentSync);
                assert!(days.is_none());
                assert!(max_items.is_none());
                assert!(priority.is_none());
            }
            _ => panic!("Expected submit command"),
        }
    }

    #[test]
    fn test_submit_with_options() {
        let cli = Cli::try_parse_from([
            "hubcapture",
            "submit",
            "repo-1",
            "--type",
            "pr-details",
            "--days",
            "30",
            "--priority",
            "high",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit {
                job_type,
                days,
                priority,
                ..
            } => {
                assert_eq!(job_type, JobType::PrDetails);
                assert_eq!(days, Some(30.0));
                assert_eq!(priority, Some(PriorityClass::High));
            }
            _ => panic!("Expected submit command"),
        }
    }

    #[test]
    fn test_submit_rejects_unknown_type() {
        assert!(Cli::try_parse_from(["hubcapture", "submit", "repo-1", "--type", "nope"]).is_err());
    }

    #[test]
    fn test_history_filters() {
        let cli = Cli::try_parse_from(["hubcapture", "history", "--status", "dead_letter", "--limit", "5"]).unwrap();
        match cli.command {
            Commands::History { repo, status, limit } => {
                assert!(repo.is_none());
                assert_eq!(status, Some(JobStatus::DeadLetter));
                assert_eq!(limit, 5);
            }
            _ => panic!("Expected history command"),
        }
    }

    #[test]
    fn test_repo_and_workspace_commands() {
        let cli = Cli::try_parse_from(["hubcapture", "repo", "add", "octo/hello", "--items", "250"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Repo {
                command: RepoCommands::Add { items: 250, stars: 0, .. }
            }
        ));

        let cli = Cli::try_parse_from(["hubcapture", "workspace", "remove", "ws-1", "octo/hello"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Workspace {
                command: WorkspaceCommands::Remove { .. }
            }
        ));
    }

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }
}
