//! CLI command definitions

use clap::{ArgGroup, Args, Parser, Subcommand};
use projectauth::auth::{Grant, GrantError};

#[derive(Parser)]
#[command(name = "projectauth")]
#[command(about = "Authorization-aware project API", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database URL for the grant store
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the project API server
    ///
    /// Without a database URL grants are kept in memory and start empty.
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:8080", env = "PROJECTAUTH_BIND")]
        bind: String,

        /// Session token signing secret
        #[arg(long, env = "PROJECTAUTH_SECRET")]
        secret: String,

        /// Events each watcher may have queued before it must resync
        #[arg(long, default_value_t = 100, env = "PROJECTAUTH_WATCH_BUFFER")]
        watch_buffer: usize,

        /// Consecutive failed resyncs before the cache reports degraded
        #[arg(long, default_value_t = 5)]
        max_resync_failures: u32,
    },

    /// Mint a session token
    ///
    /// Examples:
    ///   projectauth token --user alice --group dev
    ///   projectauth token --user alice --scope role:view:web
    Token {
        /// User name
        #[arg(short, long)]
        user: String,

        /// Group membership (can be repeated)
        #[arg(short, long = "group")]
        groups: Vec<String>,

        /// Scope restriction (can be repeated; none means unrestricted)
        #[arg(short, long = "scope")]
        scopes: Vec<String>,

        /// Session token signing secret
        #[arg(long, env = "PROJECTAUTH_SECRET")]
        secret: String,
    },

    /// Store a grant
    ///
    /// Examples:
    ///   projectauth grant --user alice --project web -p view
    ///   projectauth grant --group ops --cluster -p admin
    Grant(GrantArgs),

    /// Remove a grant
    Revoke(GrantArgs),

    /// Initialize the database schema
    Init,
}

#[derive(Args)]
#[command(group(ArgGroup::new("subject").required(true).args(["user", "group"])))]
#[command(group(ArgGroup::new("target").required(true).args(["project", "cluster"])))]
pub struct GrantArgs {
    /// Grant to a single user
    #[arg(long)]
    pub user: Option<String>,

    /// Grant to every member of a group
    #[arg(long)]
    pub group: Option<String>,

    /// Make one project visible
    #[arg(long)]
    pub project: Option<String>,

    /// Make every project visible, including future ones
    #[arg(long)]
    pub cluster: bool,

    /// Permission tag
    #[arg(short, long, default_value = "view")]
    pub permission: String,
}

impl GrantArgs {
    pub fn to_grant(&self) -> Result<Grant, GrantError> {
        let subject = match (&self.user, &self.group) {
            (Some(user), _) => format!("user:{}", user),
            (None, Some(group)) => format!("group:{}", group),
            (None, None) => String::new(),
        };
        let target = match &self.project {
            Some(project) => format!("project:{}", project),
            None if self.cluster => "cluster".to_string(),
            None => String::new(),
        };
        Grant::parse(&subject, &target, &self.permission)
    }
}
