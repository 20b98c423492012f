//! projectauth CLI entry point

mod cli;

use crate::cli::{Cli, Commands, GrantArgs};
use anyhow::{Context, Result};
use projectauth::auth::{Principal, SessionToken};
use projectauth::cache::{AuthorizationCache, CacheConfig};
use projectauth::server::{ProjectRegistry, ProjectServer, ServerConfig};
use projectauth::storage::{GrantStore, MemoryGrantStore, MemoryProjectStore, PostgresConfig, PostgresGrantStore};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let db_config = || database_config(cli.database_url.as_deref(), PostgresConfig::env_present());
    let required_db = || -> Result<PostgresConfig> { db_config()?.context("No database configured, set DATABASE_URL") };

    match &cli.command {
        Commands::Serve {
            bind,
            secret,
            watch_buffer,
            max_resync_failures,
        } => {
            let config = CacheConfig::new()
                .watch_buffer(*watch_buffer)
                .max_resync_failures(*max_resync_failures);
            let grants: Arc<dyn GrantStore> = match db_config()? {
                Some(db) => Arc::new(PostgresGrantStore::new(db).await?),
                None => {
                    warn!("No database configured, keeping grants in memory");
                    Arc::new(MemoryGrantStore::new())
                }
            };
            serve(bind, secret, config, grants).await
        }
        Commands::Token {
            user,
            groups,
            scopes,
            secret,
        } => token(user, groups, scopes, secret),
        Commands::Grant(args) => grant(required_db()?, args).await,
        Commands::Revoke(args) => revoke(required_db()?, args).await,
        Commands::Init => init(required_db()?).await,
    }
}

/// Database selected by `--database-url`/`DATABASE_URL` or the `PG*` variables
///
/// `None` only when nothing names a database; a malformed setting is an error.
fn database_config(url: Option<&str>, env_present: bool) -> Result<Option<PostgresConfig>> {
    if let Some(url) = url {
        return PostgresConfig::from_url(url).context("Invalid DATABASE_URL").map(Some);
    }
    if env_present {
        return PostgresConfig::from_env()
            .context("Incomplete PG* environment, PGUSER and PGDATABASE are required")
            .map(Some);
    }
    Ok(None)
}

async fn serve(bind: &str, secret: &str, config: CacheConfig, grants: Arc<dyn GrantStore>) -> Result<()> {
    let bind_addr = bind.parse().context("Invalid bind address")?;

    let projects = Arc::new(MemoryProjectStore::new());
    let cache = AuthorizationCache::start(config, grants, projects.clone())
        .await
        .context("Failed to load authorization cache")?;

    let registry = ProjectRegistry::new(cache, projects);
    let server = ProjectServer::new(
        ServerConfig {
            bind_addr,
            token_secret: secret.as_bytes().to_vec(),
        },
        registry,
    );

    info!(addr = %bind, "projectauth starting");
    server.run(shutdown_signal()).await?;
    info!("projectauth stopped");
    Ok(())
}

fn token(user: &str, groups: &[String], scopes: &[String], secret: &str) -> Result<()> {
    let principal = Principal::new(user, groups.iter().cloned());
    let token = SessionToken::create(principal.clone(), scopes.to_vec(), secret.as_bytes())
        .context("Failed to create session token")?;

    println!("{}", token);
    println!();
    println!("Principal: {}", principal);
    if scopes.is_empty() {
        println!("Scopes: (unrestricted)");
    } else {
        println!("Scopes:");
        for scope in scopes {
            println!("  {}", scope);
        }
    }
    Ok(())
}

async fn grant(db_config: PostgresConfig, args: &GrantArgs) -> Result<()> {
    let grant = args.to_grant().context("Invalid grant")?;
    let store = PostgresGrantStore::new(db_config).await?;
    store.add_grant(&grant).await?;

    println!("+ {}", grant);
    Ok(())
}

async fn revoke(db_config: PostgresConfig, args: &GrantArgs) -> Result<()> {
    let grant = args.to_grant().context("Invalid grant")?;
    let store = PostgresGrantStore::new(db_config).await?;
    store.remove_grant(&grant).await?;

    println!("- {}", grant);
    Ok(())
}

async fn init(db_config: PostgresConfig) -> Result<()> {
    let _store = PostgresGrantStore::new(db_config).await?;
    println!("Database schema initialized successfully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_rejects_malformed_url() {
        assert!(database_config(Some("postgres://app@db:notaport/grants"), false).is_err());
        assert!(database_config(Some("mysql://app@db/grants"), true).is_err());

        let config = database_config(Some("postgres://app@db/grants"), false).unwrap().unwrap();
        assert_eq!(config.host, "db");
    }

    #[test]
    fn test_database_config_absent_falls_back() {
        assert!(database_config(None, false).unwrap().is_none());
    }
}
