use clap::Parser;
use keyra::{Keyra, KeyraBuilder, KeyraConfig, RequestMetadata, SessionId, SqliteRepositoryProvider, UserId};
use serde_json::json;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Command line interface for Keyra
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database connection string
    #[arg(long, env = "KEYRA_DATABASE_URL", default_value = "sqlite://keyra.db")]
    db_url: String,

    /// Client IP address recorded with the request
    #[arg(long, global = true)]
    ip: Option<String>,

    /// Client user agent recorded with the request
    #[arg(long, global = true)]
    user_agent: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(clap::Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Issue a magic link and hand it to the configured delivery
    Issue { email: String },
    /// Consume a magic link token and start a session
    Verify { token: String },
    /// Exchange a refresh token for the next one
    Rotate { token: String },
    /// Revoke a session and its refresh tokens
    Revoke { session_id: String },
    /// Revoke every session of a user
    LogoutAll { user_id: String },
    /// Delete expired links, refresh tokens and sessions
    Sweep,
    /// Check that the database is reachable
    Health,
    /// Print version information
    Version,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn connect(cli: &Cli) -> Result<Keyra<SqliteRepositoryProvider>, Box<dyn std::error::Error>> {
    let config = KeyraConfig::from_env()?;
    let builder = KeyraBuilder::new()
        .with_config(config)
        .with_sqlite(&cli.db_url)
        .await?;

    #[cfg(feature = "mailer")]
    let builder = builder.with_mailer_from_env()?;

    Ok(builder.build().await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("Keyra v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let keyra = connect(&cli).await?;
    let metadata = RequestMetadata::new(cli.ip.clone(), cli.user_agent.clone());

    let output = match &cli.command {
        Commands::Migrate => {
            keyra.migrate().await?;
            json!({ "migrated": true })
        }
        Commands::Issue { email } => {
            let issued = keyra.issue_magic_link(email, &metadata).await?;
            json!({ "email": issued.email, "expires_at": issued.expires_at })
        }
        Commands::Verify { token } => {
            let login = keyra.verify_magic_link(token, &metadata).await?;
            json!({
                "user_id": login.user.id,
                "session_id": login.session.id,
                "refresh_token": login.refresh_token.expose(),
                "refresh_expires_at": login.refresh_expires_at,
                "access_token": login.access_token.token,
                "access_expires_at": login.access_token.expires_at,
            })
        }
        Commands::Rotate { token } => {
            let refreshed = keyra.rotate_refresh(token, &metadata).await?;
            json!({
                "session_id": refreshed.session.id,
                "generation": refreshed.generation,
                "refresh_token": refreshed.refresh_token.expose(),
                "refresh_expires_at": refreshed.refresh_expires_at,
                "access_token": refreshed.access_token.token,
                "access_expires_at": refreshed.access_token.expires_at,
            })
        }
        Commands::Revoke { session_id } => {
            let session_id = SessionId::new(session_id);
            keyra.revoke_session(&session_id).await?;
            json!({ "revoked": session_id })
        }
        Commands::LogoutAll { user_id } => {
            let revoked = keyra.logout_all(&UserId::new(user_id)).await?;
            json!({ "revoked_sessions": revoked })
        }
        Commands::Sweep => {
            let report = keyra.sweep_expired(chrono::Utc::now()).await?;
            serde_json::to_value(report)?
        }
        Commands::Health => {
            keyra.health_check().await?;
            json!({ "healthy": true })
        }
        Commands::Version => json!({ "version": env!("CARGO_PKG_VERSION") }),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
