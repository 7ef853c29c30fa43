use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgmcp::auth::token_store::{describe_expiry, parse_expiry};
use pgmcp::auth::{SessionManager, TokenStore};
use pgmcp::cli::{self, ConnectionCommands, TokenCommands};
use pgmcp::config::{self, Config};
use pgmcp::kb::{HttpKnowledgebase, KnowledgebaseReader};
use pgmcp::llm::LlmGateway;
use pgmcp::mcp::{RequestDispatcher, ToolRegistry};
use pgmcp::models::token::ConnectionProfile;
use pgmcp::store::ConnectionManager;
use pgmcp::vault::SecretCipher;
use pgmcp::{api, jobs, tools};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(cfg.log_json);

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Token { command }) => {
            let store = open_token_store(&cfg)?;
            handle_token_command(command, &store).await
        }
        Some(cli::Commands::Connection { command }) => {
            let store = open_token_store(&cfg)?;
            handle_connection_command(command, &store).await
        }
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pgmcp=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn open_token_store(cfg: &Config) -> anyhow::Result<TokenStore> {
    let cipher = if cfg.has_placeholder_key() {
        SecretCipher::insecure_default()
    } else {
        SecretCipher::new(&cfg.secret_key).context("invalid PGMCP_SECRET_KEY")?
    };
    TokenStore::open(&cfg.token_file, Arc::new(cipher))
        .with_context(|| format!("failed to open token file {}", cfg.token_file.display()))
}

async fn run_server(cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(cfg.port);

    tracing::info!(path = %cfg.token_file.display(), "Opening token store...");
    let tokens = Arc::new(open_token_store(&cfg)?);

    let sessions = SessionManager::new(cfg.session_ttl);
    let connections = Arc::new(
        ConnectionManager::new(cfg.auth_mode, cfg.pool, &cfg.database_url)
            .context("invalid DATABASE_URL or pool policy")?,
    );

    let knowledgebase: Option<Arc<dyn KnowledgebaseReader>> = match &cfg.kb_url {
        Some(url) => Some(Arc::new(HttpKnowledgebase::new(url, cfg.llm.timeout)?)),
        None => None,
    };
    let mut registry = ToolRegistry::new(cfg.tool_timeout);
    tools::register_builtin(&mut registry, cfg.statement_timeout_ms, knowledgebase)?;
    tracing::info!(tools = registry.len(), "Tools registered");

    let llm = LlmGateway::from_config(&cfg.llm)?;
    match llm.default_kind() {
        Some(kind) => tracing::info!(provider = %kind, "LLM gateway ready"),
        None => tracing::warn!("No LLM provider configured, chat and models will fail"),
    }

    let dispatcher = Arc::new(RequestDispatcher::new(
        tokens,
        sessions,
        connections,
        Arc::new(registry),
        llm,
        cfg.max_tool_turns,
    )
    .with_statement_timeout(cfg.statement_timeout_ms));

    let cleanup = jobs::cleanup::spawn(dispatcher.clone(), cfg.sweep_interval, cfg.pool.idle_timeout);
    tracing::info!(every_secs = cfg.sweep_interval.as_secs(), "Background cleanup job started");

    let app = api::router(dispatcher.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(mode = ?cfg.auth_mode, "pgmcp listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cleanup.abort();
    dispatcher.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining");
}

async fn handle_token_command(cmd: TokenCommands, store: &TokenStore) -> anyhow::Result<()> {
    match cmd {
        TokenCommands::Create {
            annotation,
            expires,
            id,
        } => {
            let expires_in = parse_expiry(&expires)?;
            let issued = store.create(&annotation, expires_in, id).await?;
            println!("Token created.");
            println!("  ID:      {}", issued.id);
            println!("  Expires: {}", describe_expiry(issued.expires_at));
            println!("  Token:   {}", issued.token);
            println!();
            println!("Store it now: it cannot be shown again.");
        }
        TokenCommands::List => {
            let tokens = store.list().await;
            if tokens.is_empty() {
                println!("No tokens.");
                return Ok(());
            }
            println!(
                "{:<20} {:<14} {:<22} {:<8} {:<20} ANNOTATION",
                "ID", "HASH", "EXPIRES", "STATUS", "CONNECTIONS"
            );
            for t in tokens {
                let connections = if t.connections.is_empty() {
                    "-".to_string()
                } else {
                    t.connections.join(",")
                };
                println!(
                    "{:<20} {:<14} {:<22} {:<8} {:<20} {}",
                    t.id,
                    t.hash_prefix,
                    describe_expiry(t.expires_at),
                    if t.expired { "expired" } else { "active" },
                    connections,
                    t.annotation
                );
            }
        }
        TokenCommands::Remove { id_or_prefix } => {
            let id = store.remove(&id_or_prefix).await?;
            println!("Token '{}' removed.", id);
        }
        TokenCommands::Prune => {
            let removed = store.remove_expired().await?;
            println!("Removed {} expired token(s).", removed.len());
        }
    }
    Ok(())
}

async fn handle_connection_command(cmd: ConnectionCommands, store: &TokenStore) -> anyhow::Result<()> {
    match cmd {
        ConnectionCommands::Add {
            token,
            alias,
            host,
            port,
            user,
            password,
            dbname,
            sslmode,
            application_name,
            description,
            default,
        } => {
            let profile = ConnectionProfile {
                host,
                port,
                user,
                password,
                dbname,
                sslmode: sslmode.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                application_name,
                description,
                created_at: chrono::Utc::now(),
            };
            store.add_connection(&token, &alias, profile).await?;
            if default {
                store.set_default_connection(&token, &alias).await?;
            }
            println!("Connection '{}' saved on token '{}'.", alias, token);
        }
        ConnectionCommands::Remove { token, alias } => {
            store.remove_connection(&token, &alias).await?;
            println!("Connection '{}' removed from token '{}'.", alias, token);
        }
        ConnectionCommands::Default { token, alias } => {
            store.set_default_connection(&token, &alias).await?;
            println!("Token '{}' now uses connection '{}'.", token, alias);
        }
        ConnectionCommands::List { token } => {
            let (active, profiles) = store.connections(&token).await?;
            if profiles.is_empty() {
                println!("Token '{}' has no saved connections; it uses the server default.", token);
                return Ok(());
            }
            for (alias, p) in profiles {
                let marker = if active.as_deref() == Some(alias.as_str()) { "*" } else { " " };
                println!(
                    "{} {:<16} {}@{}:{}/{} sslmode={} {}",
                    marker,
                    alias,
                    p.user,
                    p.host,
                    p.port,
                    p.database(),
                    p.sslmode.as_str(),
                    p.description
                );
            }
        }
    }
    Ok(())
}
