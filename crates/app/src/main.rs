mod http;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use vault_core::{AppConfig, NewTrackMetadata, SpotifyConfig};
use vault_engine::{CredentialGuard, MusicService, TrackService};
use vault_providers::{MusicProvider, NullProvider};
use vault_spotify::SpotifyClient;
use vault_store::Store;

#[derive(Parser, Debug)]
#[command(name = "vault", about = "Lock tracks away now, reveal them later")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Promote every user's elapsed pending tracks once.
    Sweep,
    /// Backfill unlock times on pending tracks that lack one.
    Repair,
    Status,
    /// Import a track in the unlocked `active` state.
    Stage {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        external_id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
        #[arg(long)]
        album: String,
        #[arg(long)]
        image_url: Option<String>,
    },
    /// Remove track metadata no user references any more.
    DeleteMetadata { external_id: String },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Serve);
    let cfg_path = cli.config.unwrap_or_else(default_config_path);

    if let Commands::Config {
        action: ConfigAction::Init,
    } = cmd
    {
        init_config(&cfg_path)?;
        println!("Initialized config at {}", cfg_path.display());
        return Ok(());
    }

    let cfg = load_or_default(&cfg_path)?;
    init_logging(&cfg.log_level);
    let db_path = database_path(&cfg);
    let store = open_store(&db_path)?;
    let tracks = TrackService::new(store.clone(), cfg.lock.clone(), &cfg.sweep);

    match cmd {
        Commands::Serve => serve(cfg, store, tracks).await,
        Commands::Sweep => {
            let promoted = tracks.sweep_all(Utc::now())?;
            println!("promoted {promoted} track(s)");
            Ok(())
        }
        Commands::Repair => {
            let fixed = tracks.repair_missing_unlock_times()?;
            println!("backfilled {fixed} unlock time(s)");
            Ok(())
        }
        Commands::Status => status(&cfg, &db_path, &tracks),
        Commands::Stage {
            user,
            external_id,
            title,
            artist,
            album,
            image_url,
        } => {
            let meta = NewTrackMetadata {
                external_id,
                title,
                artist,
                album,
                preview_url: None,
                image_url,
                release_date: None,
            };
            let track = tracks.stage(user, meta, Utc::now())?;
            println!("staged track {} for user {}", track.id, track.user_id);
            Ok(())
        }
        Commands::DeleteMetadata { external_id } => {
            let meta = tracks.delete_metadata(&external_id)?;
            println!("deleted metadata {} ({} - {})", meta.id, meta.artist, meta.title);
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

async fn serve(cfg: AppConfig, store: Store, tracks: TrackService) -> Result<()> {
    let provider = build_provider(&cfg.spotify)?;
    let guard = Arc::new(CredentialGuard::new(store.clone(), provider.clone()));
    let state = http::AppState {
        tracks: Arc::new(tracks),
        music: Arc::new(MusicService::new(store, guard.clone(), provider)),
        guard,
    };

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;
    info!(
        addr = %cfg.listen_addr,
        provider = state.guard.provider_name(),
        lock_days = cfg.lock.wait_duration().num_days(),
        development_mode = cfg.lock.development_mode,
        "vault started"
    );

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c; shutting down");
        })
        .await
        .context("http server error")?;
    Ok(())
}

fn status(cfg: &AppConfig, db_path: &Path, tracks: &TrackService) -> Result<()> {
    let window = tracks.lock_window();
    println!("database: {}", db_path.display());
    println!(
        "lock window: {} day(s){}",
        window.days,
        if window.development_mode {
            " (development mode)"
        } else {
            ""
        }
    );
    println!(
        "provider: {}",
        if spotify_configured(&cfg.spotify) {
            "spotify"
        } else {
            "<not configured>"
        }
    );
    let counts = tracks.status_counts()?;
    if counts.is_empty() {
        println!("tracks: <none>");
    }
    for (status, count) in counts {
        println!("{status}: {count}");
    }
    Ok(())
}

fn spotify_configured(cfg: &SpotifyConfig) -> bool {
    let id = cfg.client_id.trim();
    !id.is_empty() && id != SpotifyConfig::default().client_id && !cfg.client_secret.trim().is_empty()
}

fn build_provider(cfg: &SpotifyConfig) -> Result<Arc<dyn MusicProvider>> {
    if spotify_configured(cfg) {
        Ok(Arc::new(SpotifyClient::new(cfg)?))
    } else {
        warn!("spotify client credentials not configured; provider features are disabled");
        Ok(Arc::new(NullProvider))
    }
}

fn open_store(path: &Path) -> Result<Store> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    Store::open(path).with_context(|| format!("failed to open database {}", path.display()))
}

fn database_path(cfg: &AppConfig) -> PathBuf {
    cfg.database_path.clone().unwrap_or_else(|| {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("vault").join("vault.db")
    })
}

fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("vault").join("config.toml")
}

fn init_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let cfg = AppConfig::default();
    let toml = toml::to_string_pretty(&cfg)?;
    std::fs::write(path, toml)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

fn load_or_default(path: &Path) -> Result<AppConfig> {
    let mut cfg = if !path.exists() {
        AppConfig::default()
    } else {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))?
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

fn apply_env_overrides(cfg: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
    let non_blank = |key: &str| var(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = non_blank("VAULT_LOG_LEVEL") {
        cfg.log_level = v;
    }
    if let Some(v) = non_blank("VAULT_DATABASE_PATH") {
        cfg.database_path = Some(PathBuf::from(v));
    }
    if let Some(v) = non_blank("VAULT_LISTEN_ADDR") {
        cfg.listen_addr = v;
    }
    if let Some(v) = var("VAULT_DEVELOPMENT_MODE") {
        if let Ok(parsed) = v.trim().parse::<bool>() {
            cfg.lock.development_mode = parsed;
        }
    }
    if let Some(v) = non_blank("VAULT_SPOTIFY_CLIENT_ID") {
        cfg.spotify.client_id = v;
    }
    if let Some(v) = non_blank("VAULT_SPOTIFY_CLIENT_SECRET") {
        cfg.spotify.client_secret = v;
    }
    if let Some(v) = non_blank("VAULT_SPOTIFY_REDIRECT_URI") {
        cfg.spotify.redirect_uri = v;
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_env_overrides, spotify_configured};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use vault_core::AppConfig;

    #[test]
    fn env_overrides_skip_blank_and_unparseable_values() {
        let env: HashMap<&str, &str> = [
            ("VAULT_LOG_LEVEL", "debug"),
            ("VAULT_DATABASE_PATH", "/var/lib/vault/vault.db"),
            ("VAULT_LISTEN_ADDR", "  "),
            ("VAULT_DEVELOPMENT_MODE", "yes"),
            ("VAULT_SPOTIFY_CLIENT_ID", "client"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        apply_env_overrides(&mut cfg, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.database_path, Some(PathBuf::from("/var/lib/vault/vault.db")));
        assert_eq!(cfg.listen_addr, AppConfig::default().listen_addr);
        assert!(!cfg.lock.development_mode);
        assert_eq!(cfg.spotify.client_id, "client");
    }

    #[test]
    fn placeholder_client_id_is_not_configured() {
        let mut cfg = AppConfig::default();
        assert!(!spotify_configured(&cfg.spotify));

        cfg.spotify.client_id = "abc".to_string();
        assert!(!spotify_configured(&cfg.spotify));
        cfg.spotify.client_secret = "shh".to_string();
        assert!(spotify_configured(&cfg.spotify));
    }
}
