use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::time;
use tracing_subscriber::EnvFilter;
use warden::{Config, LogOnlyNavigator, RenewalStrategy, Session};
use warden_tokens::persistence::FileStore;

#[derive(Debug, Parser)]
struct Opts {
    /// The application's ID with the authentication service
    #[arg(short, long, env = "WARDEN_APP_ID")]
    app_id: String,

    /// Base URL of the authentication service
    #[arg(long, env = "WARDEN_AUTH_BASE_URL")]
    auth_base_url: Option<String>,

    /// Base URL of the feature flag service
    #[arg(long, env = "WARDEN_FLAGS_BASE_URL")]
    flags_base_url: Option<String>,

    /// Authorization code received on the callback route, if signing in
    #[arg(short, long, env = "WARDEN_CODE", hide_env_values = true)]
    code: Option<String>,

    /// Feature flags to report on
    #[arg(long = "flag")]
    flags: Vec<String>,

    /// Use the fixed refresh cycle instead of expiry scheduling
    #[arg(long)]
    refresh_cycle: bool,

    /// Enable verbose logging
    #[arg(short, long, env = "WARDEN_DEBUG")]
    debug: bool,

    /// The local file used to persist credentials
    #[arg(short = 'f', long, env = "WARDEN_CREDENTIALS_FILE", default_value = ".credentials.json")]
    credentials_file: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    let opts = Opts::parse();

    let mut builder = Config::builder(opts.app_id).debug(opts.debug);
    if let Some(url) = opts.auth_base_url {
        builder = builder.auth_base_url(url);
    }
    if let Some(url) = opts.flags_base_url {
        builder = builder.flags_base_url(url);
    }
    if opts.refresh_cycle {
        builder = builder.renewal(RenewalStrategy::RefreshCycle);
    }
    let config = builder.build()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();

    let storage = FileStore::open(opts.credentials_file)?;
    let session = Session::start(config, storage, Arc::new(LogOnlyNavigator), None)?;

    if let Some(code) = opts.code.as_deref() {
        let route = session.complete_callback(Some(code)).await;
        tracing::info!(route, "callback complete");
    }

    let mut profiles = session.profile().subscribe();
    let mut errors = session.profile().subscribe_errors();
    let mut interval = time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let authenticated = session.auth().is_authenticated();
                let scheduler = session.scheduler_state();
                if authenticated {
                    tracing::debug!(authenticated, ?scheduler, "status");
                } else {
                    tracing::warn!(authenticated, ?scheduler, "status");
                }

                for flag in &opts.flags {
                    let enabled = session.flags().is_feature_enabled(flag, false).await;
                    tracing::info!(flag, enabled, "feature flag");
                }
            }
            Ok(()) = profiles.changed() => {
                match &*profiles.borrow_and_update() {
                    Some(profile) => tracing::info!(
                        user = %profile.id,
                        tenant = profile.tenant.as_ref().map(|t| t.id.as_str()),
                        onboarded = profile.is_onboarded(),
                        "profile updated"
                    ),
                    None => tracing::info!("signed out"),
                }
            }
            Ok(err) = errors.recv() => {
                tracing::error!(%err, "identity token rejected");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown();
    Ok(())
}
