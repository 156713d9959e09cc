use anyhow::{bail, Context, Result};
use asr_note::audio::{AudioSource, DefaultBackendFactory, MicArbiter};
use asr_note::billing::{
    AuthProvider, BillingApi, HttpBillingClient, StaticLogin, TokenAuth, TokenStore,
};
use asr_note::cli::{AccountArgs, Cli, Commands};
use asr_note::session::{
    NoticeLevel, SessionController, SessionDeps, SessionEvent, SessionState,
};
use asr_note::transcript::StringBuffer;
use asr_note::transport::WsConnector;
use asr_note::{create_router, AppState, Config};
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cfg = Config::load(cli.config.as_deref())?;
    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));
    info!("Billing service: {}", cfg.service.backend_url);

    let billing: Arc<dyn BillingApi> = Arc::new(HttpBillingClient::new(&cfg.service.backend_url));
    let auth = Arc::new(build_auth(&cli.account, &cfg, Arc::clone(&billing))?);

    match cli.command {
        Commands::Record {
            source,
            duration,
            output,
        } => {
            let (buffer, controller) =
                spawn_controller(&cfg, source.source(), auth, billing);
            record(controller, buffer, duration, output).await
        }

        Commands::Serve { source, port } => {
            let (buffer, controller) =
                spawn_controller(&cfg, source.source(), auth, billing);
            tokio::spawn(log_events(controller.subscribe()));

            let app = create_router(AppState::new(controller, buffer));
            let addr = format!("{}:{}", cfg.http.bind, port.unwrap_or(cfg.http.port));
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("HTTP API listening on {}", addr);

            axum::serve(listener, app).await?;
            Ok(())
        }

        Commands::Balance => {
            let token = require_token(auth.as_ref()).await?;
            let status = billing.status(&token).await?;
            println!("Balance: {} min", status.display_minutes());
            if let Some(url) = status.pay_url() {
                println!("Top up: {}", url);
            }
            Ok(())
        }

        Commands::Redeem { code } => {
            let token = require_token(auth.as_ref()).await?;
            let status = billing.redeem(&token, code.trim()).await?;
            println!("Redeemed. Balance: {} min", status.display_minutes());
            Ok(())
        }

        Commands::Logout => auth.logout().await,
    }
}

fn build_auth(args: &AccountArgs, cfg: &Config, api: Arc<dyn BillingApi>) -> Result<TokenAuth> {
    let account_file: Option<PathBuf> = args
        .account_file
        .clone()
        .or_else(|| cfg.service.account_file.as_ref().map(PathBuf::from));

    let store = match (&args.token, account_file) {
        (Some(token), _) => TokenStore::in_memory(Some(token.clone())),
        (None, Some(path)) => TokenStore::load(Path::new(&path))?,
        (None, None) => TokenStore::in_memory(None),
    };

    let prompt = StaticLogin::new(args.credentials());
    Ok(TokenAuth::new(api, store, Box::new(prompt)))
}

async fn require_token(auth: &dyn AuthProvider) -> Result<String> {
    match auth.ensure_token().await? {
        Some(token) => Ok(token),
        None => bail!("Not logged in: pass --token or --username/--password"),
    }
}

fn spawn_controller(
    cfg: &Config,
    source: AudioSource,
    auth: Arc<TokenAuth>,
    billing: Arc<dyn BillingApi>,
) -> (Arc<Mutex<StringBuffer>>, SessionController) {
    let (buffer, shared) = StringBuffer::new().shared();

    let controller = SessionController::spawn(
        cfg.session_config(),
        SessionDeps {
            auth,
            billing,
            connector: Arc::new(WsConnector::new()),
            audio: Arc::new(DefaultBackendFactory::new(source)),
            mic: MicArbiter::new(),
            buffer: shared,
        },
    );

    (buffer, controller)
}

async fn record(
    controller: SessionController,
    buffer: Arc<Mutex<StringBuffer>>,
    duration: Option<u64>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut events = controller.subscribe();
    controller
        .start()
        .await
        .context("Failed to start voice note")?;

    let deadline = duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let mut stopping = false;

    loop {
        let timeout = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("Interrupted, stopping");
                stopping = true;
                request_stop(&controller).await;
            }
            _ = timeout, if !stopping => {
                info!("Duration reached, stopping");
                stopping = true;
                request_stop(&controller).await;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Transcript { text, is_final }) => {
                    if is_final {
                        println!("\r{}", text);
                    } else {
                        print!("\r{}", text);
                        std::io::stdout().flush().ok();
                    }
                }
                Ok(SessionEvent::Notice { level, message }) => match level {
                    NoticeLevel::Ok => info!("{}", message),
                    NoticeLevel::Error => warn!("{}", message),
                },
                Ok(SessionEvent::CaptureEnded) => {
                    if !stopping {
                        stopping = true;
                        request_stop(&controller).await;
                    }
                }
                Ok(SessionEvent::StateChanged { state }) => match state {
                    SessionState::Idle => break,
                    SessionState::Paused => {
                        // Reconnects gave up; nothing will resume a CLI session
                        request_stop(&controller).await;
                        break;
                    }
                    _ => {}
                },
                Ok(SessionEvent::Billing { fields }) => debug!("Billing update: {}", fields),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} session events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let text = buffer.lock().await.text().to_string();
    println!("\n--- transcript ---\n{}", text);
    if let Some(path) = output {
        std::fs::write(&path, &text)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Transcript saved to {}", path.display());
    }

    Ok(())
}

async fn request_stop(controller: &SessionController) {
    if let Err(e) = controller.stop().await {
        warn!("Stop failed: {}", e);
    }
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Notice { level, message }) => match level {
                NoticeLevel::Ok => info!("{}", message),
                NoticeLevel::Error => warn!("{}", message),
            },
            Ok(SessionEvent::StateChanged { state }) => info!("Session state: {}", state),
            Ok(SessionEvent::Transcript { text, is_final }) => {
                debug!("Transcript ({}): {}", if is_final { "final" } else { "partial" }, text)
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} session events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
