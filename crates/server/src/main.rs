mod config;
mod delivery;
mod handler;
mod metrics;
mod presence;
mod services;
mod session;
mod session_manager;
mod util;

use crate::config::{load_configuration, LogStyle, ServerConfig};
use crate::metrics::Metrics;
use crate::services::alert::AlertService;
use crate::services::auth::AuthService;
use crate::services::buddy::BuddyService;
use crate::services::generic::GenericService;
use crate::services::icbm::IcbmService;
use crate::services::location::LocationService;
use crate::services::ServiceRegistry;
use crate::session_manager::SessionManager;
use oscard_storage::{Storage, UserRecord};
use rand::rngs::OsRng;
use rand::RngCore;
use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Everything a connection task needs, shared behind one Arc.
pub struct ServerState {
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub sessions: Arc<SessionManager>,
    pub services: ServiceRegistry,
    pub presence_tx: UnboundedSender<UserRecord>,
    pub cookie_secret: [u8; 32],
}

fn main() {
    let config_path = match parse_args() {
        Some(path) => path,
        None => {
            eprintln!("usage: oscard-server --config <path>");
            process::exit(2);
        }
    };
    let config = match load_configuration(Path::new(&config_path)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("could not load configuration: {}", err);
            process::exit(1);
        }
    };
    init_tracing(&config);

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    if runtime.block_on(serve(config)).is_err() {
        process::exit(1);
    }
}

fn parse_args() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::new(config.log_level.as_filter());
    match config.log_style {
        LogStyle::Machine => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogStyle::Human => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn serve(config: ServerConfig) -> Result<(), ()> {
    let storage = match oscard_storage::connect(&config.postgres_dsn).await {
        Ok(storage) => Arc::new(storage),
        Err(err) => {
            error!("could not connect to storage: {}", err);
            return Err(());
        }
    };
    if let Err(err) = storage.migrate().await {
        error!("migrations failed: {}", err);
        return Err(());
    }
    // Single-instance invariant: nobody is online before we are.
    match storage.reset_all_away().await {
        Ok(cleared) => info!(cleared, "reset user presence to away"),
        Err(err) => {
            error!("could not reset user presence: {}", err);
            return Err(());
        }
    }

    let metrics = Arc::new(Metrics::new());
    let sessions = Arc::new(SessionManager::new());
    let (presence_tx, presence_rx) = mpsc::unbounded_channel();
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    let presence_loop = tokio::spawn(presence::run(
        presence_rx,
        sessions.clone(),
        storage.clone(),
        metrics.clone(),
    ));
    let delivery_loop = tokio::spawn(delivery::run(
        delivery_rx,
        sessions.clone(),
        storage.clone(),
        metrics.clone(),
    ));

    let cookie_secret = config.cookie_secret.unwrap_or_else(|| {
        // Per-boot secret: restart invalidates cookies, which is fine
        // when no live session outlives the process.
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        secret
    });

    let mut services = ServiceRegistry::new();
    services.register(Arc::new(GenericService {
        presence_tx: presence_tx.clone(),
    }));
    services.register(Arc::new(LocationService {
        presence_tx: presence_tx.clone(),
    }));
    services.register(Arc::new(BuddyService {
        sessions: sessions.clone(),
    }));
    services.register(Arc::new(IcbmService { delivery_tx }));
    services.register(Arc::new(AuthService {
        bos_address: config.bos.clone(),
        cookie_secret,
        cookie_ttl_seconds: config.cookie_ttl_seconds,
        metrics: metrics.clone(),
    }));
    services.register(Arc::new(AlertService));

    let metrics_task = config.metrics.clone().map(|metrics_config| {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let basic_auth = match (metrics_config.user, metrics_config.password) {
                (Some(user), Some(password)) => Some((user, password)),
                _ => None,
            };
            if let Err(err) =
                metrics::serve_endpoint(metrics_config.addr, metrics, basic_auth).await
            {
                error!("metrics endpoint failed: {}", err);
            }
        })
    });

    let listener = match TcpListener::bind(&config.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(address = %config.addr, "could not bind listener: {}", err);
            return Err(());
        }
    };
    info!(address = %config.addr, bos = %config.bos, "oscard listening");

    let state = Arc::new(ServerState {
        storage,
        metrics,
        sessions: sessions.clone(),
        services,
        presence_tx,
        cookie_secret,
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handler::drive(state.clone(), stream, peer));
                    }
                    Err(err) => {
                        error!("accept failure: {}", err);
                        return Err(());
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }

    info!("shutting down");
    drop(listener);
    for session in sessions.drain() {
        session.disconnect().await;
    }
    // Connection tasks wind down and release the event queues; the
    // loops end when the last sender drops.
    drop(state);
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = presence_loop.await;
        let _ = delivery_loop.await;
    })
    .await;
    if drained.is_err() {
        warn!("event loops did not drain in time");
    }
    if let Some(task) = metrics_task {
        task.abort();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
