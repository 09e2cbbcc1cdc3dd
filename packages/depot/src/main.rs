use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use atomic_time::AtomicInstant;
use clap::Parser;
use color_eyre::{Result, eyre::Context};
use depot::{CacheServer, CacheServerConfig, DEFAULT_EXPIRATION_TIME_SECONDS, DEFAULT_MAX_ENTRIES_PER_KEY};
use derive_more::Debug;
use futures::{SinkExt, StreamExt};
use protocol::{
    CACHE_NETWORK_VERSION, CaseSensitivity, DiskStorage, MessageType, NetworkClientExt, TcpClient,
    message::ConnectRequest, transport::framed,
};
use tap::Pipe;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::bytes::Bytes;
use tracing::{debug, info, instrument, level_filters::LevelFilter, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_tree::time::FormatTime;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Serve the cache over TCP
    Serve(ServeConfig),

    /// Load the database, run maintenance on every bucket, and save it
    Maintain(MaintainConfig),

    /// Run an administrative command on a running server and print the result
    Admin(AdminConfig),
}

#[derive(Parser, Debug)]
struct ServeConfig {
    #[command(flatten)]
    database: DatabaseArgs,

    /// Port to listen on
    #[arg(long, env = "DEPOT_PORT", default_value = "7530")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "DEPOT_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Seconds between maintenance passes over buckets that received stores
    #[arg(long, env = "DEPOT_MAINTENANCE_INTERVAL", default_value = "600")]
    maintenance_interval: u64,

    /// Delete the database instead of loading it
    #[arg(long)]
    wipe: bool,
}

#[derive(Parser, Debug)]
struct MaintainConfig {
    #[command(flatten)]
    database: DatabaseArgs,
}

#[derive(Parser, Debug)]
struct AdminConfig {
    /// Address of the server
    #[arg(long, env = "DEPOT_ADDRESS", default_value = "127.0.0.1:7530")]
    address: String,

    /// One of `status`, `maintenance`, `save`, `obliterate`
    #[arg(default_value = "status")]
    command: String,
}

#[derive(clap::Args, Debug)]
struct DatabaseArgs {
    /// Directory holding the persisted buckets
    #[arg(long, env = "DEPOT_ROOT")]
    root: PathBuf,

    /// Root of the blob storage shared with clients
    #[arg(long, env = "DEPOT_CAS_ROOT")]
    cas_root: PathBuf,

    /// Remove entries unused for this many seconds; 0 keeps them forever
    #[arg(long, env = "DEPOT_EXPIRATION_SECONDS", default_value_t = DEFAULT_EXPIRATION_TIME_SECONDS)]
    expiration_seconds: u64,

    /// Soft limit on a bucket's cas key table in bytes; 0 is unlimited
    #[arg(long, env = "DEPOT_CAS_TABLE_MAX_SIZE", default_value = "0")]
    cas_table_max_size: u64,

    /// Most entries kept per command; 0 is unlimited
    #[arg(long, env = "DEPOT_MAX_ENTRIES_PER_KEY", default_value_t = DEFAULT_MAX_ENTRIES_PER_KEY)]
    max_entries_per_key: usize,

    /// Also remove entries whose inputs are gone from storage
    #[arg(long, env = "DEPOT_CHECK_INPUTS")]
    check_inputs: bool,

    /// Compare paths ignoring ASCII case
    #[arg(long, env = "DEPOT_CASE_INSENSITIVE")]
    case_insensitive: bool,
}

impl DatabaseArgs {
    fn server(&self, wipe: bool) -> CacheServer {
        let config = CacheServerConfig::builder()
            .root_dir(&self.root)
            .expiration_time_seconds(self.expiration_seconds)
            .bucket_cas_table_max_size(self.cas_table_max_size)
            .max_entries_per_key(self.max_entries_per_key)
            .check_inputs_for_deleted_cas(self.check_inputs)
            .wipe_on_load(wipe)
            .case_sensitivity(if self.case_insensitive {
                CaseSensitivity::Insensitive
            } else {
                CaseSensitivity::Sensitive
            })
            .build();
        CacheServer::new(config, Arc::new(DiskStorage::new(&self.cas_root)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_timer(Uptime::default())
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("DEPOT_LOG")
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Command::Serve(config) => serve(config).await,
        Command::Maintain(config) => maintain(config).await,
        Command::Admin(config) => admin(config).await,
    }
}

async fn serve(config: ServeConfig) -> Result<()> {
    let server = Arc::new(config.database.server(config.wipe));
    let loaded = blocking(&server, |server| server.load()).await??;
    info!(loaded, "database loaded");

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("listening on {}", listener.local_addr()?);

    let mut maintenance_timer =
        tokio::time::interval(Duration::from_secs(config.maintenance_interval.max(1)));
    maintenance_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll_timer = tokio::time::interval(Duration::from_millis(250));
    let exiting = Arc::new(AtomicBool::new(false));
    let mut maintenance: Option<JoinHandle<bool>> = None;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(server.clone(), stream, peer));
                }
                Err(err) => warn!(?err, "accept failed"),
            },
            _ = maintenance_timer.tick() => {
                start_maintenance(&server, &exiting, &mut maintenance);
            }
            _ = poll_timer.tick() => {
                if server.should_shutdown() {
                    info!("shutdown requested by client");
                    break;
                }
                if server.maintenance_requested() {
                    start_maintenance(&server, &exiting, &mut maintenance);
                }
            }
            _ = &mut shutdown => break,
        }
    }

    exiting.store(true, Ordering::Release);
    if let Some(handle) = maintenance.take() {
        handle.await.context("join maintenance")?;
    }
    let saved = blocking(&server, |server| server.save()).await??;
    info!(saved, "server shutdown complete");
    Ok(())
}

/// Start a maintenance pass unless one is still running.
fn start_maintenance(
    server: &Arc<CacheServer>,
    exiting: &Arc<AtomicBool>,
    running: &mut Option<JoinHandle<bool>>,
) {
    if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
        debug!("maintenance still running");
        return;
    }
    let server = server.clone();
    let exiting = exiting.clone();
    *running = Some(tokio::task::spawn_blocking(move || {
        server.run_maintenance(false, || exiting.load(Ordering::Acquire))
    }));
}

#[instrument(skip(server, stream))]
async fn handle_connection(server: Arc<CacheServer>, stream: TcpStream, peer: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(?err, "set nodelay");
    }
    let connection = server.open_connection();
    let mut framed = framed(stream);

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame.freeze(),
            Err(err) => {
                warn!(%connection, ?err, "read frame");
                break;
            }
        };
        let response = match blocking(&server, move |server| server.handle_frame(connection, &frame)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%connection, ?err, "handle frame");
                break;
            }
        };
        if let Err(err) = framed.send(Bytes::from(response)).await {
            warn!(%connection, ?err, "write frame");
            break;
        }
    }
    server.close_connection(connection);
}

async fn maintain(config: MaintainConfig) -> Result<()> {
    let server = Arc::new(config.database.server(false));
    let loaded = blocking(&server, |server| server.load()).await??;
    info!(loaded, "database loaded");
    let changed = blocking(&server, |server| server.run_maintenance(true, || false)).await?;
    info!(changed, "maintenance complete");
    Ok(())
}

async fn admin(config: AdminConfig) -> Result<()> {
    let output = tokio::task::spawn_blocking(move || -> Result<String> {
        let client = TcpClient::connect(&config.address)?;
        client.request::<_, u32>(
            MessageType::Connect,
            &ConnectRequest::builder()
                .version(CACHE_NETWORK_VERSION)
                .client_name("depot admin")
                .build(),
        )?;
        client.request(MessageType::ExecuteCommand, &config.command)
    })
    .await
    .context("join admin request")??;
    println!("{output}");
    Ok(())
}

/// Run synchronous server work on the blocking pool.
async fn blocking<T: Send + 'static>(
    server: &Arc<CacheServer>,
    work: impl FnOnce(&CacheServer) -> T + Send + 'static,
) -> Result<T> {
    let server = server.clone();
    tokio::task::spawn_blocking(move || work(&server))
        .await
        .context("join blocking task")
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(?err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}

/// Prints the overall latency and latency between tracing events.
struct Uptime {
    start: Instant,
    prior: AtomicInstant,
}

impl Uptime {
    /// Get the [`Duration`] since the last time this function was called,
    /// or since the [`Uptime`] was created on the first call.
    fn elapsed_since_prior(&self) -> Duration {
        const RELAXED: Ordering = Ordering::Relaxed;
        self.prior
            .fetch_update(RELAXED, RELAXED, |_| Some(Instant::now()))
            .unwrap_or_else(|_| Instant::now())
            .pipe(|prior| prior.elapsed())
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            prior: AtomicInstant::now(),
        }
    }
}

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut impl std::fmt::Write) -> std::fmt::Result {
        let seconds = self.start.elapsed().as_secs_f64();
        write!(w, "{seconds:.03}s")
    }

    // `elapsed` is the time spent in the current span; the time since the
    // previous event is more useful when reading a server log.
    fn style_timestamp(
        &self,
        _ansi: bool,
        _elapsed: Duration,
        w: &mut impl std::fmt::Write,
    ) -> std::fmt::Result {
        let elapsed = self.elapsed_since_prior().as_millis();
        write!(w, "{elapsed: >3}ms")
    }
}
