//! The binary entrypoint for `stash`, which runs build steps through the
//! cache server.

use std::{
    path::PathBuf,
    process::{Command as Process, ExitCode},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, OptionExt, eyre},
};
use protocol::{
    DiskStorage, LogLineKind, ProcessLogLine, ProcessStartInfo, RootPaths, TcpClient,
};
use stash::{CacheClient, CacheClientConfig};
use tracing::{info, instrument, warn};
use tracing_subscriber::util::SubscriberInitExt;

// Nothing in a binary crate should be `pub`, so dead code is still reported.
mod log;

#[derive(Parser)]
#[command(name = "stash", about = "Run build steps through the cache", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// When to colorize log output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Run a command, or replay its cached result
    Exec(ExecArgs),

    /// Run an administrative command on the server
    Admin {
        #[command(flatten)]
        server: ServerArgs,

        /// One of `status`, `maintenance`, `save` or `obliterate`
        #[arg(default_value = "status")]
        command: String,
    },

    /// Ask the server to shut down
    Shutdown {
        #[command(flatten)]
        server: ServerArgs,

        /// Logged by the server
        #[arg(default_value = "requested by stash")]
        reason: String,
    },
}

#[derive(Clone, Debug, Args)]
struct ServerArgs {
    /// Address of the cache server
    #[arg(long, env = "STASH_SERVER", default_value = "127.0.0.1:7530")]
    server: String,

    /// Directory of the content addressed storage shared with the server
    #[arg(long, env = "STASH_CAS_ROOT")]
    cas_root: PathBuf,
}

impl ServerArgs {
    fn connect(&self, config: CacheClientConfig) -> Result<CacheClient> {
        let network = TcpClient::connect(&self.server)
            .with_context(|| format!("connect to {}", self.server))?;
        let storage = DiskStorage::new(self.cas_root.clone());
        CacheClient::connect(Arc::new(network), Arc::new(storage), config)
    }
}

#[derive(Clone, Debug, Args)]
struct ExecArgs {
    #[command(flatten)]
    server: ServerArgs,

    /// Cache partition; steps only share entries within a bucket
    #[arg(long, env = "STASH_BUCKET", default_value_t = 0)]
    bucket: u32,

    /// Directory whose path is replaced by a token, so checkouts at other
    /// locations share entries
    #[arg(long = "root", env = "STASH_ROOTS", value_delimiter = ',')]
    roots: Vec<String>,

    /// File the command reads
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,

    /// File the command writes
    #[arg(long = "output")]
    outputs: Vec<PathBuf>,

    /// Extension of files whose content embeds root paths
    #[arg(long = "normalize-ext")]
    normalize_extensions: Vec<String>,

    /// Directory to stat in one pass before hashing inputs
    #[arg(long)]
    preparse: Vec<PathBuf>,

    /// Shown in logs instead of the command line
    #[arg(long)]
    description: Option<String>,

    /// Always run the command, but still store its result
    #[arg(long)]
    no_cache_hit: bool,

    /// Re-check inputs and uploaded outputs before storing
    #[arg(long)]
    validate: bool,

    /// The command and its arguments
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    color_eyre::install()?;
    log::make_logger(std::io::stderr, cli.color).init();

    match cli.command {
        Command::Exec(args) => exec(args),
        Command::Admin { server, command } => {
            let client = server.connect(CacheClientConfig::default())?;
            println!("{}", client.execute_command(&command)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Shutdown { server, reason } => {
            let client = server.connect(CacheClientConfig::default())?;
            client.request_server_shutdown(&reason)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[instrument(skip_all, fields(command = ?args.command))]
fn exec(args: ExecArgs) -> Result<ExitCode> {
    let (program, arguments) = args.command.split_first().ok_or_eyre("no command given")?;
    let roots = RootPaths::from_roots(&args.roots).context("register roots")?;
    let working_dir = std::env::current_dir()
        .context("get working directory")?
        .into_os_string()
        .into_string()
        .map_err(|dir| eyre!("working directory {dir:?} is not valid utf-8"))?;
    let process = ProcessStartInfo::builder()
        .application(program)
        .arguments(arguments.to_vec())
        .working_dir(working_dir)
        .description(args.description.unwrap_or_else(|| args.command.join(" ")))
        .build();

    let validate = args.validate;
    let config = CacheClientConfig::builder()
        .client_name(format!("stash/{}", std::process::id()))
        .use_cache_hit(!args.no_cache_hit)
        .report_miss_reason(true)
        .validate_cache_writes_input(validate)
        .validate_cache_writes_output(validate)
        .normalize_extensions(args.normalize_extensions)
        .build();
    let client = args.server.connect(config)?;
    for dir in &args.preparse {
        client.preparse_directory(dir)?;
    }

    let result = client.fetch_from_cache(&roots, args.bucket, &process);
    if result.hit {
        info!(entry = result.entry_id, "replaying cached result");
        result.log_lines.iter().for_each(replay);
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(reason) = &result.miss_reason {
        info!(%reason, "cache miss");
    }

    let output = Process::new(program)
        .args(arguments)
        .output()
        .with_context(|| format!("run {program:?}"))?;
    let log_lines = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| ProcessLogLine::new(line, LogLineKind::Info))
        .chain(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(|line| ProcessLogLine::new(line, LogLineKind::Warning)),
        )
        .collect::<Vec<_>>();
    log_lines.iter().for_each(replay);

    if !output.status.success() {
        warn!(status = %output.status, "command failed, not caching");
        return Ok(output
            .status
            .code()
            .and_then(|code| u8::try_from(code).ok())
            .map(ExitCode::from)
            .unwrap_or(ExitCode::FAILURE));
    }

    let stored = client.write_to_cache(
        &roots,
        args.bucket,
        &process,
        &args.inputs,
        &args.outputs,
        &log_lines,
        std::process::id(),
    );
    info!(stored, "command finished");
    Ok(ExitCode::SUCCESS)
}

fn replay(line: &ProcessLogLine) {
    match line.kind {
        LogLineKind::Info => println!("{line}"),
        LogLineKind::Warning | LogLineKind::Error => eprintln!("{line}"),
    }
}
