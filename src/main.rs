use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wintime::config::WintimeConfig;
use wintime::inject::agent_file_name;
use wintime::launcher::{
    self, companion_file_name, LaunchMode, LaunchOptions, Launcher, FAILURE_EXIT_CODE,
};

/// Measure time and memory usage of a process.
///
/// Runs COMMAND with ARGS, then prints wall, user and kernel time together
/// with the peak memory counters of the process.
#[derive(Parser, Debug)]
#[command(name = "wintime", version, about)]
pub struct Cli {
    /// With -o FILE, append instead of overwriting
    #[arg(short, long)]
    append: bool,

    /// Write to FILE instead of STDERR
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Print COMMAND and ARGS, the architecture check, debug logs; with -o also
    /// print the report
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: wintime.toml next to this executable)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Do not inject the agent; read memory counters from the OS after exit
    #[arg(long)]
    no_inject: bool,

    /// Agent module to inject (overrides config)
    #[arg(long, value_name = "FILE")]
    agent: Option<PathBuf>,

    /// The executable to run, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => FAILURE_EXIT_CODE,
            };
            let _ = e.print();
            return code;
        }
    };

    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let self_dir = launcher::self_dir().unwrap_or_else(|| PathBuf::from("."));
    let config = match &cli.config {
        Some(path) => WintimeConfig::load(path),
        None => WintimeConfig::load_default(&self_dir),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return FAILURE_EXIT_CODE;
        }
    };

    let mode = if cli.no_inject || !config.launch.inject {
        LaunchMode::Plain
    } else {
        let agent = cli
            .agent
            .clone()
            .or_else(|| config.launch.agent_path.clone())
            .unwrap_or_else(|| self_dir.join(agent_file_name()));
        LaunchMode::Inject { agent }
    };

    let mut options = LaunchOptions::new(cli.command, mode);
    options.output = cli.output;
    options.append = cli.append;
    options.verbose = cli.verbose;
    options.separator = config.log.separator;
    options.lock_retry = config.log.lock_retry();
    options.remote_load_timeout = config.launch.remote_load_timeout();
    options.companion = self_dir.join(companion_file_name(config.companion.exe_name.as_deref()));
    options.forward_args = std::env::args_os().skip(1).collect();

    let mut stderr = std::io::stderr();
    match Launcher::new(options, &mut stderr).run() {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            tracing::debug!(error = ?e, "run aborted");
            eprintln!("{}", e);
            FAILURE_EXIT_CODE
        }
    }
}
