use anyhow::Result;
use clap::Parser;
use edgekit::manager::{AlwaysOnline, NoopPlatform};
use edgekit::signals::SignalSet;
use edgekit::{Context, EdgeOrchestrator, EdgekitConfig, StopToken, TreeFactoryRegistry};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "edgekit")]
#[command(about = "Edge data-collection runtime: sensors, processing trees and cloud upload")]
#[command(version)]
#[command(long_about = "Runs a fleet device's data-collection trees: sensor threads record \
into a local staging area, worker threads process staged data, and an asynchronous engine \
ships recordings and CSV journals to cloud storage. A running instance is controlled through \
flag files in the configured flags directory (see --request-stop and --trigger).")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "edgekit.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the runtime")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - build everything but don't start threads
    #[arg(long, help = "Perform dry run - build the context and trees but don't start them")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, value_name = "DIR", help = "Directory for daily-rotated log files")]
    log_dir: Option<String>,

    /// Ask a running instance to stop, then exit
    #[arg(long, help = "Raise the stop flag for a running instance and exit")]
    request_stop: bool,

    /// Ask a running instance for an on-demand sensing burst of this many seconds
    #[arg(long, value_name = "SECS", help = "Raise the sensing trigger flag and exit")]
    trigger: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let _log_guard = init_logging(&args)?;

    info!("Starting edgekit v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match EdgekitConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Control-plane modes talk to a running instance through its flag files.
    if args.request_stop {
        let signals = SignalSet::new(&config.paths.flags_dir());
        signals.stop.raise()?;
        println!("Stop requested");
        return Ok(());
    }
    if let Some(secs) = args.trigger {
        let signals = SignalSet::new(&config.paths.flags_dir());
        signals.trigger.raise_with(&secs.to_string())?;
        println!("Sensing trigger raised for {secs}s");
        return Ok(());
    }

    let context = Context::new(config).map_err(|e| {
        error!("Failed to build runtime context: {}", e);
        e
    })?;
    let registry = TreeFactoryRegistry::with_builtins();

    if args.dry_run {
        let trees = registry.build(&context.config)?;
        println!(
            "✓ Dry run completed - {} trees built for device {}",
            trees.len(),
            context.config.device.device_id
        );
        context.engine.shutdown();
        return Ok(());
    }

    let orchestrator = EdgeOrchestrator::new(
        Arc::clone(&context),
        registry,
        Arc::new(AlwaysOnline),
        Arc::new(NoopPlatform),
    );

    let result = orchestrator.run_supervised(&StopToken::new());
    context.engine.shutdown();
    match result {
        Ok(()) => {
            info!("edgekit exited cleanly");
            Ok(())
        }
        Err(e) => {
            error!("Runtime error: {}", e);
            Err(e.into())
        }
    }
}

fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("edgekit={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let registry = tracing_subscriber::registry().with(fmt_layer).with(env_filter);

    let guard = if let Some(dir) = &args.log_dir {
        let appender = tracing_appender::rolling::daily(Path::new(dir), "edgekit.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(fmt::layer().with_writer(writer).with_ansi(false))
            .init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    Ok(guard)
}

/// Print default configuration in TOML format.
fn print_default_config() -> Result<()> {
    println!("# Edgekit Configuration File");
    println!("# This is the default configuration with all available options");
    println!();
    let toml = toml::to_string_pretty(&EdgekitConfig::default())?;
    println!("{}", toml);
    Ok(())
}
