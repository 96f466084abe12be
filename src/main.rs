use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use mtreflector::config::DEFAULT_CONFIG_TEMPLATE;
use mtreflector::{MtReflectorConfig, ReflectorOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "run_mtreflector")]
#[command(about = "MTReflector CSC - calibration reflector control daemon")]
#[command(version)]
#[command(long_about = "Control daemon for the motorized calibration reflector. \
Drives the reflector actuator through a LabJack T-series digital I/O device, \
publishes reflector status events and follows the standard CSC lifecycle \
(standby/disabled/enabled).")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mtreflector.toml", help = "Path to TOML configuration file")]
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

    /// Run against a simulated LabJack
    #[arg(short, long, help = "Run against a simulated LabJack instead of real hardware")]
    simulate: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the CSC")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - load and validate but don't start the CSC
    #[arg(long, help = "Perform dry run - load and validate configuration but don't start the CSC")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!("Starting MTReflector CSC v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    // Load and validate configuration
    let config = match MtReflectorConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let validation = config.validate().and_then(|()| {
        if args.simulate {
            Ok(())
        } else {
            config.validate_for_hardware()
        }
    });

    // Validate configuration if requested
    if args.validate_config {
        match validation {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = validation {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    if args.simulate {
        info!("Simulation mode enabled - no hardware will be contacted");
    }

    // Create the orchestrator
    let mut orchestrator = ReflectorOrchestrator::new(config, args.simulate);

    // Handle dry run mode
    if args.dry_run {
        info!("Dry run mode - CSC initialized but not started");
        println!("✓ Dry run completed successfully");
        return Ok(());
    }

    // Run the CSC with signal handling
    let exit_code = orchestrator.run().await.map_err(|e| {
        error!("System error during execution: {}", e);
        e
    })?;

    info!("MTReflector CSC exited with code: {}", exit_code);

    // Exit with appropriate code for systemd
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    // Create environment filter
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mtreflector={}", log_level)));

    // Configure format based on options
    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed()
        }
        Some("compact") => {
            fmt::layer()
                .compact()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .boxed()
        }
        Some("pretty") | None => {
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
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

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# MTReflector Configuration File");
    println!("# This is the default configuration with all available options");
    println!();
    println!("{}", DEFAULT_CONFIG_TEMPLATE);
}
