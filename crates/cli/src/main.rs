mod serve;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use lotline_core::Fingerprint;
use lotline_engine::{read_engine_config, EngineConfig};
use tracing_subscriber::EnvFilter;

/// Default HTTP port when neither `--port` nor `LOTLINE_PORT` is given.
const DEFAULT_PORT: u16 = 8080;

/// Rendering of the verification fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FingerprintFormat {
    Svg,
    Text,
    DataUrl,
}

/// Lotline batch custody tracing.
#[derive(Parser)]
#[command(name = "lotline", version, about = "Lotline batch custody tracing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to listen on (default: LOTLINE_PORT or 8080)
        #[arg(long)]
        port: Option<u16>,
        /// Path to an engine config TOML file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Render the verification fingerprint for a batch identifier
    Fingerprint {
        /// Batch identifier encoded by the fingerprint
        id: String,
        /// Output format
        #[arg(long, default_value = "svg", value_enum)]
        format: FingerprintFormat,
        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Parse an engine config file and print the effective settings
    CheckConfig {
        /// Path to the config TOML file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("LOTLINE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { port, config } => {
            let port = port.unwrap_or_else(port_from_env);
            let config = match config {
                Some(path) => load_config(&path),
                None => EngineConfig::default(),
            };
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create tokio runtime: {}", e);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(port, config)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::Fingerprint { id, format, out } => {
            cmd_fingerprint(&id, format, out.as_deref());
        }
        Commands::CheckConfig { file } => {
            cmd_check_config(&file);
        }
    }
}

/// Port from LOTLINE_PORT, or the default.
fn port_from_env() -> u16 {
    match std::env::var("LOTLINE_PORT") {
        Ok(raw) => match raw.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("error: LOTLINE_PORT '{}' is not a valid port", raw);
                process::exit(1);
            }
        },
        Err(_) => DEFAULT_PORT,
    }
}

fn load_config(path: &Path) -> EngineConfig {
    match read_engine_config(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

fn cmd_fingerprint(id: &str, format: FingerprintFormat, out: Option<&Path>) {
    if id.trim().is_empty() {
        eprintln!("error: identifier must not be empty");
        process::exit(1);
    }
    let fingerprint = Fingerprint::generate(id);
    let rendered = match format {
        FingerprintFormat::Svg => fingerprint.to_svg(),
        FingerprintFormat::Text => fingerprint.to_text(),
        FingerprintFormat::DataUrl => fingerprint.to_data_url(),
    };

    match out {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &rendered) {
                eprintln!("error: could not write '{}': {}", path.display(), e);
                process::exit(1);
            }
            eprintln!("Wrote fingerprint for '{}' to {}", id, path.display());
        }
        None => {
            if rendered.ends_with('\n') {
                print!("{}", rendered);
            } else {
                println!("{}", rendered);
            }
        }
    }
}

fn cmd_check_config(path: &Path) {
    let config = load_config(path);
    match toml::to_string_pretty(&config) {
        Ok(effective) => {
            eprintln!("Config OK: {}", path.display());
            print!("{}", effective);
        }
        Err(e) => {
            eprintln!("error: could not render config: {}", e);
            process::exit(1);
        }
    }
}
