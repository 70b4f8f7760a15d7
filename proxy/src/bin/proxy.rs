//! braid-proxy binary.

use braid_proxy::Config;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "braid-proxy")]
#[command(about = "TCP relay: one buffered backend connection per client")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("No config file specified. Pass a path or use --print-config");
            std::process::exit(1);
        }
    };

    braid_proxy::logging::init(&config.logging);

    let shutdown = braid_proxy::signal::install();

    if let Err(e) = braid_proxy::run(&config, shutdown) {
        tracing::error!(error = %e, "proxy error");
        std::process::exit(1);
    }
}

fn print_default_config() {
    let config = r#"# braid-proxy configuration

[proxy]
# Address to listen on for client connections
listen = "0.0.0.0:7000"

# Per-connection receive buffer cap in bytes
max_recv_buffer_size = 32768

[backend]
# Backend address (one outbound connection per client)
addr = "127.0.0.1:7001"

# Connect timeout in milliseconds
connect_timeout_ms = 10000

[workers]
# Number of worker threads (default: number of CPUs)
# threads = 4

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "info"

# Log format: "pretty", "json", or "compact"
format = "pretty"
"#;
    print!("{}", config);
}
