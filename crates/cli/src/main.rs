//! buildstash - build-acceleration cache server
//!
//! One binary, two subcommands: `serve` runs the action-cache IPC endpoint
//! plus the optional HTTP listener (module proxy, intercept proxy, debug
//! introspection); `connect` bridges a compiler's stdio to a running server.

mod cli;
mod commands;
mod dispatcher;
mod shutdown;
mod tracing;

use crate::cli::{parse, Commands};
use crate::tracing::{init_tracing, TracingConfig, TracingFormat};
use buildstash_core::Error;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = parse();

    let format = if cli.json {
        TracingFormat::Json
    } else {
        TracingFormat::Pretty
    };
    let debug_log = match &cli.command {
        Commands::Serve(args) => match args.parse_debug_log() {
            Ok(debug_log) => debug_log,
            Err(message) => {
                eprintln!("error: {message}");
                return EXIT_CONFIG;
            }
        },
        Commands::Connect(_) => Default::default(),
    };
    if let Err(e) = init_tracing(TracingConfig {
        format,
        level: cli.level.into(),
        debug_log,
    }) {
        eprintln!("error: failed to initialize tracing: {e}");
        return EXIT_CONFIG;
    }

    let result = match cli.command {
        Commands::Serve(args) => match args.into_config() {
            Ok(config) => commands::serve::execute_serve(config).await,
            Err(message) => Err(Error::configuration(message)),
        },
        Commands::Connect(args) => commands::connect::execute_connect(&args.socket).await,
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            ::tracing::error!(error = %err, "Fatal error");
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

/// Startup configuration problems exit 1; everything else that escapes the
/// runtime exits 2.
fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::Configuration { .. } | Error::InvalidKey { .. } => EXIT_CONFIG,
        _ => EXIT_RUNTIME,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&Error::configuration("missing flag")), 1);
        assert_eq!(exit_code_for(&Error::remote("GetObject", "boom")), 2);
        assert_eq!(exit_code_for(&Error::Shutdown), 2);
    }
}
