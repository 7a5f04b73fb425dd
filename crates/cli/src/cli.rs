//! Command-line interface

use crate::tracing::LogLevel;
use buildstash_core::config::{DebugLog, ServeConfig, StoreConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "buildstash")]
#[command(about = "Build-acceleration cache server for compiler and CI workers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    #[arg(long, global = true, help = "Output logs in JSON format")]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Run the cache server")]
    Serve(ServeArgs),
    #[command(about = "Bridge stdio to a running server's socket")]
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, help = "Root directory of the local cache")]
    pub cache_dir: PathBuf,

    #[arg(long, help = "Unix socket path (default: <cache-dir>/buildstash.sock)")]
    pub socket: Option<PathBuf>,

    #[arg(long, help = "S3 bucket for the shared cache tier")]
    pub bucket: Option<String>,

    #[arg(long, default_value = "us-east-1", help = "S3 region")]
    pub region: String,

    #[arg(long, help = "S3 endpoint URL override")]
    pub endpoint: Option<String>,

    #[arg(long, help = "Use path-style S3 addressing")]
    pub path_style: bool,

    #[arg(long, default_value = "", help = "Prefix for all object-store keys")]
    pub key_prefix: String,

    #[arg(long, default_value_t = 64, help = "Maximum concurrent cache requests")]
    pub concurrency: usize,

    #[arg(long, default_value_t = 16, help = "Maximum concurrent S3 uploads")]
    pub s3_concurrency: usize,

    #[arg(
        long,
        default_value_t = 0,
        help = "Never upload outputs smaller than this (bytes)"
    )]
    pub min_upload_size: u64,

    #[arg(
        long,
        default_value_t = 0,
        help = "Prune local entries older than this many seconds (0 disables)"
    )]
    pub expiration: u64,

    #[arg(long, help = "HTTP listen address, e.g. 127.0.0.1:5970")]
    pub http: Option<String>,

    #[arg(long, help = "Enable the module-registry proxy (requires --http)")]
    pub modproxy: bool,

    #[arg(
        long,
        default_value = "https://proxy.golang.org",
        help = "Upstream module registry"
    )]
    pub registry: String,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Hosts to intercept and cache (requires --http)"
    )]
    pub revproxy: Vec<String>,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "sum.golang.org",
        help = "Allowlisted checksum databases"
    )]
    pub sumdb: Vec<String>,

    #[arg(
        long,
        default_value_t = 300,
        help = "Local TTL for @latest responses (seconds)"
    )]
    pub latest_ttl: u64,

    #[arg(
        long,
        default_value = "",
        help = "Request logging components: buildcache,modproxy,revproxy"
    )]
    pub debug_log: String,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[arg(long, help = "Socket of the running server")]
    pub socket: PathBuf,
}

impl ServeArgs {
    pub fn parse_debug_log(&self) -> Result<DebugLog, String> {
        DebugLog::parse(&self.debug_log)
    }

    pub fn into_config(self) -> Result<ServeConfig, String> {
        let debug_log = DebugLog::parse(&self.debug_log)?;
        let socket = self
            .socket
            .unwrap_or_else(|| self.cache_dir.join("buildstash.sock"));
        let store = self.bucket.map(|bucket| StoreConfig {
            bucket,
            region: self.region,
            endpoint: self.endpoint,
            path_style: self.path_style,
            key_prefix: self.key_prefix,
            retry: Default::default(),
        });
        let config = ServeConfig {
            cache_dir: self.cache_dir,
            socket,
            store,
            concurrency: self.concurrency,
            s3_concurrency: self.s3_concurrency,
            min_upload_size: self.min_upload_size,
            expiration_secs: self.expiration,
            http: self.http,
            modproxy: self.modproxy,
            registry: self.registry,
            revproxy: self.revproxy,
            sumdb: self.sumdb,
            latest_ttl_secs: self.latest_ttl,
            debug_log,
        };
        config.validate()?;
        Ok(config)
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["buildstash", "serve", "--cache-dir", "/tmp/c"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/c"));
        assert_eq!(config.socket, PathBuf::from("/tmp/c/buildstash.sock"));
        assert!(config.store.is_none());
        assert_eq!(config.concurrency, 64);
        assert_eq!(config.sumdb, vec!["sum.golang.org"]);
    }

    #[test]
    fn test_serve_with_store_and_proxies() {
        let cli = Cli::try_parse_from([
            "buildstash",
            "serve",
            "--cache-dir",
            "/tmp/c",
            "--bucket",
            "cache-bucket",
            "--region",
            "eu-west-1",
            "--path-style",
            "--key-prefix",
            "team",
            "--http",
            "127.0.0.1:5970",
            "--modproxy",
            "--revproxy",
            "origin.test,alt.test",
            "--debug-log",
            "buildcache,revproxy",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config().unwrap();
        let store = config.store.unwrap();
        assert_eq!(store.bucket, "cache-bucket");
        assert_eq!(store.region, "eu-west-1");
        assert!(store.path_style);
        assert_eq!(store.key_prefix, "team");
        assert_eq!(config.revproxy, vec!["origin.test", "alt.test"]);
        assert!(config.debug_log.buildcache);
        assert!(config.debug_log.revproxy);
        assert!(!config.debug_log.modproxy);
    }

    #[test]
    fn test_modproxy_without_http_is_rejected() {
        let cli = Cli::try_parse_from([
            "buildstash",
            "serve",
            "--cache-dir",
            "/tmp/c",
            "--modproxy",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_connect_args() {
        let cli =
            Cli::try_parse_from(["buildstash", "connect", "--socket", "/tmp/c/s.sock"]).unwrap();
        assert!(matches!(cli.command, Commands::Connect(_)));
    }
}
