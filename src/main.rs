//! Reel CLI

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use reel::cassette::{Cookie, InteractionKind, Protocol};
use reel::config::StorageFormat;
use reel::{CassetteStore, EngineConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        usage();
        process::exit(1);
    }

    let command = &args[1];

    let result = match command.as_str() {
        "inspect" => {
            if args.len() < 4 {
                eprintln!("Usage: reel inspect <cassette-dir> <name>");
                process::exit(1);
            }
            inspect(Path::new(&args[2]), &args[3])
        }
        "check-config" => {
            if args.len() < 3 {
                eprintln!("Usage: reel check-config <config.toml>");
                process::exit(1);
            }
            check_config(&PathBuf::from(&args[2]))
        }
        _ => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'reel' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn usage() {
    eprintln!("Reel v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: reel <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  inspect <dir> <name>     Show cassette contents");
    eprintln!("  check-config <file>      Validate a TOML configuration");
}

fn inspect(dir: &Path, name: &str) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("Directory not found: {}", dir.display());
    }

    let store = CassetteStore::new(dir, StorageFormat::Json);
    let cassette = store
        .load(name)
        .with_context(|| format!("Failed to load cassette '{name}'"))?;

    println!("Cassette:     {}", cassette.name);
    println!("Version:      {}", cassette.version);
    println!("Recorded at:  {}", cassette.recorded_at.to_rfc3339());
    println!("Interactions: {}", cassette.len());

    for (index, interaction) in cassette.interactions.iter().enumerate() {
        match &interaction.kind {
            InteractionKind::Http { request, response } => {
                println!(
                    "  [{index}] {} {} -> {} ({} bytes)",
                    request.method,
                    request.url,
                    response.status,
                    response.body_len()
                );
            }
            InteractionKind::WebSocket(exchange) => {
                println!(
                    "  [{index}] WS {} ({} messages)",
                    exchange.url,
                    exchange.messages.len()
                );
            }
        }
    }

    let websocket = cassette
        .interactions
        .iter()
        .filter(|i| i.kind.protocol() == Protocol::WebSocket)
        .count();
    if websocket > 0 {
        println!("WebSocket:    {websocket}");
    }

    println!("Cookies:      {}", cassette.cookies.len());
    for cookie in &cassette.cookies {
        println!("  {}", describe_cookie(cookie));
    }

    Ok(())
}

fn describe_cookie(cookie: &Cookie) -> String {
    let mut line = format!("{} (domain={}, path={})", cookie.name, cookie.domain, cookie.path);
    if cookie.is_expired() {
        line.push_str(" [expired]");
    }
    line
}

fn check_config(path: &Path) -> Result<()> {
    let config = EngineConfig::from_file(path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    println!("Configuration OK");
    println!("  cassette_dir: {}", config.cassette_dir.display());
    println!("  format:       {}", config.format.extension());
    println!(
        "  fallback:     {}",
        if config.replay.allow_network_fallback {
            "network"
        } else {
            "none"
        }
    );
    Ok(())
}
