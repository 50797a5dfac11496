//! lsmkv interactive shell
//!
//! Opens a tree and reads commands from stdin:
//! `put <key> <value>`, `get <key>`, `stats`, `wait`, `exit`.

use anyhow::{Context, Result};
use clap::Parser;
use lsmkv::{Tree, TreeConfig};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "lsmkv-cli")]
#[command(about = "Interactive shell for an lsmkv tree", version)]
struct Cli {
    /// Tree directory
    #[arg(short, long, default_value = "./lsmkv_data")]
    dir: PathBuf,

    /// SSTable size threshold in bytes
    #[arg(long)]
    sst_size: Option<u64>,

    /// Number of levels
    #[arg(long)]
    max_level: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = TreeConfig::new(&cli.dir);
    if let Some(sst_size) = cli.sst_size {
        config = config.with_sst_size(sst_size);
    }
    if let Some(max_level) = cli.max_level {
        config = config.with_max_level(max_level);
    }

    let tree = Tree::open(config)
        .with_context(|| format!("failed to open tree at {}", cli.dir.display()))?;

    println!("lsmkv v{}", VERSION);
    println!("Directory: {}", cli.dir.display());
    println!("Commands: put <key> <value> | get <key> | stats | wait | exit\n");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("lsmkv> ");
        io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match execute(&tree, line.trim()) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => break,
            Err(e) => println!("Error: {:#}", e),
        }
    }

    tree.close().context("failed to close tree")?;
    Ok(())
}

enum Flow {
    Continue,
    Exit,
}

fn execute(tree: &Tree, line: &str) -> Result<Flow> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();

    match command {
        "" => {}
        "put" => {
            let (key, value) = match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => (key, value.trim_start()),
                _ => anyhow::bail!("usage: put <key> <value>"),
            };
            tree.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        "get" => {
            let key = parts.next().context("usage: get <key>")?;
            match tree.get(key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(not found)"),
            }
        }
        "stats" => {
            println!("{}", serde_json::to_string_pretty(&tree.stats())?);
        }
        "wait" => {
            if tree.wait_idle(Duration::from_secs(60)) {
                println!("idle");
            } else {
                println!("background work still running");
            }
        }
        "exit" | "quit" => return Ok(Flow::Exit),
        other => anyhow::bail!("unknown command: {}", other),
    }
    Ok(Flow::Continue)
}
