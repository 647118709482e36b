//! Entry point: parse flags, wire logging/error reporting, build the initial
//! server set, and run the chat REPL — spec §6.
//!
//! Grounded on `chat-cli`'s `main.rs` (`color_eyre::install()` before
//! anything else, `tracing_subscriber::EnvFilter` driven by a verbosity
//! flag) and on `cli.py`'s top-level `main()` (`input("> ")` loop printing
//! the orchestrator's reply each turn, `Ctrl-D`/EOF as the quit signal).

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use oneshot_mcp::config::{self, Cli};
use oneshot_mcp::orchestrator::Orchestrator;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    color_eyre::install().expect("color_eyre installs exactly once at startup");

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let smithery_key = match config::require_smithery_key(&cli) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(1);
        },
    };

    let servers = match config::merge_servers(&cli) {
        Ok(servers) => servers,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        },
    };

    if cli.verbose {
        println!("[BUILD] starting with {} configured server(s)", servers.len());
    }

    let model: Arc<dyn oneshot_mcp::model::ChatModel> = Arc::from(oneshot_mcp::model::build_model(&cli.model, None));
    let mut orchestrator =
        Orchestrator::new(model, servers, smithery_key, cli.instructions.clone(), cli.verbose);

    run_repl(&mut orchestrator).await;
    ExitCode::SUCCESS
}

async fn run_repl(orchestrator: &mut Orchestrator) {
    use std::io::Write;

    println!("oneshot-mcp ready with {} server(s). Ctrl-D to quit.", orchestrator.server_count());

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            println!();
            break;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match orchestrator.chat(line).await {
            Ok(reply) => println!("{reply}"),
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
}
