use clap::Parser;

mod cli;
mod commands;

use cli::FstreeCli;
use commands::dispatch;

fn main() {
    let cli = FstreeCli::parse();
    init_tracing(cli.verbose);

    if cli.json {
        fstree_core::set_events_enabled(true);
    }
    if let Some(threads) = cli.threads {
        fstree_core::pool::set_thread_count(threads);
    }

    if let Err(err) = dispatch(&cli) {
        eprintln!("error: {}", format!("{err:#}").to_lowercase());
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = format!("fstree_core={level},fstree={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
