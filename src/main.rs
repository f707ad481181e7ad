use clap::Parser as _;
use climate_control::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Read(commands::read::Args),
    Set(commands::set::Args),
    Run(commands::run::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn end_async<E: std::error::Error>(f: impl Future<Output = Result<(), E>>) {
    match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => end(runtime.block_on(f)),
        Err(e) => end(Err(e)),
    }
}

fn main() {
    let filter_description =
        std::env::var("CLIMATE_CONTROL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => return end(Err(e)),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Read(args) => end_async(commands::read::run(args)),
        Commands::Set(args) => end_async(commands::set::run(args)),
        Commands::Run(args) => end_async(commands::run::run(args)),
    }
}
