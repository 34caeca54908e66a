//! `ghe-backup`: take a snapshot of the configured appliance.

use backup_snapshot::process::shutdown::ShutdownCoordinator;
use backup_snapshot::utils::logger;
use backup_snapshot::{BackupError, ConfigBootstrap, Orchestrator};
use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "ghe-backup",
    version,
    about = "Take an incremental snapshot of a GitHub Enterprise appliance",
    long_about = None
)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn fail(err: &BackupError) -> ExitCode {
    eprintln!("Error: {err}");
    ExitCode::from(err.exit_code())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config = match ConfigBootstrap::from_process().verbose(args.verbose).load() {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };
    if let Err(e) = logger::init(config.log_level(), &config.verbose_channel()) {
        eprintln!("Warning: {e:#}");
    }

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.listen();

    let orchestrator = Orchestrator::new(config, shutdown.token());
    let result = orchestrator.run().await;

    shutdown.shutdown();
    let _ = listener.await;

    match result {
        Ok(report) if report.succeeded() => {
            println!("{}", report.summary());
            ExitCode::SUCCESS
        }
        Ok(report) => {
            eprintln!("{}", report.summary());
            ExitCode::FAILURE
        }
        Err(e) => fail(&e),
    }
}
