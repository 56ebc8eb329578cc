//! verirun command line
//!
//! Prints exactly one `RESULT:` line on stdout followed by the
//! `INFO: Total time elapsed` trailer. Everything else goes to stderr.

mod args;

use std::process::ExitCode;
use std::time::Instant;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use verirun_core::{
    resolve_environment, AmbientEnv, BackendRegistry, RunConfiguration, Supervisor,
    SupervisorError,
};

use crate::args::Cli;

/// Exit code for configuration errors, including unparsable arguments
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let start = Instant::now();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let informational = matches!(
                e.kind(),
                ErrorKind::DisplayHelp
                    | ErrorKind::DisplayVersion
                    | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            );
            e.print()?;
            if informational {
                return Ok(ExitCode::SUCCESS);
            }
            print_result("RESULT: ERROR(invalid arguments)", start);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    init_logging(cli.log_level());

    let code = run(cli, start).await?;
    Ok(ExitCode::from(code))
}

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, start: Instant) -> anyhow::Result<u8> {
    if cli.version_short {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    // Nothing below may touch the filesystem before the name is known good
    let backend = match BackendRegistry::lookup(&cli.verifier) {
        Ok(backend) => backend,
        Err(e) => return Ok(fail(&SupervisorError::from(e), start)),
    };
    let config = match cli.to_config(backend) {
        Ok(config) => config,
        Err(e) => return Ok(fail(&SupervisorError::from(e), start)),
    };

    if cli.is_info_command() {
        return info_command(&cli, config, start).await;
    }

    let supervisor = match Supervisor::prepare(config, AmbientEnv::capture()) {
        Ok(supervisor) => supervisor,
        Err(e) => return Ok(fail(&e, start)),
    };

    match supervisor.run().await {
        Ok(report) => {
            if let Some(description) = &report.violation_description {
                println!("{}", description.trim_end());
            }
            print_result(&report.outcome.result_line(), start);
            Ok(exit_code(report.outcome.exit_code()))
        }
        Err(e) => Ok(fail(&e, start)),
    }
}

/// `--version`, `--dump-config`, `--dump-env` and `--dump-env-cmd`
async fn info_command(cli: &Cli, config: RunConfiguration, start: Instant) -> anyhow::Result<u8> {
    let (config, adapter) = match BackendRegistry::instantiate(config) {
        Ok(instantiated) => instantiated,
        Err(e) => return Ok(fail(&SupervisorError::from(e), start)),
    };

    if cli.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(0);
    }

    let env = resolve_environment(&config, adapter.as_ref(), AmbientEnv::capture());

    if cli.version {
        println!("verirun {}", env!("CARGO_PKG_VERSION"));
        let backend_version = match &env {
            Ok(env) => adapter.version_info(env).await,
            Err(_) => None,
        };
        println!(
            "{}: {}",
            adapter.name(),
            backend_version.as_deref().unwrap_or("not available")
        );
        return Ok(0);
    }

    match env {
        Ok(env) => {
            print!("{}", env.dump(cli.dump_env_cmd));
            Ok(0)
        }
        Err(e) => Ok(fail(&SupervisorError::from(e), start)),
    }
}

/// Report a fatal error on the stdout contract and return its exit code
fn fail(err: &SupervisorError, start: Instant) -> u8 {
    error!("{}", err);
    print_result(&format!("RESULT: ERROR({})", err.verdict_message()), start);
    exit_code(err.exit_code())
}

fn print_result(line: &str, start: Instant) {
    println!("{line}");
    println!("INFO: Total time elapsed: {:.1}", start.elapsed().as_secs_f64());
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
