use anyhow::Context;
use clap::Parser;

use microbox::cli::Cli;
use microbox::supervisor::Supervisor;
use microbox::logging;

fn main() {
    std::process::exit(run());
}

/// Returns the process exit code directly (`spec.md` §6: 1 on argument
/// errors, 127 propagated through the child's normal exit path, `128+signal`
/// on signal death, otherwise the sandboxed command's own exit status) —
/// std's `fn main() -> Result<...>` can only ever produce 0 or 1, which
/// isn't enough for this CLI's exit code contract, so `main` calls
/// `std::process::exit` on a plain `i32` instead.
fn run() -> i32 {
    let raw_args: Vec<String> = std::env::args().collect();

    // `Cli::try_parse` first: clap handles `--help`/`--version` itself (exit
    // 0, per `spec.md` §6) before this CLI's own `--` requirement is ever
    // checked, so `microbox --help` (which carries no bare `--`) doesn't fall
    // into the "missing delimiter" error path below.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap already renders `--help`/`--version` and usage errors;
            // we only normalize the exit code to this CLI's own contract.
            let code = if e.exit_code() == 0 { 0 } else { 1 };
            e.print().ok();
            return code;
        }
    };

    if let Err(e) = Cli::require_delimiter(&raw_args) {
        eprintln!("microbox: {e}");
        eprintln!("usage: microbox [options] -- <cmd> [args...]");
        return 1;
    }

    logging::init();

    let quiet = cli.quiet;
    let opts = match cli.into_options() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("microbox: {e}");
            eprintln!("usage: microbox [options] -- <cmd> [args...]");
            return 1;
        }
    };

    if !quiet {
        println!("{opts:#?}");
    }

    let supervisor = Supervisor::default();

    let process = match supervisor.spawn(&opts).context("spawn failed") {
        Ok(process) => process,
        Err(e) => {
            eprintln!("microbox: {e:#}");
            return 1;
        }
    };

    match supervisor.wait(&process).context("wait failed") {
        Ok(status) => status,
        Err(e) => {
            eprintln!("microbox: {e:#}");
            1
        }
    }
}
