use std::io::Write;

use clap::Parser;
use tvix_flake_cli::{logging::TracingBuilder, run, Args};

fn main() {
    let args = Args::parse();

    let tracing_handle = match TracingBuilder::default()
        .level(args.log_level)
        .enable_progressbar()
        .build()
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("unable to set up logging: {e}");
            std::process::exit(1);
        }
    };

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("unable to determine the working directory: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&args, &cwd, &mut tracing_handle.get_stdout_writer()) {
        let _ = writeln!(tracing_handle.get_stderr_writer(), "error: {e}");
        std::process::exit(1);
    }
}
