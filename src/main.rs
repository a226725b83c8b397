use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

use lc3vm::vm::Vm;

#[derive(Parser)]
#[command(version, author, about)]
struct Opt {
    /// Object image to execute
    #[arg(value_hint = clap::ValueHint::FilePath)]
    image: PathBuf,

    /// Increase the level of verbosity. Can be used multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Opt {
    const fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            3..=u8::MAX => "trace",
        }
    }
}

fn main() {
    // First, parse the arguments
    let opt = Opt::parse();

    // Parse the log level from the env, or infer it from the args.
    // Diagnostics go to stderr; stdout belongs to the guest program.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(opt.log_filter()))
        .unwrap();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();

    let image = match std::fs::read(&opt.image) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("reading {}: {e}", opt.image.display());
            exit(1);
        }
    };

    let vm = Vm::stdio();
    if let Err(e) = vm.start(&image) {
        error!("{e}");
        exit(1);
    }
}
