//! The renderer command line.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use candela::pipeline::render_file;
use candela::scene::parse_cli_macros;

/// A physically-based offline renderer.
#[derive(Parser, Debug)]
#[command(name = "candela", version, about)]
struct Args {
    /// Compute backend to render on.
    #[arg(short, long, default_value = "cpu")]
    backend: String,

    /// Device index on the chosen backend.
    #[arg(short, long, default_value_t = 0)]
    device: u32,

    /// Macro definitions applied before parsing (`-D key=value`).
    #[arg(short = 'D', long = "define", value_name = "KEY=VALUE")]
    define: Vec<String>,

    /// The scene description file (text DSL or JSON).
    scene: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let macros = match parse_cli_macros(&args.define) {
        Ok(m) => m,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match render_file(&args.backend, args.device, &args.scene, &macros) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
