use std::process::ExitCode;

use ord_image::failure_class;
use tracing_subscriber::EnvFilter;

mod workflows;

const LOG_ENV: &str = "ORD_IMAGE_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

pub(crate) fn usage() -> &'static str {
    "Usage:\n  ord-image build [recipe] [--tag <tag>] [--keep-layers]\n  ord-image verify <tag> [recipe]\n  ord-image compare <run_a> <run_b> [recipe]\n  ord-image export <tag> <dir> [recipe]\n  ord-image runs [recipe]\n  ord-image store <status|gc> [recipe]\n  ord-image store prune <keep> [recipe]\n\n`recipe` is an Image.toml path or a directory containing one (default: ./Image.toml)."
}

fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match workflows::dispatch(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            let code = failure_class(&err).map(|f| f.exit_code()).unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
