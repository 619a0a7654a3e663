//! Dumps the HTTP API description so clients can be generated without a
//! running gateway.
//!
//!   generate_openapi                         pretty JSON on stdout
//!   generate_openapi --compact               single-line JSON on stdout
//!   generate_openapi --output docs/api.json  write to a file, creating
//!                                            missing parent directories

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use home_energy_service::api::handlers::ApiDoc;
use utoipa::OpenApi;

#[derive(Debug, Default, PartialEq)]
struct Options {
    output: Option<PathBuf>,
    compact: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Options> {
    let mut options = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--compact" => options.compact = true,
            "--output" | "-o" => {
                let path = args.next().context("--output needs a file path")?;
                options.output = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(options)
}

fn render(compact: bool) -> Result<String> {
    let doc = ApiDoc::openapi();
    let json = if compact { doc.to_json() } else { doc.to_pretty_json() };
    json.context("failed to serialise the API document")
}

fn main() -> Result<()> {
    let options = parse_args(std::env::args().skip(1))?;
    let json = render(options.compact)?;

    match options.output {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("API document written to {}", path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(json.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}
