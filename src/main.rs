use anyhow::{Context, Result};
use clap::Parser;
use modscope::cli::{Cli, Command, ControlCommand};
use modscope::config::Config;
use modscope::decoder;
use modscope::remote::RemoteClient;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; `--debug` raises everything to TRACE
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Write to a file, or to stdout when no path is given
fn write_output(output: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(bytes).context("Failed to write to stdout")?;
            stdout.flush().context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn run_decode(input: &str, output: Option<PathBuf>, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_deref())?;

    let timeline = decoder::decode_source(input, &config.decoder)
        .with_context(|| format!("Failed to decode {}", input))?;
    info!(
        modules = timeline.modules.len(),
        callsites = timeline.callsites.len(),
        calls = timeline.total_calls,
        records = timeline.calls.len(),
        hotspots = timeline.hotspots.len(),
        annotations = timeline.annotations.len(),
        malformed = timeline.malformed_lines,
        duration_ms = timeline.duration,
        "decoded trace"
    );

    let mut json = timeline.to_json().context("Failed to serialize timeline")?;
    json.push('\n');
    write_output(output.as_deref(), json.as_bytes())
}

fn run_control(
    command: ControlCommand,
    url: Option<String>,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
) -> Result<()> {
    let url = match url {
        Some(url) => url,
        None => load_config(config.as_deref())?.remote.base_url(),
    };
    let client = RemoteClient::new(url);
    match command {
        ControlCommand::Start => client.start().context("Remote start failed")?,
        ControlCommand::Stop => client.stop().context("Remote stop failed")?,
        ControlCommand::Exit => client.exit().context("Remote exit failed")?,
        ControlCommand::Trace => {
            let log = client.fetch_trace().context("Remote trace fetch failed")?;
            info!(bytes = log.len(), "fetched trace");
            write_output(output.as_deref(), &log)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    match args.command {
        Command::Decode {
            input,
            output,
            config,
        } => run_decode(&input, output, config),
        Command::Control {
            command,
            url,
            output,
            config,
        } => run_control(command, url, output, config),
    }
}
