//! m2mdec
//!
//! Decodes a video file on a V4L2 memory-to-memory hardware decoder (the
//! Samsung MFC by default), and probes or lists the video nodes involved.
//!
//! Exit status is 0 on success. A failed session exits with a status that
//! names the stage it failed in: 2 device resolution, 3 format negotiation,
//! 4 buffer setup, 5 streaming. Anything else exits with 1.

mod sink;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use m2m_common::{DecoderConfig, Scheduling, SessionError, Stage};
use m2m_decoder::resolver::{DeviceKind, DeviceResolver, DriverPattern, Role};
use m2m_decoder::{decode, DecodeStats};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::sink::{CountingSink, RawFileSink};

/// m2mdec - hardware video decoding through V4L2 memory-to-memory devices
#[derive(Parser, Debug)]
#[command(name = "m2mdec")]
#[command(about = "Hardware video decoding through a V4L2 memory-to-memory device")]
#[command(version)]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Substring the decoder's driver name must contain
    #[arg(long, global = true)]
    driver: Option<String>,

    /// Directory of video-class device entries
    #[arg(long, global = true)]
    sysfs_dir: Option<PathBuf>,

    /// Directory holding the device special files
    #[arg(long, global = true)]
    dev_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a file to end of stream
    Decode(DecodeArgs),
    /// Look for the decoder, color converter and display nodes
    Probe,
    /// List video nodes and their drivers
    Devices,
}

#[derive(clap::Args, Debug)]
struct DecodeArgs {
    /// Compressed video file (elementary stream, or any container with the
    /// `ffmpeg` feature)
    file: PathBuf,

    /// Write decoded planes back to back into this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Drive both queues from a single thread
    #[arg(long)]
    polled: bool,

    /// Compressed-stream buffers to request
    #[arg(long)]
    input_buffers: Option<u32>,

    /// Size of each compressed-stream buffer in bytes
    #[arg(long)]
    input_buffer_size: Option<u32>,

    /// Decoded-picture buffers on top of the driver minimum
    #[arg(long)]
    extra_output_buffers: Option<u32>,

    /// Poll timeout in milliseconds (negative waits forever, 0 never blocks)
    #[arg(long, allow_negative_numbers = true)]
    timeout_ms: Option<i64>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Config file (or defaults) with the global flags applied.
fn load_config(args: &Args) -> anyhow::Result<DecoderConfig> {
    let mut config = match &args.config {
        Some(path) => DecoderConfig::from_json_file(path)?,
        None => DecoderConfig::default(),
    };
    if let Some(driver) = &args.driver {
        config.driver = driver.clone();
    }
    if let Some(dir) = &args.sysfs_dir {
        config.sysfs_dir = dir.clone();
    }
    if let Some(dir) = &args.dev_dir {
        config.dev_dir = dir.clone();
    }
    Ok(config)
}

impl DecodeArgs {
    fn apply(&self, config: &mut DecoderConfig) {
        if self.polled {
            config.scheduling = Scheduling::Polled;
        }
        if let Some(n) = self.input_buffers {
            config.input_buffers = n;
        }
        if let Some(n) = self.input_buffer_size {
            config.input_buffer_size = n;
        }
        if let Some(n) = self.extra_output_buffers {
            config.extra_output_buffers = n;
        }
        if let Some(ms) = self.timeout_ms {
            config.poll_timeout_ms = ms;
        }
    }
}

fn run_decode(resolver: &DeviceResolver, mut config: DecoderConfig, args: &DecodeArgs) -> anyhow::Result<()> {
    args.apply(&mut config);

    let mut demuxer = m2m_demux::open_demuxer(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;
    info!(
        file = %args.file.display(),
        codec = demuxer.codec_id().display_name(),
        header_bytes = demuxer.extradata().len(),
        "Input opened"
    );

    let device = resolver.open(&DriverPattern::new(config.driver.as_str()), DeviceKind::M2m)?;

    let started = Instant::now();
    let stats: DecodeStats = match &args.output {
        Some(path) => {
            let mut sink = RawFileSink::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            decode(device, demuxer.as_mut(), &mut sink, &config)?
        }
        None => decode(device, demuxer.as_mut(), &mut CountingSink::default(), &config)?,
    };
    let elapsed = started.elapsed();

    let fps = stats.frames_out as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{}: {} frames in ({} bytes), {} frames out, {} corrupted, {:.2?} ({:.1} fps)",
        args.file.display(),
        stats.frames_in,
        stats.bytes_in,
        stats.frames_out,
        stats.corrupted,
        elapsed,
        fps
    );
    Ok(())
}

fn run_probe(resolver: &DeviceResolver) -> anyhow::Result<()> {
    let report = resolver.probe().context("enumerating video nodes")?;
    for role in Role::ALL {
        match report.get(role) {
            Some(node) => println!(
                "{role:?}: {} (driver {}, card {})",
                node.device_path.display(),
                node.driver,
                node.card
            ),
            None => println!("{role:?}: not found"),
        }
    }
    if report.all_found() {
        return Ok(());
    }
    let missing: Vec<String> = Role::ALL
        .into_iter()
        .filter(|r| report.get(*r).is_none())
        .map(|r| r.pattern().to_string())
        .collect();
    Err(SessionError::DeviceNotFound {
        driver: missing.join(", "),
    }
    .into())
}

fn list_devices(resolver: &DeviceResolver) -> anyhow::Result<()> {
    for node in resolver.nodes().context("enumerating video nodes")? {
        println!("{}\t{}\t{}", node.name, node.device_path.display(), node.driver);
    }
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let resolver = DeviceResolver::from_config(&config);
    match &args.command {
        Command::Decode(decode_args) => run_decode(&resolver, config, decode_args),
        Command::Probe => run_probe(&resolver),
        Command::Devices => list_devices(&resolver),
    }
}

fn exit_code(stage: Stage) -> u8 {
    match stage {
        Stage::Resolution => 2,
        Stage::FormatNegotiation => 3,
        Stage::BufferSetup => 4,
        Stage::Streaming => 5,
    }
}

/// Stage of the first session error in the chain, if any.
fn failed_stage(err: &anyhow::Error) -> Option<Stage> {
    err.chain()
        .find_map(|e| e.downcast_ref::<SessionError>())
        .map(SessionError::stage)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match failed_stage(&err) {
            Some(stage) => {
                eprintln!("m2mdec: {stage} failed: {err:#}");
                ExitCode::from(exit_code(stage))
            }
            None => {
                eprintln!("m2mdec: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn decode_flags_override_config() {
        let args = Args::try_parse_from([
            "m2mdec",
            "--driver",
            "hantro",
            "decode",
            "clip.h264",
            "--polled",
            "--timeout-ms",
            "-1",
            "--input-buffers",
            "8",
        ])
        .unwrap();
        let mut config = load_config(&args).unwrap();
        let Command::Decode(decode_args) = &args.command else {
            panic!("expected decode");
        };
        decode_args.apply(&mut config);

        assert_eq!(config.driver, "hantro");
        assert_eq!(config.scheduling, Scheduling::Polled);
        assert_eq!(config.poll_timeout_ms, -1);
        assert_eq!(config.input_buffers, 8);
        assert_eq!(config.input_buffer_size, DecoderConfig::default().input_buffer_size);
    }

    #[test]
    fn flags_win_over_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "driver": "from-file", "dev_dir": "/tmp/dev" }}"#).unwrap();
        let path = file.path().to_str().unwrap();

        let args = Args::try_parse_from(["m2mdec", "devices", "--config", path, "--driver", "from-flag"]).unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.driver, "from-flag");
        assert_eq!(config.dev_dir, PathBuf::from("/tmp/dev"));
    }

    #[test]
    fn session_errors_map_to_stage_exit_codes() {
        let err = anyhow::Error::from(SessionError::NothingQueued("input")).context("decoding clip.h264");
        assert_eq!(failed_stage(&err), Some(Stage::BufferSetup));
        assert_eq!(exit_code(Stage::BufferSetup), 4);
        assert_eq!(failed_stage(&anyhow::anyhow!("bad input")), None);
    }
}
