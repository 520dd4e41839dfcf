use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use segfetch_core::checksum::{digest_file, verify_checksum, ChecksumRequest, ChecksumType};
use segfetch_core::format::{size_format, status_name};
use segfetch_core::net::VERBOSE_LOG_LEVEL;
use segfetch_core::{
    plan, segment_size, segment_size_str, split, ByteRange, HeaderMapping, HttpTransport,
    LogHandle, LogPipeline, Settings,
};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

#[derive(Parser, Debug)]
#[command(name = "segfetch", version, about = "Segmented download planning and probing")]
struct Cli {
    /// Proxy URL; empty disables proxying
    #[arg(long, global = true)]
    proxy: Option<String>,
    /// Fixed referer instead of automatic referer on redirect
    #[arg(long, global = true)]
    referer: Option<String>,
    #[arg(long, global = true)]
    user: Option<String>,
    #[arg(long, global = true)]
    password: Option<String>,
    /// Netscape cookie file to send cookies from
    #[arg(long, global = true)]
    cookies: Option<PathBuf>,
    /// Directory holding log.txt
    #[arg(long, global = true)]
    settings_dir: Option<PathBuf>,
    /// Raise verbosity; -vv and above enables wire tracing
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a size into fixed-size parts
    Split { size: u64, part_size: u64 },
    /// Plan ranges for a file under the connection cap
    Plan {
        size: u64,
        #[arg(long)]
        segment_size: Option<u64>,
        #[arg(long)]
        max_connections: Option<u32>,
    },
    /// Byte count of a `start-end` range
    SegSize { range: String },
    /// Fetch response headers only
    Probe {
        url: String,
        /// Extra header as `Name: value`; replaces the default header set
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Download a URL, or one range of it
    Fetch {
        url: String,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        range: Option<ByteRange>,
        #[arg(long)]
        sha256: Option<String>,
    },
    /// Hex digest of a file
    Digest {
        path: PathBuf,
        #[arg(long, default_value = "sha256")]
        kind: String,
    },
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = Settings::from_env();
        if let Some(proxy) = &self.proxy {
            settings.proxy = proxy.clone();
        }
        if let Some(referer) = &self.referer {
            settings.referer_url = referer.clone();
        }
        if let Some(user) = &self.user {
            settings.username = user.clone();
        }
        if let Some(password) = &self.password {
            settings.password = password.clone();
        }
        if let Some(path) = &self.cookies {
            settings.use_cookies = true;
            settings.cookie_file_path = path.clone();
        }
        if let Some(dir) = &self.settings_dir {
            settings.settings_folder = dir.clone();
        }
        settings.log_level = settings.log_level.saturating_add(self.verbose);
        settings
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings();

    let terminate = Arc::new(AtomicBool::new(false));
    let mut pipeline = LogPipeline::to_file(settings.log_file())
        .with_terminate_flag(Arc::clone(&terminate))
        .with_level(settings.log_level);
    pipeline
        .start()
        .with_context(|| format!("cannot start log at {}", settings.log_file().display()))?;
    init_tracing(pipeline.handle(), settings.log_level)?;

    let result = run(cli.command, &settings, &pipeline.handle());

    terminate.store(true, Ordering::SeqCst);
    pipeline.shutdown();
    result
}

/// Console and log-file filters for a verbosity level. Wire tracing,
/// including the client's `log` records, only goes to the log file.
fn log_filters(log_level: u8) -> (LevelFilter, LevelFilter) {
    match log_level {
        0 | 1 => (LevelFilter::WARN, LevelFilter::WARN),
        2 => (LevelFilter::INFO, LevelFilter::INFO),
        level if level < VERBOSE_LOG_LEVEL => (LevelFilter::DEBUG, LevelFilter::DEBUG),
        _ => (LevelFilter::DEBUG, LevelFilter::TRACE),
    }
}

fn init_tracing(handle: LogHandle, log_level: u8) -> Result<()> {
    let (console_level, file_level) = log_filters(log_level);

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(console_level);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(handle)
        .with_filter(file_level);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

fn run(command: Command, settings: &Settings, log: &LogHandle) -> Result<()> {
    match command {
        Command::Split { size, part_size } => {
            for (index, range) in split(size, part_size).iter().enumerate() {
                println!("{}\t{}\t{}", index, range, segment_size(range));
            }
        }
        Command::Plan {
            size,
            segment_size: seg,
            max_connections,
        } => {
            let ranges = plan(
                size,
                seg.unwrap_or(settings.segment_size),
                max_connections.unwrap_or(settings.max_connections),
            );
            for (index, range) in ranges.iter().enumerate() {
                match range {
                    Some(range) => println!(
                        "{}\t{}\t{}",
                        index,
                        range,
                        size_format(segment_size(range))
                    ),
                    None => println!("{}\twhole file", index),
                }
            }
        }
        Command::SegSize { range } => println!("{}", segment_size_str(&range)),
        Command::Probe { url, headers, json } => {
            let overrides = parse_headers(&headers)?;
            let transport = HttpTransport::new(settings.request_options())?;
            let result = transport.probe(&url, overrides.as_ref());
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "{} {} {}",
                    result.status_code,
                    status_name(result.status_code),
                    result.effective_url
                );
                let mut names: Vec<&String> = result.headers.keys().collect();
                names.sort();
                for name in names {
                    println!("{}: {}", name, result.headers[name]);
                }
                if let Some(diagnostic) = &result.diagnostic {
                    eprintln!("warning: {}", diagnostic);
                }
            }
        }
        Command::Fetch {
            url,
            output,
            range,
            sha256,
        } => {
            let transport = HttpTransport::new(settings.request_options())?;
            let file = File::create(&output)
                .with_context(|| format!("cannot create {}", output.display()))?;
            let mut writer = BufWriter::new(file);
            let written = transport.fetch_range(&url, range, &mut writer, None)?;
            writer.flush()?;
            log.log(&format!("fetched {} into {}", url, output.display()));
            info!("{} written to {}", size_format(written), output.display());

            if let Some(expected) = sha256 {
                let req = ChecksumRequest {
                    checksum_type: ChecksumType::Sha256,
                    expected_hex: expected,
                };
                if !verify_checksum(&output, &req) {
                    bail!("checksum mismatch for {}", output.display());
                }
                println!("checksum ok");
            }
        }
        Command::Digest { path, kind } => {
            let Some(kind) = ChecksumType::from_str(&kind) else {
                bail!("unknown digest {}", kind);
            };
            println!("{}  {}", digest_file(&path, kind)?, path.display());
        }
    }
    Ok(())
}

fn parse_headers(raw: &[String]) -> Result<Option<HeaderMapping>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut headers = HeaderMapping::new();
    for item in raw {
        let Some((name, value)) = item.split_once(':') else {
            bail!("header must look like `Name: value`, got {:?}", item);
        };
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(Some(headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn header_arguments() {
        assert!(parse_headers(&[]).expect("empty").is_none());
        let headers = parse_headers(&["X-Token: abc".to_string()])
            .expect("parse")
            .expect("some");
        assert_eq!(headers.get("X-Token").map(String::as_str), Some("abc"));
        assert!(parse_headers(&["broken".to_string()]).is_err());
    }

    #[test]
    fn flags_override_environment_settings() {
        let cli = Cli::parse_from([
            "segfetch",
            "--proxy",
            "",
            "--user",
            "bob",
            "-vv",
            "plan",
            "1000",
        ]);
        let settings = cli.settings();
        assert_eq!(settings.proxy, "");
        assert_eq!(settings.username, "bob");
        assert!(settings.log_level >= 2);
    }

    #[test]
    fn wire_level_reaches_log_file_only() {
        assert_eq!(log_filters(1), (LevelFilter::WARN, LevelFilter::WARN));
        assert_eq!(log_filters(2), (LevelFilter::INFO, LevelFilter::INFO));
        assert_eq!(log_filters(3), (LevelFilter::DEBUG, LevelFilter::DEBUG));
        assert_eq!(log_filters(4), (LevelFilter::DEBUG, LevelFilter::TRACE));
        assert_eq!(log_filters(9).1, LevelFilter::TRACE);
    }

    #[test]
    fn range_argument_uses_text_form() {
        let cli = Cli::parse_from([
            "segfetch",
            "fetch",
            "http://example.com/f",
            "-o",
            "/tmp/f",
            "--range",
            "0-99",
        ]);
        match cli.command {
            Command::Fetch { range, .. } => assert_eq!(range, Some(ByteRange::new(0, 99))),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
