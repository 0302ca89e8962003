//! Tracing bootstrap shared by devbox entry points.
//!
//! Settings come from `DEVBOX_LOG_*` environment variables or from the orchestrator
//! configuration. Output goes to the console, a daily-rolling file, or both.

use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry, EnvFilter};

const DEFAULT_LOG_FILE: &str = "/var/log/devbox/devbox.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

impl FromStr for LogOutput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" => Ok(LogOutput::Both),
            other => Err(format!("unknown log output '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LogSettings {
    /// Read `DEVBOX_LOG_LEVEL`, `DEVBOX_LOG_FORMAT`, `DEVBOX_LOG_OUTPUT` and
    /// `DEVBOX_LOG_FILE`, falling back to defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var("DEVBOX_LOG_LEVEL").unwrap_or(defaults.level),
            format: env::var("DEVBOX_LOG_FORMAT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.format),
            output: env::var("DEVBOX_LOG_OUTPUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.output),
            file_path: env::var("DEVBOX_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }
}

// Writes every record to both sinks when console and file output are enabled.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for directive in ["tokio=warn", "hyper=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber. The returned guard must be kept alive for file
/// output to be flushed. Installing twice is a no-op.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = registry().with(env_filter(&settings.level));
    let is_json = settings.format == LogFormat::Json;

    let log_dir = settings
        .file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let log_filename = settings
        .file_path
        .file_name()
        .unwrap_or("devbox.log".as_ref());

    match settings.output {
        LogOutput::Console => {
            let layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);
            if is_json {
                let _ = subscriber.with(layer.json()).try_init();
            } else {
                let _ = subscriber.with(layer.pretty()).try_init();
            }
            None
        }
        LogOutput::File => {
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            if is_json {
                let _ = subscriber.with(layer.json()).try_init();
            } else {
                let _ = subscriber.with(layer).try_init();
            }
            Some(guard)
        }
        LogOutput::Both => {
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let tee = MakeTee {
                make_a: io::stdout,
                make_b: writer,
            };
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(tee);
            if is_json {
                let _ = subscriber.with(layer.json()).try_init();
            } else {
                let _ = subscriber.with(layer).try_init();
            }
            Some(guard)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_format_and_output() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Human));
        assert!("xml".parse::<LogFormat>().is_err());

        assert_eq!("both".parse::<LogOutput>(), Ok(LogOutput::Both));
        assert_eq!("stdout".parse::<LogOutput>(), Ok(LogOutput::Console));
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    #[serial]
    fn test_settings_from_env() {
        env::set_var("DEVBOX_LOG_LEVEL", "debug");
        env::set_var("DEVBOX_LOG_FORMAT", "json");
        env::set_var("DEVBOX_LOG_OUTPUT", "nonsense");
        env::set_var("DEVBOX_LOG_FILE", "/tmp/devbox-test.log");

        let settings = LogSettings::from_env();
        assert_eq!(settings.level, "debug");
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.output, LogOutput::Console);
        assert_eq!(settings.file_path, PathBuf::from("/tmp/devbox-test.log"));

        for key in [
            "DEVBOX_LOG_LEVEL",
            "DEVBOX_LOG_FORMAT",
            "DEVBOX_LOG_OUTPUT",
            "DEVBOX_LOG_FILE",
        ] {
            env::remove_var(key);
        }
        assert_eq!(LogSettings::from_env(), LogSettings::default());
    }

    #[test]
    #[serial]
    fn test_init_twice_is_harmless() {
        let settings = LogSettings::default();
        assert!(init_subscriber(&settings).is_none());
        assert!(init_subscriber(&settings).is_none());
        tracing::info!(workspace_id = "ws-1", "subscriber installed");
    }

    #[test]
    fn test_tee_writes_both_sinks() {
        let mut tee = Tee {
            a: Vec::new(),
            b: Vec::new(),
        };
        tee.write_all(b"line\n").unwrap();
        tee.flush().unwrap();
        assert_eq!(tee.a, b"line\n");
        assert_eq!(tee.b, b"line\n");
    }
}
