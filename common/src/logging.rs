// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Root logger construction shared by the daemons in this workspace.

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;

/// How log records are rendered.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Unstructured, terminal-friendly text.
    #[default]
    Human,
    /// Bunyan-style JSON, one record per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

fn async_root<D>(drain: D, name: &str) -> slog::Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain)
        .chan_size(32768)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!("name" => name.to_string()))
}

/// Build the root logger for a daemon.  If `log_file` is set, records are
/// appended to that file, otherwise they go to stdout.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let log = match (log_file, log_format) {
        (Some(path), LogFormat::Human) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            let decorator = slog_term::PlainDecorator::new(file);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            async_root(drain, name)
        }
        (Some(path), LogFormat::Json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            let drain = slog_bunyan::with_name(name, file).build().fuse();
            async_root(drain, name)
        }
        (None, LogFormat::Human) => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            async_root(drain, name)
        }
        (None, LogFormat::Json) => {
            let drain = slog_bunyan::with_name(name, std::io::stdout())
                .build()
                .fuse();
            async_root(drain, name)
        }
    };
    Ok(log)
}

/// A synchronous logger that writes through the test harness, so output is
/// captured per test.
pub fn test_logger() -> slog::Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

#[cfg(test)]
mod tests {
    use super::init;
    use super::LogFormat;

    #[test]
    fn test_init_log_file() {
        let path = std::env::temp_dir()
            .join(format!("ovxd-logging-{}.log", std::process::id()));
        let name = Some(path.to_string_lossy().into_owned());
        for format in [LogFormat::Json, LogFormat::Human] {
            let log = init("ovxd", &name, format).unwrap();
            slog::info!(log, "started"; "format" => ?format);
        }
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();

        let missing = Some("/nonexistent/dir/ovxd.log".to_string());
        assert!(init("ovxd", &missing, LogFormat::Json).is_err());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("human".parse::<LogFormat>(), Ok(LogFormat::Human));
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
