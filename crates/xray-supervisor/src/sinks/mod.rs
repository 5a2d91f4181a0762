// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only JSON-lines journals fed from the core's stdout.
//!
//! Writes are synchronous: one small `write_all` per record on a local file,
//! done inline on the dispatcher's task. Queries open their own read handle and
//! never hold the journal lock while scanning.

pub mod access;
pub mod core_log;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::errors::SinkError;

pub use self::access::{AccessSink, ConnectionRecord, Protocol, UNKNOWN_USER};
pub use self::core_log::{CoreLogLine, CoreSink};

const JOURNAL_LEVEL: &str = "INFO";

/// Destination for one raw line of core output.
pub trait LineSink: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), SinkError>;
}

/// Source of the most recent raw line the core printed.
pub trait LastLogProvider: Send + Sync {
    fn last_log(&self) -> String;
}

#[derive(Serialize)]
struct JournalEntry<'a, T: Serialize> {
    time: String,
    level: &'static str,
    msg: &'a str,
    #[serde(flatten)]
    fields: &'a T,
}

/// Open journal file. Callers serialize access through their own lock.
#[derive(Debug)]
pub(crate) struct JournalFile {
    path: PathBuf,
    file: File,
}

impl JournalFile {
    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the journal with an empty file at the same path.
    pub(crate) fn rotate(&mut self) -> Result<(), SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| SinkError::Open {
                path: self.path.clone(),
                source,
            })?;
        self.file = file;
        Ok(())
    }

    /// Appends one record as a single newline terminated JSON object.
    pub(crate) fn append<T: Serialize>(&mut self, msg: &str, fields: &T) -> Result<(), SinkError> {
        let entry = JournalEntry {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: JOURNAL_LEVEL,
            msg,
            fields,
        };
        let mut line = serde_json::to_vec(&entry).map_err(SinkError::Encode)?;
        line.push(b'\n');
        self.file.write_all(&line).map_err(SinkError::Write)
    }
}
