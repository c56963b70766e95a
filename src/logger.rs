// Copyright 2024 the skiff authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File-backed sink for the `log` facade with day and line-count rollover.
//!
//! Synchronous mode writes each formatted line under the sink mutex.
//! Asynchronous mode (queue capacity > 0) pushes lines onto a
//! [`BlockingQueue`] drained by one writer thread; a full queue falls back
//! to a synchronous write of that line, so logging never blocks the caller
//! for long. FIFO holds per producer; cross-producer order is queue arrival
//! order.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Datelike, Local};
use log::{LevelFilter, Metadata, Record};

use crate::queue::BlockingQueue;

/// A log file is split once it reaches this many lines.
const MAX_LINES: u64 = 50_000;

struct SinkState {
    file: File,
    dir: PathBuf,
    suffix: String,
    line_count: u64,
    day: u32,
}

impl SinkState {
    fn file_name(dir: &Path, now: &DateTime<Local>, part: Option<u64>, suffix: &str) -> PathBuf {
        let tail = now.format("%Y_%m_%d");
        match part {
            Some(k) => dir.join(format!("{tail}-{k}{suffix}")),
            None => dir.join(format!("{tail}{suffix}")),
        }
    }

    fn open(dir: &Path, now: &DateTime<Local>, part: Option<u64>, suffix: &str) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_name(dir, now, part, suffix))
    }

    /// Switches files when the day changed or the current file is out of
    /// lines.
    fn rollover(&mut self, now: &DateTime<Local>) {
        let split = self.line_count > 0 && self.line_count % MAX_LINES == 0;
        if self.day == now.day() && !split {
            return;
        }
        let part = if self.day == now.day() {
            Some(self.line_count / MAX_LINES)
        } else {
            self.day = now.day();
            self.line_count = 0;
            None
        };
        let _ = self.file.flush();
        match Self::open(&self.dir, now, part, &self.suffix) {
            Ok(file) => self.file = file,
            Err(e) => eprintln!("log rollover failed: {e}"),
        }
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = self.file.write_all(line.as_bytes()) {
            eprintln!("log write failed: {e}");
        }
    }
}

struct LogInner {
    level: LevelFilter,
    state: Mutex<SinkState>,
    queue: Option<Arc<BlockingQueue<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl LogInner {
    fn write(&self, level: log::Level, args: fmt::Arguments<'_>) {
        let now = Local::now();
        let line = format!(
            "{} {}{}\n",
            now.format("%Y-%m-%d %H:%M:%S.%6f"),
            level_tag(level),
            args
        );

        let mut state = self.state.lock().unwrap();
        state.rollover(&now);
        state.line_count += 1;
        match &self.queue {
            Some(queue) if !queue.is_full() => {
                drop(state);
                // a racing fill-up just means this line degrades to sync
                if let Err(line) = queue.push_back(line) {
                    self.state.lock().unwrap().write_line(&line);
                }
            }
            _ => state.write_line(&line),
        }
    }

    fn flush(&self) {
        if let Some(queue) = &self.queue {
            queue.flush();
        }
        let mut state = self.state.lock().unwrap();
        let _ = state.file.flush();
    }
}

fn level_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "[error]: ",
        log::Level::Warn => "[warn] : ",
        log::Level::Info => "[info] : ",
        log::Level::Debug | log::Level::Trace => "[debug]: ",
    }
}

/// Handle to the log sink; clone freely, shut down once.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LogInner>,
}

impl Logger {
    /// Opens today's log file under `dir` (created 0777 when missing) and,
    /// for `queue_capacity > 0`, starts the async writer thread.
    pub fn init<P: Into<PathBuf>>(
        level: LevelFilter,
        dir: P,
        suffix: &str,
        queue_capacity: usize,
    ) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(&dir)?;

        let now = Local::now();
        let state = SinkState {
            file: SinkState::open(&dir, &now, None, suffix)?,
            dir,
            suffix: suffix.to_string(),
            line_count: 0,
            day: now.day(),
        };

        let queue = if queue_capacity > 0 {
            Some(Arc::new(BlockingQueue::new(queue_capacity)))
        } else {
            None
        };

        let inner = Arc::new(LogInner {
            level,
            state: Mutex::new(state),
            queue,
            writer: Mutex::new(None),
        });

        if let Some(queue) = inner.queue.clone() {
            let sink = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("log-writer".to_string())
                .spawn(move || {
                    while let Some(line) = queue.pop() {
                        sink.state.lock().unwrap().write_line(&line);
                    }
                })?;
            *inner.writer.lock().unwrap() = Some(handle);
        }

        Ok(Logger { inner })
    }

    /// Registers this sink as the process-wide `log` backend.
    pub fn install(&self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.inner.level);
        log::set_boxed_logger(Box::new(self.clone()))
    }

    /// Drains the async queue, joins the writer thread, and flushes the
    /// current file. Idempotent.
    pub fn shutdown(&self) {
        if let Some(queue) = &self.inner.queue {
            queue.close();
        }
        if let Some(handle) = self.inner.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut state = self.inner.state.lock().unwrap();
        let _ = state.file.flush();
    }

    /// The configured level filter.
    pub fn level(&self) -> LevelFilter {
        self.inner.level
    }

    /// Maps the numeric CLI level (0..=3) onto a filter; 0 is the most
    /// verbose.
    pub fn level_from_cli(level: u8) -> LevelFilter {
        match level {
            0 => LevelFilter::Debug,
            1 => LevelFilter::Info,
            2 => LevelFilter::Warn,
            _ => LevelFilter::Error,
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.inner.level
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.inner.write(record.level(), *record.args());
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.inner.level)
            .field("async", &self.inner.queue.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Logger, MAX_LINES};
    use chrono::Local;
    use std::fs;

    fn today_file(dir: &std::path::Path) -> std::path::PathBuf {
        dir.join(format!("{}{}", Local::now().format("%Y_%m_%d"), ".log"))
    }

    #[test]
    fn sync_sink_writes_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::init(log::LevelFilter::Debug, dir.path(), ".log", 0).unwrap();

        logger
            .inner
            .write(log::Level::Info, format_args!("Server port: {}", 1316));
        logger.shutdown();

        let text = fs::read_to_string(today_file(dir.path())).unwrap();
        assert!(text.contains("[info] : Server port: 1316\n"));
    }

    #[test]
    fn async_sink_drains_queue_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::init(log::LevelFilter::Debug, dir.path(), ".log", 64).unwrap();

        for i in 0..100 {
            logger
                .inner
                .write(log::Level::Debug, format_args!("line {i}"));
        }
        logger.shutdown();

        let text = fs::read_to_string(today_file(dir.path())).unwrap();
        assert_eq!(100, text.lines().count());
        assert!(text.contains("[debug]: line 99\n"));
    }

    #[test]
    fn line_budget_rolls_into_a_numbered_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::init(log::LevelFilter::Debug, dir.path(), ".log", 0).unwrap();

        for i in 0..(MAX_LINES + 10) {
            logger
                .inner
                .write(log::Level::Info, format_args!("{i}"));
        }
        logger.shutdown();

        let rolled = dir
            .path()
            .join(format!("{}-1{}", Local::now().format("%Y_%m_%d"), ".log"));
        assert!(rolled.exists(), "expected rollover file {rolled:?}");
        let text = fs::read_to_string(rolled).unwrap();
        assert_eq!(10, text.lines().count());
    }

    #[test]
    fn level_mapping_matches_the_cli_contract() {
        assert_eq!(log::LevelFilter::Debug, Logger::level_from_cli(0));
        assert_eq!(log::LevelFilter::Info, Logger::level_from_cli(1));
        assert_eq!(log::LevelFilter::Warn, Logger::level_from_cli(2));
        assert_eq!(log::LevelFilter::Error, Logger::level_from_cli(3));
    }
}
