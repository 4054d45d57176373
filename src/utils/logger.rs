/*
 * Copyright (c) 2022 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use flexi_logger::{
    colored_opt_format, writers::LogWriter, Age, Cleanup, Criterion, DeferredNow,
    FlexiLoggerError, FileSpec, Level, Logger, LoggerHandle, Naming, Record,
};

use super::stats;

#[derive(Default)]
struct Counter {
    error: AtomicU64,
    warning: AtomicU64,
}

// A writer calculating log count by level without actually writing log
pub struct LogLevelWriter(Arc<Counter>);

impl LogLevelWriter {
    pub fn new() -> (Self, LogLevelCounter) {
        let c = Arc::new(Counter::default());
        (Self(c.clone()), LogLevelCounter(Arc::downgrade(&c)))
    }
}

impl LogWriter for LogLevelWriter {
    fn write(&self, _: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        match record.level() {
            Level::Error => &self.0.error,
            Level::Warn => &self.0.warning,
            _ => return Ok(()),
        }
        .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

pub struct LogLevelCounter(Weak<Counter>);

impl stats::OwnedCountable for LogLevelCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        match self.0.upgrade() {
            Some(counters) => vec![
                (
                    "error",
                    stats::CounterType::Counted,
                    stats::CounterValue::Unsigned(counters.error.swap(0, Ordering::Relaxed)),
                ),
                (
                    "warning",
                    stats::CounterType::Counted,
                    stats::CounterValue::Unsigned(counters.warning.swap(0, Ordering::Relaxed)),
                ),
            ],
            None => vec![],
        }
    }

    fn closed(&self) -> bool {
        self.0.strong_count() == 0
    }
}

pub struct LoggerOptions<'a> {
    pub level: &'a str,
    pub log_file: &'a Path,
    pub retention_days: usize,
    pub stderr: bool,
}

// 日志按天滚动写入文件，同时统计error/warning条数；日志目录不可写时只输出到stderr
pub fn init_logger(
    options: LoggerOptions,
) -> Result<(LoggerHandle, LogLevelCounter), FlexiLoggerError> {
    let (log_level_writer, log_level_counter) = LogLevelWriter::new();
    let logger = Logger::try_with_env_or_str(options.level)?.format(colored_opt_format);

    let writable = options
        .log_file
        .parent()
        .map(|dir| dir.as_os_str().is_empty() || fs::create_dir_all(dir).is_ok())
        .unwrap_or(true);
    let logger = if writable {
        let logger = logger
            .log_to_file_and_writer(
                FileSpec::try_from(options.log_file)?,
                Box::new(log_level_writer),
            )
            .rotate(
                Criterion::Age(Age::Day),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(options.retention_days.max(1)),
            )
            .create_symlink(options.log_file)
            .append();
        if options.stderr {
            logger.duplicate_to_stderr(flexi_logger::Duplicate::All)
        } else {
            logger
        }
    } else {
        eprintln!(
            "log directory of {} is not writable, logging to stderr only",
            options.log_file.display()
        );
        logger
            .log_to_writer(Box::new(log_level_writer))
            .duplicate_to_stderr(flexi_logger::Duplicate::All)
    };

    Ok((logger.start()?, log_level_counter))
}
