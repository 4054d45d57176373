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

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use signal_hook::consts::TERM_SIGNALS;

use ::flow_generator::{
    agent::Agent,
    config::Config,
    utils::{
        logger::{init_logger, LoggerOptions},
        stats::{Countable, StatsOption},
    },
};

#[derive(Parser)]
#[clap(version, about = "Aggregate packet records into bidirectional flows")]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long, default_value = "/etc/flow-generator.yaml")]
    config_file: PathBuf,

    /// Packet records in JSON lines, read from stdin if absent
    #[clap(short, long)]
    input: Option<PathBuf>,

    /// Write flows to file instead of stdout
    #[clap(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = Config::load_from_file(&opts.config_file)
        .with_context(|| format!("failed loading config {}", opts.config_file.display()))?;

    let level = config.log_level.to_string().to_lowercase();
    let (_logger, log_level_counter) = init_logger(LoggerOptions {
        level: &level,
        log_file: Path::new(&config.log_file),
        retention_days: config.log_retention,
        stderr: opts.output.is_some(),
    })?;

    let input: Box<dyn BufRead + Send> = match opts.input.as_ref() {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let output: Box<dyn Write + Send> = match opts.output.as_ref() {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed creating {}", path.display()))?,
        )),
        None => Box::new(io::stdout()),
    };

    let terminated = Arc::new(AtomicBool::new(false));
    for signal in TERM_SIGNALS {
        signal_hook::flag::register(*signal, terminated.clone())?;
    }

    let agent = Agent::start(config, input, output)?;
    agent.stats_collector().register_countable(
        "log_counter",
        Countable::Owned(Box::new(log_level_counter)),
        vec![StatsOption::Tag("module", "flow-generator".to_owned())],
    );
    while !terminated.load(Ordering::Relaxed) && !agent.input_exhausted() {
        thread::sleep(Duration::from_millis(100));
    }
    if terminated.load(Ordering::Relaxed) {
        info!("received termination signal");
    }
    agent.stop();
    Ok(())
}
