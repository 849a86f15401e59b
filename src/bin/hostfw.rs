// Copyright 2018 the hostfw developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Daemon entry point: spawns one updater per configured table and
//! drives periodic garbage collection.

#[macro_use]
extern crate clap;
extern crate crossbeam_channel;
#[macro_use]
extern crate failure;
extern crate hostfw;
#[macro_use]
extern crate slog;
extern crate sloggers;

use clap::{App, Arg};
use hostfw::actor::{self, Mailbox};
use hostfw::errors::*;
use hostfw::iptables::IPVersion;
use hostfw::types;
use hostfw::updater::TableUpdater;
use slog::Logger;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::process::exit;
use std::thread;
use std::time::Duration;

fn main() {
    let matches = App::new("hostfw")
        .version(crate_version!())
        .about("Transactional manager for host firewall chains")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .default_value("/etc/hostfw/hostfw.toml")
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .default_value("info")
                .possible_values(&["trace", "debug", "info", "warning", "error"])
                .help("Log verbosity"),
        )
        .arg(
            Arg::with_name("once")
                .long("once")
                .help("Run a single cleanup pass for every table, then exit"),
        )
        .get_matches();

    let log = match build_logger(matches.value_of("log-level").unwrap_or("info")) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("failed to initialise logging: {}", e);
            exit(1);
        }
    };

    let config_path = matches.value_of("config").unwrap_or("/etc/hostfw/hostfw.toml");
    if let Err(e) = run(&log, config_path, matches.is_present("once")) {
        crit!(log, "exiting on error"; "error" => format!("{}", e));
        exit(1);
    }
}

fn build_logger(level: &str) -> Result<Logger> {
    let severity = match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        _ => Severity::Info,
    };
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    builder.build().map_err(|e| format_err!("{}", e))
}

fn run(log: &Logger, config_path: &str, once: bool) -> Result<()> {
    let config = types::load_config(config_path)?;
    if config.tables.is_empty() {
        warn!(log, "no tables configured; nothing to do");
        return Ok(());
    }

    let mut mailboxes: Vec<Mailbox> = Vec::new();
    let mut workers = Vec::new();
    for table_config in &config.tables {
        let ip_version = if table_config.ipv6 {
            IPVersion::IPv6
        } else {
            IPVersion::IPv4
        };
        let (mailbox, rx) = actor::channel();
        let table = table_config.table.clone();
        let worker_log = log.clone();
        workers.push(thread::spawn(move || {
            let mut updater = match TableUpdater::new(&table, ip_version, &worker_log) {
                Ok(updater) => updater,
                Err(e) => {
                    error!(worker_log, "failed to initialise table updater";
                           "table" => table, "error" => format!("{}", e));
                    return;
                }
            };
            actor::run(&mut updater, &rx);
        }));
        mailboxes.push(mailbox);
    }

    // The first cleanup pass ends each table's graceful restart window.
    for mailbox in &mailboxes {
        mailbox.cleanup()?;
    }

    if !once {
        let ticker = crossbeam_channel::tick(Duration::from_secs(config.cleanup_interval_secs));
        while ticker.recv().is_ok() {
            for mailbox in &mailboxes {
                mailbox.cleanup()?;
            }
        }
    }

    drop(mailboxes);
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}
