// Copyright 2018 the hostfw developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! This module holds the [`IptablesBackend`](trait.IptablesBackend.html)
//! seam between the updater and the kernel's command interface, the
//! subprocess implementation that spawns the real `ip(6)tables` family of
//! commands, and the parsers that turn their textual output into
//! structured results.

use errors::*;
use regex::Regex;
use rules::OWNED_CHAIN_PREFIX;
use std::collections::BTreeSet;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};

lazy_static! {
    static ref RESTORE_LINE_FAILED: Regex = Regex::new(r"line (\d+) failed").unwrap();
    static ref CHAIN_HEADING: Regex = Regex::new(r"^Chain ([^ ]+) \((\d+)").unwrap();
}

static CORRELATOR: AtomicUsize = AtomicUsize::new(0);

/// Mint a correlation id for one kernel interaction. The counter is
/// shared by every updater in the process, so a correlator uniquely
/// identifies a restore invocation in the logs.
pub fn next_correlator() -> String {
    format!("ipt-{}", CORRELATOR.fetch_add(1, Ordering::Relaxed))
}

/// Enum identifying a IP protocol version. Selects between the `iptables`
/// and `ip6tables` command families; the two never share state, so each
/// IP version gets its own updater per table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IPVersion {
    /// IP protocol version 4
    IPv4,

    /// IP protocol version 6
    IPv6,
}

impl IPVersion {
    /// Short qualifier used in log context.
    pub fn qualifier(self) -> &'static str {
        match self {
            IPVersion::IPv4 => "v4",
            IPVersion::IPv6 => "v6",
        }
    }
}

/// Captured output of a finished kernel command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Name of the command that produced this output.
    pub command: String,
    /// Exit code; `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    fn from_output(command: &str, output: Output) -> CommandOutput {
        CommandOutput {
            command: command.to_owned(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn an unsuccessful exit into a
    /// [`CommandFailed`](../errors/enum.HostfwError.html) error.
    pub fn into_result(self) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(HostfwError::CommandFailed {
                command: self.command,
                code: self.code.unwrap_or(-1),
                stdout: self.stdout,
                stderr: self.stderr,
            }.into())
        }
    }
}

/// Interface between the updater and the kernel commands, allowing the
/// use of scripted implementations in tests.
///
/// Implementations return `Ok` with the captured output whenever the
/// command could be spawned at all, even if it exited unsuccessfully;
/// `Err` is reserved for I/O-level failures (command missing, pipe
/// broken), which callers treat as structural.
pub trait IptablesBackend: Send {
    /// Apply a restore-format transaction. `input` must be newline
    /// terminated; it is written to the command's stdin in full before
    /// the command's exit is awaited.
    fn restore(&mut self, input: &str) -> Result<CommandOutput>;

    /// Dump the current contents of `table` in save format.
    fn save_table(&mut self, table: &str) -> Result<CommandOutput>;

    /// Produce the human-readable listing of `table`.
    fn list_table(&mut self, table: &str) -> Result<CommandOutput>;
}

/// [`IptablesBackend`](trait.IptablesBackend.html) implementation that
/// spawns the real kernel commands for one IP version.
pub struct IptablesProcess {
    restore_cmd: &'static str,
    save_cmd: &'static str,
    iptables_cmd: &'static str,
}

impl IptablesProcess {
    /// Create a backend for the given IP version.
    pub fn new(ip_version: IPVersion) -> IptablesProcess {
        match ip_version {
            IPVersion::IPv4 => IptablesProcess {
                restore_cmd: "iptables-restore",
                save_cmd: "iptables-save",
                iptables_cmd: "iptables",
            },
            IPVersion::IPv6 => IptablesProcess {
                restore_cmd: "ip6tables-restore",
                save_cmd: "ip6tables-save",
                iptables_cmd: "ip6tables",
            },
        }
    }

    fn run(command: &'static str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(command).args(args).output()?;
        Ok(CommandOutput::from_output(command, output))
    }
}

impl IptablesBackend for IptablesProcess {
    fn restore(&mut self, input: &str) -> Result<CommandOutput> {
        // --noflush so that the chains we are not touching survive.
        let mut process = Command::new(self.restore_cmd)
            .arg("--noflush")
            .arg("--verbose")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        match process.stdin.as_mut() {
            Some(ref mut stdin) => stdin.write_all(input.as_bytes())?,
            None => Err(format_err!("cannot get stdin of {}", self.restore_cmd))?,
        }

        // wait_with_output closes stdin, letting the command see EOF.
        let output = process.wait_with_output()?;
        Ok(CommandOutput::from_output(self.restore_cmd, output))
    }

    fn save_table(&mut self, table: &str) -> Result<CommandOutput> {
        IptablesProcess::run(self.save_cmd, &["--table", table])
    }

    fn list_table(&mut self, table: &str) -> Result<CommandOutput> {
        IptablesProcess::run(self.iptables_cmd, &["--wait", "--list", "--table", table])
    }
}

/// Extract the set of owned chains in `table` from `ip(6)tables-save`
/// output. Chains in other tables and chains without the owned prefix
/// are ignored.
pub fn extract_owned_chains(table: &str, save_output: &str) -> BTreeSet<String> {
    let mut chains = BTreeSet::new();
    let mut current_table = None;
    for line in save_output.lines() {
        let line = line.trim();
        if line.starts_with('*') {
            current_table = Some(&line[1..]);
        } else if line.starts_with(':') && current_table == Some(table) {
            let name = line[1..].split(' ').next().unwrap_or("");
            if name.starts_with(OWNED_CHAIN_PREFIX) {
                chains.insert(name.to_owned());
            }
        }
    }
    chains
}

/// Extract the owned, unreferenced chains from `ip(6)tables --list`
/// output. Root chains (the ones with a policy) are excluded.
pub fn extract_unreferenced_chains(list_output: &str) -> BTreeSet<String> {
    let mut chains = BTreeSet::new();
    // A chain heading only counts when it follows a blank line (or opens
    // the output); rule lines can legitimately contain the word "Chain".
    let mut last_blank = true;
    for line in list_output.lines() {
        if last_blank && line.starts_with("Chain") && !line.contains("policy") {
            if let Some(caps) = CHAIN_HEADING.captures(line) {
                let name = caps.get(1).map_or("", |m| m.as_str());
                let references = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());
                if name.starts_with(OWNED_CHAIN_PREFIX) && references == Some(0) {
                    chains.insert(name.to_owned());
                }
            }
        }
        last_blank = line.trim().is_empty();
    }
    chains
}

/// Classify a failed restore from its stderr.
///
/// Returns `(retryable, detail)`. A failure on the COMMIT line means the
/// kernel-side table lock was contended by a concurrent writer; the
/// transaction is intact and can simply be replayed. A failure on any
/// other line is structural and must not be retried.
pub fn classify_restore_error(input_lines: &[String], stderr: &str) -> (bool, String) {
    let line_number = RESTORE_LINE_FAILED
        .captures(stderr)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok());
    match line_number {
        Some(n) if n >= 1 && n <= input_lines.len() => {
            let offending_line = &input_lines[n - 1];
            if offending_line.trim() == "COMMIT" {
                (true, "COMMIT failed; likely concurrent access".to_owned())
            } else {
                (false, format!("line {} failed: {}", n, offending_line))
            }
        }
        Some(n) => (false, format!("line {} failed (outside submitted input)", n)),
        None => (false, format!("restore failed with: {}", stderr.trim())),
    }
}
