//! Error types shared across the crate.

use std::collections::BTreeSet;

/// Convenience alias used by every fallible function in this crate.
pub type Result<T> = ::std::result::Result<T, ::failure::Error>;

/// Errors raised by the chain-management core.
#[derive(Debug, Fail)]
pub enum HostfwError {
    /// A kernel command ran to completion but exited unsuccessfully.
    #[fail(display = "{} exited with code {}: {}", command, code, stderr)]
    CommandFailed {
        /// Name of the command that failed.
        command: String,
        /// Exit code, `-1` if the process was killed by a signal.
        code: i32,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// At the end of a cleanup pass, chains we believe must exist were
    /// missing from the dataplane. Fatal; the supervisor must decide how
    /// to recover.
    #[fail(display = "owned chains missing from iptables: {:?}", chains)]
    InconsistentDataplane {
        /// The chains that should have been present.
        chains: BTreeSet<String>,
    },
}
