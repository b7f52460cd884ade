//! Error taxonomy of the fuzzing core.
//!
//! The session classifies every failure into exactly one of these variants;
//! the variant decides whether an iteration is retried, filed as a suspect,
//! or aborts start-up.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The target was unreachable when opening the fuzzing connection.
    #[error("cannot connect to target; target presumed down")]
    ConnectionFailed(#[source] io::Error),

    /// The peer dropped the connection mid-transmission.
    #[error("target connection reset")]
    ConnectionReset(#[source] io::Error),

    /// `ECONNABORTED` and friends during send/recv.
    #[error("target connection aborted")]
    ConnectionAborted(#[source] io::Error),

    /// The target sent nothing (or nothing in time) when a reply was expected.
    #[error("timed out waiting for target response")]
    RecvTimeout,

    /// Cooperative cancellation observed while a test case was pending.
    #[error("fuzzing paused")]
    Paused,

    /// A transmission error that ends the current test case.
    #[error("test case aborted: {0}")]
    TestCaseAborted(String),

    /// The restarter module could not bring the target up.
    #[error("restarting the target failed: {0}")]
    RestartFailed(String),

    /// Transition graph misuse at build or traversal time. Fatal.
    #[error("transition graph: {0}")]
    Graph(&'static str),

    /// Allocating, attaching or reading the coverage map failed.
    #[error("coverage shared memory: {0}")]
    SharedMemory(String),

    /// The seed capture could not be read or decoded.
    #[error("capture file: {0}")]
    Capture(String),

    #[error("unknown protocol module `{0}`")]
    UnknownFuzzer(String),

    #[error("unknown restarter module `{0}`")]
    UnknownRestarter(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Failures that park the current iteration without incriminating the
    /// target: the case is re-run on the next outer tick instead of being
    /// filed as a suspect.
    pub fn is_benign_interruption(&self) -> bool {
        matches!(self, Error::Paused | Error::ConnectionFailed(_))
    }

    /// Short stable label used for the `cause_of_restart` CSV column.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::ConnectionFailed(_) => "connection_failed",
            Error::ConnectionReset(_) => "connection_reset",
            Error::ConnectionAborted(_) => "connection_aborted",
            Error::RecvTimeout => "recv_timeout",
            Error::Paused => "paused",
            Error::TestCaseAborted(_) => "test_case_aborted",
            Error::RestartFailed(_) => "restart_failed",
            Error::Graph(_) => "graph",
            Error::SharedMemory(_) => "shared_memory",
            Error::Capture(_) => "capture",
            Error::UnknownFuzzer(_) => "unknown_fuzzer",
            Error::UnknownRestarter(_) => "unknown_restarter",
            Error::Tls(_) => "tls",
            Error::Io(_) => "io",
        }
    }
}
