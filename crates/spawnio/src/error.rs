//! Error types for streams, descriptor passing and process supervision.
//!
//! Three kinds of failure are kept apart:
//! - **Contract violations** ([`ContractViolation`]): an operation was called in a
//!   lifecycle state where it is illegal. These are bugs in the caller.
//! - **Resource errors**: spawn failures, bad descriptors, descriptor passing on a
//!   non-socket. Reported synchronously by the offending call.
//! - **Stream termination**: read-side EOF and I/O errors on an active stream are
//!   never surfaced here, they arrive as a zero-length data callback.

use std::io;

use nix::sys::signal::Signal;

/// Errors from [`crate::Stream`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid file descriptor: {0}")]
    InvalidDescriptor(#[source] io::Error),

    #[error("failed to register descriptor for readiness events: {0}")]
    Register(#[source] io::Error),

    #[error("stream is not writable")]
    NotWritable,

    #[error("stream is canceled")]
    Canceled,

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors from sending or receiving a descriptor over a unix socket.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor passing requires a unix domain socket")]
    NotUnixSocket,

    #[error("message carried no descriptor (payload: {0:?})")]
    MissingDescriptor(String),

    #[error("descriptor transfer failed: {0}")]
    Io(#[from] io::Error),
}

impl From<nix::Error> for DescriptorError {
    fn from(errno: nix::Error) -> Self {
        Self::Io(io::Error::from(errno))
    }
}

/// An operation was invoked in a lifecycle state where it is not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("process was already started")]
    AlreadyStarted,

    #[error("process has not been started")]
    NotStarted,

    #[error("process has already exited")]
    Exited,

    #[error("channels were not enabled before the process was started")]
    ChannelsDisabled,
}

/// Errors from [`crate::Process`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("process is not running")]
    NotRunning,

    #[error("failed to deliver {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: nix::Error,
    },

    #[error("channel `{0}` is already open")]
    ChannelExists(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_violation_messages() {
        insta::assert_snapshot!(
            ProcessError::from(ContractViolation::ChannelsDisabled),
            @"contract violation: channels were not enabled before the process was started"
        );
        insta::assert_snapshot!(
            ProcessError::from(ContractViolation::AlreadyStarted),
            @"contract violation: process was already started"
        );
        insta::assert_snapshot!(
            ProcessError::from(ContractViolation::Exited),
            @"contract violation: process has already exited"
        );
    }

    #[test]
    fn descriptor_errors_surface_through_stream_error() {
        let err = StreamError::from(DescriptorError::NotUnixSocket);
        insta::assert_snapshot!(err, @"descriptor passing requires a unix domain socket");
    }

    #[test]
    fn signal_error_names_the_signal() {
        let err = ProcessError::Signal {
            signal: Signal::SIGINT,
            source: nix::Error::ESRCH,
        };
        assert!(err.to_string().starts_with("failed to deliver SIGINT"));
        assert!(!err.is_contract_violation());
    }
}
