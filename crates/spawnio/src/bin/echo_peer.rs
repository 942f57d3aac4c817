//! spawnio-echo-peer: the child side of the channel contract.
//!
//! Receives descriptors on stdin (a unix socket) and echoes every byte read on
//! each channel back to it. Exits when stdin closes.

use std::io;
use std::os::fd::AsFd;

use spawnio::fdpass::recv_descriptor;
use spawnio::{DescriptorError, Stream, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    loop {
        let received = tokio::task::spawn_blocking(|| recv_descriptor(io::stdin().as_fd())).await?;
        let (fd, name) = match received {
            Ok(Some(received)) => received,
            Ok(None) => {
                tracing::debug!("Stdin closed, exiting");
                return Ok(());
            }
            Err(DescriptorError::MissingDescriptor(payload)) => {
                tracing::warn!(%payload, "Ignoring stdin data without a descriptor");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let channel = Stream::duplex(fd)?;
        let echo = channel.clone();
        channel.on_data(move |bytes| {
            if bytes.is_empty() {
                return;
            }
            if let Err(e) = echo.write_bytes(bytes) {
                tracing::warn!(error = %e, "Failed to echo");
            }
        });
        channel.resume();
        tracing::info!(channel = %name, "Channel opened");
    }
}
