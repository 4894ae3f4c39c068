//! Line identification responder.
//!
//! External tooling probes this port to recognize the device: every
//! connection receives a fixed greeting and is closed shortly after.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Greeting sent to every client.
pub const GREETING: &[u8] = b"\r\nopenWB DimmModul";

/// Pause between the greeting and closing the connection.
pub const LINGER: Duration = Duration::from_millis(500);

pub struct IdentityResponder {
    listener: TcpListener,
}

impl IdentityResponder {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "Identity responder listening");

        loop {
            let (stream, peer) = self.listener.accept().await?;
            tokio::spawn(async move {
                if let Err(e) = greet(stream).await {
                    warn!(peer = %peer, error = %e, "Identity responder error");
                }
            });
        }
    }
}

async fn greet(mut stream: TcpStream) -> io::Result<()> {
    stream.write_all(GREETING).await?;
    stream.flush().await?;
    tokio::time::sleep(LINGER).await;
    stream.shutdown().await?;
    debug!("Identity probe answered");
    Ok(())
}
