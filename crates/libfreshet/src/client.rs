use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, warn};

use freshet_core::server_info::ServerInfo;

use crate::connection::{Connection, DEFAULT_CONNECT_TIMEOUT};

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Retries after the first attempt. Zero fails fast.
    pub max_retries: usize,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_retries: 3,
            min_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Dials remote servers, announcing the local server's port triple.
#[derive(Debug, Clone, Copy)]
pub struct Client {
    local_ports: [u16; 3],
    options: ConnectOptions,
}

impl Client {
    pub fn new(local_ports: [u16; 3], options: ConnectOptions) -> Self {
        Client {
            local_ports,
            options,
        }
    }

    /// One connection attempt, all three sockets.
    pub async fn connect(&self, remote: ServerInfo) -> crate::Result<Connection> {
        debug!(%remote, "dialing");
        Connection::connect(remote, self.local_ports, self.options.connect_timeout).await
    }

    /// Dials with exponential back-off. The transient-network reconnect
    /// policy lives here and nowhere else.
    pub async fn connect_with_retry(&self, remote: ServerInfo) -> crate::Result<Connection> {
        (|| self.connect(remote))
            .retry(
                ExponentialBuilder::new()
                    .with_max_times(self.options.max_retries)
                    .with_min_delay(self.options.min_retry_delay)
                    .with_max_delay(self.options.max_retry_delay)
                    .with_jitter(),
            )
            .notify(|err, delay| {
                warn!(%remote, ?delay, "connect failed, will retry: {err:#}");
            })
            .await
    }
}
