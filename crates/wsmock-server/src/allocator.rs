//! Port selection and listener binding.
//!
//! Candidates come from a process-wide counter seeded randomly on first use,
//! so instances started in quick succession walk different ports instead of
//! racing for the same random pick. A failed bind moves on to the next
//! candidate until `max_bind_attempts` is exhausted.

use std::ops::RangeInclusive;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};

use metrics::counter;
use tokio::net::TcpListener;
use tracing::{debug, warn};
use wsmock_core::{MockError, Result};

use crate::config::MockServerConfig;
use crate::metrics::BIND_RETRIES_TOTAL;

static PORT_COUNTER: LazyLock<AtomicU32> = LazyLock::new(|| AtomicU32::new(rand::random()));

/// Next candidate port within `range`.
pub fn next_candidate(range: &RangeInclusive<u16>) -> u16 {
    let start = *range.start();
    let span = u32::from(range.end().saturating_sub(start)) + 1;
    let offset = PORT_COUNTER.fetch_add(1, Ordering::Relaxed) % span;
    start + offset as u16
}

/// Bind a listener on the first free candidate port.
///
/// Returns the bound listener together with its port, or
/// [`MockError::PortBind`] once every attempt has failed.
pub async fn bind_listener(config: &MockServerConfig) -> Result<(TcpListener, u16)> {
    config.validate()?;
    let range = config.port_range();
    let mut last_failure = None;

    for attempt in 1..=config.max_bind_attempts {
        let port = next_candidate(&range);
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                debug!(port, attempt, "listener bound");
                return Ok((listener, port));
            }
            Err(error) => {
                warn!(port, attempt, %error, "bind failed, trying another port");
                counter!(BIND_RETRIES_TOTAL).increment(1);
                last_failure = Some((port, error));
            }
        }
    }

    let Some((last_port, source)) = last_failure else {
        return Err(MockError::InvalidConfig(
            "max_bind_attempts must be at least 1".into(),
        ));
    };
    Err(MockError::PortBind {
        attempts: config.max_bind_attempts,
        last_port,
        source,
    })
}
