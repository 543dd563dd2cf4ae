use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{interval, timeout};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::supervisor::EngineSupervisor;

const POLL_INTERVAL: Duration = Duration::from_millis(300);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(400);

/// Waits for the engine's inbound port to open, racing against the child
/// exiting early and an overall deadline.
pub struct ReadinessGate;

impl ReadinessGate {
    pub async fn await_ready(host: &str, port: u16, deadline: Duration, child: &EngineSupervisor) -> Result<()> {
        let addr = format!("{host}:{port}");
        let mut ticker = interval(POLL_INTERVAL);

        let outcome = timeout(deadline, async {
            loop {
                ticker.tick().await;

                if child.has_exited().await {
                    return Err(CoreError::ChildExitedEarly(child.stderr_tail().await));
                }

                match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                    Ok(Ok(_stream)) => return Ok(()),
                    Ok(Err(e)) => debug!(error = %e, %addr, "readiness probe not yet open"),
                    Err(_) => debug!(%addr, "readiness probe connect timed out"),
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(CoreError::ReadinessDeadline(deadline)),
        }
    }
}
