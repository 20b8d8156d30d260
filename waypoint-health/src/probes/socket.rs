use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout};
use tracing::debug;
use waypoint_core::{HealthStatus, ServiceInstance};

use super::HealthProbe;
use crate::config::{HealthCheckConfig, HealthCheckType};
use crate::result::HealthCheckResult;

/// Healthy if a TCP connection to the endpoint can be opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl HealthProbe for TcpProbe {
    fn kind(&self) -> HealthCheckType {
        HealthCheckType::Tcp
    }

    async fn probe(
        &self,
        instance: &Arc<ServiceInstance>,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult {
        let address = instance.address();
        let start = Instant::now();
        match timeout(config.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => HealthCheckResult::healthy(start.elapsed()),
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "TCP health check failed");
                HealthCheckResult::unhealthy(start.elapsed(), e.to_string())
            }
            Err(_) => HealthCheckResult::timed_out(config.timeout),
        }
    }
}

/// Sends `config.udp_payload` and waits for any reply.
///
/// UDP has no handshake, so silence is reported as `Warning` rather than
/// `Unhealthy`; only a socket error (e.g. ICMP port unreachable) fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpProbe;

impl UdpProbe {
    async fn exchange(target: SocketAddr, payload: &[u8]) -> std::io::Result<usize> {
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        socket.send(payload).await?;
        let mut buf = [0u8; 512];
        socket.recv(&mut buf).await
    }
}

#[async_trait]
impl HealthProbe for UdpProbe {
    fn kind(&self) -> HealthCheckType {
        HealthCheckType::Udp
    }

    async fn probe(
        &self,
        instance: &Arc<ServiceInstance>,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult {
        let address = instance.address();
        let start = Instant::now();

        let target = match tokio::net::lookup_host(&address).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    return HealthCheckResult::unhealthy(
                        start.elapsed(),
                        format!("`{}` did not resolve", address),
                    );
                }
            },
            Err(e) => return HealthCheckResult::unhealthy(start.elapsed(), e.to_string()),
        };

        match timeout(config.timeout, Self::exchange(target, config.udp_payload.as_bytes())).await {
            Ok(Ok(_)) => HealthCheckResult::healthy(start.elapsed()),
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "UDP health check failed");
                HealthCheckResult::unhealthy(start.elapsed(), e.to_string())
            }
            Err(_) => HealthCheckResult::new(HealthStatus::Warning, config.timeout)
                .with_message("no datagram reply"),
        }
    }
}
