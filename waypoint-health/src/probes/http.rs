use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use tokio::time::Instant;
use tracing::debug;
use waypoint_core::ServiceInstance;

use super::HealthProbe;
use crate::config::{HealthCheckConfig, HealthCheckType};
use crate::result::HealthCheckResult;

/// Requests `config.path` on the instance and compares the status code
/// against `config.expected_status`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    force_tls: bool,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            force_tls: false,
        }
    }

    /// Always use `https`, whatever the endpoint says.
    pub fn force_tls(mut self) -> Self {
        self.force_tls = true;
        self
    }

    fn url_for(&self, instance: &ServiceInstance, config: &HealthCheckConfig) -> String {
        let tls = self.force_tls || instance.endpoint.tls_enabled;
        let scheme = if tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, instance.address(), config.path)
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    fn kind(&self) -> HealthCheckType {
        if self.force_tls {
            HealthCheckType::Https
        } else {
            HealthCheckType::Http
        }
    }

    async fn probe(
        &self,
        instance: &Arc<ServiceInstance>,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult {
        let url = self.url_for(instance, config);
        let method = match Method::from_bytes(config.method.to_ascii_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return HealthCheckResult::unhealthy(
                    Default::default(),
                    format!("invalid HTTP method `{}`", config.method),
                );
            }
        };

        let mut request = self.client.request(method, &url).timeout(config.timeout);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        let start = Instant::now();
        match request.send().await {
            Ok(response) => {
                let latency = start.elapsed();
                let code = response.status().as_u16();
                if config.expected_status.contains(&code) {
                    HealthCheckResult::healthy(latency).with_http_status(code)
                } else {
                    debug!(url = %url, status = code, "Health check got unexpected status");
                    HealthCheckResult::unhealthy(latency, format!("unexpected status code {}", code))
                        .with_http_status(code)
                }
            }
            Err(e) if e.is_timeout() => HealthCheckResult::timed_out(config.timeout),
            Err(e) => {
                debug!(url = %url, error = %e, "Health check request failed");
                HealthCheckResult::unhealthy(start.elapsed(), e.to_string())
            }
        }
    }
}
