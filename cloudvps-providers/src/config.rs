use std::time::Duration;

/// Connection settings for the hypervisor control API.
#[derive(Clone, Debug, PartialEq)]
pub struct HypervisorConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub realm: String,
    /// `http` or `https`.
    pub protocol: String,
    /// Overall per-request timeout.
    pub timeout: Duration,
    /// Attempts callers may spend on a retryable failure.
    pub retries: u32,
    /// Clusters commonly run with self-signed certificates.
    pub verify_tls: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8006,
            username: "root".to_string(),
            password: String::new(),
            realm: "pam".to_string(),
            protocol: "https".to_string(),
            timeout: Duration::from_millis(30_000),
            retries: 3,
            verify_tls: true,
        }
    }
}

impl HypervisorConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}/api2/json", self.protocol, self.host, self.port)
    }

    /// `user@realm`, as the ticket endpoint expects.
    pub fn login_name(&self) -> String {
        if self.username.contains('@') {
            self.username.clone()
        } else {
            format!("{}@{}", self.username, self.realm)
        }
    }

    /// Where a console client connects for a given proxy port.
    pub fn console_url(&self, port: u16) -> String {
        format!("{}://{}:{}", self.protocol, self.host, port)
    }
}
