use anyhow::bail;
use cloudvps_common::templates::TemplateTable;
use cloudvps_providers::HypervisorConfig;
use std::fs;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

/// Knobs of the provisioning workflow.
#[derive(Clone, Debug)]
pub struct ProvisioningSettings {
    pub vmid_range: RangeInclusive<u32>,
    /// Re-allocations allowed after `create_vm` reports the id as taken.
    pub collision_retries: u32,
    /// Attempts per hypervisor call when it reports itself unavailable.
    pub hypervisor_retries: u32,
    /// First backoff delay; doubles on each retry.
    pub retry_backoff: Duration,
    pub clone_timeout: Duration,
    pub start_timeout: Duration,
    pub status_poll_interval: Duration,
    pub task_poll_interval: Duration,
    pub ip_wait_timeout: Duration,
    pub storage: String,
    pub bridge: String,
    pub app_base_url: String,
    /// `creating` rows older than this are considered orphaned at startup.
    pub stale_creating_after: Duration,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            vmid_range: 100..=999_999,
            collision_retries: 3,
            hypervisor_retries: 3,
            retry_backoff: Duration::from_secs(1),
            clone_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(60),
            status_poll_interval: Duration::from_secs(2),
            task_poll_interval: Duration::from_secs(5),
            ip_wait_timeout: Duration::from_secs(30),
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            app_base_url: "http://localhost:3000".to_string(),
            stale_creating_after: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub stop_timeout: Duration,
    pub status_poll_interval: Duration,
    pub backup_storage: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(60),
            status_poll_interval: Duration::from_secs(2),
            backup_storage: "local".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IpPoolSettings {
    pub public_prefix: String,
    pub private_prefix: String,
}

impl Default for IpPoolSettings {
    fn default() -> Self {
        Self {
            public_prefix: "203.0.113.".to_string(),
            private_prefix: "10.0.0.".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// `proxmox` or `mock`.
    pub provider: String,
    pub hypervisor: HypervisorConfig,
    pub provisioning: ProvisioningSettings,
    pub lifecycle: LifecycleSettings,
    pub templates: TemplateTable,
    pub ip_pool: IpPoolSettings,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub http_addr: SocketAddr,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key/value source. All invalid or missing values are
    /// reported in one error.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = Reader {
            lookup,
            problems: Vec::new(),
        };

        let provider = env
            .string("HYPERVISOR_PROVIDER", "proxmox")
            .to_ascii_lowercase();
        let needs_credentials = provider == "proxmox";

        // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
        let password = env
            .optional("PROXMOX_PASSWORD_FILE")
            .and_then(|path| fs::read_to_string(path).ok())
            .or_else(|| env.optional("PROXMOX_PASSWORD"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let host = env.optional("PROXMOX_HOST").unwrap_or_default();
        if needs_credentials && host.is_empty() {
            env.problems.push("PROXMOX_HOST must be set".to_string());
        }
        if needs_credentials && password.is_empty() {
            env.problems
                .push("PROXMOX_PASSWORD (or PROXMOX_PASSWORD_FILE) must be set".to_string());
        }

        let defaults = HypervisorConfig::default();
        let hypervisor = HypervisorConfig {
            host: if host.is_empty() {
                defaults.host.clone()
            } else {
                host
            },
            port: env.parse("PROXMOX_PORT", defaults.port),
            username: env.string("PROXMOX_USERNAME", &defaults.username),
            password,
            realm: env.string("PROXMOX_REALM", &defaults.realm),
            protocol: env.string("PROXMOX_PROTOCOL", &defaults.protocol),
            timeout: Duration::from_millis(env.parse("PROXMOX_TIMEOUT_MS", 30_000u64)),
            retries: env.parse("PROXMOX_RETRIES", defaults.retries),
            verify_tls: env.flag("PROXMOX_VERIFY_TLS", defaults.verify_tls),
        };
        if !matches!(hypervisor.protocol.as_str(), "http" | "https") {
            env.problems.push(format!(
                "PROXMOX_PROTOCOL must be http or https (got '{}')",
                hypervisor.protocol
            ));
        }

        let p = ProvisioningSettings::default();
        let range_start = env.parse("VMID_RANGE_START", *p.vmid_range.start());
        let range_end = env.parse("VMID_RANGE_END", *p.vmid_range.end());
        if range_start > range_end {
            env.problems.push(format!(
                "VMID_RANGE_START ({}) must not exceed VMID_RANGE_END ({})",
                range_start, range_end
            ));
        }
        if range_end > i32::MAX as u32 {
            env.problems.push(format!(
                "VMID_RANGE_END ({}) must not exceed {}",
                range_end,
                i32::MAX
            ));
        }
        let provisioning = ProvisioningSettings {
            vmid_range: range_start..=range_end,
            collision_retries: env.parse("VMID_COLLISION_RETRIES", p.collision_retries),
            hypervisor_retries: hypervisor.retries.max(1),
            retry_backoff: env.secs("RETRY_BACKOFF_SECS", p.retry_backoff),
            clone_timeout: env.secs("CLONE_TIMEOUT_SECS", p.clone_timeout),
            start_timeout: env.secs("START_TIMEOUT_SECS", p.start_timeout),
            status_poll_interval: env.secs("STATUS_POLL_INTERVAL_SECS", p.status_poll_interval),
            task_poll_interval: env.secs("TASK_POLL_INTERVAL_SECS", p.task_poll_interval),
            ip_wait_timeout: env.secs("IP_WAIT_TIMEOUT_SECS", p.ip_wait_timeout),
            storage: env.string("VM_STORAGE", &p.storage),
            bridge: env.string("VM_BRIDGE", &p.bridge),
            app_base_url: env
                .string("APP_BASE_URL", &p.app_base_url)
                .trim_end_matches('/')
                .to_string(),
            stale_creating_after: env.secs("STALE_CREATING_AFTER_SECS", p.stale_creating_after),
        };

        let l = LifecycleSettings::default();
        let lifecycle = LifecycleSettings {
            stop_timeout: env.secs("STOP_TIMEOUT_SECS", l.stop_timeout),
            status_poll_interval: provisioning.status_poll_interval,
            backup_storage: env.string("BACKUP_STORAGE", &l.backup_storage),
        };

        let templates = match TemplateTable::parse(env.optional("OS_TEMPLATES").as_deref()) {
            Ok(t) => t,
            Err(e) => {
                env.problems.push(format!("OS_TEMPLATES: {}", e));
                TemplateTable::default()
            }
        };

        let ip = IpPoolSettings::default();
        let ip_pool = IpPoolSettings {
            public_prefix: env.string("PUBLIC_IP_PREFIX", &ip.public_prefix),
            private_prefix: env.string("PRIVATE_IP_PREFIX", &ip.private_prefix),
        };

        let http_addr = env.parse(
            "HTTP_ADDR",
            SocketAddr::from(([0, 0, 0, 0], 8001)),
        );

        let settings = Settings {
            provider,
            hypervisor,
            provisioning,
            lifecycle,
            templates,
            ip_pool,
            database_url: env.optional("DATABASE_URL"),
            redis_url: env.optional("REDIS_URL"),
            http_addr,
        };

        if !env.problems.is_empty() {
            bail!("invalid configuration:\n  - {}", env.problems.join("\n  - "));
        }
        Ok(settings)
    }
}

struct Reader<F> {
    lookup: F,
    problems: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&mut self, key: &str, default: T) -> T {
        match self.optional(key) {
            None => default,
            Some(raw) => match raw.parse() {
                Ok(v) => v,
                Err(_) => {
                    self.problems
                        .push(format!("{} has an invalid value '{}'", key, raw));
                    default
                }
            },
        }
    }

    fn secs(&mut self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }

    fn flag(&mut self, key: &str, default: bool) -> bool {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => default,
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => {
                self.problems
                    .push(format!("{} has an invalid value '{}'", key, v));
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> anyhow::Result<Settings> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply() {
        let s = settings(&[("PROXMOX_HOST", "pve.local"), ("PROXMOX_PASSWORD", "pw")]).unwrap();
        assert_eq!(s.hypervisor.port, 8006);
        assert_eq!(s.hypervisor.login_name(), "root@pam");
        assert_eq!(s.hypervisor.timeout, Duration::from_millis(30_000));
        assert_eq!(s.provisioning.vmid_range, 100..=999_999);
        assert_eq!(s.provisioning.collision_retries, 3);
        assert_eq!(s.provisioning.clone_timeout, Duration::from_secs(300));
        assert_eq!(s.lifecycle.stop_timeout, Duration::from_secs(60));
        assert_eq!(s.lifecycle.backup_storage, "local");
        assert_eq!(s.http_addr.port(), 8001);
        assert!(s.database_url.is_none());
        assert_eq!(s.templates.lookup("Ubuntu 22.04 LTS"), Some(9000));
    }

    #[test]
    fn reports_every_problem_at_once() {
        let err = settings(&[
            ("PROXMOX_PORT", "eighty"),
            ("PROXMOX_VERIFY_TLS", "maybe"),
        ])
        .unwrap_err()
        .to_string();
        assert!(err.contains("PROXMOX_HOST"));
        assert!(err.contains("PROXMOX_PASSWORD"));
        assert!(err.contains("PROXMOX_PORT"));
        assert!(err.contains("PROXMOX_VERIFY_TLS"));
    }

    #[test]
    fn mock_provider_needs_no_credentials() {
        let s = settings(&[
            ("HYPERVISOR_PROVIDER", "mock"),
            ("VMID_RANGE_START", "500"),
            ("VMID_RANGE_END", "600"),
            ("APP_BASE_URL", "https://panel.example.com/"),
        ])
        .unwrap();
        assert_eq!(s.provider, "mock");
        assert_eq!(s.provisioning.vmid_range, 500..=600);
        assert_eq!(s.provisioning.app_base_url, "https://panel.example.com");
    }

    #[test]
    fn inverted_vmid_range_is_rejected() {
        let err = settings(&[
            ("HYPERVISOR_PROVIDER", "mock"),
            ("VMID_RANGE_START", "700"),
            ("VMID_RANGE_END", "600"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("VMID_RANGE_START"));
    }

    #[test]
    fn vmid_range_must_fit_the_database_column() {
        let err = settings(&[
            ("HYPERVISOR_PROVIDER", "mock"),
            ("VMID_RANGE_END", "3000000000"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("VMID_RANGE_END (3000000000)"));
    }
}
