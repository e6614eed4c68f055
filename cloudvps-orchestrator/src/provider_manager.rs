use anyhow::bail;
use cloudvps_providers::{Hypervisor, HypervisorConfig};
use std::sync::Arc;

pub struct ProviderManager;

impl ProviderManager {
    pub fn get_provider(
        provider_name: &str,
        config: &HypervisorConfig,
    ) -> anyhow::Result<Arc<dyn Hypervisor>> {
        match provider_name.to_lowercase().as_str() {
            #[cfg(feature = "provider-proxmox")]
            "proxmox" => {
                let client = cloudvps_providers::proxmox::ProxmoxClient::new(config.clone())?;
                tracing::info!(
                    "🔌 [provider] Proxmox at {} as {}",
                    config.base_url(),
                    config.login_name()
                );
                Ok(Arc::new(client))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => {
                let _ = config; // not needed for the mock
                tracing::warn!("🔌 [provider] using the in-memory mock hypervisor");
                Ok(Arc::new(cloudvps_providers::mock::MockHypervisor::standard()))
            }
            other => bail!(
                "unknown or disabled hypervisor provider '{}' (enabled: {})",
                other,
                Self::enabled().join(", ")
            ),
        }
    }

    fn enabled() -> Vec<&'static str> {
        let mut names = Vec::new();
        if cfg!(feature = "provider-proxmox") {
            names.push("proxmox");
        }
        if cfg!(feature = "provider-mock") {
            names.push("mock");
        }
        names
    }
}
