use async_trait::async_trait;

pub mod config;
pub mod error;
pub use config::HypervisorConfig;
pub use error::HypervisorError;

pub type HvResult<T> = Result<T, HypervisorError>;

use inventory::{
    BackupEntry, ConsoleTicket, NodeInfo, PowerAction, TaskRef, TaskStatus, VmConfig, VmSpec,
    VmStatus, VmSummary,
};

/// Control-plane API of a hypervisor cluster.
///
/// Implementations own transport and session handling; callers never authenticate
/// explicitly. Errors are never swallowed and transient failures are not retried
/// here: retry policy belongs to the workflow that issued the call.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Establish (or refresh) a session eagerly. Every other method does this
    /// implicitly; exposed so startup can fail fast on bad credentials.
    async fn authenticate(&self) -> HvResult<()> {
        Ok(())
    }

    /// Cluster nodes with load indicators. An empty list is not an error.
    async fn list_nodes(&self) -> HvResult<Vec<NodeInfo>>;

    /// VMs (including templates) defined on one node.
    async fn list_vms(&self, node: &str) -> HvResult<Vec<VmSummary>>;

    /// Allocate a VM shell. A vmid that already exists yields
    /// [`HypervisorError::VmidInUse`], which callers treat as retryable with a new id.
    async fn create_vm(&self, node: &str, spec: &VmSpec) -> HvResult<()>;

    /// Full clone of `template_id` into `new_id`. Asynchronous: poll the returned task.
    async fn clone_template(
        &self,
        node: &str,
        template_id: u32,
        new_id: u32,
        storage: &str,
    ) -> HvResult<TaskRef>;

    async fn task_status(&self, node: &str, task: &TaskRef) -> HvResult<TaskStatus>;

    /// Apply cores/memory/network settings. Idempotent.
    async fn configure_vm(&self, node: &str, vmid: u32, config: &VmConfig) -> HvResult<()>;

    /// Request a power transition. The hypervisor acknowledges and transitions in
    /// the background.
    async fn power_action(&self, node: &str, vmid: u32, action: PowerAction)
        -> HvResult<TaskRef>;

    async fn vm_status(&self, node: &str, vmid: u32) -> HvResult<VmStatus>;

    /// Hard-remove a VM. Does not check power state; the hypervisor refuses to
    /// delete a running VM.
    async fn delete_vm(&self, node: &str, vmid: u32) -> HvResult<TaskRef>;

    /// Snapshot-mode, gzip-compressed backup.
    async fn create_backup(&self, node: &str, vmid: u32, storage: &str) -> HvResult<TaskRef>;

    async fn list_backups(&self, node: &str, storage: &str) -> HvResult<Vec<BackupEntry>>;

    async fn restore_backup(
        &self,
        node: &str,
        vmid: u32,
        archive: &str,
        storage: &str,
    ) -> HvResult<TaskRef>;

    /// One-time console credential.
    async fn console_ticket(&self, node: &str, vmid: u32) -> HvResult<ConsoleTicket>;
}

pub mod inventory {
    use serde::{Deserialize, Deserializer, Serialize};
    use std::fmt;

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
    pub struct NodeInfo {
        pub node: String,
        #[serde(default)]
        pub status: Option<String>,
        #[serde(default)]
        pub cpu: f64,
        #[serde(default)]
        pub mem: u64,
        #[serde(default)]
        pub maxmem: u64,
        #[serde(default)]
        pub disk: u64,
        #[serde(default)]
        pub maxdisk: u64,
        #[serde(default)]
        pub uptime: u64,
    }

    impl NodeInfo {
        /// Nodes that report no status are assumed usable.
        pub fn is_online(&self) -> bool {
            self.status
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case("online"))
                .unwrap_or(true)
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
    pub struct VmSummary {
        #[serde(deserialize_with = "de_u32_lenient")]
        pub vmid: u32,
        #[serde(default)]
        pub name: Option<String>,
        #[serde(default)]
        pub status: Option<String>,
        #[serde(default, deserialize_with = "de_flag")]
        pub template: bool,
    }

    #[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum PowerState {
        Running,
        Stopped,
        Paused,
        Suspended,
    }

    impl PowerState {
        pub fn parse(raw: &str) -> Option<Self> {
            match raw.trim().to_ascii_lowercase().as_str() {
                "running" => Some(PowerState::Running),
                "stopped" => Some(PowerState::Stopped),
                "paused" | "prelaunch" => Some(PowerState::Paused),
                "suspended" => Some(PowerState::Suspended),
                _ => None,
            }
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                PowerState::Running => "running",
                PowerState::Stopped => "stopped",
                PowerState::Paused => "paused",
                PowerState::Suspended => "suspended",
            }
        }
    }

    impl fmt::Display for PowerState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Power state and live counters of one VM.
    #[derive(Clone, Debug, Serialize, PartialEq)]
    pub struct VmStatus {
        pub status: PowerState,
        pub cpu: f64,
        pub mem: u64,
        pub maxmem: u64,
        pub disk: u64,
        pub maxdisk: u64,
        pub netin: u64,
        pub netout: u64,
        pub uptime: u64,
    }

    impl VmStatus {
        pub fn stopped() -> Self {
            Self {
                status: PowerState::Stopped,
                cpu: 0.0,
                mem: 0,
                maxmem: 0,
                disk: 0,
                maxdisk: 0,
                netin: 0,
                netout: 0,
                uptime: 0,
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum PowerAction {
        Start,
        Stop,
        Reboot,
        Shutdown,
    }

    impl PowerAction {
        pub fn as_str(&self) -> &'static str {
            match self {
                PowerAction::Start => "start",
                PowerAction::Stop => "stop",
                PowerAction::Reboot => "reboot",
                PowerAction::Shutdown => "shutdown",
            }
        }
    }

    /// Handle of an asynchronous hypervisor task (a Proxmox UPID).
    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
    #[serde(transparent)]
    pub struct TaskRef(pub String);

    impl TaskRef {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for TaskRef {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum TaskStatus {
        Running,
        Stopped { exit_ok: bool, exitstatus: Option<String> },
    }

    impl TaskStatus {
        pub fn is_finished(&self) -> bool {
            matches!(self, TaskStatus::Stopped { .. })
        }
    }

    /// Parameters of a new VM shell.
    #[derive(Clone, Debug, PartialEq)]
    pub struct VmSpec {
        pub vmid: u32,
        pub name: String,
        pub cores: u32,
        pub memory_mb: u64,
        pub disk_gb: u32,
        pub storage: String,
        pub bridge: String,
        pub ostype: String,
        pub agent: bool,
        pub onboot: bool,
    }

    impl VmSpec {
        pub fn form(&self) -> Vec<(&'static str, String)> {
            vec![
                ("vmid", self.vmid.to_string()),
                ("name", self.name.clone()),
                ("cores", self.cores.to_string()),
                ("memory", self.memory_mb.to_string()),
                ("net0", format!("virtio,bridge={}", self.bridge)),
                ("scsi0", format!("{}:{}", self.storage, self.disk_gb)),
                ("ostype", self.ostype.clone()),
                ("boot", "order=scsi0".to_string()),
                ("agent", flag(self.agent)),
                ("protection", "0".to_string()),
                ("onboot", flag(self.onboot)),
            ]
        }
    }

    /// Resource settings applied after clone.
    #[derive(Clone, Debug, PartialEq)]
    pub struct VmConfig {
        pub cores: u32,
        pub memory_mb: u64,
        pub bridge: String,
        /// Network rate limit in MB/s, when the plan carries one.
        pub rate_limit: Option<u32>,
    }

    impl VmConfig {
        pub fn form(&self) -> Vec<(&'static str, String)> {
            let mut form = vec![
                ("cores", self.cores.to_string()),
                ("memory", self.memory_mb.to_string()),
            ];
            if let Some(rate) = self.rate_limit {
                form.push((
                    "net0",
                    format!("virtio,bridge={},rate={}", self.bridge, rate),
                ));
            }
            form
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
    pub struct BackupEntry {
        pub volid: String,
        #[serde(default)]
        pub content: Option<String>,
        #[serde(default, deserialize_with = "de_opt_u32_lenient")]
        pub vmid: Option<u32>,
        #[serde(default)]
        pub size: u64,
        #[serde(default)]
        pub ctime: Option<i64>,
        #[serde(default)]
        pub format: Option<String>,
        #[serde(default)]
        pub notes: Option<String>,
    }

    impl BackupEntry {
        pub fn is_backup(&self) -> bool {
            self.content.as_deref().map(|c| c == "backup").unwrap_or(true)
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
    pub struct ConsoleTicket {
        pub ticket: String,
        #[serde(deserialize_with = "de_u16_lenient")]
        pub port: u16,
    }

    fn flag(v: bool) -> String {
        if v { "1" } else { "0" }.to_string()
    }

    // Proxmox encodes numbers and booleans inconsistently (1 vs "1" vs true).
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Int(u64),
        Bool(bool),
        Str(String),
    }

    fn lenient_u64<E: serde::de::Error>(v: Lenient) -> Result<u64, E> {
        match v {
            Lenient::Int(n) => Ok(n),
            Lenient::Bool(b) => Ok(u64::from(b)),
            Lenient::Str(s) if s.trim().is_empty() => Ok(0),
            Lenient::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("expected a number, got '{}'", s))),
        }
    }

    fn de_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(lenient_u64::<D::Error>(Lenient::deserialize(d)?)? != 0)
    }

    fn de_u32_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let n = lenient_u64::<D::Error>(Lenient::deserialize(d)?)?;
        u32::try_from(n).map_err(serde::de::Error::custom)
    }

    fn de_opt_u32_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        match Option::<Lenient>::deserialize(d)? {
            None => Ok(None),
            Some(v) => {
                let n = lenient_u64::<D::Error>(v)?;
                u32::try_from(n).map(Some).map_err(serde::de::Error::custom)
            }
        }
    }

    fn de_u16_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
        let n = lenient_u64::<D::Error>(Lenient::deserialize(d)?)?;
        u16::try_from(n).map_err(serde::de::Error::custom)
    }

}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "proxmox")]
pub mod proxmox;
