use crate::error::target;
use crate::inventory::{
    BackupEntry, ConsoleTicket, NodeInfo, PowerAction, PowerState, TaskRef, TaskStatus, VmConfig,
    VmSpec, VmStatus, VmSummary,
};
use crate::{HvResult, Hypervisor, HypervisorError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// A VM as the mock cluster sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct MockVm {
    pub node: String,
    pub name: String,
    pub template: bool,
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u32,
    pub rate_limit: Option<u32>,
    pub status: PowerState,
    pub uptime: u64,
    /// Template the VM was cloned from, if any.
    pub cloned_from: Option<u32>,
}

#[derive(Debug)]
enum Effect {
    None,
    Restore { vmid: u32, node: String },
}

#[derive(Debug)]
struct MockTask {
    polls_left: u32,
    exit_ok: bool,
    exitstatus: String,
    never_finishes: bool,
    effect: Effect,
}

#[derive(Default)]
struct Faults {
    auth_fails: bool,
    collide_on_create: HashSet<u32>,
    fail_clone: HashSet<u32>,
    clone_never_finishes: bool,
    stuck_running: HashSet<u32>,
    never_running: HashSet<u32>,
    failing_nodes: HashSet<String>,
    unavailable: HashMap<&'static str, u32>,
    lost_create_responses: u32,
}

#[derive(Default)]
struct State {
    nodes: Vec<NodeInfo>,
    vms: BTreeMap<u32, MockVm>,
    tasks: HashMap<String, MockTask>,
    backups: Vec<BackupEntry>,
    faults: Faults,
    calls: HashMap<&'static str, usize>,
    task_polls: u32,
    seq: u64,
}

/// In-memory hypervisor for local runs and tests.
///
/// Power transitions apply immediately unless a fault says otherwise; tasks
/// finish after a configurable number of polls. Every trait call is counted per
/// operation so tests can assert what was (not) sent.
#[derive(Default)]
pub struct MockHypervisor {
    state: Mutex<State>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two online nodes and the standard OS templates on `pve1`.
    pub fn standard() -> Self {
        let mock = Self::new()
            .with_node("pve1", 0.35)
            .with_node("pve2", 0.10);
        for (vmid, name) in [
            (9000, "ubuntu-22.04"),
            (9001, "ubuntu-20.04"),
            (9002, "centos-8"),
            (9003, "debian-11"),
            (9004, "fedora-37"),
        ] {
            mock.insert_vm(vmid, template_vm("pve1", name));
        }
        mock
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_node(self, name: &str, cpu: f64) -> Self {
        self.lock().nodes.push(NodeInfo {
            node: name.to_string(),
            status: Some("online".to_string()),
            cpu,
            mem: 0,
            maxmem: 64 * 1024 * 1024 * 1024,
            disk: 0,
            maxdisk: 0,
            uptime: 86_400,
        });
        self
    }

    pub fn with_offline_node(self, name: &str) -> Self {
        self.lock().nodes.push(NodeInfo {
            node: name.to_string(),
            status: Some("offline".to_string()),
            cpu: 0.0,
            mem: 0,
            maxmem: 0,
            disk: 0,
            maxdisk: 0,
            uptime: 0,
        });
        self
    }

    pub fn with_template(self, node: &str, vmid: u32, name: &str) -> Self {
        self.insert_vm(vmid, template_vm(node, name));
        self
    }

    pub fn with_vm(self, node: &str, vmid: u32, status: PowerState) -> Self {
        self.insert_vm(
            vmid,
            MockVm {
                node: node.to_string(),
                name: format!("vm-{}", vmid),
                template: false,
                cores: 1,
                memory_mb: 1024,
                disk_gb: 10,
                rate_limit: None,
                status,
                uptime: 0,
                cloned_from: None,
            },
        );
        self
    }

    pub fn insert_vm(&self, vmid: u32, vm: MockVm) {
        self.lock().vms.insert(vmid, vm);
    }

    /// Simulate an out-of-band deletion.
    pub fn remove_vm(&self, vmid: u32) -> Option<MockVm> {
        self.lock().vms.remove(&vmid)
    }

    /// Simulate an out-of-band power change.
    pub fn set_power(&self, vmid: u32, status: PowerState) {
        if let Some(vm) = self.lock().vms.get_mut(&vmid) {
            vm.status = status;
        }
    }

    pub fn add_backup(&self, entry: BackupEntry) {
        self.lock().backups.push(entry);
    }

    // ---- faults ----

    pub fn fail_auth(&self) {
        self.lock().faults.auth_fails = true;
    }

    /// `create_vm` with this vmid reports it as taken, even though no listing shows it.
    pub fn collide_on_create(&self, vmid: u32) {
        self.lock().faults.collide_on_create.insert(vmid);
    }

    /// Clone into this vmid ends with a failed task.
    pub fn fail_clone(&self, vmid: u32) {
        self.lock().faults.fail_clone.insert(vmid);
    }

    pub fn clone_never_finishes(&self) {
        self.lock().faults.clone_never_finishes = true;
    }

    /// Stop/shutdown are acknowledged but the VM keeps running.
    pub fn stuck_running(&self, vmid: u32) {
        self.lock().faults.stuck_running.insert(vmid);
    }

    /// Start is acknowledged but the VM never leaves `stopped`.
    pub fn never_running(&self, vmid: u32) {
        self.lock().faults.never_running.insert(vmid);
    }

    pub fn fail_list_vms(&self, node: &str) {
        self.lock().faults.failing_nodes.insert(node.to_string());
    }

    /// The next `times` calls of `op` fail as unavailable.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.lock().faults.unavailable.insert(op, times);
    }

    /// The next `times` creates take effect but report the hypervisor as unavailable.
    pub fn lose_create_response(&self, times: u32) {
        self.lock().faults.lost_create_responses = times;
    }

    /// Tasks report `running` this many times before finishing.
    pub fn set_task_polls(&self, polls: u32) {
        self.lock().task_polls = polls;
    }

    // ---- inspection ----

    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn vm(&self, vmid: u32) -> Option<MockVm> {
        self.lock().vms.get(&vmid).cloned()
    }

    pub fn vm_ids(&self) -> Vec<u32> {
        self.lock().vms.keys().copied().collect()
    }

    pub fn backups(&self) -> Vec<BackupEntry> {
        self.lock().backups.clone()
    }

    // Counts the call and applies auth/unavailability faults.
    fn enter(&self, op: &'static str, tgt: impl FnOnce() -> String) -> HvResult<MutexGuard<'_, State>> {
        let mut st = self.lock();
        *st.calls.entry(op).or_insert(0) += 1;
        if st.faults.auth_fails {
            return Err(HypervisorError::Authentication {
                host: "mock".to_string(),
                reason: "invalid credentials".to_string(),
            });
        }
        if let Some(left) = st.faults.unavailable.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(HypervisorError::Unavailable {
                    op,
                    target: tgt(),
                    reason: "injected outage".to_string(),
                });
            }
        }
        Ok(st)
    }
}

impl State {
    fn next_task(&mut self, node: &str, kind: &str, vmid: u32, task: MockTask) -> TaskRef {
        self.seq += 1;
        let upid = format!(
            "UPID:{}:{:08X}:00000000:00000000:{}:{}:root@pam:",
            node, self.seq, kind, vmid
        );
        self.tasks.insert(upid.clone(), task);
        TaskRef(upid)
    }

    fn ok_task(&mut self, node: &str, kind: &str, vmid: u32) -> TaskRef {
        let polls = self.task_polls;
        self.next_task(
            node,
            kind,
            vmid,
            MockTask {
                polls_left: polls,
                exit_ok: true,
                exitstatus: "OK".to_string(),
                never_finishes: false,
                effect: Effect::None,
            },
        )
    }

    fn vm_mut(&mut self, op: &'static str, node: &str, vmid: u32) -> HvResult<&mut MockVm> {
        match self.vms.get_mut(&vmid) {
            Some(vm) if vm.node == node => Ok(vm),
            _ => Err(HypervisorError::NotFound {
                op,
                target: target(Some(node), Some(vmid)),
            }),
        }
    }
}

fn template_vm(node: &str, name: &str) -> MockVm {
    MockVm {
        node: node.to_string(),
        name: name.to_string(),
        template: true,
        cores: 1,
        memory_mb: 1024,
        disk_gb: 10,
        rate_limit: None,
        status: PowerState::Stopped,
        uptime: 0,
        cloned_from: None,
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn authenticate(&self) -> HvResult<()> {
        self.enter("authenticate", || target(None, None)).map(|_| ())
    }

    async fn list_nodes(&self) -> HvResult<Vec<NodeInfo>> {
        let st = self.enter("list_nodes", || target(None, None))?;
        Ok(st.nodes.clone())
    }

    async fn list_vms(&self, node: &str) -> HvResult<Vec<VmSummary>> {
        let st = self.enter("list_vms", || target(Some(node), None))?;
        if st.faults.failing_nodes.contains(node) {
            return Err(HypervisorError::Unavailable {
                op: "list_vms",
                target: target(Some(node), None),
                reason: "node unreachable".to_string(),
            });
        }
        Ok(st
            .vms
            .iter()
            .filter(|(_, vm)| vm.node == node)
            .map(|(vmid, vm)| VmSummary {
                vmid: *vmid,
                name: Some(vm.name.clone()),
                status: Some(vm.status.as_str().to_string()),
                template: vm.template,
            })
            .collect())
    }

    async fn create_vm(&self, node: &str, spec: &VmSpec) -> HvResult<()> {
        let mut st = self.enter("create_vm", || target(Some(node), Some(spec.vmid)))?;
        if st.vms.contains_key(&spec.vmid) || st.faults.collide_on_create.contains(&spec.vmid) {
            return Err(HypervisorError::VmidInUse {
                node: node.to_string(),
                vmid: spec.vmid,
            });
        }
        st.vms.insert(
            spec.vmid,
            MockVm {
                node: node.to_string(),
                name: spec.name.clone(),
                template: false,
                cores: spec.cores,
                memory_mb: spec.memory_mb,
                disk_gb: spec.disk_gb,
                rate_limit: None,
                status: PowerState::Stopped,
                uptime: 0,
                cloned_from: None,
            },
        );
        if st.faults.lost_create_responses > 0 {
            st.faults.lost_create_responses -= 1;
            return Err(HypervisorError::Unavailable {
                op: "create_vm",
                target: target(Some(node), Some(spec.vmid)),
                reason: "response lost".to_string(),
            });
        }
        Ok(())
    }

    async fn clone_template(
        &self,
        node: &str,
        template_id: u32,
        new_id: u32,
        _storage: &str,
    ) -> HvResult<TaskRef> {
        let mut st = self.enter("clone_template", || target(Some(node), Some(new_id)))?;
        let template_name = match st.vms.get(&template_id) {
            Some(t) if t.template => t.name.clone(),
            _ => {
                return Err(HypervisorError::NotFound {
                    op: "clone_template",
                    target: format!("template={}", template_id),
                })
            }
        };

        let failing = st.faults.fail_clone.contains(&new_id);
        if !failing {
            let vm = st.vms.entry(new_id).or_insert_with(|| MockVm {
                node: node.to_string(),
                name: format!("{}-clone", template_name),
                template: false,
                cores: 1,
                memory_mb: 1024,
                disk_gb: 10,
                rate_limit: None,
                status: PowerState::Stopped,
                uptime: 0,
                cloned_from: None,
            });
            vm.cloned_from = Some(template_id);
        }

        let polls = st.task_polls;
        let never_finishes = st.faults.clone_never_finishes;
        Ok(st.next_task(
            node,
            "qmclone",
            new_id,
            MockTask {
                polls_left: polls,
                exit_ok: !failing,
                exitstatus: if failing {
                    "clone failed: storage error".to_string()
                } else {
                    "OK".to_string()
                },
                never_finishes,
                effect: Effect::None,
            },
        ))
    }

    async fn task_status(&self, node: &str, task: &TaskRef) -> HvResult<TaskStatus> {
        let mut st = self.enter("task_status", || target(Some(node), None))?;
        let Some(t) = st.tasks.get_mut(task.as_str()) else {
            return Err(HypervisorError::NotFound {
                op: "task_status",
                target: format!("task={}", task),
            });
        };
        if t.never_finishes {
            return Ok(TaskStatus::Running);
        }
        if t.polls_left > 0 {
            t.polls_left -= 1;
            return Ok(TaskStatus::Running);
        }
        let status = TaskStatus::Stopped {
            exit_ok: t.exit_ok,
            exitstatus: Some(t.exitstatus.clone()),
        };
        if let Effect::Restore { vmid, node } = std::mem::replace(&mut t.effect, Effect::None) {
            st.vms.entry(vmid).or_insert_with(|| MockVm {
                node,
                name: format!("vm-{}", vmid),
                template: false,
                cores: 1,
                memory_mb: 1024,
                disk_gb: 10,
                rate_limit: None,
                status: PowerState::Stopped,
                uptime: 0,
                cloned_from: None,
            });
        }
        Ok(status)
    }

    async fn configure_vm(&self, node: &str, vmid: u32, config: &VmConfig) -> HvResult<()> {
        let mut st = self.enter("configure_vm", || target(Some(node), Some(vmid)))?;
        let vm = st.vm_mut("configure_vm", node, vmid)?;
        vm.cores = config.cores;
        vm.memory_mb = config.memory_mb;
        vm.rate_limit = config.rate_limit;
        Ok(())
    }

    async fn power_action(
        &self,
        node: &str,
        vmid: u32,
        action: PowerAction,
    ) -> HvResult<TaskRef> {
        let mut st = self.enter("power_action", || target(Some(node), Some(vmid)))?;
        let stuck = st.faults.stuck_running.contains(&vmid);
        let inert = st.faults.never_running.contains(&vmid);
        let vm = st.vm_mut("power_action", node, vmid)?;
        match action {
            PowerAction::Start if !inert => {
                vm.status = PowerState::Running;
                vm.uptime = 1;
            }
            PowerAction::Stop | PowerAction::Shutdown if !stuck => {
                vm.status = PowerState::Stopped;
                vm.uptime = 0;
            }
            PowerAction::Reboot => vm.uptime = 1,
            _ => {}
        }
        let kind = match action {
            PowerAction::Start => "qmstart",
            PowerAction::Stop => "qmstop",
            PowerAction::Reboot => "qmreboot",
            PowerAction::Shutdown => "qmshutdown",
        };
        Ok(st.ok_task(node, kind, vmid))
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> HvResult<VmStatus> {
        let mut st = self.enter("vm_status", || target(Some(node), Some(vmid)))?;
        let vm = st.vm_mut("vm_status", node, vmid)?;
        let running = vm.status == PowerState::Running;
        let maxmem = vm.memory_mb * 1024 * 1024;
        let maxdisk = u64::from(vm.disk_gb) * 1024 * 1024 * 1024;
        Ok(VmStatus {
            status: vm.status,
            cpu: if running { 0.25 } else { 0.0 },
            mem: if running { maxmem / 2 } else { 0 },
            maxmem,
            disk: maxdisk / 4,
            maxdisk,
            netin: if running { 10 * 1024 * 1024 } else { 0 },
            netout: if running { 5 * 1024 * 1024 } else { 0 },
            uptime: vm.uptime,
        })
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> HvResult<TaskRef> {
        let mut st = self.enter("delete_vm", || target(Some(node), Some(vmid)))?;
        let vm = st.vm_mut("delete_vm", node, vmid)?;
        if vm.status == PowerState::Running {
            return Err(HypervisorError::Api {
                op: "delete_vm",
                target: target(Some(node), Some(vmid)),
                status: 500,
                body: format!("VM {} is running - destroy failed", vmid),
            });
        }
        st.vms.remove(&vmid);
        Ok(st.ok_task(node, "qmdestroy", vmid))
    }

    async fn create_backup(&self, node: &str, vmid: u32, storage: &str) -> HvResult<TaskRef> {
        let mut st = self.enter("create_backup", || target(Some(node), Some(vmid)))?;
        let size = u64::from(st.vm_mut("create_backup", node, vmid)?.disk_gb) * 1024 * 1024 * 256;
        st.seq += 1;
        let ctime = 1_700_000_000 + st.seq as i64;
        st.backups.push(BackupEntry {
            volid: format!("{}:backup/vzdump-qemu-{}-{}.vma.gz", storage, vmid, ctime),
            content: Some("backup".to_string()),
            vmid: Some(vmid),
            size,
            ctime: Some(ctime),
            format: Some("vma.gz".to_string()),
            notes: Some(format!("Backup of VM {}", vmid)),
        });
        Ok(st.ok_task(node, "vzdump", vmid))
    }

    async fn list_backups(&self, node: &str, storage: &str) -> HvResult<Vec<BackupEntry>> {
        let st = self.enter("list_backups", || target(Some(node), None))?;
        let prefix = format!("{}:", storage);
        Ok(st
            .backups
            .iter()
            .filter(|b| b.volid.starts_with(&prefix) && b.is_backup())
            .cloned()
            .collect())
    }

    async fn restore_backup(
        &self,
        node: &str,
        vmid: u32,
        archive: &str,
        storage: &str,
    ) -> HvResult<TaskRef> {
        let mut st = self.enter("restore_backup", || target(Some(node), Some(vmid)))?;
        let volid = if archive.contains(':') {
            archive.to_string()
        } else {
            format!("{}:backup/{}", storage, archive)
        };
        if !st.backups.iter().any(|b| b.volid == volid) {
            return Err(HypervisorError::NotFound {
                op: "restore_backup",
                target: format!("archive={}", volid),
            });
        }
        if st.vms.get(&vmid).map(|vm| vm.status) == Some(PowerState::Running) {
            return Err(HypervisorError::Api {
                op: "restore_backup",
                target: target(Some(node), Some(vmid)),
                status: 500,
                body: format!("VM {} is running - unable to restore", vmid),
            });
        }
        let polls = st.task_polls;
        Ok(st.next_task(
            node,
            "qmrestore",
            vmid,
            MockTask {
                polls_left: polls,
                exit_ok: true,
                exitstatus: "OK".to_string(),
                never_finishes: false,
                effect: Effect::Restore {
                    vmid,
                    node: node.to_string(),
                },
            },
        ))
    }

    async fn console_ticket(&self, node: &str, vmid: u32) -> HvResult<ConsoleTicket> {
        let mut st = self.enter("console_ticket", || target(Some(node), Some(vmid)))?;
        st.vm_mut("console_ticket", node, vmid)?;
        st.seq += 1;
        Ok(ConsoleTicket {
            ticket: format!("PVEVNC:{:08X}::mock-{}", st.seq, vmid),
            port: 5900 + (vmid % 100) as u16,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(vmid: u32) -> VmSpec {
        VmSpec {
            vmid,
            name: "jane-starter".to_string(),
            cores: 2,
            memory_mb: 2048,
            disk_gb: 25,
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            ostype: "l26".to_string(),
            agent: true,
            onboot: true,
        }
    }

    #[tokio::test]
    async fn create_rejects_existing_vmid() {
        let hv = MockHypervisor::standard();
        hv.create_vm("pve2", &spec(100)).await.unwrap();
        let err = hv.create_vm("pve2", &spec(100)).await.unwrap_err();
        assert!(matches!(err, HypervisorError::VmidInUse { vmid: 100, .. }));
        assert_eq!(hv.calls("create_vm"), 2);
    }

    #[tokio::test]
    async fn clone_task_finishes_after_configured_polls() {
        let hv = MockHypervisor::standard();
        hv.set_task_polls(2);
        let task = hv.clone_template("pve2", 9000, 120, "local-lvm").await.unwrap();
        assert_eq!(hv.task_status("pve2", &task).await.unwrap(), TaskStatus::Running);
        assert_eq!(hv.task_status("pve2", &task).await.unwrap(), TaskStatus::Running);
        assert!(hv.task_status("pve2", &task).await.unwrap().is_finished());
        assert_eq!(hv.vm(120).unwrap().cloned_from, Some(9000));
    }

    #[tokio::test]
    async fn stuck_vm_ignores_stop() {
        let hv = MockHypervisor::standard().with_vm("pve1", 150, PowerState::Running);
        hv.stuck_running(150);
        hv.power_action("pve1", 150, PowerAction::Stop).await.unwrap();
        assert_eq!(
            hv.vm_status("pve1", 150).await.unwrap().status,
            PowerState::Running
        );
        assert!(hv.delete_vm("pve1", 150).await.is_err());
    }

    #[tokio::test]
    async fn lost_create_response_still_creates() {
        let hv = MockHypervisor::standard();
        hv.lose_create_response(1);
        assert!(hv.create_vm("pve2", &spec(100)).await.unwrap_err().is_retryable());
        assert_eq!(hv.vm(100).unwrap().name, "jane-starter");
        assert!(hv.create_vm("pve2", &spec(101)).await.is_ok());
    }

    #[tokio::test]
    async fn injected_outage_is_consumed() {
        let hv = MockHypervisor::standard();
        hv.fail_next("list_nodes", 1);
        assert!(hv.list_nodes().await.unwrap_err().is_retryable());
        assert_eq!(hv.list_nodes().await.unwrap().len(), 2);
    }
}
