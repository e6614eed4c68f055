use cloudvps_providers::inventory::NodeInfo;
use cloudvps_providers::{Hypervisor, HypervisorError};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("no hypervisor node available")]
    NoCapacity,
    #[error("no free vmid in {start}..={end}")]
    NoIdentifierAvailable { start: u32, end: u32 },
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

/// Least-loaded online node. Ties go to the first node listed, so identical
/// snapshots always give the same answer.
pub fn select_node(nodes: &[NodeInfo]) -> Result<&NodeInfo, PlacementError> {
    nodes
        .iter()
        .filter(|n| n.is_online())
        .fold(None, |best: Option<&NodeInfo>, n| match best {
            Some(b) if b.cpu <= n.cpu => Some(b),
            _ => Some(n),
        })
        .ok_or(PlacementError::NoCapacity)
}

/// Hands out vmids that are free cluster-wide at the time of the call.
///
/// Ids handed out but not yet created are held in a process-local reservation
/// set so concurrent runs in this process do not pick the same id. Other
/// tooling can still race us; `create_vm` stays the final arbiter.
pub struct IdAllocator {
    range: RangeInclusive<u32>,
    reserved: Mutex<HashSet<u32>>,
}

/// A reserved vmid. The reservation is dropped with the lease.
#[derive(Debug)]
pub struct VmidLease<'a> {
    vmid: u32,
    allocator: &'a IdAllocator,
}

impl VmidLease<'_> {
    pub fn vmid(&self) -> u32 {
        self.vmid
    }
}

impl Drop for VmidLease<'_> {
    fn drop(&mut self) {
        self.allocator.reserved().remove(&self.vmid);
    }
}

impl std::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdAllocator")
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

impl IdAllocator {
    pub fn new(range: RangeInclusive<u32>) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u32> {
        &self.range
    }

    fn reserved(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Union of vmids defined on every node. A node whose listing fails is
    /// skipped with a warning; failing to list nodes at all is an error.
    pub async fn ids_in_use(&self, hv: &dyn Hypervisor) -> Result<HashSet<u32>, HypervisorError> {
        let mut used = HashSet::new();
        for node in hv.list_nodes().await? {
            match hv.list_vms(&node.node).await {
                Ok(vms) => used.extend(vms.into_iter().map(|vm| vm.vmid)),
                Err(e) => tracing::warn!(
                    "⚠️ [placement] could not list VMs on node {}: {}",
                    node.node,
                    e
                ),
            }
        }
        Ok(used)
    }

    /// First id in range that is neither in use, excluded by the caller, nor
    /// reserved by another run.
    pub async fn allocate(
        &self,
        hv: &dyn Hypervisor,
        exclude: &HashSet<u32>,
    ) -> Result<VmidLease<'_>, PlacementError> {
        let used = self.ids_in_use(hv).await?;
        let mut reserved = self.reserved();
        let vmid = self
            .range
            .clone()
            .find(|id| !used.contains(id) && !exclude.contains(id) && !reserved.contains(id))
            .ok_or(PlacementError::NoIdentifierAvailable {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;
        reserved.insert(vmid);
        drop(reserved);
        tracing::debug!("[placement] reserved vmid {}", vmid);
        Ok(VmidLease {
            vmid,
            allocator: self,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudvps_providers::inventory::PowerState;
    use cloudvps_providers::mock::MockHypervisor;

    fn node(name: &str, cpu: f64, status: Option<&str>) -> NodeInfo {
        NodeInfo {
            node: name.to_string(),
            status: status.map(str::to_string),
            cpu,
            mem: 0,
            maxmem: 0,
            disk: 0,
            maxdisk: 0,
            uptime: 0,
        }
    }

    #[test]
    fn picks_least_loaded_node_deterministically() {
        let nodes = vec![
            node("pve1", 0.40, Some("online")),
            node("pve2", 0.12, Some("online")),
            node("pve3", 0.12, None),
            node("pve4", 0.01, Some("offline")),
        ];
        for _ in 0..5 {
            assert_eq!(select_node(&nodes).unwrap().node, "pve2");
        }
    }

    #[test]
    fn empty_or_offline_cluster_has_no_capacity() {
        assert!(matches!(select_node(&[]), Err(PlacementError::NoCapacity)));
        let nodes = vec![node("pve1", 0.1, Some("offline"))];
        assert!(matches!(select_node(&nodes), Err(PlacementError::NoCapacity)));
    }

    #[tokio::test]
    async fn allocations_are_distinct_and_skip_used_ids() {
        let hv = MockHypervisor::new()
            .with_node("pve1", 0.1)
            .with_node("pve2", 0.2)
            .with_vm("pve1", 100, PowerState::Running)
            .with_vm("pve2", 102, PowerState::Stopped);
        let alloc = IdAllocator::new(100..=999_999);

        let a = alloc.allocate(&hv, &HashSet::new()).await.unwrap();
        let b = alloc.allocate(&hv, &HashSet::new()).await.unwrap();
        let c = alloc.allocate(&hv, &HashSet::new()).await.unwrap();
        assert_eq!((a.vmid(), b.vmid(), c.vmid()), (101, 103, 104));

        drop(b);
        let d = alloc.allocate(&hv, &HashSet::from([103])).await.unwrap();
        assert_eq!(d.vmid(), 105);
    }

    #[tokio::test]
    async fn failing_node_is_skipped() {
        let hv = MockHypervisor::new()
            .with_node("pve1", 0.1)
            .with_node("pve2", 0.2)
            .with_vm("pve1", 100, PowerState::Running);
        hv.fail_list_vms("pve2");
        let alloc = IdAllocator::new(100..=200);
        assert_eq!(alloc.allocate(&hv, &HashSet::new()).await.unwrap().vmid(), 101);
    }

    #[tokio::test]
    async fn exhausted_range_is_reported() {
        let hv = MockHypervisor::new()
            .with_node("pve1", 0.1)
            .with_vm("pve1", 100, PowerState::Running)
            .with_vm("pve1", 101, PowerState::Running);
        let alloc = IdAllocator::new(100..=101);
        let err = alloc.allocate(&hv, &HashSet::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PlacementError::NoIdentifierAvailable { start: 100, end: 101 }
        ));
    }
}
