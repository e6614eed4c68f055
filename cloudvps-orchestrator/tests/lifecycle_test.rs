// Lifecycle controller against the mock hypervisor

mod common;

use cloudvps_common::{ErrorKind, Instance, InstancePatch, InstanceStatus};
use cloudvps_orchestrator::lifecycle::LifecycleAction;
use cloudvps_orchestrator::repository::InstanceRepository;
use cloudvps_providers::inventory::PowerState;
use cloudvps_providers::mock::MockHypervisor;
use common::{purchase, Harness};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn start_on_a_running_vm_issues_no_power_action() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;
    let before = h.hv.calls("power_action");

    let started = h.lifecycle.start(inst.id).await.unwrap();
    assert_eq!(started.status, InstanceStatus::Running);
    assert_eq!(h.hv.calls("power_action"), before);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;
    let before = h.hv.calls("power_action");

    let stopped = h.lifecycle.stop(inst.id).await.unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert_eq!(h.hv.vm(inst.vmid).unwrap().status, PowerState::Stopped);
    assert_eq!(h.hv.calls("power_action"), before + 1);

    let again = h.lifecycle.stop(inst.id).await.unwrap();
    assert_eq!(again.status, InstanceStatus::Stopped);
    assert_eq!(h.hv.calls("power_action"), before + 1);

    let restarted = h.lifecycle.start(inst.id).await.unwrap();
    assert_eq!(restarted.status, InstanceStatus::Running);
    assert_eq!(h.hv.calls("power_action"), before + 2);
}

#[tokio::test(start_paused = true)]
async fn start_syncs_a_stale_stored_status() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;
    h.repo
        .update(inst.id, InstancePatch::status(InstanceStatus::Stopped))
        .await
        .unwrap();
    let before = h.hv.calls("power_action");

    let started = h.lifecycle.start(inst.id).await.unwrap();
    assert_eq!(started.status, InstanceStatus::Running);
    assert_eq!(h.hv.calls("power_action"), before);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_the_vm_to_stop() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;

    let down = h.lifecycle.shutdown(inst.id).await.unwrap();
    assert_eq!(down.status, InstanceStatus::Stopped);
    assert_eq!(h.hv.vm(inst.vmid).unwrap().status, PowerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn restart_records_running_optimistically() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;
    h.hv.set_power(inst.vmid, PowerState::Stopped);
    h.repo
        .update(inst.id, InstancePatch::status(InstanceStatus::Stopped))
        .await
        .unwrap();

    let restarted = h.lifecycle.restart(inst.id).await.unwrap();
    assert_eq!(restarted.status, InstanceStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn stuck_vm_is_never_deleted() {
    let hv = MockHypervisor::standard();
    hv.stuck_running(100);
    let h = Harness::new(hv);
    let inst = h.provisioned().await;
    assert_eq!(inst.vmid, 100);

    let err = h.lifecycle.delete(inst.id).await.unwrap_err();
    assert_eq!(err.action, LifecycleAction::Delete);
    assert_eq!(err.instance_id, inst.id);
    assert_eq!(err.kind(), ErrorKind::TaskTimeout);
    assert_eq!(h.hv.calls("delete_vm"), 0);
    assert!(h.hv.vm(100).is_some());

    let stored = h.repo.get(inst.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Running);
    assert!(stored.deleted_at.is_none());

    let failures = h.notifier.failures().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].action, "delete");
    assert_eq!(failures[0].owner_id, "user-42");
    assert_eq!(failures[0].error_kind, ErrorKind::TaskTimeout);
}

#[tokio::test(start_paused = true)]
async fn stop_timeout_leaves_status_unchanged() {
    let hv = MockHypervisor::standard();
    hv.stuck_running(100);
    let h = Harness::new(hv);
    let inst = h.provisioned().await;

    let err = h.lifecycle.stop(inst.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TaskTimeout);
    let stored = h.repo.get(inst.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn delete_stops_removes_and_soft_deletes() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;

    h.lifecycle.delete(inst.id).await.unwrap();
    assert!(h.hv.vm(inst.vmid).is_none());
    assert_eq!(h.hv.calls("delete_vm"), 1);

    let stored = h.repo.get(inst.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Deleted);
    assert!(stored.deleted_at.is_some());
    assert!(h.repo.list_by_owner("user-42").await.unwrap().is_empty());

    let err = h.lifecycle.start(inst.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceDeleted);
}

#[tokio::test(start_paused = true)]
async fn vm_missing_on_the_hypervisor_still_deletes_the_record() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;
    h.hv.remove_vm(inst.vmid);

    h.lifecycle.delete(inst.id).await.unwrap();
    assert_eq!(h.hv.calls("delete_vm"), 0);
    let stored = h.repo.get(inst.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Deleted);
}

#[tokio::test(start_paused = true)]
async fn failed_purchase_without_vm_is_deleted_locally() {
    let h = Harness::new(MockHypervisor::standard());
    let mut req = purchase(1);
    req.operating_system = "Plan 9".to_string();
    let outcome = h.workflow.purchase(&req, &CancellationToken::new()).await;
    let id = outcome.outcomes[0].instance_id();

    h.lifecycle.delete(id).await.unwrap();
    assert_eq!(h.hv.total_calls(), 0);
    let stored = h.repo.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Deleted);
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let h = Harness::new(MockHypervisor::standard());
    let err = h.lifecycle.start(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.hv.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn backups_are_created_listed_and_restored() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;

    let task = h.lifecycle.create_backup(inst.id).await.unwrap();
    assert!(task.as_str().starts_with("UPID:pve2:"));

    let backups = h.lifecycle.list_backups(inst.id).await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].vmid, Some(inst.vmid));
    assert!(backups[0].volid.starts_with("local:backup/vzdump-qemu-100-"));

    // The VM is running; restore stops it first.
    let restore = h
        .lifecycle
        .restore_backup(inst.id, &backups[0].volid)
        .await
        .unwrap();
    assert!(restore.as_str().contains("qmrestore"));
    assert_eq!(h.hv.vm(inst.vmid).unwrap().status, PowerState::Stopped);
    let stored = h.repo.get(inst.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn restoring_a_missing_archive_fails_and_notifies() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;

    let err = h
        .lifecycle
        .restore_backup(inst.id, "vzdump-qemu-100-0.vma.gz")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let failures = h.notifier.failures().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].action, "restore_backup");
}

#[tokio::test(start_paused = true)]
async fn console_access_points_at_the_hypervisor() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;

    let access = h.lifecycle.console_access(inst.id).await.unwrap();
    assert_eq!(access.url, "https://localhost:5900");
    assert!(access.password.starts_with("PVEVNC:"));
}

#[tokio::test(start_paused = true)]
async fn actions_wait_for_the_provisioning_run() {
    let hv = MockHypervisor::standard();
    hv.set_task_polls(20);
    let h = Harness::new(hv);

    let workflow = h.workflow.clone();
    let run = tokio::spawn(async move {
        workflow
            .purchase(&purchase(1), &CancellationToken::new())
            .await
    });

    // The run has recorded vmid and node and is now waiting on the clone.
    let id = loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(inst) = h.repo.all().await.into_iter().find(|i| i.has_vm()) {
            assert_eq!(inst.status, InstanceStatus::Creating);
            break inst.id;
        }
    };

    let err = h.lifecycle.delete(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceProvisioning);
    let err = h.lifecycle.start(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceProvisioning);
    let err = h.lifecycle.stop(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceProvisioning);
    let err = h.lifecycle.create_backup(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceProvisioning);
    assert_eq!(h.hv.calls("delete_vm"), 0);
    assert_eq!(h.hv.calls("power_action"), 0);
    assert_eq!(h.hv.calls("create_backup"), 0);

    let outcome = run.await.unwrap();
    assert_eq!(outcome.provisioned_count(), 1);
    let stored = h.repo.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Running);
    assert!(stored.deleted_at.is_none());
    assert!(h.hv.vm(stored.vmid).is_some());
}

#[tokio::test]
async fn creating_record_without_vm_is_rejected() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = Instance::new_creating(&purchase(1), "Professional 1".to_string());
    let id = h.repo.create(inst).await.unwrap().id;

    let err = h.lifecycle.delete(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceProvisioning);
    let err = h.lifecycle.console_access(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceProvisioning);
    assert_eq!(h.hv.total_calls(), 0);

    let stored = h.repo.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Creating);
    assert!(stored.deleted_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn deleted_instance_rejects_every_action() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;
    h.lifecycle.delete(inst.id).await.unwrap();
    let calls = h.hv.total_calls();

    let kinds = [
        h.lifecycle.stop(inst.id).await.unwrap_err().kind(),
        h.lifecycle.shutdown(inst.id).await.unwrap_err().kind(),
        h.lifecycle.restart(inst.id).await.unwrap_err().kind(),
        h.lifecycle.delete(inst.id).await.unwrap_err().kind(),
        h.lifecycle.create_backup(inst.id).await.unwrap_err().kind(),
        h.lifecycle.list_backups(inst.id).await.unwrap_err().kind(),
        h.lifecycle
            .restore_backup(inst.id, "vzdump-qemu-100-0.vma.gz")
            .await
            .unwrap_err()
            .kind(),
        h.lifecycle.console_access(inst.id).await.unwrap_err().kind(),
    ];
    assert!(kinds.iter().all(|k| *k == ErrorKind::InstanceDeleted), "{:?}", kinds);
    assert_eq!(h.hv.total_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn late_writes_do_not_revive_a_deleted_instance() {
    let h = Harness::new(MockHypervisor::standard());
    let inst = h.provisioned().await;
    h.lifecycle.delete(inst.id).await.unwrap();

    let written = h
        .repo
        .update(inst.id, InstancePatch::status(InstanceStatus::Running))
        .await
        .unwrap();
    assert!(written.is_none());

    let stored = h.repo.get(inst.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Deleted);
    assert!(stored.deleted_at.is_some());
}
