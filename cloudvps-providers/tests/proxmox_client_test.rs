// Integration tests for the Proxmox client against an in-process fake API.
#![cfg(feature = "proxmox")]

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use cloudvps_providers::inventory::{PowerState, VmSpec};
use cloudvps_providers::proxmox::ProxmoxClient;
use cloudvps_providers::{Hypervisor, HypervisorConfig, HypervisorError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakePve {
    logins: AtomicUsize,
    ticket: Mutex<Option<String>>,
    last_form: Mutex<HashMap<String, String>>,
    last_csrf: Mutex<Option<String>>,
    unavailable: Mutex<bool>,
}

impl FakePve {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(current) = self.ticket.lock().unwrap().clone() else {
            return false;
        };
        headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .map(|c| c == format!("PVEAuthCookie={}", current))
            .unwrap_or(false)
    }

    fn expire_ticket(&self) {
        *self.ticket.lock().unwrap() = None;
    }
}

type Shared = Arc<FakePve>;

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "authentication failure").into_response()
}

async fn login(State(s): State<Shared>, Form(f): Form<HashMap<String, String>>) -> Response {
    if f.get("username").map(String::as_str) != Some("root@pam")
        || f.get("password").map(String::as_str) != Some("secret")
    {
        return (StatusCode::UNAUTHORIZED, "authentication failure").into_response();
    }
    let n = s.logins.fetch_add(1, Ordering::SeqCst) + 1;
    let ticket = format!("PVE:root@pam:TICKET{}", n);
    *s.ticket.lock().unwrap() = Some(ticket.clone());
    Json(json!({"data": {"ticket": ticket, "CSRFPreventionToken": format!("CSRF{}", n)}}))
        .into_response()
}

async fn nodes(State(s): State<Shared>, headers: HeaderMap) -> Response {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    if *s.unavailable.lock().unwrap() {
        return (StatusCode::SERVICE_UNAVAILABLE, "proxy loop").into_response();
    }
    Json(json!({"data": [
        {"node": "pve1", "status": "online", "cpu": 0.41, "maxmem": 68719476736u64},
        {"node": "pve2", "status": "offline"}
    ]}))
    .into_response()
}

async fn create_vm(
    State(s): State<Shared>,
    Path(node): Path<String>,
    headers: HeaderMap,
    Form(f): Form<HashMap<String, String>>,
) -> Response {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    *s.last_csrf.lock().unwrap() = headers
        .get("CSRFPreventionToken")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let vmid = f.get("vmid").cloned().unwrap_or_default();
    *s.last_form.lock().unwrap() = f;
    if vmid == "100" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to create VM 100 - VM 100 already exists on node '{}'", node),
        )
            .into_response();
    }
    Json(json!({"data": format!("UPID:{}:0001:qmcreate:{}:root@pam:", node, vmid)})).into_response()
}

async fn clone_vm(
    State(s): State<Shared>,
    Path((node, template)): Path<(String, u32)>,
    headers: HeaderMap,
    Form(f): Form<HashMap<String, String>>,
) -> Response {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    let newid = f.get("newid").cloned().unwrap_or_default();
    *s.last_form.lock().unwrap() = f;
    Json(json!({"data": format!("UPID:{}:0002:qmclone:{}-{}:root@pam:", node, template, newid)}))
        .into_response()
}

async fn vm_status(
    State(s): State<Shared>,
    Path((node, vmid)): Path<(String, u32)>,
    headers: HeaderMap,
) -> Response {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    if vmid != 101 {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Configuration file 'nodes/{}/qemu-server/{}.conf' does not exist",
                node, vmid
            ),
        )
            .into_response();
    }
    Json(json!({"data": {
        "status": "running", "cpu": 0.123, "mem": 536870912u64, "maxmem": 2147483648u64,
        "disk": 0, "maxdisk": 26843545600u64, "netin": 1048576, "netout": 2097152, "uptime": 3720
    }}))
    .into_response()
}

async fn storage_content(
    State(s): State<Shared>,
    Path((_node, storage)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !s.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"data": [
        {"volid": format!("{}:backup/vzdump-qemu-101-2024_01_01-00_00_00.vma.gz", storage),
         "content": "backup", "vmid": 101, "size": 1024, "ctime": 1704067200},
        {"volid": format!("{}:iso/ubuntu.iso", storage), "content": "iso", "size": 2048}
    ]}))
    .into_response()
}

async fn spawn_fake() -> (Shared, HypervisorConfig) {
    let state: Shared = Arc::new(FakePve::default());
    let app = Router::new()
        .route("/api2/json/access/ticket", post(login))
        .route("/api2/json/nodes", get(nodes))
        .route("/api2/json/nodes/{node}/qemu", post(create_vm))
        .route("/api2/json/nodes/{node}/qemu/{vmid}/clone", post(clone_vm))
        .route(
            "/api2/json/nodes/{node}/qemu/{vmid}/status/current",
            get(vm_status),
        )
        .route(
            "/api2/json/nodes/{node}/storage/{storage}/content",
            get(storage_content),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = HypervisorConfig {
        host: "127.0.0.1".to_string(),
        port,
        password: "secret".to_string(),
        protocol: "http".to_string(),
        timeout: Duration::from_secs(5),
        ..Default::default()
    };
    (state, config)
}

fn spec(vmid: u32) -> VmSpec {
    VmSpec {
        vmid,
        name: "jane-doe-starter".to_string(),
        cores: 2,
        memory_mb: 4096,
        disk_gb: 50,
        storage: "local-lvm".to_string(),
        bridge: "vmbr0".to_string(),
        ostype: "l26".to_string(),
        agent: true,
        onboot: true,
    }
}

#[tokio::test]
async fn session_is_reused_across_calls() {
    let (fake, config) = spawn_fake().await;
    let client = ProxmoxClient::new(config).unwrap();

    let nodes = client.list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes[0].is_online());
    assert!(!nodes[1].is_online());
    client.list_nodes().await.unwrap();

    assert_eq!(fake.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_ticket_triggers_one_reauthentication() {
    let (fake, config) = spawn_fake().await;
    let client = ProxmoxClient::new(config).unwrap();
    client.list_nodes().await.unwrap();

    fake.expire_ticket();
    client.list_nodes().await.unwrap();
    assert_eq!(fake.logins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn bad_credentials_are_an_authentication_error() {
    let (_fake, mut config) = spawn_fake().await;
    config.password = "wrong".to_string();
    let client = ProxmoxClient::new(config).unwrap();

    let err = client.authenticate().await.unwrap_err();
    assert!(matches!(err, HypervisorError::Authentication { .. }));
    let err = client.list_nodes().await.unwrap_err();
    assert!(matches!(err, HypervisorError::Authentication { .. }));
}

#[tokio::test]
async fn unreachable_host_fails_authentication() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = ProxmoxClient::new(HypervisorConfig {
        host: "127.0.0.1".to_string(),
        port,
        protocol: "http".to_string(),
        password: "secret".to_string(),
        ..Default::default()
    })
    .unwrap();
    let err = client.authenticate().await.unwrap_err();
    assert!(matches!(err, HypervisorError::Authentication { .. }));
}

#[tokio::test]
async fn create_vm_sends_form_and_csrf_token() {
    let (fake, config) = spawn_fake().await;
    let client = ProxmoxClient::new(config).unwrap();

    client.create_vm("pve1", &spec(105)).await.unwrap();

    let form = fake.last_form.lock().unwrap().clone();
    assert_eq!(form.get("vmid").map(String::as_str), Some("105"));
    assert_eq!(form.get("memory").map(String::as_str), Some("4096"));
    assert_eq!(form.get("net0").map(String::as_str), Some("virtio,bridge=vmbr0"));
    assert_eq!(form.get("scsi0").map(String::as_str), Some("local-lvm:50"));
    assert_eq!(form.get("boot").map(String::as_str), Some("order=scsi0"));
    assert_eq!(fake.last_csrf.lock().unwrap().as_deref(), Some("CSRF1"));
}

#[tokio::test]
async fn existing_vmid_maps_to_vmid_in_use() {
    let (_fake, config) = spawn_fake().await;
    let client = ProxmoxClient::new(config).unwrap();

    let err = client.create_vm("pve1", &spec(100)).await.unwrap_err();
    assert!(matches!(err, HypervisorError::VmidInUse { vmid: 100, .. }));
}

#[tokio::test]
async fn clone_requests_full_clone_and_returns_task() {
    let (fake, config) = spawn_fake().await;
    let client = ProxmoxClient::new(config).unwrap();

    let task = client
        .clone_template("pve1", 9000, 105, "local-lvm")
        .await
        .unwrap();
    assert!(task.as_str().starts_with("UPID:pve1:"));

    let form = fake.last_form.lock().unwrap().clone();
    assert_eq!(form.get("newid").map(String::as_str), Some("105"));
    assert_eq!(form.get("full").map(String::as_str), Some("1"));
    assert_eq!(form.get("storage").map(String::as_str), Some("local-lvm"));
}

#[tokio::test]
async fn vm_status_decodes_counters_and_missing_vm_is_not_found() {
    let (_fake, config) = spawn_fake().await;
    let client = ProxmoxClient::new(config).unwrap();

    let st = client.vm_status("pve1", 101).await.unwrap();
    assert_eq!(st.status, PowerState::Running);
    assert_eq!(st.uptime, 3720);
    assert_eq!(st.maxmem, 2147483648);

    let err = client.vm_status("pve1", 404).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let (fake, config) = spawn_fake().await;
    let client = ProxmoxClient::new(config).unwrap();
    *fake.unavailable.lock().unwrap() = true;

    let err = client.list_nodes().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.op(), "list_nodes");
}

#[tokio::test]
async fn list_backups_keeps_only_backup_volumes() {
    let (_fake, config) = spawn_fake().await;
    let client = ProxmoxClient::new(config).unwrap();

    let backups = client.list_backups("pve1", "local").await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].vmid, Some(101));
    assert!(backups[0].volid.starts_with("local:backup/"));
}
