use crate::error::target;
use crate::inventory::{
    BackupEntry, ConsoleTicket, NodeInfo, PowerAction, PowerState, TaskRef, TaskStatus, VmConfig,
    VmSpec, VmStatus, VmSummary,
};
use crate::{HvResult, Hypervisor, HypervisorConfig, HypervisorError};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// Tickets are valid for two hours; renew a little before that.
const TICKET_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);
const TICKET_RENEW_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
    issued_at: Instant,
}

impl Session {
    fn is_fresh(&self) -> bool {
        self.issued_at.elapsed() + TICKET_RENEW_MARGIN < TICKET_LIFETIME
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Deserialize)]
struct RawTaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Deserialize)]
struct RawVmStatus {
    status: String,
    #[serde(default)]
    cpu: f64,
    #[serde(default)]
    mem: u64,
    #[serde(default)]
    maxmem: u64,
    #[serde(default)]
    disk: u64,
    #[serde(default)]
    maxdisk: u64,
    #[serde(default)]
    netin: u64,
    #[serde(default)]
    netout: u64,
    #[serde(default)]
    uptime: u64,
}

/// Client for the Proxmox VE REST API (`/api2/json`).
///
/// Holds one ticket session shared by all callers. The session is created lazily,
/// renewed before it expires and re-established once when the server answers 401.
pub struct ProxmoxClient {
    client: Client,
    config: HypervisorConfig,
    session: Mutex<Option<Session>>,
}

impl ProxmoxClient {
    pub fn new(config: HypervisorConfig) -> HvResult<Self> {
        // No overall timeout means a stalled node hangs a workflow forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| HypervisorError::Unavailable {
                op: "client_init",
                target: config.host.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            config,
            session: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    async fn login(&self) -> HvResult<Session> {
        let url = self.url("/access/ticket");
        tracing::debug!(
            "🔵 [Proxmox API] POST {} - requesting ticket for {}",
            url,
            self.config.login_name()
        );
        let auth_err = |reason: String| HypervisorError::Authentication {
            host: self.config.host.clone(),
            reason,
        };

        let resp = self
            .client
            .post(&url)
            .form(&[
                ("username", self.config.login_name()),
                ("password", self.config.password.clone()),
            ])
            .send()
            .await
            .map_err(|e| auth_err(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(
                "❌ [Proxmox API] ticket request rejected: status={} body={}",
                status,
                body
            );
            return Err(auth_err(format!("status={} {}", status.as_u16(), body)));
        }

        let env: Envelope<Option<TicketData>> = resp
            .json()
            .await
            .map_err(|e| auth_err(format!("malformed ticket response: {}", e)))?;
        let data = env
            .data
            .ok_or_else(|| auth_err("ticket response carried no data".to_string()))?;

        tracing::info!("✅ [Proxmox API] session established on {}", self.config.host);
        Ok(Session {
            ticket: data.ticket,
            csrf_token: data.csrf_token,
            issued_at: Instant::now(),
        })
    }

    async fn session(&self) -> HvResult<Session> {
        let mut guard = self.session.lock().await;
        if let Some(s) = guard.as_ref().filter(|s| s.is_fresh()) {
            return Ok(s.clone());
        }
        let fresh = self.login().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// Issue one authenticated call and unwrap the `{data}` envelope.
    ///
    /// GET parameters travel as query string, everything else as a form body.
    async fn dispatch<T: DeserializeOwned>(
        &self,
        op: &'static str,
        target: String,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> HvResult<T> {
        let url = self.url(path);
        let mut reauthenticated = false;

        loop {
            let session = self.session().await?;
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header(
                    reqwest::header::COOKIE,
                    format!("PVEAuthCookie={}", session.ticket),
                );
            if method != Method::GET {
                req = req.header("CSRFPreventionToken", session.csrf_token.as_str());
            }
            if !params.is_empty() {
                req = if method == Method::GET {
                    req.query(params)
                } else {
                    req.form(params)
                };
            }

            tracing::debug!("🔵 [Proxmox API] {} {} ({})", method, url, target);
            let resp = req.send().await.map_err(|e| HypervisorError::Unavailable {
                op,
                target: target.clone(),
                reason: if e.is_timeout() {
                    format!("timed out: {}", e)
                } else {
                    e.to_string()
                },
            })?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                tracing::warn!(
                    "⚠️ [Proxmox API] {} {} answered 401, renewing session",
                    method,
                    url
                );
                self.invalidate_session().await;
                reauthenticated = true;
                continue;
            }

            let body = resp.text().await.map_err(|e| HypervisorError::Unavailable {
                op,
                target: target.clone(),
                reason: format!("failed reading body: {}", e),
            })?;

            if !status.is_success() {
                tracing::warn!(
                    "❌ [Proxmox API] {} {} failed: status={} body={}",
                    method,
                    url,
                    status,
                    body
                );
                return Err(self.map_status(op, target, status, body));
            }

            let env: Envelope<T> =
                serde_json::from_str(&body).map_err(|e| HypervisorError::Decode {
                    op,
                    target: target.clone(),
                    reason: e.to_string(),
                })?;
            return Ok(env.data);
        }
    }

    fn map_status(
        &self,
        op: &'static str,
        target: String,
        status: StatusCode,
        body: String,
    ) -> HypervisorError {
        let lowered = body.to_ascii_lowercase();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return HypervisorError::Authentication {
                host: self.config.host.clone(),
                reason: format!("{} rejected with status={}", op, status.as_u16()),
            };
        }
        if status == StatusCode::NOT_FOUND
            || lowered.contains("does not exist")
            || lowered.contains("no such")
        {
            return HypervisorError::NotFound { op, target };
        }
        if status.is_server_error() && !lowered.contains("already exists") {
            return HypervisorError::Unavailable {
                op,
                target,
                reason: format!("status={} {}", status.as_u16(), body),
            };
        }
        HypervisorError::Api {
            op,
            target,
            status: status.as_u16(),
            body,
        }
    }

    async fn task(
        &self,
        op: &'static str,
        target: String,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> HvResult<TaskRef> {
        let upid: Option<String> = self.dispatch(op, target.clone(), method, path, params).await?;
        match upid.filter(|u| !u.trim().is_empty()) {
            Some(u) => Ok(TaskRef(u)),
            None => Err(HypervisorError::Decode {
                op,
                target,
                reason: "no task id in response".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn authenticate(&self) -> HvResult<()> {
        self.invalidate_session().await;
        self.session().await.map(|_| ())
    }

    async fn list_nodes(&self) -> HvResult<Vec<NodeInfo>> {
        self.dispatch("list_nodes", target(None, None), Method::GET, "/nodes", &[])
            .await
    }

    async fn list_vms(&self, node: &str) -> HvResult<Vec<VmSummary>> {
        self.dispatch(
            "list_vms",
            target(Some(node), None),
            Method::GET,
            &format!("/nodes/{}/qemu", node),
            &[],
        )
        .await
    }

    async fn create_vm(&self, node: &str, spec: &VmSpec) -> HvResult<()> {
        tracing::info!(
            "🔵 [Proxmox API] creating vm {} ({}) on {}: cores={} memory={}MB disk={}GB",
            spec.vmid,
            spec.name,
            node,
            spec.cores,
            spec.memory_mb,
            spec.disk_gb
        );
        let res: HvResult<serde_json::Value> = self
            .dispatch(
                "create_vm",
                target(Some(node), Some(spec.vmid)),
                Method::POST,
                &format!("/nodes/{}/qemu", node),
                &spec.form(),
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(HypervisorError::Api { body, .. })
                if body.to_ascii_lowercase().contains("already exists") =>
            {
                Err(HypervisorError::VmidInUse {
                    node: node.to_string(),
                    vmid: spec.vmid,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn clone_template(
        &self,
        node: &str,
        template_id: u32,
        new_id: u32,
        storage: &str,
    ) -> HvResult<TaskRef> {
        tracing::info!(
            "🔵 [Proxmox API] cloning template {} into {} on {} (storage={})",
            template_id,
            new_id,
            node,
            storage
        );
        self.task(
            "clone_template",
            target(Some(node), Some(new_id)),
            Method::POST,
            &format!("/nodes/{}/qemu/{}/clone", node, template_id),
            &[
                ("newid", new_id.to_string()),
                ("full", "1".to_string()),
                ("storage", storage.to_string()),
            ],
        )
        .await
    }

    async fn task_status(&self, node: &str, task: &TaskRef) -> HvResult<TaskStatus> {
        let raw: RawTaskStatus = self
            .dispatch(
                "task_status",
                format!("{} task={}", target(Some(node), None), task),
                Method::GET,
                &format!("/nodes/{}/tasks/{}/status", node, task.as_str()),
                &[],
            )
            .await?;
        if raw.status.eq_ignore_ascii_case("running") {
            return Ok(TaskStatus::Running);
        }
        let exit_ok = raw
            .exitstatus
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("OK"))
            .unwrap_or(false);
        Ok(TaskStatus::Stopped {
            exit_ok,
            exitstatus: raw.exitstatus,
        })
    }

    async fn configure_vm(&self, node: &str, vmid: u32, config: &VmConfig) -> HvResult<()> {
        let _: serde_json::Value = self
            .dispatch(
                "configure_vm",
                target(Some(node), Some(vmid)),
                Method::PUT,
                &format!("/nodes/{}/qemu/{}/config", node, vmid),
                &config.form(),
            )
            .await?;
        Ok(())
    }

    async fn power_action(
        &self,
        node: &str,
        vmid: u32,
        action: PowerAction,
    ) -> HvResult<TaskRef> {
        tracing::info!(
            "🔵 [Proxmox API] {} vm {} on {}",
            action.as_str(),
            vmid,
            node
        );
        self.task(
            "power_action",
            target(Some(node), Some(vmid)),
            Method::POST,
            &format!("/nodes/{}/qemu/{}/status/{}", node, vmid, action.as_str()),
            &[],
        )
        .await
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> HvResult<VmStatus> {
        let tgt = target(Some(node), Some(vmid));
        let raw: RawVmStatus = self
            .dispatch(
                "vm_status",
                tgt.clone(),
                Method::GET,
                &format!("/nodes/{}/qemu/{}/status/current", node, vmid),
                &[],
            )
            .await?;
        let status = PowerState::parse(&raw.status).ok_or_else(|| HypervisorError::Decode {
            op: "vm_status",
            target: tgt,
            reason: format!("unknown power state '{}'", raw.status),
        })?;
        Ok(VmStatus {
            status,
            cpu: raw.cpu,
            mem: raw.mem,
            maxmem: raw.maxmem,
            disk: raw.disk,
            maxdisk: raw.maxdisk,
            netin: raw.netin,
            netout: raw.netout,
            uptime: raw.uptime,
        })
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> HvResult<TaskRef> {
        tracing::info!("🗑️ [Proxmox API] deleting vm {} on {}", vmid, node);
        self.task(
            "delete_vm",
            target(Some(node), Some(vmid)),
            Method::DELETE,
            &format!("/nodes/{}/qemu/{}", node, vmid),
            &[],
        )
        .await
    }

    async fn create_backup(&self, node: &str, vmid: u32, storage: &str) -> HvResult<TaskRef> {
        tracing::info!(
            "🔵 [Proxmox API] backing up vm {} on {} to {}",
            vmid,
            node,
            storage
        );
        self.task(
            "create_backup",
            target(Some(node), Some(vmid)),
            Method::POST,
            &format!("/nodes/{}/vzdump", node),
            &[
                ("vmid", vmid.to_string()),
                ("storage", storage.to_string()),
                ("mode", "snapshot".to_string()),
                ("compress", "gzip".to_string()),
                ("notes-template", format!("Backup of VM {}", vmid)),
            ],
        )
        .await
    }

    async fn list_backups(&self, node: &str, storage: &str) -> HvResult<Vec<BackupEntry>> {
        let entries: Vec<BackupEntry> = self
            .dispatch(
                "list_backups",
                format!("{} storage={}", target(Some(node), None), storage),
                Method::GET,
                &format!("/nodes/{}/storage/{}/content", node, storage),
                &[("content", "backup".to_string())],
            )
            .await?;
        Ok(entries.into_iter().filter(|e| e.is_backup()).collect())
    }

    async fn restore_backup(
        &self,
        node: &str,
        vmid: u32,
        archive: &str,
        storage: &str,
    ) -> HvResult<TaskRef> {
        // Bare file names are resolved against the backup storage.
        let archive = if archive.contains(':') {
            archive.to_string()
        } else {
            format!("{}:backup/{}", storage, archive)
        };
        tracing::info!(
            "🔵 [Proxmox API] restoring {} into vm {} on {}",
            archive,
            vmid,
            node
        );
        self.task(
            "restore_backup",
            target(Some(node), Some(vmid)),
            Method::POST,
            &format!("/nodes/{}/qemu", node),
            &[
                ("vmid", vmid.to_string()),
                ("archive", archive),
                ("force", "1".to_string()),
            ],
        )
        .await
    }

    async fn console_ticket(&self, node: &str, vmid: u32) -> HvResult<ConsoleTicket> {
        self.dispatch(
            "console_ticket",
            target(Some(node), Some(vmid)),
            Method::POST,
            &format!("/nodes/{}/qemu/{}/vncproxy", node, vmid),
            &[],
        )
        .await
    }
}
