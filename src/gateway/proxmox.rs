//! Proxmox VE REST binding
//!
//! Every response is wrapped as `{"data": ...}`. Writes are form encoded.
//! Authentication uses an API token (`PVEAPIToken=user!name=secret`).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{CloneRequest, ClusterGateway, GatewayError, InterfaceMap, TaskId, TaskStatus, VmInfo};
use crate::config::ConnectionSettings;

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    node: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceEntry {
    vmid: Option<u32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    template: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl ResourceEntry {
    fn into_vm(self, default_node: &str) -> Option<VmInfo> {
        if matches!(self.kind.as_deref(), Some(kind) if kind != "qemu") {
            return None;
        }
        Some(VmInfo {
            vmid: self.vmid?,
            name: self.name.unwrap_or_default(),
            node: self.node.unwrap_or_else(|| default_node.to_string()),
            status: self.status.unwrap_or_default(),
            template: flag(self.template.as_ref()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PoolEntry {
    #[serde(default)]
    members: Vec<ResourceEntry>,
}

#[derive(Debug, Deserialize)]
struct BridgeEntry {
    iface: String,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

// ============================================================================
// SBIO: Pure helpers (no I/O)
// ============================================================================

/// Proxmox booleans arrive as 0/1, "0"/"1" or true/false
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => s == "1",
        _ => false,
    }
}

fn bool_param(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Map an HTTP failure onto the gateway taxonomy
fn classify_error(status: u16, body: &str) -> GatewayError {
    let lower = body.to_lowercase();
    if status == 404 || lower.contains("does not exist") || lower.contains("no such") {
        GatewayError::NotFound(body.trim().to_string())
    } else if lower.contains("already exists") {
        GatewayError::Conflict(body.trim().to_string())
    } else {
        GatewayError::Api {
            status,
            message: body.trim().to_string(),
        }
    }
}

/// Only a 404 from the task endpoint means the task was reaped. Other
/// failures, including "no such" bodies, stay errors.
fn classify_task_error(status: u16, body: &str) -> GatewayError {
    if status == 404 {
        return GatewayError::TaskGone(body.trim().to_string());
    }
    match classify_error(status, body) {
        GatewayError::NotFound(message) => GatewayError::Api { status, message },
        other => other,
    }
}

fn parse_task(entry: TaskEntry) -> TaskStatus {
    if entry.status == "running" {
        return TaskStatus::Running;
    }
    match entry.exitstatus.as_deref() {
        Some("OK") | None => TaskStatus::Completed,
        Some(other) => TaskStatus::Failed(other.to_string()),
    }
}

fn parse_vmid(value: &Value) -> Result<u32, GatewayError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| GatewayError::Parse(format!("invalid vmid {}", n))),
        Value::String(s) => s
            .parse()
            .map_err(|_| GatewayError::Parse(format!("invalid vmid '{}'", s))),
        other => Err(GatewayError::Parse(format!("invalid vmid {}", other))),
    }
}

fn parse_task_id(value: Value) -> Result<TaskId, GatewayError> {
    match value {
        Value::String(upid) => Ok(TaskId(upid)),
        other => Err(GatewayError::Parse(format!("expected task id, got {}", other))),
    }
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct ProxmoxGateway {
    client: reqwest::Client,
    base_url: String,
    auth_header: String,
}

impl ProxmoxGateway {
    pub fn new(settings: &ConnectionSettings) -> Result<Self, GatewayError> {
        if settings.host.is_empty() {
            return Err(GatewayError::Config("no cluster host configured".to_string()));
        }
        let (Some(token_name), Some(token_value)) = (&settings.token_name, &settings.token_value)
        else {
            return Err(GatewayError::Config(
                "API token name and value are required".to_string(),
            ));
        };

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url(),
            auth_header: format!(
                "PVEAPIToken={}!{}={}",
                settings.user, token_name, token_value
            ),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        self.client
            .request(method, url)
            .header("Authorization", &self.auth_header)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value, GatewayError> {
        self.send_with(req, classify_error).await
    }

    async fn send_with(
        &self,
        req: RequestBuilder,
        classify: fn(u16, &str) -> GatewayError,
    ) -> Result<Value, GatewayError> {
        let response = req.send().await.map_err(|e| GatewayError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let reason = status.canonical_reason().unwrap_or_default();
            return Err(classify(status.as_u16(), &format!("{} {}", reason, text)));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let data = self.send(self.request(Method::GET, path)).await?;
        serde_json::from_value(data).map_err(|e| GatewayError::Parse(e.to_string()))
    }

    async fn write(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        debug!("{} {}", method, path);
        self.send(self.request(method, path).form(form)).await
    }

    async fn exists(&self, path: &str) -> Result<bool, GatewayError> {
        match self.send(self.request(Method::GET, path)).await {
            Ok(_) => Ok(true),
            Err(GatewayError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bridge_with(
        &self,
        node: &str,
        name: &str,
        vlan_aware: bool,
    ) -> Result<(), GatewayError> {
        let mut form = vec![
            ("iface", name.to_string()),
            ("type", "bridge".to_string()),
            ("autostart", "1".to_string()),
        ];
        if vlan_aware {
            form.push(("bridge_vlan_aware", "1".to_string()));
        }
        self.write(Method::POST, &format!("/nodes/{}/network", node), &form)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterGateway for ProxmoxGateway {
    async fn get_nodes(&self) -> Result<Vec<String>, GatewayError> {
        let nodes: Vec<NodeEntry> = self.get("/nodes").await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.status.as_deref().map_or(true, |s| s == "online"))
            .map(|n| n.node)
            .collect())
    }

    async fn get_vms_on_node(&self, node: &str) -> Result<Vec<VmInfo>, GatewayError> {
        let entries: Vec<ResourceEntry> = self.get(&format!("/nodes/{}/qemu", node)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| e.into_vm(node))
            .collect())
    }

    async fn find_vm(&self, vmid: u32) -> Result<Option<VmInfo>, GatewayError> {
        let entries: Vec<ResourceEntry> = self.get("/cluster/resources?type=vm").await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.vmid == Some(vmid))
            .find_map(|e| e.into_vm("")))
    }

    async fn get_next_vmid(&self) -> Result<u32, GatewayError> {
        let data = self.send(self.request(Method::GET, "/cluster/nextid")).await?;
        parse_vmid(&data)
    }

    async fn clone_vm(&self, request: &CloneRequest) -> Result<TaskId, GatewayError> {
        let mut form = vec![
            ("newid", request.new_vmid.to_string()),
            ("name", request.name.clone()),
            ("target", request.target_node.clone()),
            ("full", bool_param(request.full_clone)),
        ];
        if let Some(ref pool) = request.pool {
            form.push(("pool", pool.clone()));
        }
        let path = format!(
            "/nodes/{}/qemu/{}/clone",
            request.source_node, request.source_vmid
        );
        parse_task_id(self.write(Method::POST, &path, &form).await?)
    }

    async fn task_status(&self, node: &str, task: &TaskId) -> Result<TaskStatus, GatewayError> {
        let path = format!("/nodes/{}/tasks/{}/status", node, task);
        let data = self
            .send_with(self.request(Method::GET, &path), classify_task_error)
            .await?;
        let entry: TaskEntry =
            serde_json::from_value(data).map_err(|e| GatewayError::Parse(e.to_string()))?;
        Ok(parse_task(entry))
    }

    async fn convert_to_template(&self, node: &str, vmid: u32) -> Result<(), GatewayError> {
        let path = format!("/nodes/{}/qemu/{}/template", node, vmid);
        self.write(Method::POST, &path, &[]).await?;
        Ok(())
    }

    async fn migrate_vm(
        &self,
        source_node: &str,
        vmid: u32,
        target_node: &str,
        online: bool,
    ) -> Result<TaskId, GatewayError> {
        let path = format!("/nodes/{}/qemu/{}/migrate", source_node, vmid);
        let form = [
            ("target", target_node.to_string()),
            ("online", bool_param(online)),
        ];
        parse_task_id(self.write(Method::POST, &path, &form).await?)
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> Result<TaskId, GatewayError> {
        let path = format!("/nodes/{}/qemu/{}/status/stop", node, vmid);
        parse_task_id(self.write(Method::POST, &path, &[]).await?)
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<TaskId, GatewayError> {
        let path = format!("/nodes/{}/qemu/{}?purge=1", node, vmid);
        parse_task_id(self.write(Method::DELETE, &path, &[]).await?)
    }

    async fn vm_config(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        let raw: BTreeMap<String, Value> = self
            .get(&format!("/nodes/{}/qemu/{}/config", node, vmid))
            .await?;
        Ok(raw
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect())
    }

    async fn configure_vm_network(
        &self,
        node: &str,
        vmid: u32,
        interfaces: &InterfaceMap,
    ) -> Result<(), GatewayError> {
        let form: Vec<(&str, String)> = interfaces
            .iter()
            .map(|(slot, definition)| (slot.as_str(), definition.clone()))
            .collect();
        let path = format!("/nodes/{}/qemu/{}/config", node, vmid);
        self.write(Method::POST, &path, &form).await?;
        Ok(())
    }

    async fn remove_vm_interfaces(
        &self,
        node: &str,
        vmid: u32,
        slots: &[String],
    ) -> Result<(), GatewayError> {
        if slots.is_empty() {
            return Ok(());
        }
        let path = format!("/nodes/{}/qemu/{}/config", node, vmid);
        self.write(Method::POST, &path, &[("delete", slots.join(","))])
            .await?;
        Ok(())
    }

    async fn list_bridges(&self, node: &str) -> Result<Vec<String>, GatewayError> {
        let entries: Vec<BridgeEntry> = self
            .get(&format!("/nodes/{}/network?type=bridge", node))
            .await?;
        Ok(entries.into_iter().map(|e| e.iface).collect())
    }

    async fn create_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError> {
        self.create_bridge_with(node, name, false).await
    }

    async fn create_vlan_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError> {
        self.create_bridge_with(node, name, true).await
    }

    async fn delete_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError> {
        let path = format!("/nodes/{}/network/{}", node, name);
        self.write(Method::DELETE, &path, &[]).await?;
        Ok(())
    }

    async fn reload_node_network(&self, node: &str) -> Result<(), GatewayError> {
        self.write(Method::PUT, &format!("/nodes/{}/network", node), &[])
            .await?;
        Ok(())
    }

    async fn user_exists(&self, userid: &str) -> Result<bool, GatewayError> {
        self.exists(&format!("/access/users/{}", userid)).await
    }

    async fn create_user(&self, userid: &str, password: &str) -> Result<(), GatewayError> {
        let form = [
            ("userid", userid.to_string()),
            ("password", password.to_string()),
        ];
        self.write(Method::POST, "/access/users", &form).await?;
        Ok(())
    }

    async fn set_user_password(&self, userid: &str, password: &str) -> Result<(), GatewayError> {
        let form = [
            ("userid", userid.to_string()),
            ("password", password.to_string()),
        ];
        self.write(Method::PUT, "/access/password", &form).await?;
        Ok(())
    }

    async fn delete_user(&self, userid: &str) -> Result<(), GatewayError> {
        self.write(Method::DELETE, &format!("/access/users/{}", userid), &[])
            .await?;
        Ok(())
    }

    async fn pool_exists(&self, poolid: &str) -> Result<bool, GatewayError> {
        self.exists(&format!("/pools/{}", poolid)).await
    }

    async fn create_pool(&self, poolid: &str, comment: &str) -> Result<(), GatewayError> {
        let form = [
            ("poolid", poolid.to_string()),
            ("comment", comment.to_string()),
        ];
        self.write(Method::POST, "/pools", &form).await?;
        Ok(())
    }

    async fn delete_pool(&self, poolid: &str) -> Result<(), GatewayError> {
        self.write(Method::DELETE, &format!("/pools/{}", poolid), &[])
            .await?;
        Ok(())
    }

    async fn pool_members(&self, poolid: &str) -> Result<Vec<VmInfo>, GatewayError> {
        let pool: PoolEntry = self.get(&format!("/pools/{}", poolid)).await?;
        Ok(pool
            .members
            .into_iter()
            .filter_map(|m| m.into_vm(""))
            .collect())
    }

    async fn set_pool_permissions(
        &self,
        userid: &str,
        poolid: &str,
        roles: &[String],
    ) -> Result<(), GatewayError> {
        let form = [
            ("path", format!("/pool/{}", poolid)),
            ("roles", roles.join(",")),
            ("users", userid.to_string()),
            ("propagate", "1".to_string()),
        ];
        self.write(Method::PUT, "/access/acl", &form).await?;
        Ok(())
    }

    async fn grant_vm_permission(
        &self,
        userid: &str,
        _node: &str,
        vmid: u32,
        role: &str,
    ) -> Result<(), GatewayError> {
        let form = [
            ("path", format!("/vms/{}", vmid)),
            ("roles", role.to_string()),
            ("users", userid.to_string()),
            ("propagate", "0".to_string()),
        ];
        self.write(Method::PUT, "/access/acl", &form).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            host: "pve.lab".to_string(),
            token_name: Some("standctl".to_string()),
            token_value: Some("secret".to_string()),
            ..ConnectionSettings::default()
        }
    }

    #[test]
    fn test_new_requires_token() {
        let mut s = settings();
        s.token_value = None;
        assert!(matches!(ProxmoxGateway::new(&s), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_new_requires_host() {
        let mut s = settings();
        s.host.clear();
        assert!(matches!(ProxmoxGateway::new(&s), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_auth_header_format() {
        let gateway = ProxmoxGateway::new(&settings()).unwrap();
        assert_eq!(gateway.auth_header, "PVEAPIToken=root@pam!standctl=secret");
        assert_eq!(gateway.base_url(), "https://pve.lab:8006/api2/json");
    }

    #[test]
    fn test_flag_variants() {
        assert!(flag(Some(&json!(1))));
        assert!(flag(Some(&json!("1"))));
        assert!(flag(Some(&json!(true))));
        assert!(!flag(Some(&json!(0))));
        assert!(!flag(None));
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error(500, "pool 'alice' does not exist"),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            classify_error(500, "no such user ('bob@pve')"),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            classify_error(500, "VM 105 already exists on node 'pve1'"),
            GatewayError::Conflict(_)
        ));
        assert!(matches!(
            classify_error(403, "Permission check failed"),
            GatewayError::Api { status: 403, .. }
        ));
    }

    #[test]
    fn test_classify_task_error() {
        assert!(matches!(
            classify_task_error(404, "Not Found"),
            GatewayError::TaskGone(_)
        ));
        assert!(matches!(
            classify_task_error(500, "no such task"),
            GatewayError::Api { status: 500, .. }
        ));
        assert!(matches!(
            classify_task_error(500, "hostname lookup 'pve9' failed - does not exist"),
            GatewayError::Api { status: 500, .. }
        ));
        assert!(matches!(
            classify_task_error(599, "connection timed out"),
            GatewayError::Api { status: 599, .. }
        ));
    }

    #[test]
    fn test_parse_task_states() {
        let running = TaskEntry {
            status: "running".into(),
            exitstatus: None,
        };
        let ok = TaskEntry {
            status: "stopped".into(),
            exitstatus: Some("OK".into()),
        };
        let failed = TaskEntry {
            status: "stopped".into(),
            exitstatus: Some("can't lock file".into()),
        };
        assert_eq!(parse_task(running), TaskStatus::Running);
        assert_eq!(parse_task(ok), TaskStatus::Completed);
        assert_eq!(
            parse_task(failed),
            TaskStatus::Failed("can't lock file".into())
        );
    }

    #[test]
    fn test_parse_vmid_accepts_string_and_number() {
        assert_eq!(parse_vmid(&json!("105")).unwrap(), 105);
        assert_eq!(parse_vmid(&json!(106)).unwrap(), 106);
        assert!(parse_vmid(&json!(null)).is_err());
    }

    #[test]
    fn test_resource_entry_skips_containers() {
        let entries: Vec<ResourceEntry> = serde_json::from_value(json!([
            {"vmid": 100, "name": "tpl", "node": "pve1", "status": "stopped", "template": 1, "type": "qemu"},
            {"vmid": 200, "name": "ct", "node": "pve1", "status": "running", "type": "lxc"}
        ]))
        .unwrap();
        let vms: Vec<VmInfo> = entries.into_iter().filter_map(|e| e.into_vm("")).collect();
        assert_eq!(vms.len(), 1);
        assert!(vms[0].template);
        assert_eq!(vms[0].node, "pve1");
    }
}
