//! Typed, stateless façade over the remote cloud's identity, compute,
//! block-storage, and network capabilities. Every call takes an explicit
//! [`Session`] so the caller controls tenant scope; the client itself holds
//! no credentials.
//!
//! When a session's `dry_run` flag is set, mutating calls return synthetic
//! `dryrun-<uuid>` identifiers without contacting the remote — this is what
//! lets the restore planner and snapshot worker be exercised end to end with
//! `RESTORE_DRY_RUN=true` / `AUTO_SNAPSHOT_DRY_RUN=true`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;

use crate::cloud::retry::{classify_status, retry_with_backoff, RetryPolicy};
use crate::domain::ports::{
    ComputeApi, FlavorInfo, IdentityApi, NetworkApi, NetworkId, PortId, PortInfo, PortSpec,
    ProjectId, Quotas, RoleAssignment, ServerInfo, ServerSpec, Session, SnapshotId, SnapshotInfo,
    StorageApi, UserId, VmId, VolumeFromSnapshotSpec, VolumeId, VolumeInfo,
};
use crate::error::{Error, Result};
use crate::session::credentials::ServiceUserCredentials;

fn dryrun_id() -> String {
    format!("dryrun-{}", uuid::Uuid::new_v4())
}

/// A single OpenStack-style deployment's four endpoint base URLs.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub identity: String,
    pub compute: String,
    pub volume: String,
    pub network: String,
}

pub struct CloudClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    retry_policy: RetryPolicy,
}

impl CloudClient {
    pub fn new(endpoints: Endpoints, retry_policy: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(retry_policy.request_timeout)
            .build()?;
        Ok(Self { http, endpoints, retry_policy })
    }

    async fn get_json<T: DeserializeOwned>(&self, session: &Session, url: &str) -> Result<T> {
        retry_with_backoff(&self.retry_policy, "GET", || async {
            let resp = self
                .http
                .get(url)
                .bearer_auth(&session.token)
                .send()
                .await
                .map_err(|e| Error::Transient(e.to_string()))?;
            self.decode(resp).await
        })
        .await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        session: &Session,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        retry_with_backoff(&self.retry_policy, method.as_str(), || async {
            let resp = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&session.token)
                .json(body)
                .send()
                .await
                .map_err(|e| Error::Transient(e.to_string()))?;
            self.decode(resp).await
        })
        .await
    }

    async fn decode<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            resp.json::<T>().await.map_err(|e| Error::Internal(e.to_string()))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(classify_status(status, body))
        }
    }

    async fn send_no_body(&self, method: reqwest::Method, session: &Session, url: &str) -> Result<()> {
        retry_with_backoff(&self.retry_policy, method.as_str(), || async {
            let resp = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&session.token)
                .send()
                .await
                .map_err(|e| Error::Transient(e.to_string()))?;
            let status = resp.status();
            if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
                Ok(())
            } else {
                let body = resp.text().await.unwrap_or_default();
                Err(classify_status(status, body))
            }
        })
        .await
    }

    async fn poll_until<F, Fut>(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        mut predicate: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[async_trait]
impl IdentityApi for CloudClient {
    #[instrument(skip(self, credential))]
    async fn authenticate(
        &self,
        credential: &ServiceUserCredentials,
        project_id: Option<&ProjectId>,
    ) -> Result<Session> {
        let url = format!("{}/v3/auth/tokens", self.endpoints.identity);
        let body = json!({
            "email": credential.email,
            "password": credential.password,
            "project_id": project_id.map(|p| p.to_string()),
        });
        #[derive(serde::Deserialize)]
        struct AuthResponse {
            token: String,
            project_id: String,
            expires_in_seconds: i64,
        }
        let resp: AuthResponse = self.send_json(reqwest::Method::POST, &placeholder_session(), &url, &body).await?;
        Ok(Session {
            token: resp.token,
            project_id: resp.project_id.into(),
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(resp.expires_in_seconds),
            dry_run: false,
        })
    }

    #[instrument(skip(self, session))]
    async fn grant_role(
        &self,
        session: &Session,
        user_id: &UserId,
        project_id: &ProjectId,
        role: &str,
    ) -> Result<()> {
        if session.dry_run {
            return Ok(());
        }
        let url = format!(
            "{}/v3/projects/{}/users/{}/roles/{}",
            self.endpoints.identity, project_id, user_id, role
        );
        // A duplicate grant surfaces as ConflictError already classified by decode().
        self.send_no_body(reqwest::Method::PUT, session, &url).await
    }

    #[instrument(skip(self, session))]
    async fn find_user_by_email(&self, session: &Session, email: &str) -> Result<Option<UserId>> {
        let url = format!("{}/v3/users?name={}", self.endpoints.identity, email);
        #[derive(serde::Deserialize)]
        struct UserList {
            users: Vec<UserEntry>,
        }
        #[derive(serde::Deserialize)]
        struct UserEntry {
            id: String,
        }
        let list: UserList = self.get_json(session, &url).await?;
        Ok(list.users.into_iter().next().map(|u| u.id.into()))
    }

    async fn list_role_assignments(
        &self,
        session: &Session,
        user_id: Option<&UserId>,
    ) -> Result<Vec<RoleAssignment>> {
        let url = match user_id {
            Some(u) => format!("{}/v3/role_assignments?user.id={}", self.endpoints.identity, u),
            None => format!("{}/v3/role_assignments", self.endpoints.identity),
        };
        #[derive(serde::Deserialize)]
        struct AssignmentList {
            role_assignments: Vec<RoleAssignment>,
        }
        let list: AssignmentList = self.get_json(session, &url).await?;
        Ok(list.role_assignments)
    }
}

#[async_trait]
impl ComputeApi for CloudClient {
    async fn get_server(&self, session: &Session, vm_id: &VmId) -> Result<Option<ServerInfo>> {
        let url = format!("{}/servers/{}", self.endpoints.compute, vm_id);
        match self.get_json::<ServerInfo>(session, &url).await {
            Ok(s) => Ok(Some(s)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_servers(&self, session: &Session, project_id: &ProjectId) -> Result<Vec<ServerInfo>> {
        let url = format!("{}/servers?project_id={}", self.endpoints.compute, project_id);
        #[derive(serde::Deserialize)]
        struct ServerList {
            servers: Vec<ServerInfo>,
        }
        let list: ServerList = self.get_json(session, &url).await?;
        Ok(list.servers)
    }

    async fn delete_server(&self, session: &Session, vm_id: &VmId) -> Result<()> {
        if session.dry_run {
            return Ok(());
        }
        let url = format!("{}/servers/{}", self.endpoints.compute, vm_id);
        self.send_no_body(reqwest::Method::DELETE, session, &url).await
    }

    #[instrument(skip(self, session, spec))]
    async fn create_server(&self, session: &Session, spec: &ServerSpec) -> Result<VmId> {
        if session.dry_run {
            return Ok(dryrun_id().into());
        }
        let url = format!("{}/servers", self.endpoints.compute);
        let body = json!({
            "name": spec.name,
            "flavorRef": spec.flavor_id,
            "block_device_mapping_v2": [{ "boot_index": 0, "uuid": spec.boot_volume_id.to_string() }],
            "networks": spec.port_ids.iter().map(|p| json!({ "port": p.to_string() })).collect::<Vec<_>>(),
            "user_data": spec.user_data,
            "security_groups": spec.security_group_ids,
        });
        #[derive(serde::Deserialize)]
        struct CreateServerResponse {
            id: String,
        }
        let resp: CreateServerResponse = self.send_json(reqwest::Method::POST, session, &url, &body).await?;
        Ok(resp.id.into())
    }

    async fn get_user_data(&self, session: &Session, vm_id: &VmId) -> Result<Option<String>> {
        let url = format!("{}/servers/{}/os-server-metadata/user_data", self.endpoints.compute, vm_id);
        #[derive(serde::Deserialize)]
        struct UserDataResponse {
            user_data: Option<String>,
        }
        match self.get_json::<UserDataResponse>(session, &url).await {
            Ok(r) => Ok(r.user_data),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, session))]
    async fn wait_server_status(
        &self,
        session: &Session,
        vm_id: &VmId,
        target: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        if session.dry_run {
            return Ok(());
        }
        self.poll_until(timeout, poll_interval, || async {
            match self.get_server(session, vm_id).await? {
                Some(s) => Ok(s.status.eq_ignore_ascii_case(target)),
                None => Ok(target.eq_ignore_ascii_case("DELETED")),
            }
        })
        .await
    }

    async fn get_quotas(&self, session: &Session, project_id: &ProjectId) -> Result<Quotas> {
        let url = format!("{}/os-quota-sets/{}/detail", self.endpoints.compute, project_id);
        self.get_json(session, &url).await
    }

    async fn list_flavors(&self, session: &Session) -> Result<Vec<FlavorInfo>> {
        let url = format!("{}/flavors/detail", self.endpoints.compute);
        #[derive(serde::Deserialize)]
        struct FlavorList {
            flavors: Vec<FlavorInfo>,
        }
        let list: FlavorList = self.get_json(session, &url).await?;
        Ok(list.flavors)
    }
}

#[async_trait]
impl StorageApi for CloudClient {
    #[instrument(skip(self, session, spec))]
    async fn create_volume_from_snapshot(
        &self,
        session: &Session,
        spec: &VolumeFromSnapshotSpec,
    ) -> Result<VolumeId> {
        if session.dry_run {
            return Ok(dryrun_id().into());
        }
        let url = format!("{}/volumes", self.endpoints.volume);
        let body = json!({
            "volume": {
                "snapshot_id": spec.snapshot_id.to_string(),
                "name": spec.name,
                "size": spec.size_gb,
            }
        });
        #[derive(serde::Deserialize)]
        struct CreateVolumeResponse {
            volume: VolumeEntry,
        }
        #[derive(serde::Deserialize)]
        struct VolumeEntry {
            id: String,
        }
        let resp: CreateVolumeResponse = self.send_json(reqwest::Method::POST, session, &url, &body).await?;
        Ok(resp.volume.id.into())
    }

    async fn wait_volume_status(
        &self,
        session: &Session,
        volume_id: &VolumeId,
        target: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        if session.dry_run {
            return Ok(());
        }
        self.poll_until(timeout, poll_interval, || async {
            match self.get_volume(session, volume_id).await? {
                Some(v) => Ok(v.status.eq_ignore_ascii_case(target)),
                None => Ok(target.eq_ignore_ascii_case("DELETED")),
            }
        })
        .await
    }

    async fn delete_volume(&self, session: &Session, volume_id: &VolumeId) -> Result<()> {
        if session.dry_run {
            return Ok(());
        }
        let url = format!("{}/volumes/{}", self.endpoints.volume, volume_id);
        self.send_no_body(reqwest::Method::DELETE, session, &url).await
    }

    async fn list_snapshots(
        &self,
        session: &Session,
        volume_id: Option<&VolumeId>,
        metadata_equals: &HashMap<String, String>,
    ) -> Result<Vec<SnapshotInfo>> {
        let mut url = format!("{}/snapshots/detail", self.endpoints.volume);
        let mut params = vec![];
        if let Some(v) = volume_id {
            params.push(format!("volume_id={v}"));
        }
        for (k, v) in metadata_equals {
            params.push(format!("metadata[{k}]={v}"));
        }
        if !params.is_empty() {
            url = format!("{url}?{}", params.join("&"));
        }
        #[derive(serde::Deserialize)]
        struct SnapshotList {
            snapshots: Vec<SnapshotInfo>,
        }
        let list: SnapshotList = self.get_json(session, &url).await?;
        Ok(list.snapshots)
    }

    #[instrument(skip(self, session, metadata))]
    async fn create_snapshot(
        &self,
        session: &Session,
        volume_id: &VolumeId,
        name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<SnapshotId> {
        if session.dry_run {
            return Ok(dryrun_id().into());
        }
        let url = format!("{}/snapshots", self.endpoints.volume);
        let body = json!({
            "snapshot": {
                "volume_id": volume_id.to_string(),
                "name": name,
                "metadata": metadata,
                "force": true,
            }
        });
        #[derive(serde::Deserialize)]
        struct CreateSnapshotResponse {
            snapshot: SnapshotEntry,
        }
        #[derive(serde::Deserialize)]
        struct SnapshotEntry {
            id: String,
        }
        let resp: CreateSnapshotResponse = self.send_json(reqwest::Method::POST, session, &url, &body).await?;
        Ok(resp.snapshot.id.into())
    }

    async fn delete_snapshot(&self, session: &Session, snapshot_id: &SnapshotId) -> Result<()> {
        if session.dry_run {
            return Ok(());
        }
        let url = format!("{}/snapshots/{}", self.endpoints.volume, snapshot_id);
        self.send_no_body(reqwest::Method::DELETE, session, &url).await
    }

    async fn get_snapshot(&self, session: &Session, snapshot_id: &SnapshotId) -> Result<Option<SnapshotInfo>> {
        let url = format!("{}/snapshots/{}", self.endpoints.volume, snapshot_id);
        match self.get_json::<SnapshotInfo>(session, &url).await {
            Ok(s) => Ok(Some(s)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_volume(&self, session: &Session, volume_id: &VolumeId) -> Result<Option<VolumeInfo>> {
        let url = format!("{}/volumes/{}", self.endpoints.volume, volume_id);
        match self.get_json::<VolumeInfo>(session, &url).await {
            Ok(v) => Ok(Some(v)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_quotas(&self, session: &Session, project_id: &ProjectId) -> Result<Quotas> {
        let url = format!("{}/os-quota-sets/{}?usage=true", self.endpoints.volume, project_id);
        self.get_json(session, &url).await
    }

    async fn list_volumes(&self, session: &Session, project_id: Option<&ProjectId>) -> Result<Vec<VolumeInfo>> {
        let url = match project_id {
            Some(p) => format!("{}/volumes/detail?project_id={}&all_tenants=0", self.endpoints.volume, p),
            None => format!("{}/volumes/detail?all_tenants=1", self.endpoints.volume),
        };
        #[derive(serde::Deserialize)]
        struct VolumeList {
            volumes: Vec<VolumeInfo>,
        }
        let list: VolumeList = self.get_json(session, &url).await?;
        Ok(list.volumes)
    }
}

#[async_trait]
impl NetworkApi for CloudClient {
    async fn list_ports(&self, session: &Session, device_id: Option<&str>) -> Result<Vec<PortInfo>> {
        let url = match device_id {
            Some(d) => format!("{}/v2.0/ports?device_id={}", self.endpoints.network, d),
            None => format!("{}/v2.0/ports", self.endpoints.network),
        };
        #[derive(serde::Deserialize)]
        struct PortList {
            ports: Vec<PortInfo>,
        }
        let list: PortList = self.get_json(session, &url).await?;
        Ok(list.ports)
    }

    #[instrument(skip(self, session, spec))]
    async fn create_port(&self, session: &Session, spec: &PortSpec) -> Result<PortInfo> {
        if session.dry_run {
            return Ok(PortInfo {
                id: dryrun_id().into(),
                network_id: spec.network_id.clone(),
                ip_addresses: spec.fixed_ip.clone().into_iter().collect(),
                mac_address: "fa:16:3e:00:00:00".to_string(),
                device_id: None,
            });
        }
        let url = format!("{}/v2.0/ports", self.endpoints.network);
        let body = json!({
            "port": {
                "network_id": spec.network_id.to_string(),
                "fixed_ips": spec.fixed_ip.as_ref().map(|ip| vec![json!({ "ip_address": ip })]).unwrap_or_default(),
                "security_groups": spec.security_group_ids,
            }
        });
        #[derive(serde::Deserialize)]
        struct CreatePortResponse {
            port: PortInfo,
        }
        let resp: CreatePortResponse = self.send_json(reqwest::Method::POST, session, &url, &body).await?;
        Ok(resp.port)
    }

    async fn delete_port(&self, session: &Session, port_id: &PortId) -> Result<()> {
        if session.dry_run {
            return Ok(());
        }
        let url = format!("{}/v2.0/ports/{}", self.endpoints.network, port_id);
        self.send_no_body(reqwest::Method::DELETE, session, &url).await
    }

    async fn list_subnets(&self, session: &Session, network_id: &NetworkId) -> Result<Vec<String>> {
        let url = format!("{}/v2.0/subnets?network_id={}", self.endpoints.network, network_id);
        #[derive(serde::Deserialize)]
        struct SubnetList {
            subnets: Vec<SubnetEntry>,
        }
        #[derive(serde::Deserialize)]
        struct SubnetEntry {
            id: String,
        }
        let list: SubnetList = self.get_json(session, &url).await?;
        Ok(list.subnets.into_iter().map(|s| s.id).collect())
    }

    async fn list_networks(&self, session: &Session, project_id: &ProjectId) -> Result<Vec<NetworkId>> {
        let url = format!("{}/v2.0/networks?project_id={}", self.endpoints.network, project_id);
        #[derive(serde::Deserialize)]
        struct NetworkList {
            networks: Vec<NetworkEntry>,
        }
        #[derive(serde::Deserialize)]
        struct NetworkEntry {
            id: String,
        }
        let list: NetworkList = self.get_json(session, &url).await?;
        Ok(list.networks.into_iter().map(|n| n.id.into()).collect())
    }

    async fn create_security_group(&self, session: &Session, name: &str) -> Result<String> {
        if session.dry_run {
            return Ok(dryrun_id());
        }
        let url = format!("{}/v2.0/security-groups", self.endpoints.network);
        let body = json!({ "security_group": { "name": name } });
        #[derive(serde::Deserialize)]
        struct CreateSgResponse {
            security_group: SgEntry,
        }
        #[derive(serde::Deserialize)]
        struct SgEntry {
            id: String,
        }
        let resp: CreateSgResponse = self.send_json(reqwest::Method::POST, session, &url, &body).await?;
        Ok(resp.security_group.id)
    }

    async fn create_security_group_rule(&self, session: &Session, group_id: &str, rule: &str) -> Result<()> {
        if session.dry_run {
            return Ok(());
        }
        let url = format!("{}/v2.0/security-group-rules", self.endpoints.network);
        let body = json!({ "security_group_rule": { "security_group_id": group_id, "protocol": rule } });
        self.send_json::<serde_json::Value>(reqwest::Method::POST, session, &url, &body)
            .await?;
        Ok(())
    }

    async fn list_security_groups(&self, session: &Session, project_id: &ProjectId) -> Result<Vec<String>> {
        let url = format!("{}/v2.0/security-groups?project_id={}", self.endpoints.network, project_id);
        #[derive(serde::Deserialize)]
        struct SgList {
            security_groups: Vec<SgEntry>,
        }
        #[derive(serde::Deserialize)]
        struct SgEntry {
            id: String,
        }
        let list: SgList = self.get_json(session, &url).await?;
        Ok(list.security_groups.into_iter().map(|s| s.id).collect())
    }
}

/// `authenticate` is the one call made before any session exists; it still
/// needs a `Session` value to thread through `send_json`'s bearer-auth
/// plumbing, so it uses an empty, already-expired placeholder that is never
/// actually sent as a real bearer token check by the identity endpoint.
fn placeholder_session() -> Session {
    Session {
        token: String::new(),
        project_id: ProjectId(String::new()),
        expires_at: chrono::Utc::now(),
        dry_run: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dryrun_ids_are_unique_and_tagged() {
        let a = dryrun_id();
        let b = dryrun_id();
        assert_ne!(a, b);
        assert!(a.starts_with("dryrun-"));
    }
}
