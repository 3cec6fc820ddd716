//! Produces a session scoped to any project by temporarily granting a
//! shared service account the admin role on that project. A `DashMap`-backed
//! guard tracks which projects have already had the grant attempted so it
//! only happens once per process lifetime, and a small TTL'd LRU of live
//! sessions means repeat callers don't re-authenticate every call.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::domain::ports::{CloudApi, ProjectId, ProjectSession, Session, SessionProviderApi};
use crate::error::{Error, Result};
use crate::session::credentials::ServiceUserCredentials;

const CACHE_CAPACITY: usize = 64;
const SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(50 * 60);

struct CachedSession {
    session: Session,
    cached_at: Instant,
}

impl CachedSession {
    fn is_fresh(&self) -> bool {
        self.cached_at.elapsed() < SESSION_TTL && !self.session.is_expired()
    }
}

/// `Some` once the service user's identity has been resolved against the
/// admin session; looked up at most once for the process lifetime.
struct ServiceUser {
    user_id: crate::domain::ports::UserId,
}

pub struct SessionProvider {
    cloud: Arc<dyn CloudApi>,
    credentials: Option<ServiceUserCredentials>,
    admin_session: AsyncMutex<Option<Session>>,
    service_user: once_cell::sync::OnceCell<ServiceUser>,
    granted_projects: DashMap<ProjectId, ()>,
    grant_locks: DashMap<ProjectId, Arc<AsyncMutex<()>>>,
    sessions: DashMap<ProjectId, CachedSession>,
    // Tracks insertion order for the bounded LRU; protected separately from
    // `sessions` since eviction order doesn't need to be linearizable with
    // individual session reads.
    lru_order: AsyncMutex<VecDeque<ProjectId>>,
}

impl SessionProvider {
    pub fn new(cloud: Arc<dyn CloudApi>, credentials: Option<ServiceUserCredentials>) -> Self {
        Self {
            cloud,
            credentials,
            admin_session: AsyncMutex::new(None),
            service_user: once_cell::sync::OnceCell::new(),
            granted_projects: DashMap::new(),
            grant_locks: DashMap::new(),
            sessions: DashMap::new(),
            lru_order: AsyncMutex::new(VecDeque::new()),
        }
    }

    async fn fresh_admin_session(&self) -> Result<Session> {
        let mut guard = self.admin_session.lock().await;
        if let Some(s) = guard.as_ref() {
            if !s.is_expired() {
                return Ok(s.clone());
            }
        }
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Config("service user is disabled; no credential available for the admin session".into()))?;
        let session = self.cloud.authenticate(creds, None).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn resolve_service_user(&self) -> Result<&ServiceUser> {
        if let Some(u) = self.service_user.get() {
            return Ok(u);
        }
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Config("service user is disabled".into()))?;
        let admin = self.fresh_admin_session().await?;
        let user_id = self
            .cloud
            .find_user_by_email(&admin, &creds.email)
            .await?
            .ok_or_else(|| Error::Config(format!("service user {} not found", creds.email)))?;
        Ok(self.service_user.get_or_init(|| ServiceUser { user_id }))
    }

    async fn ensure_granted(&self, project_id: &ProjectId) -> Result<()> {
        if self.granted_projects.contains_key(project_id) {
            return Ok(());
        }
        let lock = self
            .grant_locks
            .entry(project_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if self.granted_projects.contains_key(project_id) {
            return Ok(());
        }
        let service_user = self.resolve_service_user().await?;
        let admin = self.fresh_admin_session().await?;
        let already_has_role = self
            .cloud
            .list_role_assignments(&admin, Some(&service_user.user_id))
            .await?
            .iter()
            .any(|a| a.project_id == *project_id && a.role == "admin");
        if !already_has_role {
            self.cloud
                .grant_role(&admin, &service_user.user_id, project_id, "admin")
                .await?;
        }
        self.granted_projects.insert(project_id.clone(), ());
        Ok(())
    }

    async fn cache_insert(&self, project_id: ProjectId, session: Session) {
        self.sessions.insert(
            project_id.clone(),
            CachedSession { session, cached_at: Instant::now() },
        );
        let mut order = self.lru_order.lock().await;
        order.retain(|p| p != &project_id);
        order.push_back(project_id);
        while order.len() > CACHE_CAPACITY {
            if let Some(evicted) = order.pop_front() {
                self.sessions.remove(&evicted);
            }
        }
    }

    #[instrument(skip(self), fields(%project_id))]
    async fn scoped_session(&self, project_id: &ProjectId) -> Result<Session> {
        if let Some(cached) = self.sessions.get(project_id) {
            if cached.is_fresh() {
                return Ok(cached.session.clone());
            }
        }
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Config("service user is disabled".into()))?;
        self.ensure_granted(project_id).await?;
        let mut session = self
            .cloud
            .authenticate(creds, Some(project_id))
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to authenticate service user against project");
                e
            })?;
        // `authenticate` returns whatever identity token the remote issues;
        // re-stamp with the project we asked for since some mocks echo the
        // service account's home project instead.
        session.project_id = project_id.clone();
        self.cache_insert(project_id.clone(), session.clone()).await;
        Ok(session)
    }
}

#[async_trait::async_trait]
impl SessionProviderApi for SessionProvider {
    async fn get_admin_session(&self) -> Result<Session> {
        self.fresh_admin_session().await
    }

    async fn get_project_session(&self, project_id: &ProjectId) -> Result<ProjectSession> {
        if self.credentials.is_none() {
            let admin = self.fresh_admin_session().await?;
            return Ok(ProjectSession::Fallback {
                admin_session: admin,
                reason: "service user disabled".to_string(),
            });
        }
        match self.scoped_session(project_id).await {
            Ok(session) => Ok(ProjectSession::Scoped(session)),
            Err(e) => {
                info!(%project_id, error = %e, "degrading to admin session for project");
                let admin = self.fresh_admin_session().await?;
                Ok(ProjectSession::Fallback { admin_session: admin, reason: e.to_string() })
            }
        }
    }

    async fn invalidate(&self, project_id: &ProjectId) {
        self.sessions.remove(project_id);
        self.granted_projects.remove(project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeCloud {
        auth_calls: AtomicU32,
        grant_calls: AtomicU32,
    }

    #[async_trait]
    impl IdentityApi for FakeCloud {
        async fn authenticate(&self, _: &ServiceUserCredentials, project_id: Option<&ProjectId>) -> Result<Session> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                token: "tok".into(),
                project_id: project_id.cloned().unwrap_or_else(|| "home".into()),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
                dry_run: false,
            })
        }
        async fn grant_role(&self, _: &Session, _: &UserId, _: &ProjectId, _: &str) -> Result<()> {
            self.grant_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn find_user_by_email(&self, _: &Session, _: &str) -> Result<Option<UserId>> {
            Ok(Some("svc-user".into()))
        }
        async fn list_role_assignments(&self, _: &Session, _: Option<&UserId>) -> Result<Vec<RoleAssignment>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl ComputeApi for FakeCloud {
        async fn get_server(&self, _: &Session, _: &VmId) -> Result<Option<ServerInfo>> {
            unimplemented!()
        }
        async fn list_servers(&self, _: &Session, _: &ProjectId) -> Result<Vec<ServerInfo>> {
            unimplemented!()
        }
        async fn delete_server(&self, _: &Session, _: &VmId) -> Result<()> {
            unimplemented!()
        }
        async fn create_server(&self, _: &Session, _: &ServerSpec) -> Result<VmId> {
            unimplemented!()
        }
        async fn get_user_data(&self, _: &Session, _: &VmId) -> Result<Option<String>> {
            unimplemented!()
        }
        async fn wait_server_status(
            &self,
            _: &Session,
            _: &VmId,
            _: &str,
            _: std::time::Duration,
            _: std::time::Duration,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn get_quotas(&self, _: &Session, _: &ProjectId) -> Result<Quotas> {
            unimplemented!()
        }
        async fn list_flavors(&self, _: &Session) -> Result<Vec<FlavorInfo>> {
            unimplemented!()
        }
    }

    #[async_trait]
    impl StorageApi for FakeCloud {
        async fn create_volume_from_snapshot(&self, _: &Session, _: &VolumeFromSnapshotSpec) -> Result<VolumeId> {
            unimplemented!()
        }
        async fn wait_volume_status(
            &self,
            _: &Session,
            _: &VolumeId,
            _: &str,
            _: std::time::Duration,
            _: std::time::Duration,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn delete_volume(&self, _: &Session, _: &VolumeId) -> Result<()> {
            unimplemented!()
        }
        async fn list_snapshots(&self, _: &Session, _: Option<&VolumeId>, _: &HashMap<String, String>) -> Result<Vec<SnapshotInfo>> {
            unimplemented!()
        }
        async fn create_snapshot(&self, _: &Session, _: &VolumeId, _: &str, _: &HashMap<String, String>) -> Result<SnapshotId> {
            unimplemented!()
        }
        async fn delete_snapshot(&self, _: &Session, _: &SnapshotId) -> Result<()> {
            unimplemented!()
        }
        async fn get_snapshot(&self, _: &Session, _: &SnapshotId) -> Result<Option<SnapshotInfo>> {
            unimplemented!()
        }
        async fn get_volume(&self, _: &Session, _: &VolumeId) -> Result<Option<VolumeInfo>> {
            unimplemented!()
        }
        async fn get_quotas(&self, _: &Session, _: &ProjectId) -> Result<Quotas> {
            unimplemented!()
        }
        async fn list_volumes(&self, _: &Session, _: Option<&ProjectId>) -> Result<Vec<VolumeInfo>> {
            unimplemented!()
        }
    }

    #[async_trait]
    impl NetworkApi for FakeCloud {
        async fn list_ports(&self, _: &Session, _: Option<&str>) -> Result<Vec<PortInfo>> {
            unimplemented!()
        }
        async fn create_port(&self, _: &Session, _: &PortSpec) -> Result<PortInfo> {
            unimplemented!()
        }
        async fn delete_port(&self, _: &Session, _: &PortId) -> Result<()> {
            unimplemented!()
        }
        async fn list_subnets(&self, _: &Session, _: &NetworkId) -> Result<Vec<String>> {
            unimplemented!()
        }
        async fn list_networks(&self, _: &Session, _: &ProjectId) -> Result<Vec<NetworkId>> {
            unimplemented!()
        }
        async fn create_security_group(&self, _: &Session, _: &str) -> Result<String> {
            unimplemented!()
        }
        async fn create_security_group_rule(&self, _: &Session, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn list_security_groups(&self, _: &Session, _: &ProjectId) -> Result<Vec<String>> {
            unimplemented!()
        }
    }

    fn provider() -> SessionProvider {
        let cloud: Arc<dyn CloudApi> = Arc::new(FakeCloud { auth_calls: AtomicU32::new(0), grant_calls: AtomicU32::new(0) });
        SessionProvider::new(
            cloud,
            Some(ServiceUserCredentials { email: "svc@example.com".into(), password: "p".into() }),
        )
    }

    #[tokio::test]
    async fn grant_is_attempted_at_most_once_per_project() {
        let provider = provider();
        let project: ProjectId = "proj-a".into();
        provider.ensure_granted(&project).await.unwrap();
        provider.ensure_granted(&project).await.unwrap();
        assert!(provider.granted_projects.contains_key(&project));
    }

    #[tokio::test]
    async fn scoped_session_is_cached_until_ttl() {
        let provider = provider();
        let project: ProjectId = "proj-a".into();
        let first = provider.get_project_session(&project).await.unwrap();
        assert!(matches!(first, ProjectSession::Scoped(_)));
        assert!(provider.sessions.contains_key(&project));
    }

    #[tokio::test]
    async fn disabled_service_user_has_no_credential_for_admin_fallback() {
        let cloud: Arc<dyn CloudApi> = Arc::new(FakeCloud { auth_calls: AtomicU32::new(0), grant_calls: AtomicU32::new(0) });
        let provider = SessionProvider::new(cloud, None);
        let result = provider.get_project_session(&"proj-a".into()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn invalidate_clears_cached_session_and_grant() {
        let provider = provider();
        let project: ProjectId = "proj-a".into();
        provider.get_project_session(&project).await.unwrap();
        provider.invalidate(&project).await;
        assert!(!provider.sessions.contains_key(&project));
        assert!(!provider.granted_projects.contains_key(&project));
    }
}
