//! The abstract contract the core requires from the container Agent (spec
//! §4.C). Real adapters (Docker, S3) are a deployment-time concern and are
//! deliberately not implemented here -- only the trait and a deterministic
//! in-memory fake that the coordinators' tests program against.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{ArchiveFailureReason, ContainerCondition, VolumeCondition};
use crate::error::Result;
use crate::ids::{OpId, WorkspaceId};

#[derive(Debug, Clone, Default)]
pub struct ObservedWorkspace {
    pub container: Option<ContainerCondition>,
    pub volume: Option<VolumeCondition>,
    pub archive: Option<ObservedArchive>,
    pub restore_marker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObservedArchive {
    pub exists: bool,
    pub archive_key: Option<String>,
    pub failure_reason: Option<ArchiveFailureReason>,
}

#[derive(Debug, Clone, Copy)]
pub struct UpstreamAddress {
    pub host: std::net::IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct GcResult {
    pub deleted_count: u64,
    pub deleted_keys: Vec<String>,
}

/// Nine idempotent operations. Implementations must be thread-safe and must
/// never mutate core DB state directly -- only `observe()` results flow back
/// into `conditions`, and only Observer writes them.
#[async_trait]
pub trait WorkspaceRuntime: Send + Sync {
    async fn observe(&self) -> Result<HashMap<WorkspaceId, ObservedWorkspace>>;
    async fn provision(&self, id: WorkspaceId) -> Result<()>;
    async fn start(&self, id: WorkspaceId, image_ref: &str) -> Result<()>;
    async fn stop(&self, id: WorkspaceId) -> Result<()>;
    async fn delete(&self, id: WorkspaceId) -> Result<()>;
    async fn archive(&self, id: WorkspaceId, op_id: OpId) -> Result<String>;
    async fn restore(&self, id: WorkspaceId, archive_key: &str) -> Result<()>;
    async fn create_empty_archive(&self, id: WorkspaceId, op_id: OpId) -> Result<String>;
    async fn run_gc(
        &self,
        protected_archive_keys: &[String],
        protected_workspaces: &[WorkspaceId],
    ) -> Result<GcResult>;
    async fn get_upstream(&self, id: WorkspaceId) -> Result<Option<UpstreamAddress>>;
}

#[derive(Debug, Default, Clone)]
struct FakeWorkspaceState {
    container: Option<ContainerCondition>,
    volume: Option<VolumeCondition>,
    archive_key: Option<String>,
    upstream: Option<UpstreamAddress>,
}

/// Deterministic in-memory `WorkspaceRuntime` for coordinator/proxy tests.
/// No timers, no real I/O: every operation takes effect synchronously under
/// the lock so tests never need to sleep waiting for convergence.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<HashMap<WorkspaceId, FakeWorkspaceState>>,
    resource_prefix: String,
}

impl FakeRuntime {
    pub fn new(resource_prefix: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            resource_prefix: resource_prefix.into(),
        }
    }

    fn entry(&self, id: WorkspaceId) -> FakeWorkspaceState {
        self.state.lock().entry(id).or_default().clone()
    }

    fn with_state(&self, id: WorkspaceId, f: impl FnOnce(&mut FakeWorkspaceState)) {
        let mut guard = self.state.lock();
        let entry = guard.entry(id).or_default();
        f(entry);
    }

    /// Test helper: force the upstream address a running workspace resolves to.
    pub fn set_upstream(&self, id: WorkspaceId, addr: UpstreamAddress) {
        self.with_state(id, |s| s.upstream = Some(addr));
    }
}

#[async_trait]
impl WorkspaceRuntime for FakeRuntime {
    async fn observe(&self) -> Result<HashMap<WorkspaceId, ObservedWorkspace>> {
        let guard = self.state.lock();
        Ok(guard
            .iter()
            .map(|(id, s)| {
                let observed = ObservedWorkspace {
                    container: s.container,
                    volume: s.volume,
                    archive: s.archive_key.as_ref().map(|key| ObservedArchive {
                        exists: true,
                        archive_key: Some(key.clone()),
                        failure_reason: None,
                    }),
                    restore_marker: None,
                };
                (*id, observed)
            })
            .collect())
    }

    async fn provision(&self, id: WorkspaceId) -> Result<()> {
        self.with_state(id, |s| s.volume = Some(VolumeCondition { exists: true }));
        Ok(())
    }

    async fn start(&self, id: WorkspaceId, _image_ref: &str) -> Result<()> {
        self.with_state(id, |s| {
            s.container = Some(ContainerCondition { running: true, healthy: true });
        });
        Ok(())
    }

    async fn stop(&self, id: WorkspaceId) -> Result<()> {
        self.with_state(id, |s| s.container = None);
        Ok(())
    }

    async fn delete(&self, id: WorkspaceId) -> Result<()> {
        self.with_state(id, |s| {
            s.container = None;
            s.volume = None;
        });
        Ok(())
    }

    async fn archive(&self, id: WorkspaceId, op_id: OpId) -> Result<String> {
        let existing = self.entry(id).archive_key;
        if let Some(key) = existing {
            if key.contains(&op_id.to_string()) {
                return Ok(key);
            }
        }
        let key = format!("{}{id}/{op_id}/home.tar.zst", self.resource_prefix);
        self.with_state(id, |s| s.archive_key = Some(key.clone()));
        Ok(key)
    }

    async fn restore(&self, id: WorkspaceId, archive_key: &str) -> Result<()> {
        if !archive_key.contains(&id.to_string()) {
            return Err(crate::error::CoreError::InvalidState(format!(
                "archive key {archive_key} does not belong to workspace {id}"
            )));
        }
        self.with_state(id, |s| s.volume = Some(VolumeCondition { exists: true }));
        Ok(())
    }

    async fn create_empty_archive(&self, id: WorkspaceId, op_id: OpId) -> Result<String> {
        self.archive(id, op_id).await
    }

    async fn run_gc(
        &self,
        protected_archive_keys: &[String],
        _protected_workspaces: &[WorkspaceId],
    ) -> Result<GcResult> {
        let mut guard = self.state.lock();
        let mut deleted_keys = Vec::new();
        for state in guard.values_mut() {
            if let Some(key) = &state.archive_key {
                if !protected_archive_keys.contains(key) {
                    deleted_keys.push(key.clone());
                    state.archive_key = None;
                }
            }
        }
        Ok(GcResult { deleted_count: deleted_keys.len() as u64, deleted_keys })
    }

    async fn get_upstream(&self, id: WorkspaceId) -> Result<Option<UpstreamAddress>> {
        Ok(self.entry(id).upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provision_then_start_converges_to_running_conditions() {
        let rt = FakeRuntime::new("codehub-ws-");
        let id = WorkspaceId::new();
        rt.provision(id).await.unwrap();
        rt.start(id, "image:latest").await.unwrap();
        let observed = rt.observe().await.unwrap();
        let ws = observed.get(&id).unwrap();
        assert!(ws.container.unwrap().running);
        assert!(ws.volume.unwrap().exists);
    }

    #[tokio::test]
    async fn archive_is_idempotent_for_the_same_op_id() {
        let rt = FakeRuntime::new("codehub-ws-");
        let id = WorkspaceId::new();
        let op_id = OpId::new();
        let key1 = rt.archive(id, op_id).await.unwrap();
        let key2 = rt.archive(id, op_id).await.unwrap();
        assert_eq!(key1, key2);
    }

    #[tokio::test]
    async fn gc_deletes_unprotected_archives_only() {
        let rt = FakeRuntime::new("codehub-ws-");
        let id = WorkspaceId::new();
        let op_id = OpId::new();
        let key = rt.archive(id, op_id).await.unwrap();
        let result = rt.run_gc(&[], &[]).await.unwrap();
        assert_eq!(result.deleted_keys, vec![key]);

        let observed = rt.observe().await.unwrap();
        assert!(observed.get(&id).unwrap().archive.is_none());
    }

    #[tokio::test]
    async fn gc_protects_listed_archive_keys() {
        let rt = FakeRuntime::new("codehub-ws-");
        let id = WorkspaceId::new();
        let op_id = OpId::new();
        let key = rt.archive(id, op_id).await.unwrap();
        let result = rt.run_gc(&[key], &[]).await.unwrap();
        assert_eq!(result.deleted_count, 0);
    }
}
