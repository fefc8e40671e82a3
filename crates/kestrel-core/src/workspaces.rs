use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use kestrel_observability::short_hash;
use kestrel_runtime::{PathGuard, ProcessSupervisor};
use kestrel_tools::{PlanCache, ShellLimits, ToolRegistry, WorkspaceTools};

/// Execution context of one workspace root.
pub struct Workspace {
    pub guard: PathGuard,
    pub supervisor: ProcessSupervisor,
    pub tools: ToolRegistry,
    pub plans: PlanCache,
}

/// Lazily builds one [`Workspace`] per root and hands out the same instance
/// afterwards.
#[derive(Clone)]
pub struct WorkspaceRegistry {
    jobs_base: PathBuf,
    bin_dir: Option<PathBuf>,
    shell: ShellLimits,
    workspaces: Arc<RwLock<HashMap<PathBuf, Arc<Workspace>>>>,
}

impl WorkspaceRegistry {
    pub fn new(
        jobs_base: impl Into<PathBuf>,
        bin_dir: Option<PathBuf>,
        shell: ShellLimits,
    ) -> Self {
        Self {
            jobs_base: jobs_base.into(),
            bin_dir,
            shell,
            workspaces: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get_or_create(&self, root: &Path) -> anyhow::Result<Arc<Workspace>> {
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|err| anyhow::anyhow!("workspace root {}: {err}", root.display()))?;
        if let Some(existing) = self.workspaces.read().await.get(&root) {
            return Ok(existing.clone());
        }

        let mut workspaces = self.workspaces.write().await;
        // Another task may have created it between the two locks.
        if let Some(existing) = workspaces.get(&root) {
            return Ok(existing.clone());
        }
        let workspace = Arc::new(self.build(&root)?);
        workspaces.insert(root.clone(), workspace.clone());
        tracing::info!(root = %root.display(), "workspace context created");
        Ok(workspace)
    }

    pub async fn len(&self) -> usize {
        self.workspaces.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workspaces.read().await.is_empty()
    }

    /// Job directory for `root` under the shared jobs base, stable across
    /// runs.
    pub fn jobs_root_for(&self, root: &Path) -> PathBuf {
        self.jobs_base.join(short_hash(&root.to_string_lossy()))
    }

    fn build(&self, root: &Path) -> anyhow::Result<Workspace> {
        let guard = PathGuard::new(root)?;
        let supervisor =
            ProcessSupervisor::new(guard.clone(), self.jobs_root_for(root), self.bin_dir.clone());
        let mut env = WorkspaceTools::new(guard.clone(), supervisor.clone());
        env.shell = self.shell;
        let plans = env.plans.clone();
        Ok(Workspace {
            guard,
            supervisor,
            tools: ToolRegistry::builtin(&env),
            plans,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_lookups_share_one_context() {
        let state = tempfile::tempdir().expect("state");
        let root = tempfile::tempdir().expect("root");
        let registry = WorkspaceRegistry::new(state.path(), None, ShellLimits::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let path = root.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                registry.get_or_create(&path).await.expect("workspace")
            }));
        }
        let mut contexts = Vec::new();
        for handle in handles {
            contexts.push(handle.await.expect("join"));
        }
        assert!(contexts.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len().await, 1);
        assert!(contexts[0].tools.get("apply_patch").await.is_some());
    }

    #[tokio::test]
    async fn distinct_roots_get_distinct_job_dirs() {
        let state = tempfile::tempdir().expect("state");
        let a = tempfile::tempdir().expect("a");
        let b = tempfile::tempdir().expect("b");
        let registry = WorkspaceRegistry::new(state.path(), None, ShellLimits::default());
        let wa = registry.get_or_create(a.path()).await.expect("a");
        let wb = registry.get_or_create(b.path()).await.expect("b");
        assert_ne!(wa.supervisor.jobs_root(), wb.supervisor.jobs_root());
        assert!(registry.get_or_create(&a.path().join("missing")).await.is_err());
    }
}
