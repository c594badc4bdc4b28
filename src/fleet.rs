//! Client handle bundling every fleet operation over one provider and one
//! remote shell.

use std::sync::Arc;
use std::time::Duration;

use crate::directory::{Capabilities, InstanceDirectory, ResolveOptions};
use crate::exec::{CommandPayload, ExecOptions, Executor, OutputStream, RemoteShell};
use crate::instance::{Filter, Instance};
use crate::launch::{LaunchError, LaunchOptions, LaunchOrchestrator};
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::provider::{CloudProvider, ProviderError};

/// Fleet operations bound to a provider and a shell.
pub struct Fleet<P, S> {
    directory: InstanceDirectory<P>,
    executor: Executor<P, S>,
    launcher: LaunchOrchestrator<P>,
    lifecycle: Lifecycle<P>,
}

impl<P: CloudProvider, S: RemoteShell> Fleet<P, S> {
    /// Binds the operations to `provider` and `shell`.
    #[must_use]
    pub fn new(provider: P, shell: S) -> Self {
        let directory = InstanceDirectory::new(Arc::new(provider));
        Self {
            executor: Executor::new(directory.clone(), Arc::new(shell)),
            launcher: LaunchOrchestrator::new(directory.clone()),
            lifecycle: Lifecycle::new(directory.clone()),
            directory,
        }
    }

    /// Bounds the launch wait; unbounded by default.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.launcher = self.launcher.with_wait_timeout(timeout);
        self
    }

    /// Instances matching `filter`, best first.
    ///
    /// # Errors
    ///
    /// Propagates [`ProviderError`] from the lookups.
    pub async fn resolve(
        &self,
        filter: &Filter,
        options: ResolveOptions,
    ) -> Result<Vec<Instance>, ProviderError> {
        self.directory.resolve(filter, options).await
    }

    /// Public addresses of the running matches.
    ///
    /// # Errors
    ///
    /// Propagates [`ProviderError`] from the inventory lookup.
    pub async fn hostnames(&self, filter: &Filter) -> Result<Vec<String>, ProviderError> {
        self.directory.hostnames(filter).await
    }

    /// Distinct instance names among the matches, sorted.
    ///
    /// # Errors
    ///
    /// Propagates [`ProviderError`] from the inventory lookup.
    pub async fn names(&self, filter: &Filter) -> Result<Vec<String>, ProviderError> {
        let instances = self
            .directory
            .resolve(filter, ResolveOptions::default())
            .await?;
        let mut names: Vec<String> = instances
            .iter()
            .filter_map(|instance| instance.name.as_ref())
            .map(ToString::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Resources available to launches.
    ///
    /// # Errors
    ///
    /// Returns the first failing catalogue lookup.
    pub async fn describe_capabilities(&self) -> Result<Capabilities, ProviderError> {
        self.directory.describe_capabilities().await
    }

    /// Runs `payload` on the running matches. Must be called within a Tokio
    /// runtime.
    #[must_use]
    pub fn execute(
        &self,
        filter: Filter,
        payload: &CommandPayload,
        options: ExecOptions,
    ) -> OutputStream {
        self.executor.execute(filter, payload, options)
    }

    /// Launches instances named `name`.
    ///
    /// # Errors
    ///
    /// See [`LaunchOrchestrator::launch`].
    pub async fn launch(&self, name: &str, options: &LaunchOptions) -> Result<Instance, LaunchError> {
        self.launcher.launch(name, options).await
    }

    /// Terminates the best match for `filter`.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::terminate`].
    pub async fn terminate(&self, filter: &Filter) -> Result<Option<Instance>, LifecycleError> {
        self.lifecycle.terminate(filter).await
    }

    /// Reads the boot payload of the best match for `filter`.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::read_boot_payload`].
    pub async fn read_boot_payload(
        &self,
        filter: &Filter,
    ) -> Result<Option<Vec<u8>>, LifecycleError> {
        self.lifecycle.read_boot_payload(filter).await
    }
}
