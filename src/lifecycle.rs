//! Termination and boot payload retrieval for single instances.
//!
//! Both operations act on the best match for a filter and refuse the
//! wildcard so that a bare invocation cannot pick an arbitrary instance.

use thiserror::Error;
use tracing::info;

use crate::directory::{InstanceDirectory, ResolveOptions};
use crate::instance::{Filter, Instance};
use crate::payload::{self, PayloadError};
use crate::provider::{CloudProvider, ProviderError};

/// Errors raised by [`Lifecycle`] operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The wildcard filter was given where a specific instance is needed.
    #[error("a filter must be specified")]
    FilterRequired,
    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The stored boot payload could not be decoded.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Single instance operations.
pub struct Lifecycle<P> {
    directory: InstanceDirectory<P>,
}

impl<P> Clone for Lifecycle<P> {
    fn clone(&self) -> Self {
        Self {
            directory: self.directory.clone(),
        }
    }
}

impl<P: CloudProvider> Lifecycle<P> {
    /// Binds the operations to a directory.
    #[must_use]
    pub const fn new(directory: InstanceDirectory<P>) -> Self {
        Self { directory }
    }

    /// Terminates the best match for `filter`.
    ///
    /// Returns the instance with its state replaced by the transitional
    /// state the provider reported, or `None` when nothing matched.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::FilterRequired`] for the wildcard before
    /// any provider call, otherwise propagates provider failures.
    pub async fn terminate(&self, filter: &Filter) -> Result<Option<Instance>, LifecycleError> {
        let Some(mut instance) = self.best_match(filter).await? else {
            return Ok(None);
        };
        info!(id = %instance.id, "terminating instance");
        instance.state = self
            .directory
            .provider()
            .terminate_instance(&instance.id)
            .await?;
        Ok(Some(instance))
    }

    /// Reads and decodes the boot payload of the best match for `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::FilterRequired`] for the wildcard, a
    /// provider failure, or a decode failure for malformed stored data.
    pub async fn read_boot_payload(
        &self,
        filter: &Filter,
    ) -> Result<Option<Vec<u8>>, LifecycleError> {
        let Some(instance) = self.best_match(filter).await? else {
            return Ok(None);
        };
        let encoded = self
            .directory
            .provider()
            .describe_boot_payload(&instance.id)
            .await?;
        Ok(encoded.as_deref().map(payload::decode).transpose()?)
    }

    async fn best_match(&self, filter: &Filter) -> Result<Option<Instance>, LifecycleError> {
        if filter.is_wildcard() {
            return Err(LifecycleError::FilterRequired);
        }
        Ok(self.directory.first(filter, ResolveOptions::default()).await?)
    }
}
