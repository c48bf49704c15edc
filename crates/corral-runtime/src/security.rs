//! Security profile collaborator.
//!
//! Mandatory access control and syscall filter generation live outside the
//! driver. The driver only loads, unloads and deletes profiles at fixed
//! points of the lifecycle.

use corral_common::error::Result;

/// Manages the security profiles of containers.
pub trait SecurityProfiles: Send + Sync {
    /// Loads the profile before the container's init runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile cannot be loaded.
    fn load(&self, container: &str) -> Result<()>;

    /// Unloads the profile after the container stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile cannot be unloaded.
    fn unload(&self, container: &str) -> Result<()>;

    /// Removes every trace of the profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile files cannot be removed.
    fn delete(&self, container: &str) -> Result<()>;
}

/// Hosts without a security module.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfined;

impl SecurityProfiles for Unconfined {
    fn load(&self, container: &str) -> Result<()> {
        tracing::debug!(container, "no security profile to load");
        Ok(())
    }

    fn unload(&self, _container: &str) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _container: &str) -> Result<()> {
        Ok(())
    }
}
