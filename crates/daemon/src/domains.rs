//! Domain registrar collaborator.
//!
//! An HTTP service may only bind a domain the registrar accepts. What
//! happens past this boundary (DNS records, certificates) is the
//! collaborator's business.

use async_trait::async_trait;
use tracing::{debug, info};
use wiregate_common::{validate, Error, Result};

/// External collaborator registering and validating service domains.
#[async_trait]
pub trait DomainRegistrar: Send + Sync {
    /// Warm up registrar-dependent state at process start.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Register `domain` before a service may bind to it. A rejection
    /// aborts the service mutation with `DomainUnavailable`.
    async fn register_domain(&self, domain: &str) -> Result<()>;
}

/// Default registrar: accepts any syntactically valid domain and logs
/// the registration. Deployments with managed DNS plug in their own.
pub struct LocalRegistrar;

#[async_trait]
impl DomainRegistrar for LocalRegistrar {
    async fn initialize(&self) -> Result<()> {
        debug!("Local domain registrar ready");
        Ok(())
    }

    async fn register_domain(&self, domain: &str) -> Result<()> {
        if let Some(err) = validate::check_domain(domain) {
            return Err(Error::DomainUnavailable {
                domain: domain.to_string(),
                reason: err.message,
            });
        }
        info!("Registered domain {}", domain);
        Ok(())
    }
}
