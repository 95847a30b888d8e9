//! Routing synchronizer.
//!
//! Thin imperative wrapper over the host route table. Each call is one
//! synchronous system mutation; there is no caching or batching layer.
//! Adds and deletes are idempotent because gateway reconfiguration may
//! re-issue the same route during an update.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use wiregate_common::{Error, Result};

/// Host route table mutations, `ip route` semantics.
#[async_trait]
pub trait RouteSync: Send + Sync {
    /// Route `subnet` via `next_hop` over `iface`. No-op if present.
    async fn add_route(&self, subnet: &str, next_hop: &str, iface: &str) -> Result<()>;

    /// Remove the route for `subnet` via `next_hop`. No-op if absent.
    async fn del_route(&self, subnet: &str, next_hop: &str) -> Result<()>;
}

/// `ip route` backed implementation.
pub struct IpRoute;

#[async_trait]
impl RouteSync for IpRoute {
    async fn add_route(&self, subnet: &str, next_hop: &str, iface: &str) -> Result<()> {
        let via = strip_prefix_len(next_hop);
        // `replace` makes re-adding an existing route a no-op
        let output = Command::new("ip")
            .args(["route", "replace", subnet, "via", via, "dev", iface])
            .output()
            .await
            .map_err(|e| Error::RouteSync(format!("failed to run ip route: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Route add failed for {} via {}: {}", subnet, via, stderr.trim());
            return Err(Error::RouteSync(format!(
                "ip route replace {} via {}: {}",
                subnet,
                via,
                stderr.trim()
            )));
        }

        debug!("Route added: {} via {} dev {}", subnet, via, iface);
        Ok(())
    }

    async fn del_route(&self, subnet: &str, next_hop: &str) -> Result<()> {
        let via = strip_prefix_len(next_hop);
        let output = Command::new("ip")
            .args(["route", "del", subnet, "via", via])
            .output()
            .await
            .map_err(|e| Error::RouteSync(format!("failed to run ip route: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Deleting an absent route is a no-op, not an error
            if stderr.contains("No such process") || stderr.contains("No such file") {
                debug!("Route already absent: {} via {}", subnet, via);
                return Ok(());
            }
            warn!("Route del failed for {} via {}: {}", subnet, via, stderr.trim());
            return Err(Error::RouteSync(format!(
                "ip route del {} via {}: {}",
                subnet,
                via,
                stderr.trim()
            )));
        }

        debug!("Route removed: {} via {}", subnet, via);
        Ok(())
    }
}

/// Tunnel addresses are stored with their prefix length; next hops
/// must be bare addresses.
fn strip_prefix_len(addr: &str) -> &str {
    addr.split('/').next().unwrap_or(addr)
}
