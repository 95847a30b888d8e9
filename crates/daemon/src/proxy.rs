//! Reverse proxy configurator.
//!
//! Renders nginx virtual hosts for HTTP services and stream listeners
//! for TCP/UDP services, then triggers a graceful reload. Reloads
//! collapse to at most one in flight; the winning reload always
//! re-reads the registry, so the latest topology change is never lost.
//! A failed render or reload is reported to the caller and never rolls
//! back the registry mutation that triggered it.

use crate::services::{HttpServiceRepo, TcpServiceRepo};
use crate::sync::Coalesce;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};
use wiregate_common::{Error, HttpService, Proto, Result, TcpService};

/// Process-control seam over the running proxy.
#[async_trait]
pub trait ProxyRunner: Send + Sync {
    /// Persist rendered configuration where the proxy includes it from.
    async fn write_config(&self, http_conf: &str, stream_conf: &str) -> Result<()>;

    /// Graceful reload: existing connections are not dropped.
    async fn reload(&self) -> Result<()>;
}

/// nginx-backed implementation.
pub struct NginxRunner {
    http_path: PathBuf,
    stream_path: PathBuf,
}

impl NginxRunner {
    pub fn new(http_path: PathBuf, stream_path: PathBuf) -> Self {
        Self {
            http_path,
            stream_path,
        }
    }
}

#[async_trait]
impl ProxyRunner for NginxRunner {
    async fn write_config(&self, http_conf: &str, stream_conf: &str) -> Result<()> {
        for (path, content) in [(&self.http_path, http_conf), (&self.stream_path, stream_conf)] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, content).await?;
        }
        debug!("Wrote proxy configuration");
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        // Validate before signalling; a bad config must never reach
        // the running proxy.
        let check = Command::new("nginx")
            .args(["-t"])
            .output()
            .await
            .map_err(|e| Error::Reconciliation(format!("failed to run nginx -t: {}", e)))?;
        if !check.status.success() {
            let stderr = String::from_utf8_lossy(&check.stderr);
            return Err(Error::Reconciliation(format!(
                "nginx config test failed: {}",
                stderr.trim()
            )));
        }

        let output = Command::new("nginx")
            .args(["-s", "reload"])
            .output()
            .await
            .map_err(|e| Error::Reconciliation(format!("failed to run nginx -s reload: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Reconciliation(format!(
                "nginx reload failed: {}",
                stderr.trim()
            )));
        }

        info!("Proxy reloaded");
        Ok(())
    }
}

/// Renders and reloads proxy configuration from registry state.
pub struct ProxyConfigurator {
    http_repo: HttpServiceRepo,
    tcp_repo: TcpServiceRepo,
    runner: std::sync::Arc<dyn ProxyRunner>,
    guard: Coalesce,
}

impl ProxyConfigurator {
    pub fn new(
        http_repo: HttpServiceRepo,
        tcp_repo: TcpServiceRepo,
        runner: std::sync::Arc<dyn ProxyRunner>,
    ) -> Self {
        Self {
            http_repo,
            tcp_repo,
            runner,
            guard: Coalesce::new(),
        }
    }

    /// Re-render from current registry state and gracefully reload.
    /// Overlapping calls collapse to the latest state.
    pub async fn reload(&self) -> Result<()> {
        self.guard
            .run(|| async {
                let now = wiregate_common::now_epoch_secs();
                let http = self.http_repo.list_active(now)?;
                let tcp = self.tcp_repo.list_active(now)?;

                let http_conf = render_http_config(&http);
                let stream_conf = render_stream_config(&tcp);

                self.runner.write_config(&http_conf, &stream_conf).await?;
                self.runner.reload().await
            })
            .await?;
        Ok(())
    }
}

/// Render the HTTP virtual host file. Pure. Services arrive paired
/// with their resolved backend host (owning node's tunnel address when
/// the service declares none).
pub fn render_http_config(services: &[(HttpService, String)]) -> String {
    let mut services: Vec<_> = services.iter().collect();
    services.sort_by(|a, b| a.0.domain.cmp(&b.0.domain));

    let mut out = String::from(
        "# managed by wiregated, do not edit\n\n\
         server {\n    listen 80 default_server;\n    server_name _;\n    return 404;\n}\n",
    );

    for (svc, backend_host) in services {
        out.push('\n');
        out.push_str(&format!("# {}\nserver {{\n", svc.name));
        if svc.ssl {
            out.push_str("    listen 443 ssl;\n");
            out.push_str(&format!(
                "    ssl_certificate /etc/ssl/wiregate/{domain}/fullchain.pem;\n\
                 \x20   ssl_certificate_key /etc/ssl/wiregate/{domain}/privkey.pem;\n",
                domain = svc.domain
            ));
        } else {
            out.push_str("    listen 80;\n");
        }
        out.push_str(&format!("    server_name {};\n", svc.domain));
        push_access_rules(&mut out, &svc.allowed_ips, &svc.blocked_ips);
        out.push_str(&format!(
            "    location / {{\n\
             \x20       proxy_pass {proto}://{host}:{port};\n\
             \x20       proxy_http_version 1.1;\n\
             \x20       proxy_set_header Host $host;\n\
             \x20       proxy_set_header Upgrade $http_upgrade;\n\
             \x20       proxy_set_header Connection \"upgrade\";\n\
             \x20       proxy_set_header X-Real-IP $remote_addr;\n\
             \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
             \x20       proxy_set_header X-Forwarded-Proto $scheme;\n\
             \x20   }}\n",
            proto = svc.backend_proto,
            host = backend_host,
            port = svc.backend_port,
        ));
        out.push_str("}\n");
    }

    out
}

/// Render the stream listener file. Pure.
pub fn render_stream_config(services: &[(TcpService, String)]) -> String {
    let mut services: Vec<_> = services.iter().collect();
    services.sort_by_key(|(svc, _)| svc.port);

    let mut out = String::from("# managed by wiregated, do not edit\n");

    for (svc, backend_host) in services {
        out.push('\n');
        out.push_str(&format!("# {}\nserver {{\n", svc.name));
        match svc.proto {
            Proto::Tcp => out.push_str(&format!("    listen {};\n", svc.port)),
            Proto::Udp => out.push_str(&format!("    listen {} udp;\n", svc.port)),
        }
        push_access_rules(&mut out, &svc.allowed_ips, &svc.blocked_ips);
        out.push_str(&format!(
            "    proxy_pass {}:{};\n",
            backend_host, svc.backend_port
        ));
        out.push_str("}\n");
    }

    out
}

fn push_access_rules(out: &mut String, allowed: &[String], blocked: &[String]) {
    for ip in blocked {
        out.push_str(&format!("    deny {};\n", ip));
    }
    for ip in allowed {
        out.push_str(&format!("    allow {};\n", ip));
    }
    if !allowed.is_empty() {
        out.push_str("    deny all;\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiregate_common::BackendProto;

    fn http_service(domain: &str) -> HttpService {
        HttpService {
            id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            name: format!("svc-{}", domain),
            domain: domain.to_string(),
            backend_proto: BackendProto::Http,
            backend_host: None,
            backend_port: 3000,
            ssl: false,
            allowed_ips: Vec::new(),
            blocked_ips: Vec::new(),
            enabled: true,
            ttl: None,
            expires_at: None,
            created_at: 0,
        }
    }

    fn tcp_service(port: u16) -> TcpService {
        TcpService {
            id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            name: format!("tcp-{}", port),
            proto: Proto::Tcp,
            port,
            backend_host: None,
            backend_port: 22,
            allowed_ips: Vec::new(),
            blocked_ips: Vec::new(),
            enabled: true,
            ttl: None,
            expires_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_empty_render_has_no_listeners() {
        let conf = render_http_config(&[]);
        // Only the default catch-all server remains
        assert_eq!(conf.matches("server {").count(), 1);
        assert!(conf.contains("return 404"));

        let stream = render_stream_config(&[]);
        assert!(!stream.contains("server {"));
    }

    #[test]
    fn test_http_vhost_render() {
        let mut svc = http_service("app.example.com");
        svc.allowed_ips = vec!["10.0.0.0/8".to_string()];
        svc.blocked_ips = vec!["10.0.5.1".to_string()];

        let conf = render_http_config(&[(svc, "10.12.0.2".to_string())]);
        assert!(conf.contains("server_name app.example.com;"));
        assert!(conf.contains("proxy_pass http://10.12.0.2:3000;"));
        assert!(conf.contains("deny 10.0.5.1;"));
        assert!(conf.contains("allow 10.0.0.0/8;"));
        assert!(conf.contains("deny all;"));
        assert!(conf.contains("listen 80;"));
    }

    #[test]
    fn test_https_vhost_render() {
        let mut svc = http_service("secure.example.com");
        svc.ssl = true;
        svc.backend_proto = BackendProto::Https;

        let conf = render_http_config(&[(svc, "10.12.0.2".to_string())]);
        assert!(conf.contains("listen 443 ssl;"));
        assert!(conf.contains("ssl_certificate /etc/ssl/wiregate/secure.example.com/fullchain.pem;"));
        assert!(conf.contains("proxy_pass https://10.12.0.2:3000;"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = http_service("a.example.com");
        let b = http_service("b.example.com");
        let one = render_http_config(&[
            (a.clone(), "10.12.0.2".to_string()),
            (b.clone(), "10.12.0.3".to_string()),
        ]);
        let two = render_http_config(&[
            (b, "10.12.0.3".to_string()),
            (a, "10.12.0.2".to_string()),
        ]);
        assert_eq!(one, two);
    }

    #[test]
    fn test_stream_render() {
        let tcp = tcp_service(9022);
        let mut udp = tcp_service(9053);
        udp.proto = Proto::Udp;
        udp.backend_port = 53;

        let conf = render_stream_config(&[
            (tcp, "10.12.0.2".to_string()),
            (udp, "10.12.0.3".to_string()),
        ]);
        assert!(conf.contains("listen 9022;"));
        assert!(conf.contains("proxy_pass 10.12.0.2:22;"));
        assert!(conf.contains("listen 9053 udp;"));
        assert!(conf.contains("proxy_pass 10.12.0.3:53;"));
    }
}
