//! Public URL discovery for the tunnel process.
//!
//! The tunnel's local admin API is asked first; if that fails or lists no
//! tunnel forwarding to the supervised address, the tunnel log is scanned.

use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(
        "no public URL for {addr}: admin API {api} gave no match ({api_error}) and {} has no URL; inspect the tunnel log",
        log.display()
    )]
    NotFound {
        addr: String,
        api: String,
        api_error: String,
        log: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    AdminApi,
    LogScan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub url: String,
    pub source: DiscoverySource,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TunnelInfo {
    #[serde(default)]
    pub name: String,
    pub public_url: String,
    #[serde(default)]
    pub proto: String,
    pub config: TunnelTarget,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TunnelTarget {
    pub addr: String,
}

pub(crate) struct DiscoveryParams<'a> {
    pub client: &'a reqwest::Client,
    pub admin_api: &'a str,
    pub log_path: &'a Path,
    /// `host:port` the tunnel should be forwarding to.
    pub local_addr: &'a str,
    pub url_pattern: &'a Regex,
    pub settle_delay: Duration,
}

/// Resolve the tunnel's public URL.
pub(crate) async fn discover(params: DiscoveryParams<'_>) -> Result<Discovered, DiscoveryError> {
    let DiscoveryParams {
        client,
        admin_api,
        log_path,
        local_addr,
        url_pattern,
        settle_delay,
    } = params;

    tokio::time::sleep(settle_delay).await;

    let api_error = match query_admin_api(client, admin_api, local_addr).await {
        Ok(url) => {
            return Ok(Discovered {
                url,
                source: DiscoverySource::AdminApi,
            })
        }
        Err(e) => e,
    };
    tracing::warn!(api = admin_api, "admin API discovery failed ({api_error}), scanning tunnel log");

    match scan_log(log_path, url_pattern).await {
        Some(url) => Ok(Discovered {
            url,
            source: DiscoverySource::LogScan,
        }),
        None => Err(DiscoveryError::NotFound {
            addr: local_addr.to_string(),
            api: admin_api.to_string(),
            api_error,
            log: log_path.to_path_buf(),
        }),
    }
}

async fn query_admin_api(
    client: &reqwest::Client,
    admin_api: &str,
    local_addr: &str,
) -> Result<String, String> {
    let resp = client
        .get(admin_api)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {}", resp.status()));
    }
    let list: TunnelList = resp.json().await.map_err(|e| e.to_string())?;
    select_tunnel(&list.tunnels, local_addr)
        .map(|t| {
            tracing::debug!(name = %t.name, proto = %t.proto, "matched tunnel");
            t.public_url.clone()
        })
        .ok_or_else(|| format!("{} tunnel(s), none forwarding to {local_addr}", list.tunnels.len()))
}

/// First tunnel whose forwarding target is `local_addr`.
pub(crate) fn select_tunnel<'a>(tunnels: &'a [TunnelInfo], local_addr: &str) -> Option<&'a TunnelInfo> {
    tunnels
        .iter()
        .find(|t| !t.public_url.is_empty() && addr_matches(&t.config.addr, local_addr))
}

fn split_host_port(addr: &str) -> (String, Option<u16>) {
    let addr = addr.split_once("://").map_or(addr, |(_, rest)| rest);
    let addr = addr.trim_end_matches('/');
    if let Ok(port) = addr.parse::<u16>() {
        return ("localhost".to_string(), Some(port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => (
            host.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase(),
            port.parse().ok(),
        ),
        None => (addr.to_ascii_lowercase(), None),
    }
}

fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0" | "::1" | "::")
}

fn addr_matches(target: &str, local: &str) -> bool {
    let (t_host, t_port) = split_host_port(target);
    let (l_host, l_port) = split_host_port(local);
    if t_port.is_none() || t_port != l_port {
        return false;
    }
    t_host == l_host || (is_local(&t_host) && is_local(&l_host))
}

/// First URL matching `pattern` in the tunnel log.
pub(crate) async fn scan_log(path: &Path, pattern: &Regex) -> Option<String> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    text.lines()
        .find_map(|line| pattern.find(line))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_URL_PATTERN;
    use crate::engine::{http_client, stub};
    use axum::{routing::get, Json, Router};
    use serde_json::json;

    fn tunnels_json() -> serde_json::Value {
        json!({
            "tunnels": [
                {
                    "name": "other",
                    "public_url": "https://other-app.ngrok-free.app",
                    "proto": "https",
                    "config": { "addr": "http://localhost:3000" }
                },
                {
                    "name": "command_line",
                    "public_url": "https://abcd-1234.ngrok-free.app",
                    "proto": "https",
                    "config": { "addr": "http://localhost:8000" }
                },
                {
                    "name": "command_line (http)",
                    "public_url": "http://abcd-1234.ngrok-free.app",
                    "proto": "http",
                    "config": { "addr": "http://localhost:8000" }
                }
            ],
            "uri": "/api/tunnels"
        })
    }

    fn pattern() -> Regex {
        Regex::new(DEFAULT_URL_PATTERN).unwrap()
    }

    async fn admin_api(body: serde_json::Value) -> String {
        let router = Router::new().route("/api/tunnels", get(move || async move { Json(body) }));
        format!("http://{}/api/tunnels", stub::serve(router).await)
    }

    #[test]
    fn address_matching_normalises_local_hosts() {
        assert!(addr_matches("http://localhost:8000", "127.0.0.1:8000"));
        assert!(addr_matches("localhost:8000", "0.0.0.0:8000"));
        assert!(addr_matches("8000", "127.0.0.1:8000"));
        assert!(addr_matches("http://[::1]:8000", "localhost:8000"));
        assert!(addr_matches("http://10.0.0.5:8000", "10.0.0.5:8000"));
        assert!(!addr_matches("http://10.0.0.5:8000", "127.0.0.1:8000"));
        assert!(!addr_matches("http://localhost:8001", "127.0.0.1:8000"));
        assert!(!addr_matches("http://localhost", "127.0.0.1:8000"));
    }

    #[test]
    fn first_matching_tunnel_wins() {
        let list: TunnelList = serde_json::from_value(tunnels_json()).unwrap();
        let t = select_tunnel(&list.tunnels, "127.0.0.1:8000").unwrap();
        assert_eq!(t.public_url, "https://abcd-1234.ngrok-free.app");
        assert!(select_tunnel(&list.tunnels, "127.0.0.1:9999").is_none());
    }

    #[tokio::test]
    async fn admin_api_match_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let client = http_client(Duration::from_secs(2)).unwrap();
        let api = admin_api(tunnels_json()).await;

        let found = discover(DiscoveryParams {
            client: &client,
            admin_api: &api,
            log_path: &dir.path().join("tunnel.log"),
            local_addr: "127.0.0.1:8000",
            url_pattern: &pattern(),
            settle_delay: Duration::ZERO,
        })
        .await
        .unwrap();
        assert_eq!(found.url, "https://abcd-1234.ngrok-free.app");
        assert_eq!(found.source, DiscoverySource::AdminApi);
    }

    #[tokio::test]
    async fn falls_back_to_log_when_api_has_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("tunnel.log");
        std::fs::write(
            &log,
            "t=2024-01-01 lvl=info msg=\"starting web service\" addr=127.0.0.1:4040\n\
             t=2024-01-01 lvl=info msg=\"started tunnel\" name=command_line addr=http://localhost:8000 url=https://fall-back-42.ngrok-free.app\n\
             t=2024-01-01 lvl=info msg=\"started tunnel\" url=https://second.ngrok-free.app\n",
        )
        .unwrap();
        let client = http_client(Duration::from_secs(2)).unwrap();
        let api = admin_api(json!({ "tunnels": [] })).await;

        let found = discover(DiscoveryParams {
            client: &client,
            admin_api: &api,
            log_path: &log,
            local_addr: "127.0.0.1:8000",
            url_pattern: &pattern(),
            settle_delay: Duration::ZERO,
        })
        .await
        .unwrap();
        assert_eq!(found.url, "https://fall-back-42.ngrok-free.app");
        assert_eq!(found.source, DiscoverySource::LogScan);
    }

    #[tokio::test]
    async fn unreachable_api_and_empty_log_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("tunnel.log");
        std::fs::write(&log, "lvl=eror msg=\"authentication failed\"\n").unwrap();
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let api = format!("http://127.0.0.1:{port}/api/tunnels");
        let client = http_client(Duration::from_secs(1)).unwrap();

        let err = discover(DiscoveryParams {
            client: &client,
            admin_api: &api,
            log_path: &log,
            local_addr: "127.0.0.1:8000",
            url_pattern: &pattern(),
            settle_delay: Duration::ZERO,
        })
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:8000"));
        assert!(msg.contains("tunnel.log"));
    }
}
