//! Network-facing work: readiness probing, endpoint discovery and keep-alive traffic.

pub mod discovery;
pub mod keepalive;
pub mod readiness;

use std::time::Duration;

/// Shared HTTP client with a per-request timeout.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("serve-tunnel/{}", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
}

#[cfg(test)]
pub(crate) mod stub {
    //! Throwaway HTTP servers for tests.

    use std::net::SocketAddr;

    pub(crate) async fn serve(router: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}
