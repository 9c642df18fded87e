use crate::model::Readiness;
use std::time::Duration;
use tokio::time::Instant;

/// Parameters for a readiness wait.
pub(crate) struct ReadinessParams<'a> {
    pub client: &'a reqwest::Client,
    pub url: &'a str,
    /// Sleep before the first probe; model loading takes a while.
    pub initial_delay: Duration,
    /// Polling window after the initial delay.
    pub window: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

/// Poll `url` until it answers with a success status or the budget
/// (`initial_delay + window`) runs out.
///
/// `NotReady` is returned no earlier than the full budget.
pub(crate) async fn wait_ready(params: ReadinessParams<'_>) -> Readiness {
    let ReadinessParams {
        client,
        url,
        initial_delay,
        window,
        poll_interval,
        probe_timeout,
    } = params;
    let start = Instant::now();
    let deadline = start + initial_delay + window;
    let mut attempts = 0u32;
    let mut last_error = None;

    if !initial_delay.is_zero() {
        tracing::info!(
            url,
            "waiting {} before probing readiness",
            humantime::format_duration(initial_delay)
        );
        tokio::time::sleep(initial_delay).await;
    }

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        attempts += 1;

        match probe(client, url, probe_timeout.min(remaining)).await {
            Ok(()) => {
                let elapsed = start.elapsed();
                tracing::info!(url, attempts, "ready after {:.1}s", elapsed.as_secs_f64());
                return Readiness::Ready { elapsed, attempts };
            }
            Err(e) => {
                tracing::debug!(url, attempts, "not ready yet: {e}");
                last_error = Some(e);
            }
        }

        let next = Instant::now() + poll_interval;
        if next >= deadline {
            tokio::time::sleep_until(deadline).await;
            break;
        }
        tokio::time::sleep_until(next).await;
    }

    Readiness::NotReady {
        elapsed: start.elapsed(),
        attempts,
        last_error,
    }
}

async fn probe(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<(), String> {
    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP {}", resp.status()))
    }
}
