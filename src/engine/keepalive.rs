//! Periodic synthetic chat traffic that keeps the served model warm.
//!
//! The scheduler is spawned once and never joined. Request failures are
//! logged and the loop carries on; nothing is reported back to the caller.

use crate::config::KeepAliveConfig;
use crate::logging::KEEPALIVE_TARGET;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Longest response body kept in a failure log line.
const MAX_LOGGED_BODY: usize = 2048;

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveOutcome {
    Success {
        prompt_index: usize,
    },
    Failure {
        prompt_index: usize,
        status: Option<u16>,
        body: String,
    },
}

/// Owns the prompt cursor; nothing else reads or writes it.
pub struct KeepAliveScheduler {
    client: reqwest::Client,
    url: String,
    model: String,
    prompts: Vec<String>,
    temperature: f32,
    max_tokens: u32,
    initial_delay: Duration,
    interval: Duration,
    cursor: usize,
}

impl KeepAliveScheduler {
    /// `base_url` is the endpoint root; `chat_path` is appended to it.
    pub fn new(
        cfg: &KeepAliveConfig,
        base_url: &str,
        chat_path: &str,
        model: &str,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: super::http_client(cfg.request_timeout)?,
            url: format!("{}{}", base_url.trim_end_matches('/'), chat_path),
            model: model.to_string(),
            prompts: cfg.prompts.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            initial_delay: cfg.initial_delay,
            interval: cfg.interval,
            cursor: 0,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn request_for<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    /// Send the next prompt in the cycle and advance the cursor.
    pub async fn fire(&mut self) -> KeepAliveOutcome {
        if self.prompts.is_empty() {
            return KeepAliveOutcome::Failure {
                prompt_index: 0,
                status: None,
                body: "no prompts configured".into(),
            };
        }
        let prompt_index = self.cursor % self.prompts.len();
        let prompt = &self.prompts[prompt_index];

        let result = self
            .client
            .post(&self.url)
            .json(&self.request_for(prompt))
            .send()
            .await;

        let outcome = match result {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                tracing::info!(
                    target: KEEPALIVE_TARGET,
                    prompt_index,
                    url = %self.url,
                    "keep-alive request succeeded"
                );
                KeepAliveOutcome::Success { prompt_index }
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!(
                    target: KEEPALIVE_TARGET,
                    prompt_index,
                    status,
                    url = %self.url,
                    body = %truncate(&body, MAX_LOGGED_BODY),
                    "keep-alive request failed"
                );
                KeepAliveOutcome::Failure {
                    prompt_index,
                    status: Some(status),
                    body,
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: KEEPALIVE_TARGET,
                    prompt_index,
                    url = %self.url,
                    "keep-alive request failed: {e}"
                );
                KeepAliveOutcome::Failure {
                    prompt_index,
                    status: None,
                    body: e.to_string(),
                }
            }
        };

        self.cursor = (prompt_index + 1) % self.prompts.len();
        outcome
    }

    /// Idle for the initial delay, then fire forever, one request per interval.
    pub async fn run(mut self) {
        tracing::info!(
            target: KEEPALIVE_TARGET,
            url = %self.url,
            prompts = self.prompts.len(),
            "keep-alive scheduled: first request in {}, then every {}",
            humantime::format_duration(self.initial_delay),
            humantime::format_duration(self.interval)
        );
        tokio::time::sleep(self.initial_delay).await;
        // Fixed cadence: request latency does not push the next fire time back.
        let mut ticks = tokio::time::interval(self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.fire().await;
        }
    }

    /// Detach the scheduler onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<String>>>;

    /// Records prompts; every request whose 1-based number is in `fail_on` gets a 500.
    async fn chat_stub(fail_on: Vec<usize>) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let router = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    move |State(seen): State<Seen>, Json(body): Json<serde_json::Value>| {
                        let fail_on = fail_on.clone();
                        async move {
                            let prompt = body["messages"][0]["content"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string();
                            let n = {
                                let mut seen = seen.lock().unwrap();
                                seen.push(prompt);
                                seen.len()
                            };
                            if fail_on.contains(&n) {
                                (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded")
                            } else {
                                (StatusCode::OK, "{}")
                            }
                        }
                    },
                ),
            )
            .with_state(seen.clone());
        let addr = stub::serve(router).await;
        (format!("http://{addr}"), seen)
    }

    fn cfg(prompts: &[&str], interval: Duration) -> KeepAliveConfig {
        KeepAliveConfig {
            enabled: true,
            endpoint: None,
            initial_delay: Duration::ZERO,
            interval,
            prompts: prompts.iter().map(|p| p.to_string()).collect(),
            temperature: 0.2,
            max_tokens: 8,
            request_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn prompts_cycle_and_failures_do_not_stop_the_cycle() {
        let (base, seen) = chat_stub(vec![2]).await;
        let mut ka = KeepAliveScheduler::new(
            &cfg(&["a", "b", "c"], Duration::from_secs(60)),
            &base,
            "/v1/chat/completions",
            "stub-model",
        )
        .unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..7 {
            outcomes.push(ka.fire().await);
        }

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c", "a", "b", "c", "a"]);
        for (n, outcome) in outcomes.iter().enumerate() {
            let expected_index = n % 3;
            match outcome {
                KeepAliveOutcome::Success { prompt_index } => {
                    assert_ne!(n, 1);
                    assert_eq!(*prompt_index, expected_index);
                }
                KeepAliveOutcome::Failure {
                    prompt_index,
                    status,
                    body,
                } => {
                    assert_eq!(n, 1);
                    assert_eq!(*prompt_index, expected_index);
                    assert_eq!(*status, Some(500));
                    assert_eq!(body, "model overloaded");
                }
            }
        }
    }

    #[tokio::test]
    async fn spawned_loop_keeps_firing_after_failures() {
        let (base, seen) = chat_stub((1..=100).collect()).await;
        let ka = KeepAliveScheduler::new(
            &cfg(&["x", "y"], Duration::from_millis(100)),
            &base,
            "/v1/chat/completions",
            "stub-model",
        )
        .unwrap();

        let handle = ka.spawn();
        tokio::time::sleep(Duration::from_millis(650)).await;
        handle.abort();

        let seen = seen.lock().unwrap().clone();
        assert!(seen.len() >= 4, "only {} requests", seen.len());
        for (n, prompt) in seen.iter().enumerate() {
            assert_eq!(prompt, if n % 2 == 0 { "x" } else { "y" });
        }
    }

    #[tokio::test]
    async fn slow_responses_do_not_stretch_the_interval() {
        let arrivals: Arc<Mutex<Vec<std::time::Instant>>> = Arc::default();
        let recorded = arrivals.clone();
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(std::time::Instant::now());
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    StatusCode::OK
                }
            }),
        );
        let base = format!("http://{}", stub::serve(router).await);
        let ka = KeepAliveScheduler::new(
            &cfg(&["tick"], Duration::from_millis(200)),
            &base,
            "/v1/chat/completions",
            "stub-model",
        )
        .unwrap();

        let handle = ka.spawn();
        tokio::time::sleep(Duration::from_millis(1050)).await;
        handle.abort();

        // Sleeping after each response would give a 350ms period and only 3 requests.
        let arrivals = arrivals.lock().unwrap().clone();
        assert!(arrivals.len() >= 5, "only {} requests", arrivals.len());
        for pair in arrivals.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap < Duration::from_millis(300), "gap {gap:?}");
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_failure_not_a_panic() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut ka = KeepAliveScheduler::new(
            &cfg(&["only"], Duration::from_secs(60)),
            &format!("http://127.0.0.1:{port}/"),
            "/v1/chat/completions",
            "stub-model",
        )
        .unwrap();
        assert_eq!(ka.url(), format!("http://127.0.0.1:{port}/v1/chat/completions"));

        let first = ka.fire().await;
        assert!(matches!(first, KeepAliveOutcome::Failure { status: None, .. }));
        assert!(matches!(ka.fire().await, KeepAliveOutcome::Failure { .. }));
    }

    #[test]
    fn payload_escapes_prompt_text() {
        let prompt = "Say \"hi\"\nthen \\ stop";
        let ka = KeepAliveScheduler {
            client: reqwest::Client::new(),
            url: String::new(),
            model: "m".into(),
            prompts: vec![prompt.into()],
            temperature: 0.5,
            max_tokens: 16,
            initial_delay: Duration::ZERO,
            interval: Duration::from_secs(1),
            cursor: 0,
        };
        let text = serde_json::to_string(&ka.request_for(prompt)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["model"], "m");
        assert_eq!(parsed["messages"][0]["role"], "user");
        assert_eq!(parsed["messages"][0]["content"], prompt);
        assert_eq!(parsed["max_tokens"], 16);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
