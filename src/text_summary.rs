//! Operator-facing endpoint summary.
//!
//! Formats the lines printed once discovery finishes: where the model is
//! reachable and a ready-to-paste request against it.

use crate::model::EndpointSummary;

/// Pre-formatted lines for the endpoint banner.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build the banner for a discovered (or undiscovered) endpoint.
pub(crate) fn build_endpoint_summary(summary: &EndpointSummary) -> TextSummary {
    let mut lines = Vec::new();
    let rule = "=".repeat(60);

    lines.push(rule.clone());
    lines.push(format!("Deployment: {}", summary.label));
    lines.push(format!("Model:      {}", summary.model));
    lines.push(format!("Started:    {}", summary.started_at));
    lines.push(format!("Local:      {}{}", summary.local_url, summary.chat_path));

    let base = match summary.public_url.as_deref() {
        Some(url) => {
            lines.push(format!("Public:     {}{}", url.trim_end_matches('/'), summary.chat_path));
            url
        }
        None => {
            lines.push("Public:     unavailable (tunnel URL not discovered)".to_string());
            summary.local_url.as_str()
        }
    };

    lines.push(String::new());
    lines.push("Example:".to_string());
    lines.extend(curl_example(base, &summary.chat_path, &summary.model));
    lines.push(rule);

    TextSummary { lines }
}

fn curl_example(base: &str, chat_path: &str, model: &str) -> Vec<String> {
    let body = serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": "Hello!" }],
    });
    vec![
        format!("  curl {}{} \\", base.trim_end_matches('/'), chat_path),
        "    -H 'Content-Type: application/json' \\".to_string(),
        format!("    -d '{body}'"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(public_url: Option<&str>) -> EndpointSummary {
        EndpointSummary {
            label: "qwen-demo".into(),
            public_url: public_url.map(str::to_string),
            local_url: "http://127.0.0.1:8000".into(),
            chat_path: "/v1/chat/completions".into(),
            model: "Qwen/Qwen2.5-7B-Instruct".into(),
            started_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn public_url_is_used_for_the_example() {
        let text = build_endpoint_summary(&summary(Some("https://abcd.ngrok-free.app/"))).lines;
        assert!(text.contains(&"Public:     https://abcd.ngrok-free.app/v1/chat/completions".to_string()));
        assert!(text
            .iter()
            .any(|l| l == "  curl https://abcd.ngrok-free.app/v1/chat/completions \\"));
        let body = text.iter().find(|l| l.starts_with("    -d ")).unwrap();
        assert!(body.contains(r#""model":"Qwen/Qwen2.5-7B-Instruct""#));
    }

    #[test]
    fn missing_public_url_falls_back_to_local() {
        let text = build_endpoint_summary(&summary(None)).lines;
        assert!(text.iter().any(|l| l.contains("unavailable")));
        assert!(text
            .iter()
            .any(|l| l == "  curl http://127.0.0.1:8000/v1/chat/completions \\"));
    }
}
