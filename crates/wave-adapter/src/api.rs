//! API-wrapper adapter: drives the provider's messages endpoint directly
//! instead of spawning an agent CLI. Single-shot — no tool use — which is
//! enough for pure-generation personas.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use wave_core::error::{FailureReason, StepError};
use wave_core::stream::{ResultSubtype, StreamEvent, StreamEventKind};

use crate::config::{AdapterResult, AdapterRunConfig};
use crate::settings::assemble_system_prompt;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const MAX_OUTPUT_TOKENS: u32 = 8192;
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ApiContent>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub(crate) async fn run_api(
    base_url: Option<&str>,
    config: &AdapterRunConfig,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<AdapterResult, StepError> {
    let api_key = config.env.get("ANTHROPIC_API_KEY").ok_or_else(|| {
        StepError::new(
            FailureReason::GeneralError,
            "ANTHROPIC_API_KEY is not in the persona's env passthrough",
        )
    })?;

    let url = format!(
        "{}/v1/messages",
        base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/')
    );
    let mut body = json!({
        "model": config.model.as_deref().unwrap_or(DEFAULT_MODEL),
        "max_tokens": MAX_OUTPUT_TOKENS,
        "system": assemble_system_prompt(config),
        "messages": [{ "role": "user", "content": config.prompt }],
    });
    if let Some(temperature) = config.temperature {
        body["temperature"] = json!(temperature);
    }

    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| StepError::new(FailureReason::GeneralError, format!("http client: {e}")))?;

    let request = client
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", API_VERSION)
        .json(&body)
        .send();

    let response = tokio::select! {
        response = request => response,
        _ = cancel.cancelled() => {
            return Err(StepError::new(
                FailureReason::Cancelled,
                "cancelled before the API call completed",
            ));
        }
        _ = tokio::time::sleep(config.timeout + Duration::from_secs(1)) => {
            return Err(StepError::new(
                FailureReason::Timeout,
                format!("deadline of {}s expired", config.timeout.as_secs()),
            ));
        }
    };

    let response = response.map_err(|e| {
        if e.is_timeout() {
            StepError::new(
                FailureReason::Timeout,
                format!("deadline of {}s expired", config.timeout.as_secs()),
            )
        } else {
            StepError::new(FailureReason::GeneralError, format!("API request failed: {e}"))
        }
    })?;

    let status = response.status();
    if status.as_u16() == 429 {
        let detail = response.text().await.unwrap_or_default();
        return Err(StepError::new(
            FailureReason::RateLimit,
            format!("rate limit: {detail}"),
        ));
    }
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(StepError::new(
            FailureReason::GeneralError,
            format!("API returned {status}: {detail}"),
        ));
    }

    let parsed: ApiResponse = response.json().await.map_err(|e| {
        StepError::new(
            FailureReason::GeneralError,
            format!("unreadable API response: {e}"),
        )
    })?;

    let text: String = parsed
        .content
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("");
    let tokens = parsed
        .usage
        .input_tokens
        .saturating_add(parsed.usage.output_tokens);

    debug!(tokens, "API adapter completed");

    config.emit(&StreamEvent {
        kind: StreamEventKind::Result,
        tool_name: None,
        tool_input: None,
        content: Some(text.clone()),
        tokens_in: parsed.usage.input_tokens,
        tokens_out: parsed.usage.output_tokens,
        subtype: Some(ResultSubtype::Success),
    });

    Ok(AdapterResult {
        exit_code: 0,
        stdout: text.clone(),
        tokens_used: tokens,
        result_content: Some(text),
        subtype: Some(ResultSubtype::Success),
        files_modified: Vec::new(),
        failure: None,
        format_warning: None,
    })
}
