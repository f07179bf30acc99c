//! Submit a build through the API.

use anyhow::{Result, bail};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
struct SubmitBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    build_id: Option<String>,
    repo_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    env_vars: BTreeMap<String, String>,
}

pub async fn submit(
    api_url: &str,
    repo_url: &str,
    build_id: Option<String>,
    user_id: Option<String>,
    env: Vec<(String, String)>,
) -> Result<()> {
    let body = SubmitBody {
        build_id,
        repo_url: repo_url.to_string(),
        user_id,
        env_vars: env.into_iter().collect(),
    };

    let response = reqwest::Client::new()
        .post(super::endpoint(api_url, "/project")?)
        .json(&body)
        .send()
        .await?;
    let status = response.status();
    let payload: Value = response.json().await?;

    if !status.is_success() {
        let message = payload["error"]
            .as_str()
            .or_else(|| payload["message"].as_str())
            .unwrap_or("unknown error");
        bail!("submission failed ({}): {}", status, message);
    }

    println!(
        "{} ({})",
        payload["data"]["message"].as_str().unwrap_or("Job queued"),
        payload["data"]["buildId"].as_str().unwrap_or("?")
    );
    Ok(())
}
