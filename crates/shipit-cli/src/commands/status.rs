//! Build status queries.

use anyhow::{Result, bail};
use serde_json::Value;

async fn get(api_url: &str, path: &str) -> Result<Value> {
    let response = reqwest::get(super::endpoint(api_url, path)?).await?;
    let status = response.status();
    let payload: Value = response.json().await?;
    if !status.is_success() {
        bail!(
            "request failed ({}): {}",
            status,
            payload["error"].as_str().unwrap_or("unknown error")
        );
    }
    Ok(payload)
}

fn field<'a>(job: &'a Value, name: &str) -> &'a str {
    job[name].as_str().unwrap_or("-")
}

pub async fn show(api_url: &str, id: &str) -> Result<()> {
    let job = get(api_url, &format!("/project/{}", id)).await?;

    println!("Build:     {}", field(&job, "id"));
    println!("Status:    {}", field(&job, "status"));
    println!("Repo:      {}", field(&job, "repo_url"));
    println!("Retries:   {}", job["retry_count"]);
    if let Some(size) = job["build_size"].as_i64() {
        println!("Size:      {} bytes", size);
    }
    if let Some(duration) = job["build_duration"].as_i64() {
        println!("Duration:  {} ms", duration);
    }
    if let Some(error) = job["error_message"].as_str() {
        println!("Error:     {}", error);
    }
    println!("Updated:   {}", field(&job, "updated_at"));
    Ok(())
}

pub async fn list(api_url: &str, limit: u32) -> Result<()> {
    let jobs = get(api_url, &format!("/project?limit={}", limit)).await?;
    let jobs = jobs.as_array().map(Vec::as_slice).unwrap_or_default();
    if jobs.is_empty() {
        println!("No builds");
        return Ok(());
    }

    println!("{:<38} {:<18} {:>7}  REPO", "BUILD", "STATUS", "RETRIES");
    for job in jobs {
        println!(
            "{:<38} {:<18} {:>7}  {}",
            field(job, "id"),
            field(job, "status"),
            job["retry_count"].as_u64().unwrap_or(0),
            field(job, "repo_url")
        );
    }
    Ok(())
}
