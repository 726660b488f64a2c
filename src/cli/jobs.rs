// CLI job commands: submit, list, status, cancel, delete, download

use std::io::{self, BufRead, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::{base_url, handle_request_error};
use crate::models::{NewJob, SourceKind, SourcePayload, UploadFile};

/// Arguments for `translateable submit`.
#[derive(Debug)]
pub struct SubmitArgs<'a> {
    pub files: &'a [String],
    pub url: Option<&'a str>,
    pub target_language: &'a str,
    pub source_language: Option<&'a str>,
    pub title: Option<&'a str>,
    pub fail_fast: bool,
}

/// Arguments for `translateable list`.
#[derive(Debug, Default)]
pub struct ListArgs<'a> {
    pub status: Option<&'a str>,
    pub query: Option<&'a str>,
    pub page: usize,
    pub per_page: usize,
    pub oldest: bool,
}

/// Format a relative time string like "2 minutes ago".
fn format_relative_time(dt: &DateTime<Utc>) -> String {
    let secs = Utc::now().signed_duration_since(*dt).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86400)
    }
}

/// Format a byte count as B, KB or MB.
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Turn a non-success response into an error carrying the server's message.
async fn error_from_response(response: Response) -> anyhow::Error {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .unwrap_or_else(|_| serde_json::json!({"message": "Unknown error"}));
    let message = body["message"].as_str().unwrap_or("Unknown error");
    anyhow::anyhow!("{} ({})", message, status.as_u16())
}

async fn get_json(client: &Client, url: &str, host: &str, port: u16) -> anyhow::Result<Value> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))
}

/// Read the given files into an upload submission.
fn read_upload(files: &[String]) -> anyhow::Result<Vec<UploadFile>> {
    files
        .iter()
        .map(|path| {
            let path = Path::new(path);
            let data = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read '{}': {}", path.display(), e))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(UploadFile {
                content_type: mime_guess::from_path(path)
                    .first_raw()
                    .map(|m| m.to_string()),
                name,
                index: None,
                data,
            })
        })
        .collect()
}

fn build_new_job(args: &SubmitArgs<'_>) -> anyhow::Result<NewJob> {
    let (source_kind, payload) = match args.url {
        Some(url) => (
            SourceKind::RemoteUrl,
            SourcePayload::Remote {
                url: url.to_string(),
            },
        ),
        None => (
            SourceKind::UploadBatch,
            SourcePayload::Upload {
                files: read_upload(args.files)?,
            },
        ),
    };
    Ok(NewJob {
        source_kind,
        payload,
        target_language: args.target_language.to_string(),
        source_language: args.source_language.map(|s| s.to_string()),
        title: args.title.map(|s| s.to_string()),
        fail_fast: args.fail_fast.then_some(true),
    })
}

/// translateable submit
pub async fn cmd_submit(
    host: &str,
    port: u16,
    args: &SubmitArgs<'_>,
    wait: bool,
) -> anyhow::Result<()> {
    let new_job = build_new_job(args)?;

    let client = Client::new();
    let url = format!("{}/jobs", base_url(host, port));

    let response = client
        .post(&url)
        .json(&new_job)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;
    let job_id = body["jobId"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing job ID in response"))?
        .to_string();

    println!("Job submitted.");
    println!("  ID: {}", job_id);

    if wait {
        wait_for_job(&client, host, port, &job_id).await?;
    }

    Ok(())
}

/// Follow the event stream for one job until it reaches a terminal status.
async fn wait_for_job(client: &Client, host: &str, port: u16, job_id: &str) -> anyhow::Result<()> {
    let events_url = format!("{}/events?job_id={}", base_url(host, port), job_id);
    let response = client
        .get(&events_url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    // The job may have finished before the stream was connected.
    let job_url = format!("{}/jobs/{}", base_url(host, port), job_id);
    let job = get_json(client, &job_url, host, port).await?;
    if let Some(status) = job["status"].as_str() {
        if status == "completed" || status == "failed" {
            print_outcome(&job);
            return Ok(());
        }
    }

    if follow_sse_stream(response).await? {
        let job = get_json(client, &job_url, host, port).await?;
        print_outcome(&job);
    }
    Ok(())
}

fn print_outcome(job: &Value) {
    let status = job["status"].as_str().unwrap_or("unknown");
    let done = job["pagesDone"].as_u64().unwrap_or(0);
    let total = job["pageCount"].as_u64().unwrap_or(0);
    if status == "completed" {
        println!("--- Job completed: {}/{} pages translated ---", done, total);
    } else {
        let kind = job["error"]["kind"].as_str().unwrap_or("Failed");
        let message = job["error"]["message"].as_str().unwrap_or("unknown error");
        eprintln!("--- Job failed ({}): {} ---", kind, message);
    }
}

/// Print progress from an SSE response. Returns true once a terminal status
/// event arrives, false if the stream ended first.
///
/// Each `data:` field holds the tagged event JSON, e.g.
///   `{"event":"Progress","data":{"job_id":"...","pages_done":3,...}}`
async fn follow_sse_stream(response: Response) -> anyhow::Result<bool> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("SSE stream error: {}", e))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let event_block = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();

            let mut event_type = String::new();
            let mut data = String::new();
            for line in event_block.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event_type = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = rest.to_string();
                }
            }

            let Ok(json) = serde_json::from_str::<Value>(&data) else {
                continue;
            };
            let payload = &json["data"];
            match event_type.as_str() {
                "status" => {
                    let status = payload["status"].as_str().unwrap_or("?");
                    println!("status: {}", status);
                    if status == "completed" || status == "failed" {
                        return Ok(true);
                    }
                }
                "progress" => {
                    println!(
                        "progress: {}/{} done, {} failed",
                        payload["pages_done"].as_u64().unwrap_or(0),
                        payload["page_count"].as_u64().unwrap_or(0),
                        payload["pages_failed"].as_u64().unwrap_or(0)
                    );
                    io::stdout().flush()?;
                }
                "deleted" => {
                    eprintln!("Job was deleted.");
                    return Ok(false);
                }
                _ => {}
            }
        }
    }

    Ok(false)
}

fn list_query(args: &ListArgs<'_>) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("page", args.page.to_string()),
        ("perPage", args.per_page.to_string()),
        (
            "order",
            if args.oldest { "oldest" } else { "newest" }.to_string(),
        ),
    ];
    if let Some(status) = args.status {
        query.push(("status", status.to_string()));
    }
    if let Some(q) = args.query {
        query.push(("q", q.to_string()));
    }
    query
}

/// translateable list
pub async fn cmd_list(host: &str, port: u16, args: &ListArgs<'_>, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/jobs", base_url(host, port));

    let response = client
        .get(&url)
        .query(&list_query(args))
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    let total: Option<usize> = response
        .headers()
        .get("x-total-count")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let empty_vec = vec![];
    let jobs = body.as_array().unwrap_or(&empty_vec);

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<38}{:<26}{:<12}{:<7}{:<10}{:<11}{:<10}{:<16}",
        "ID", "TITLE", "STATUS", "PAGES", "LANG", "SIZE", "PROGRESS", "CREATED"
    );

    for job in jobs {
        let created = job["dateCreated"]
            .as_str()
            .and_then(|ts| ts.parse::<DateTime<Utc>>().ok())
            .map(|dt| format_relative_time(&dt))
            .unwrap_or_else(|| "-".to_string());
        let progress = job["progress"].as_f64().unwrap_or(0.0);

        println!(
            "{:<38}{:<26}{:<12}{:<7}{:<10}{:<11}{:<10}{:<16}",
            job["id"].as_str().unwrap_or("?"),
            truncate(job["title"].as_str().unwrap_or("?"), 24),
            job["status"].as_str().unwrap_or("?"),
            job["pages"].as_u64().unwrap_or(0),
            truncate(job["language"].as_str().unwrap_or("?"), 9),
            format_size(job["size"].as_u64().unwrap_or(0)),
            format!("{:.0}%", progress * 100.0),
            created
        );
    }

    if let Some(total) = total {
        println!(
            "\nShowing {} of {} jobs (page {}).",
            jobs.len(),
            total,
            args.page
        );
    }

    Ok(())
}

/// translateable status
pub async fn cmd_status(host: &str, port: u16, job: &str, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/jobs/{}", base_url(host, port), job);
    let body = get_json(&client, &url, host, port).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let progress = body["progress"].as_f64().unwrap_or(0.0);
    println!("Job {}", body["id"].as_str().unwrap_or(job));
    println!("  Title:    {}", body["title"].as_str().unwrap_or("?"));
    println!("  Status:   {}", body["status"].as_str().unwrap_or("?"));
    println!(
        "  Language: {} -> {}",
        body["sourceLanguage"].as_str().unwrap_or("?"),
        body["targetLanguage"].as_str().unwrap_or("?")
    );
    println!(
        "  Pages:    {} done, {} failed, {} total ({:.0}%)",
        body["pagesDone"].as_u64().unwrap_or(0),
        body["pagesFailed"].as_u64().unwrap_or(0),
        body["pageCount"].as_u64().unwrap_or(0),
        progress * 100.0
    );
    println!(
        "  Size:     {}",
        format_size(body["totalBytes"].as_u64().unwrap_or(0))
    );
    if let Some(url) = body["sourceUrl"].as_str() {
        println!("  Source:   {}", url);
    }
    if body["error"].is_object() {
        println!(
            "  Error:    {}: {}",
            body["error"]["kind"].as_str().unwrap_or("?"),
            body["error"]["message"].as_str().unwrap_or("?")
        );
    }

    let empty_vec = vec![];
    let pages = body["pages"].as_array().unwrap_or(&empty_vec);
    if pages.is_empty() {
        return Ok(());
    }

    println!();
    println!(
        "{:<7}{:<13}{:<10}{:<10}{}",
        "PAGE", "STATUS", "REGIONS", "ATTEMPTS", "ERROR"
    );
    for page in pages {
        let error = if page["error"].is_object() {
            format!(
                "{}: {}",
                page["error"]["kind"].as_str().unwrap_or("?"),
                page["error"]["message"].as_str().unwrap_or("?")
            )
        } else {
            "-".to_string()
        };
        println!(
            "{:<7}{:<13}{:<10}{:<10}{}",
            page["index"].as_u64().unwrap_or(0),
            page["status"].as_str().unwrap_or("?"),
            format!(
                "{}/{}",
                page["regionsTranslated"].as_u64().unwrap_or(0),
                page["regionCount"].as_u64().unwrap_or(0)
            ),
            page["attempts"].as_u64().unwrap_or(0),
            truncate(&error, 60)
        );
    }

    Ok(())
}

/// translateable cancel
pub async fn cmd_cancel(host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/jobs/{}/cancel", base_url(host, port), job);

    let response = client
        .post(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    match body["status"].as_str() {
        Some("failed") => println!("Job '{}' cancelled.", job),
        Some(status) => println!("Job '{}' is {}; cancellation requested.", job, status),
        None => println!("Cancellation requested for job '{}'.", job),
    }
    Ok(())
}

/// translateable delete
pub async fn cmd_delete(host: &str, port: u16, job: &str, yes: bool) -> anyhow::Result<()> {
    if !yes {
        print!(
            "Delete job '{}' and all of its pages? [y/N] ",
            job
        );
        io::stdout().flush()?;
        let stdin = io::stdin();
        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;
        let answer = line.trim().to_lowercase();
        if answer != "y" && answer != "yes" {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let client = Client::new();
    let url = format!("{}/jobs/{}", base_url(host, port), job);

    let response = client
        .delete(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if response.status().as_u16() == 204 {
        println!("Job '{}' deleted.", job);
        Ok(())
    } else {
        Err(error_from_response(response).await)
    }
}

/// Pull the file name out of a `Content-Disposition: attachment; filename="..."` header.
fn disposition_file_name(value: &str) -> Option<String> {
    let start = value.find("filename=")? + "filename=".len();
    let name = value[start..].split(';').next()?.trim().trim_matches('"');
    let name = Path::new(name).file_name()?.to_string_lossy().into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// translateable download
pub async fn cmd_download(
    host: &str,
    port: u16,
    job: &str,
    output: Option<&str>,
    page: Option<usize>,
) -> anyhow::Result<()> {
    let client = Client::new();
    let url = match page {
        Some(index) => format!("{}/jobs/{}/pages/{}", base_url(host, port), job, index),
        None => format!("{}/jobs/{}/download", base_url(host, port), job),
    };

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let file_name = match output {
        Some(path) => path.to_string(),
        None => {
            let from_header = response
                .headers()
                .get(reqwest::header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(disposition_file_name);
            match (from_header, page) {
                (Some(name), _) => name,
                (None, Some(index)) => {
                    let ext = response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(mime_guess::get_mime_extensions_str)
                        .and_then(|exts| exts.first())
                        .copied()
                        .unwrap_or("bin");
                    format!("{}-page-{:03}.{}", job, index, ext)
                }
                (None, None) => format!("{}.zip", job),
            }
        }
    };

    let mut file = tokio::fs::File::create(&file_name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create '{}': {}", file_name, e))?;

    use futures_util::StreamExt;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("Download interrupted: {}", e))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    println!("Saved {} ({})", file_name, format_size(written));
    Ok(())
}
