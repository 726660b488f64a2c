// CLI daemon commands: serve, health

use reqwest::Client;
use serde_json::Value;

use super::{base_url, handle_request_error};

/// translateable serve
pub async fn cmd_serve(
    config: Option<&str>,
    bind: Option<&str>,
    port_override: Option<u16>,
    data_dir: Option<&str>,
) -> anyhow::Result<()> {
    let config_path = config.map(std::path::Path::new);
    let data_dir_path = data_dir.map(std::path::Path::new);

    crate::daemon::start_daemon(config_path, data_dir_path, bind, port_override).await
}

/// translateable health
pub async fn cmd_health(host: &str, port: u16, verbose: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/health", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if !status.is_success() {
        let message = body["message"]
            .as_str()
            .unwrap_or("Daemon returned an error");
        anyhow::bail!("{}", message);
    }

    let daemon_status = body["status"].as_str().unwrap_or("unknown");
    let version = body["version"].as_str().unwrap_or("unknown");
    let uptime = body["uptimeSeconds"].as_u64().unwrap_or(0);
    let active_jobs = body["activeJobs"].as_u64().unwrap_or(0);
    let total_jobs = body["totalJobs"].as_u64().unwrap_or(0);
    let workers = body["maxWorkers"].as_u64().unwrap_or(0);
    let data_dir = body["dataDir"].as_str().unwrap_or("unknown");

    println!("Daemon Status: {}", daemon_status);
    println!("  Data Dir:    {}", data_dir);
    println!("  API:         {}", base_url(host, port));
    println!(
        "  Jobs:        {} active / {} total",
        active_jobs, total_jobs
    );
    println!("  Workers:     {}", workers);
    println!("  Uptime:      {}", format_uptime(uptime));
    println!("  Version:     {}", version);

    if verbose {
        println!("\nRaw response:");
        println!("{}", serde_json::to_string_pretty(&body)?);
    }

    Ok(())
}

/// Format uptime seconds into a human-readable string.
fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
