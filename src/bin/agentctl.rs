//! Start/stop triggers for a running agent API
//!
//! `agentctl start` / `agentctl stop`. Success is an HTTP 200; anything else
//! is printed with the status code and body. No automatic retry.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let command = std::env::args().nth(1).unwrap_or_default();
    let base_url =
        std::env::var("AGENT_API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());

    let path = match command.as_str() {
        "start" => "/agent/start",
        "stop" => "/agent/stop",
        _ => {
            eprintln!("Usage: agentctl <start|stop>");
            return ExitCode::FAILURE;
        }
    };

    let url = format!("{}{}", base_url, path);
    match reqwest::Client::new().post(&url).send().await {
        Ok(response) if response.status().is_success() => {
            println!("Agent cycle {} request accepted.", command);
            ExitCode::SUCCESS
        }
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            eprintln!("Failed to {} agent: {} - {}", command, status, body);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error connecting to backend: {}", e);
            ExitCode::FAILURE
        }
    }
}
