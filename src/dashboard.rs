//! Minimal client for a visdom-compatible dashboard server.
//!
//! Only the pieces the harness needs: a connectivity check and line plots
//! that can be extended point by point.

use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::{json, Value};

use crate::error::DashboardError;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Require a reachable server at startup. On by default.
    pub enabled: bool,
    pub server: String,
    pub port: u16,
    /// Dashboard environment the panes are created in.
    pub env: String,
    pub timeout_secs: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            enabled: true,
            server: "localhost".to_string(),
            port: 8097,
            env: "main".to_string(),
            timeout_secs: 5,
        }
    }
}

impl DashboardConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.server, self.port)
    }
}

pub struct Dashboard {
    client: Client,
    base_url: String,
    env: String,
}

impl Dashboard {
    /// Connect to the configured server. Returns `None` when the dashboard is
    /// disabled and an error when it is enabled but unreachable.
    pub fn connect(config: &DashboardConfig) -> Result<Option<Self>, DashboardError> {
        if !config.enabled {
            return Ok(None);
        }
        let base_url = config.base_url();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DashboardError::Unreachable {
                url: base_url.clone(),
                source: e,
            })?;
        let dashboard = Dashboard {
            client,
            base_url,
            env: config.env.clone(),
        };
        dashboard.check_connection()?;
        tracing::info!(url = %dashboard.base_url, "dashboard connected");
        Ok(Some(dashboard))
    }

    pub fn check_connection(&self) -> Result<(), DashboardError> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .map_err(|e| DashboardError::Unreachable {
                url: self.base_url.clone(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(DashboardError::BadStatus {
                url: self.base_url.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    fn post(&self, endpoint: &str, body: &Value) -> Result<(), DashboardError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| DashboardError::Unreachable {
                url: url.clone(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(DashboardError::BadStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Create or replace line plot `win`.
    pub fn line(
        &self,
        win: &str,
        title: &str,
        x: &[f64],
        series: &[(&str, Vec<f64>)],
    ) -> Result<(), DashboardError> {
        self.post("events", &line_payload(&self.env, win, title, x, series))
    }

    /// Append one point to trace `name` of plot `win`.
    pub fn append(&self, win: &str, name: &str, x: f64, y: f64) -> Result<(), DashboardError> {
        self.post("update", &append_payload(&self.env, win, name, x, y))
    }
}

fn line_payload(env: &str, win: &str, title: &str, x: &[f64], series: &[(&str, Vec<f64>)]) -> Value {
    let traces: Vec<Value> = series
        .iter()
        .map(|(name, y)| {
            json!({
                "x": x,
                "y": y,
                "name": name,
                "type": "scatter",
                "mode": "lines",
            })
        })
        .collect();
    json!({
        "eid": env,
        "win": win,
        "data": traces,
        "layout": { "title": title, "showlegend": series.len() > 1 },
        "opts": { "title": title },
    })
}

fn append_payload(env: &str, win: &str, name: &str, x: f64, y: f64) -> Value {
    json!({
        "eid": env,
        "win": win,
        "name": name,
        "append": true,
        "data": [{ "x": [x], "y": [y] }],
    })
}

/// Local HTTP listener answering every request with `200 OK` and
/// forwarding `"<METHOD> <path> <body>"` of each request to the receiver.
#[cfg(test)]
pub(crate) fn spawn_test_server() -> (DashboardConfig, std::sync::mpsc::Receiver<String>) {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                continue;
            }
            let mut content_length = 0;
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap_or(0) == 0 || header == "\r\n" {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).ok();
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default();
            let path = parts.next().unwrap_or_default();
            tx.send(format!("{method} {path} {}", String::from_utf8_lossy(&body)))
                .ok();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .ok();
        }
    });
    let config = DashboardConfig {
        enabled: true,
        server: "127.0.0.1".into(),
        port,
        timeout_secs: 5,
        ..Default::default()
    };
    (config, rx)
}
