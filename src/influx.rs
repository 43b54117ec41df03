use crate::lineproto::{self, Point};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub const INFLUX_PRECISION: &str = "s"; //write timestamps as epoch seconds
pub const INFLUX_TIMEOUT_SECS: u64 = 5;
pub const SEND_RETRY_BACKOFF_MS: u64 = 500; //pause before the single resend attempt

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug)]
pub enum SendError {
    Rejected(u16, String),
    Unreachable(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SendError::Rejected(status, body) => {
                write!(f, "write rejected by influxdb (status {}): {}", status, body)
            }
            SendError::Unreachable(detail) => write!(f, "influxdb unreachable: {}", detail),
        }
    }
}

impl std::error::Error for SendError {}

pub struct Influx {
    pub name: String,
    pub url: String,
    pub dbname: String,
    client: reqwest::Client,
}

impl Influx {
    pub fn new(name: String, url: String, dbname: String) -> Result<Influx> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(INFLUX_TIMEOUT_SECS))
            .build()?;
        Ok(Influx {
            name,
            url,
            dbname,
            client,
        })
    }

    pub async fn send(&self, points: &[Point]) -> std::result::Result<usize, SendError> {
        if points.is_empty() {
            return Ok(0);
        }
        let payload = lineproto::to_payload(points);
        match self.write(&payload).await {
            Ok(()) => {}
            Err(SendError::Unreachable(detail)) => {
                warn!("{}: write failed ({}), retrying once...", self.name, detail);
                tokio::time::sleep(Duration::from_millis(SEND_RETRY_BACKOFF_MS)).await;
                self.write(&payload).await?;
            }
            Err(e) => return Err(e),
        }
        debug!("{}: wrote {} lines", self.name, points.len());
        Ok(points.len())
    }

    async fn write(&self, payload: &str) -> std::result::Result<(), SendError> {
        let response = self
            .client
            .post(&self.url)
            .query(&[("db", self.dbname.as_str()), ("precision", INFLUX_PRECISION)])
            .body(payload.to_owned())
            .send()
            .await
            .map_err(|e| SendError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SendError::Rejected(status.as_u16(), body))
    }

    pub async fn test_connection(&self) -> bool {
        info!("{}: testing connection to {}...", self.name, self.url);

        let ping_url = sibling_endpoint(&self.url, "ping");
        match self.client.get(&ping_url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("{}: ✓ influxdb is running", self.name);
            }
            Ok(response) => {
                error!(
                    "{}: ✗ ping failed with status {}",
                    self.name,
                    response.status()
                );
                return false;
            }
            Err(e) => {
                error!("{}: ✗ cannot connect: {}", self.name, e);
                return false;
            }
        }

        let query_url = sibling_endpoint(&self.url, "query");
        let response = match self
            .client
            .get(&query_url)
            .query(&[("q", "SHOW DATABASES")])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("{}: ✗ database listing failed: {}", self.name, e);
                return false;
            }
        };
        if !response.status().is_success() {
            error!(
                "{}: ✗ database listing returned status {}",
                self.name,
                response.status()
            );
            return false;
        }
        let data = match response.json::<Value>().await {
            Ok(v) => v,
            Err(e) => {
                error!("{}: ✗ cannot parse database listing: {}", self.name, e);
                return false;
            }
        };
        let known = database_names(&data);
        if known.iter().any(|name| name == &self.dbname) {
            info!("{}: ✓ database {:?} exists", self.name, self.dbname);
        } else {
            warn!(
                "{}: database {:?} not found (known databases: {:?})",
                self.name, self.dbname, known
            );
        }
        true
    }
}

//the ping and query endpoints live next to the write endpoint
pub fn sibling_endpoint(url: &str, name: &str) -> String {
    match url.strip_suffix("/write") {
        Some(base) => format!("{}/{}", base, name),
        None => format!("{}/{}", url.trim_end_matches('/'), name),
    }
}

fn database_names(data: &Value) -> Vec<String> {
    let mut names = Vec::new();
    let series = data
        .get("results")
        .and_then(|r| r.get(0))
        .and_then(|r| r.get("series"))
        .and_then(Value::as_array);
    if let Some(series) = series {
        for entry in series {
            if let Some(rows) = entry.get("values").and_then(Value::as_array) {
                for row in rows {
                    if let Some(name) = row.get(0).and_then(Value::as_str) {
                        names.push(name.to_string());
                    }
                }
            }
        }
    }
    names
}
