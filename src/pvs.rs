use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub const PVS_USERNAME: &str = "ssm_owner"; //fixed owner account on the supervisor
pub const SERIAL_SECRET_LEN: usize = 5; //trailing serial chars used as the password
pub const PVS_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const PVS_READ_TIMEOUT_SECS: u64 = 10;

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, PartialEq)]
pub enum AuthError {
    NoSerialAvailable,
    SerialTooShort,
    Rejected(String),
    Unreachable(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoSerialAvailable => {
                write!(f, "no PVS serial available from discovery or config")
            }
            AuthError::SerialTooShort => {
                write!(f, "PVS serial is shorter than {} characters", SERIAL_SECRET_LEN)
            }
            AuthError::Rejected(detail) => write!(f, "PVS rejected authentication: {}", detail),
            AuthError::Unreachable(detail) => {
                write!(f, "PVS unreachable during authentication: {}", detail)
            }
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
pub enum FetchError {
    Unauthorized,
    Unreachable(String),
    MalformedResponse(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FetchError::Unauthorized => write!(f, "PVS reported an authentication failure"),
            FetchError::Unreachable(detail) => write!(f, "PVS unreachable: {}", detail),
            FetchError::MalformedResponse(detail) => {
                write!(f, "malformed device list response: {}", detail)
            }
        }
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub identifier: String,
    pub derived_secret: String,
}

impl Credential {
    pub fn derive(
        discovered_serial: Option<&str>,
        fallback_serial: Option<&str>,
    ) -> std::result::Result<Credential, AuthError> {
        let serial = discovered_serial
            .filter(|s| !s.is_empty())
            .or_else(|| fallback_serial.filter(|s| !s.is_empty()))
            .ok_or(AuthError::NoSerialAvailable)?;
        let length = serial.chars().count();
        if length < SERIAL_SECRET_LEN {
            return Err(AuthError::SerialTooShort);
        }
        let derived_secret = serial.chars().skip(length - SERIAL_SECRET_LEN).collect();
        Ok(Credential {
            identifier: serial.to_string(),
            derived_secret,
        })
    }
}

pub struct Session {
    pub credential: Credential,
    pub token: String,
}

#[derive(Deserialize)]
struct VarEntry {
    value: String,
}

#[derive(Deserialize)]
struct VarsResponse {
    values: Vec<VarEntry>,
}

#[derive(Deserialize)]
struct AuthResponse {
    session: Option<String>,
}

#[derive(Deserialize)]
struct DeviceListResponse {
    devices: Vec<Value>,
}

pub struct Pvs {
    pub name: String,
    pub host: String,
    client: reqwest::Client,
}

impl Pvs {
    pub fn new(name: String, host: String) -> Result<Pvs> {
        //the supervisor serves a self-signed certificate
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(PVS_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(PVS_READ_TIMEOUT_SECS))
            .build()?;
        Ok(Pvs { name, host, client })
    }

    pub async fn discover_serial(&self) -> Option<String> {
        let url = format!("https://{}/vars?name=/sys/info/serialnum", self.host);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: serial discovery failed: {}", self.name, e);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                "{}: serial discovery returned status {}",
                self.name,
                response.status()
            );
            return None;
        }
        match response.json::<VarsResponse>().await {
            Ok(vars) => vars
                .values
                .into_iter()
                .map(|v| v.value)
                .find(|v| !v.is_empty()),
            Err(e) => {
                warn!("{}: cannot parse serial discovery response: {}", self.name, e);
                None
            }
        }
    }

    pub async fn authenticate(
        &self,
        discovered_serial: Option<&str>,
        fallback_serial: Option<&str>,
    ) -> std::result::Result<Session, AuthError> {
        let credential = Credential::derive(discovered_serial, fallback_serial)?;
        let url = format!("https://{}/auth?login", self.host);
        let response = self
            .client
            .get(&url)
            .basic_auth(PVS_USERNAME, Some(&credential.derived_secret))
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(format!("status {}", status)));
        }
        let auth = response
            .json::<AuthResponse>()
            .await
            .map_err(|e| AuthError::Rejected(format!("bad auth response: {}", e)))?;
        match auth.session {
            Some(token) => {
                info!(
                    "{}: authenticated, serial: {}",
                    self.name, credential.identifier
                );
                Ok(Session { credential, token })
            }
            None => Err(AuthError::Rejected("no session token in response".to_string())),
        }
    }

    pub async fn fetch_devices(
        &self,
        session: &Session,
    ) -> std::result::Result<Vec<Value>, FetchError> {
        let url = format!("https://{}/cgi-bin/dl_cgi?Command=DeviceList", self.host);
        let response = self
            .client
            .get(&url)
            .header(
                reqwest::header::COOKIE,
                format!("session={}", session.token),
            )
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized);
        }
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!(
                "device returned status {}",
                status
            )));
        }
        let list = response
            .json::<DeviceListResponse>()
            .await
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
        debug!("{}: retrieved {} device records", self.name, list.devices.len());
        Ok(list.devices)
    }
}
