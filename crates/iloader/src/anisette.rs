//! Anisette device attestation headers.
//!
//! Apple's sign-in and developer endpoints expect ten `X-Apple-*` headers
//! produced by an Anisette server. [`AnisetteProvider`] fetches them, caches
//! each server's result for five minutes and collapses concurrent fetches
//! for one server into a single request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::http::{HttpRequest, HttpTransport, TransportError};
use crate::{Error, Result, Stage};

/// How long fetched headers stay valid.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

/// Paths tried in order under the server URL.
const ENDPOINTS: [&str; 3] = ["", "/headers", "/anisette"];
const USER_AGENT: &str = "iloader/1.0";

/// The header set required by Apple services.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnisetteHeaders {
    #[serde(rename = "X-Apple-I-MD-M")]
    pub machine_id: String,
    #[serde(rename = "X-Apple-I-MD")]
    pub one_time_password: String,
    #[serde(rename = "X-Apple-I-MD-LU")]
    pub local_user_id: String,
    #[serde(rename = "X-Apple-I-MD-RINFO")]
    pub routing_info: String,
    #[serde(rename = "X-Mme-Device-Id")]
    pub device_id: String,
    #[serde(rename = "X-Apple-I-SRL-NO")]
    pub serial_number: String,
    #[serde(rename = "X-MMe-Client-Info")]
    pub client_info: String,
    #[serde(rename = "X-Apple-I-Client-Time")]
    pub client_time: String,
    #[serde(rename = "X-Apple-Locale")]
    pub locale: String,
    #[serde(rename = "X-Apple-I-TimeZone")]
    pub timezone: String,
}

impl std::fmt::Debug for AnisetteHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnisetteHeaders")
            .field("device_id", &self.device_id)
            .field("client_time", &self.client_time)
            .finish_non_exhaustive()
    }
}

impl AnisetteHeaders {
    pub const NAMES: [&'static str; 10] = [
        "X-Apple-I-MD-M",
        "X-Apple-I-MD",
        "X-Apple-I-MD-LU",
        "X-Apple-I-MD-RINFO",
        "X-Mme-Device-Id",
        "X-Apple-I-SRL-NO",
        "X-MMe-Client-Info",
        "X-Apple-I-Client-Time",
        "X-Apple-Locale",
        "X-Apple-I-TimeZone",
    ];

    /// Header name and value pairs, in [`AnisetteHeaders::NAMES`] order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        let values = [
            &self.machine_id,
            &self.one_time_password,
            &self.local_user_id,
            &self.routing_info,
            &self.device_id,
            &self.serial_number,
            &self.client_info,
            &self.client_time,
            &self.locale,
            &self.timezone,
        ];
        Self::NAMES
            .into_iter()
            .zip(values)
            .map(|(name, value)| (name, value.as_str()))
    }

    /// Parse a server response body.
    ///
    /// Accepts the named-field object or any flat map that carries all ten
    /// names with string or numeric values.
    pub fn parse(body: &[u8]) -> Option<Self> {
        if let Ok(headers) = serde_json::from_slice::<Self>(body) {
            return Some(headers);
        }

        let map: HashMap<String, serde_json::Value> = serde_json::from_slice(body).ok()?;
        let field = |name: &str| match map.get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        Some(Self {
            machine_id: field("X-Apple-I-MD-M")?,
            one_time_password: field("X-Apple-I-MD")?,
            local_user_id: field("X-Apple-I-MD-LU")?,
            routing_info: field("X-Apple-I-MD-RINFO")?,
            device_id: field("X-Mme-Device-Id")?,
            serial_number: field("X-Apple-I-SRL-NO")?,
            client_info: field("X-MMe-Client-Info")?,
            client_time: field("X-Apple-I-Client-Time")?,
            locale: field("X-Apple-Locale")?,
            timezone: field("X-Apple-I-TimeZone")?,
        })
    }
}

struct CacheEntry {
    headers: AnisetteHeaders,
    fetched_at: Instant,
}

/// Per-server slot; its async lock is held for the duration of a fetch.
type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Fetches and caches Anisette headers.
pub struct AnisetteProvider {
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl AnisetteProvider {
    pub fn new(transport: Arc<dyn HttpTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Headers for `server`, from cache when fetched less than
    /// [`CACHE_TTL`] ago.
    ///
    /// Concurrent callers for one server wait for the fetch in flight and
    /// share its result.
    pub async fn fetch(&self, server: &str) -> Result<AnisetteHeaders> {
        let base = normalize(server);
        let slot = self.slots.lock().entry(base.clone()).or_default().clone();

        let mut entry = slot.lock().await;
        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                debug!(server = %base, "anisette cache hit");
                return Ok(cached.headers.clone());
            }
        }

        let headers = self.fetch_uncached(&base).await?;
        *entry = Some(CacheEntry {
            headers: headers.clone(),
            fetched_at: Instant::now(),
        });
        Ok(headers)
    }

    /// Drop every cached entry.
    pub fn invalidate(&self) {
        self.slots.lock().clear();
    }

    /// Drop the cached entry for one server.
    pub fn invalidate_server(&self, server: &str) {
        self.slots.lock().remove(&normalize(server));
    }

    async fn fetch_uncached(&self, base: &str) -> Result<AnisetteHeaders> {
        let mut saw_ok = false;
        let mut all_timed_out = true;
        let mut last_failure = String::from("no response");

        for endpoint in ENDPOINTS {
            let url = format!("{base}{endpoint}");
            let request = HttpRequest::get(&url, self.timeout)
                .header("Accept", "application/json")
                .header("User-Agent", USER_AGENT);

            match self.transport.send(request).await {
                Ok(response) if response.is_success() => {
                    all_timed_out = false;
                    saw_ok = true;
                    if let Some(headers) = AnisetteHeaders::parse(&response.body) {
                        info!(url = %url, "fetched anisette headers");
                        return Ok(headers);
                    }
                    debug!(url = %url, "anisette body did not parse");
                }
                Ok(response) => {
                    all_timed_out = false;
                    last_failure = format!("HTTP {}", response.status);
                    debug!(url = %url, status = response.status, "anisette endpoint rejected");
                }
                Err(TransportError::Timeout) => {
                    last_failure = "timed out".into();
                    debug!(url = %url, "anisette endpoint timed out");
                }
                Err(TransportError::Network(message)) => {
                    all_timed_out = false;
                    debug!(url = %url, error = %message, "anisette endpoint unreachable");
                    last_failure = message;
                }
            }
        }

        warn!(server = %base, "no anisette endpoint produced headers");
        if saw_ok {
            Err(Error::AnisetteMalformed)
        } else if all_timed_out {
            Err(Error::Timeout {
                stage: Stage::Anisette,
            })
        } else {
            Err(Error::AnisetteUnreachable(last_failure))
        }
    }
}

fn normalize(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("http") {
        server.to_string()
    } else {
        format!("https://{server}")
    }
}
