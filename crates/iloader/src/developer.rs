//! Apple developer services client.
//!
//! Every call is an XML plist POST to
//! `developerservices2.apple.com/services/v1/<action>` carrying the session
//! token as `myacinfo` plus fresh Anisette headers. Replies are plists whose
//! `resultCode` is absent or zero on success.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeZone, Utc};
use plist::{Dictionary, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anisette::AnisetteProvider;
use crate::auth::SessionToken;
use crate::crypto::ProvisioningProfile;
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::{Error, Result, Stage};

const CLIENT_ID: &str = "XABBG36SBA";
const PROTOCOL_VERSION: &str = "A1234";

/// Longest slice of a raw body quoted in an error.
const MAX_ERROR_BODY: usize = 200;

/// Who a call is made for.
#[derive(Debug, Clone)]
pub struct DeveloperContext {
    pub token: SessionToken,
    pub anisette_server: String,
    pub team_id: Option<String>,
}

impl DeveloperContext {
    pub fn new(token: SessionToken, anisette_server: impl Into<String>) -> Self {
        Self {
            token,
            anisette_server: anisette_server.into(),
            team_id: None,
        }
    }

    #[must_use]
    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }
}

/// A development signing certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct Certificate {
    pub id: String,
    pub name: String,
    pub serial_number: String,
    pub machine_name: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    /// DER certificate, when the listing included it
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppId {
    pub id: String,
    pub identifier: String,
    pub name: String,
    pub features: Dictionary,
    pub expiration: Option<DateTime<Utc>>,
}

/// App IDs with the account's quota.
#[derive(Debug, Clone, PartialEq)]
pub struct AppIdList {
    pub app_ids: Vec<AppId>,
    pub max_quantity: Option<u64>,
    pub available_quantity: Option<u64>,
}

/// Plist RPC client for developer services.
pub struct DeveloperServicesClient {
    transport: Arc<dyn HttpTransport>,
    anisette: Arc<AnisetteProvider>,
    base_url: String,
    timeout: Duration,
}

impl DeveloperServicesClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        anisette: Arc<AnisetteProvider>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            anisette,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub async fn list_teams(&self, ctx: &DeveloperContext) -> Result<Vec<Team>> {
        let reply = self.call(ctx, "listTeams", Dictionary::new()).await?;
        let teams = array(&reply, "teams")?
            .iter()
            .filter_map(Value::as_dictionary)
            .filter_map(|team| {
                Some(Team {
                    id: string(team, "teamId")?.to_string(),
                    name: string(team, "name").unwrap_or_default().to_string(),
                    kind: string(team, "type").unwrap_or_default().to_string(),
                })
            })
            .collect();
        Ok(teams)
    }

    pub async fn list_certificates(&self, ctx: &DeveloperContext) -> Result<Vec<Certificate>> {
        let reply = self
            .call(ctx, "ios/listAllDevelopmentCerts", Dictionary::new())
            .await?;
        let certificates: Vec<Certificate> = array(&reply, "developerCertificates")?
            .iter()
            .filter_map(Value::as_dictionary)
            .filter_map(parse_certificate)
            .collect();
        debug!(count = certificates.len(), "listed certificates");
        Ok(certificates)
    }

    pub async fn revoke_certificate(&self, ctx: &DeveloperContext, serial_number: &str) -> Result<()> {
        let mut params = Dictionary::new();
        params.insert("serialNumber".into(), Value::String(serial_number.into()));
        self.call(ctx, "ios/revokeDevelopmentCert", params).await?;
        info!(serial_number, "revoked certificate");
        Ok(())
    }

    pub async fn list_app_ids(&self, ctx: &DeveloperContext) -> Result<AppIdList> {
        let reply = self.call(ctx, "ios/listAppIds", Dictionary::new()).await?;
        let app_ids = array(&reply, "appIds")?
            .iter()
            .filter_map(Value::as_dictionary)
            .filter_map(parse_app_id)
            .collect();
        Ok(AppIdList {
            app_ids,
            max_quantity: reply.get("maxQuantity").and_then(Value::as_unsigned_integer),
            available_quantity: reply
                .get("availableQuantity")
                .and_then(Value::as_unsigned_integer),
        })
    }

    pub async fn create_app_id(
        &self,
        ctx: &DeveloperContext,
        identifier: &str,
        name: &str,
    ) -> Result<AppId> {
        let mut params = Dictionary::new();
        params.insert("identifier".into(), Value::String(identifier.into()));
        params.insert("name".into(), Value::String(name.into()));
        let reply = self.call(ctx, "ios/addAppId", params).await?;
        let app_id = reply
            .get("appId")
            .and_then(Value::as_dictionary)
            .and_then(parse_app_id)
            .ok_or_else(|| missing("appId"))?;
        info!(identifier, id = %app_id.id, "created app id");
        Ok(app_id)
    }

    /// Delete an App ID. Callers decide whether deletion is allowed.
    pub async fn delete_app_id(&self, ctx: &DeveloperContext, app_id_id: &str) -> Result<()> {
        let mut params = Dictionary::new();
        params.insert("appIdId".into(), Value::String(app_id_id.into()));
        self.call(ctx, "ios/deleteAppId", params).await?;
        info!(app_id_id, "deleted app id");
        Ok(())
    }

    /// DER bytes of the certificate with `serial_number`.
    pub async fn download_certificate(
        &self,
        ctx: &DeveloperContext,
        serial_number: &str,
    ) -> Result<Vec<u8>> {
        let mut params = Dictionary::new();
        params.insert("serialNumber".into(), Value::String(serial_number.into()));
        let reply = self.call(ctx, "ios/downloadDevelopmentCert", params).await?;
        reply
            .get("certificate")
            .and_then(Value::as_dictionary)
            .and_then(|cert| cert.get("certContent"))
            .and_then(Value::as_data)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| missing("certificate.certContent"))
    }

    pub async fn download_provisioning_profile(
        &self,
        ctx: &DeveloperContext,
        app_id_id: &str,
        certificate_id: Option<&str>,
    ) -> Result<ProvisioningProfile> {
        let mut params = Dictionary::new();
        params.insert("appIdId".into(), Value::String(app_id_id.into()));
        if let Some(certificate_id) = certificate_id {
            params.insert(
                "certificateIds".into(),
                Value::Array(vec![Value::String(certificate_id.into())]),
            );
        }
        let reply = self
            .call(ctx, "ios/downloadTeamProvisioningProfile", params)
            .await?;
        let data = reply
            .get("provisioningProfile")
            .and_then(Value::as_dictionary)
            .and_then(|p| p.get("encodedProfile"))
            .and_then(Value::as_data)
            .ok_or_else(|| Error::ProfileGenerationFailed("no profile in response".into()))?;
        ProvisioningProfile::parse(data.to_vec())
            .map_err(|e| Error::ProfileGenerationFailed(e.to_string()))
    }

    /// Ask for a new development certificate for `csr_pem`.
    pub async fn submit_csr(
        &self,
        ctx: &DeveloperContext,
        csr_pem: &str,
        machine_name: &str,
    ) -> Result<Certificate> {
        let mut params = Dictionary::new();
        params.insert("csrContent".into(), Value::String(csr_pem.into()));
        params.insert("machineId".into(), Value::String(Uuid::new_v4().to_string().to_uppercase()));
        params.insert("machineName".into(), Value::String(machine_name.into()));
        let reply = self.call(ctx, "ios/submitDevelopmentCSR", params).await?;
        reply
            .get("certRequest")
            .and_then(Value::as_dictionary)
            .and_then(parse_certificate)
            .ok_or_else(|| missing("certRequest"))
    }

    async fn call(
        &self,
        ctx: &DeveloperContext,
        action: &str,
        mut params: Dictionary,
    ) -> Result<Dictionary> {
        let anisette = self.anisette.fetch(&ctx.anisette_server).await?;

        params.insert("clientId".into(), Value::String(CLIENT_ID.into()));
        params.insert("myacinfo".into(), Value::String(ctx.token.to_myacinfo()));
        params.insert("protocolVersion".into(), Value::String(PROTOCOL_VERSION.into()));
        params.insert(
            "requestId".into(),
            Value::String(Uuid::new_v4().to_string().to_uppercase()),
        );
        if let Some(team_id) = &ctx.team_id {
            params.insert("teamId".into(), Value::String(team_id.clone()));
        }
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &Value::Dictionary(params))?;

        let url = format!("{}/{action}", self.base_url);
        debug!(url = %url, "developer services request");
        let request = HttpRequest::post(&url, body, self.timeout)
            .headers(anisette.iter())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("User-Agent", "Xcode")
            .header("Accept-Language", "en_US")
            .header("Accept", "text/x-xml-plist");
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| e.at(Stage::DeveloperServices))?;
        check_response(&response)
    }
}

/// Accept HTTP 200 with a plist whose `resultCode` is absent or zero.
fn check_response(response: &HttpResponse) -> Result<Dictionary> {
    let parsed = plist::from_bytes::<Value>(&response.body)
        .ok()
        .and_then(Value::into_dictionary);
    let Some(dict) = parsed else {
        warn!(status = response.status, "unreadable developer services reply");
        return Err(Error::Api {
            status: response.status,
            message: raw_excerpt(&response.body),
        });
    };

    let result_code = dict.get("resultCode").and_then(|v| match v {
        Value::Integer(i) => i.as_signed(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    if response.is_success() && result_code.unwrap_or(0) == 0 {
        return Ok(dict);
    }

    let message = string(&dict, "userString")
        .or_else(|| string(&dict, "resultString"))
        .map(str::to_string)
        .or_else(|| result_code.map(|code| format!("result code {code}")))
        .unwrap_or_else(|| raw_excerpt(&response.body));
    warn!(status = response.status, ?result_code, "developer services error");
    Err(Error::Api {
        status: response.status,
        message,
    })
}

fn raw_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn missing(key: &str) -> Error {
    Error::Api {
        status: 200,
        message: format!("response is missing {key}"),
    }
}

fn string<'a>(dict: &'a Dictionary, key: &str) -> Option<&'a str> {
    dict.get(key).and_then(Value::as_string)
}

fn array<'a>(dict: &'a Dictionary, key: &str) -> Result<&'a [Value]> {
    dict.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| missing(key))
}

/// Dates arrive as plist dates, epoch seconds or RFC 3339 strings.
fn date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Date(date) => Some(DateTime::<Utc>::from(SystemTime::from(*date))),
        Value::Integer(i) => Utc.timestamp_opt(i.as_signed()?, 0).single(),
        Value::Real(secs) => Utc.timestamp_opt(*secs as i64, 0).single(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

fn parse_certificate(dict: &Dictionary) -> Option<Certificate> {
    Some(Certificate {
        id: string(dict, "certificateId")?.to_string(),
        name: string(dict, "name").unwrap_or_default().to_string(),
        serial_number: string(dict, "serialNumber")?.to_string(),
        machine_name: string(dict, "machineName").map(str::to_string),
        expiration: dict.get("expirationDate").and_then(date),
        content: dict.get("certContent").and_then(Value::as_data).map(<[u8]>::to_vec),
    })
}

fn parse_app_id(dict: &Dictionary) -> Option<AppId> {
    Some(AppId {
        id: string(dict, "appIdId")?.to_string(),
        identifier: string(dict, "identifier")?.to_string(),
        name: string(dict, "name").unwrap_or_default().to_string(),
        features: dict
            .get("features")
            .and_then(Value::as_dictionary)
            .cloned()
            .unwrap_or_default(),
        expiration: dict.get("expirationDate").and_then(date),
    })
}
