//! Grand Slam Authentication wire format.
//!
//! Requests are XML plists of the form
//! `{Header: {Version: "1.0.1"}, Request: {...}}`. Replies come back wrapped
//! in `Response` or bare, and every reply is classified the same way by
//! [`classify`].

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use plist::{Dictionary, Value};
use sha2::Sha256;
use tracing::debug;

use super::srp::PasswordProtocol;
use super::SessionToken;
use crate::anisette::AnisetteHeaders;
use crate::http::HttpResponse;
use crate::{Error, Result};

const PROTOCOL_VERSION: &str = "1.0.1";

/// `ec` for a wrong account name or password.
const INVALID_CREDENTIALS: i64 = -20101;

/// `au` values that demand a second factor.
const SECOND_FACTOR_MARKERS: [&str; 2] = ["trustedDeviceSecondaryAuth", "secondaryAuth"];

/// Top-level keys that may carry a token in a bare 200 reply.
const TOKEN_KEYS: [&str; 3] = ["GsIdmsToken", "token", "t"];

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// SRP parameters sent by the server in reply to `init`.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub server_public: Vec<u8>,
    pub cookie: String,
    pub protocol: PasswordProtocol,
}

/// Meaning of one GSA reply.
#[derive(Debug)]
pub enum Reply {
    SecondFactor,
    Token(SessionToken),
    Challenge(Challenge),
}

/// Client data dictionary (`cpd`) with the Anisette fields folded in.
pub fn client_data(anisette: &AnisetteHeaders) -> Dictionary {
    let mut cpd = Dictionary::new();
    cpd.insert("bootstrap".into(), Value::Boolean(true));
    cpd.insert("icscrec".into(), Value::Boolean(true));
    cpd.insert("pbe".into(), Value::Boolean(false));
    cpd.insert("prkgen".into(), Value::Boolean(true));
    cpd.insert("svct".into(), Value::String("iCloud".into()));
    for (name, value) in anisette.iter() {
        cpd.insert(name.into(), Value::String(value.into()));
    }
    cpd
}

/// Wrap `request` in the GSA envelope and serialize it.
pub fn encode_request(request: Dictionary) -> Result<Vec<u8>> {
    let mut header = Dictionary::new();
    header.insert("Version".into(), Value::String(PROTOCOL_VERSION.into()));

    let mut envelope = Dictionary::new();
    envelope.insert("Header".into(), Value::Dictionary(header));
    envelope.insert("Request".into(), Value::Dictionary(request));

    let mut body = Vec::new();
    plist::to_writer_xml(&mut body, &Value::Dictionary(envelope))?;
    Ok(body)
}

/// Parse a reply body, unwrapping `Response` when present.
pub fn decode_response(response: &HttpResponse) -> Result<Dictionary> {
    let parsed = plist::from_bytes::<Value>(&response.body)
        .ok()
        .and_then(Value::into_dictionary);
    match parsed {
        Some(mut dict) => match dict.remove("Response") {
            Some(Value::Dictionary(inner)) => Ok(inner),
            Some(other) => {
                dict.insert("Response".into(), other);
                Ok(dict)
            }
            None => Ok(dict),
        },
        None if !response.is_success() => Err(Error::Server {
            code: i64::from(response.status),
            message: format!("HTTP {}", response.status),
        }),
        None => Err(Error::Server {
            code: 0,
            message: "unreadable response".into(),
        }),
    }
}

/// Classify a decoded reply.
///
/// `session_key` is the SRP key `K` when the handshake got that far; it is
/// used to decrypt `spd`.
pub fn classify(dict: &Dictionary, status: u16, session_key: Option<&[u8]>) -> Result<Reply> {
    let status_dict = dict.get("Status").and_then(Value::as_dictionary);

    if let Some(au) = status_dict.and_then(|s| s.get("au")).and_then(Value::as_string) {
        if SECOND_FACTOR_MARKERS.contains(&au) {
            return Ok(Reply::SecondFactor);
        }
    }

    let code = status_dict.and_then(|s| s.get("ec")).and_then(as_i64).unwrap_or(0);
    if code == INVALID_CREDENTIALS {
        return Err(Error::InvalidCredentials);
    }
    if code != 0 {
        let message = status_dict
            .and_then(|s| s.get("em"))
            .and_then(Value::as_string)
            .unwrap_or_default()
            .to_string();
        return Err(Error::Server { code, message });
    }

    if let Some(token) = dict.get("spd").and_then(|spd| decode_spd(spd, session_key)) {
        return Ok(Reply::Token(token));
    }

    if let Some(challenge) = parse_challenge(dict)? {
        return Ok(Reply::Challenge(challenge));
    }

    if status == 200 {
        let token = TOKEN_KEYS
            .iter()
            .find_map(|key| dict.get(*key).and_then(Value::as_string))
            .filter(|t| !t.is_empty());
        if let Some(token) = token {
            return Ok(Reply::Token(SessionToken::new(token.as_bytes())));
        }
    }

    Err(Error::Server {
        code: if status == 200 { 0 } else { i64::from(status) },
        message: "unexpected response".into(),
    })
}

/// Server proof `M2`, when the reply carries one.
pub fn server_proof(dict: &Dictionary) -> Option<&[u8]> {
    dict.get("M2").and_then(Value::as_data)
}

fn parse_challenge(dict: &Dictionary) -> Result<Option<Challenge>> {
    let (Some(salt), Some(iterations), Some(server_public), Some(cookie), Some(sp)) = (
        dict.get("s").and_then(Value::as_data),
        dict.get("i").and_then(as_i64),
        dict.get("B").and_then(Value::as_data),
        dict.get("c").and_then(Value::as_string),
        dict.get("sp").and_then(Value::as_string),
    ) else {
        return Ok(None);
    };

    let protocol = PasswordProtocol::from_name(sp).ok_or_else(|| Error::Server {
        code: 0,
        message: format!("unsupported password protocol {sp}"),
    })?;
    let iterations = u32::try_from(iterations)
        .ok()
        .filter(|i| *i > 0)
        .ok_or_else(|| Error::Server {
            code: 0,
            message: "invalid iteration count".into(),
        })?;

    Ok(Some(Challenge {
        salt: salt.to_vec(),
        iterations,
        server_public: server_public.to_vec(),
        cookie: cookie.to_string(),
        protocol,
    }))
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => i.as_signed(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn decode_spd(spd: &Value, session_key: Option<&[u8]>) -> Option<SessionToken> {
    let raw: &[u8] = match spd {
        Value::Data(data) => data,
        Value::String(s) => s.as_bytes(),
        _ => return None,
    };
    if raw.is_empty() {
        return None;
    }
    if let Some(token) = session_key.and_then(|key| decrypt_spd(key, raw)) {
        return Some(token);
    }
    debug!("using spd as an opaque token");
    Some(SessionToken::new(raw))
}

fn derive(key: &[u8], label: &[u8]) -> Option<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).ok()?;
    mac.update(label);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Decrypt `spd` with keys derived from `K` and pull out `GsIdmsToken`.
pub fn decrypt_spd(session_key: &[u8], spd: &[u8]) -> Option<SessionToken> {
    let key = zeroize::Zeroizing::new(derive(session_key, b"extra data key:")?);
    let iv = derive(session_key, b"extra data iv:")?;
    let plaintext = zeroize::Zeroizing::new(
        Aes256CbcDec::new_from_slices(&key, &iv[..16])
            .ok()?
            .decrypt_padded_vec_mut::<Pkcs7>(spd)
            .ok()?,
    );
    let dict = plist::from_bytes::<Value>(&plaintext).ok()?.into_dictionary()?;
    let token = dict.get("GsIdmsToken").and_then(Value::as_string)?;
    Some(SessionToken::new(token.as_bytes()))
}
