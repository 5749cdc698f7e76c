//! Apple ID sign-in.
//!
//! [`SrpAuthenticator`] runs the Grand Slam Authentication handshake:
//!
//! | Step | Request | Outcome |
//! |------|---------|---------|
//! | init | `A2k`, `cpd`, `ps`, `u` | challenge, token or second factor |
//! | complete | `M1`, `c`, `cpd`, `u` | token or second factor |
//! | two-factor | `security_code`, `cpd` | token |
//!
//! A login that needs a second factor is parked under a [`SessionHandle`]
//! until [`SrpAuthenticator::complete_second_factor`] or
//! [`SrpAuthenticator::cancel`]. Only one login per identifier may be in
//! progress at a time.

pub mod gsa;
pub mod srp;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use parking_lot::Mutex;
use plist::{Dictionary, Value};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::anisette::{AnisetteHeaders, AnisetteProvider};
use crate::http::{HttpRequest, HttpTransport};
use crate::{Error, Result, Stage};

use gsa::Reply;
use srp::{derive_password_key, SrpClient};

/// Opaque Apple session token.
///
/// Sent to developer services as `myacinfo`. The bytes are wiped on drop
/// and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionToken(Vec<u8>);

impl SessionToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Text form used on the wire; base64 when the token is not UTF-8.
    pub fn to_myacinfo(&self) -> String {
        match std::str::from_utf8(&self.0) {
            Ok(text) => text.to_string(),
            Err(_) => base64::engine::general_purpose::STANDARD.encode(&self.0),
        }
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

/// Names a login parked until a second factor arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of a finished handshake.
pub struct AuthenticatedSession {
    pub identifier: String,
    pub token: SessionToken,
    pub password: SecretString,
}

impl fmt::Debug for AuthenticatedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedSession")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

/// What [`SrpAuthenticator::begin`] ended with.
#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated(AuthenticatedSession),
    SecondFactorRequired(SessionHandle),
}

/// State kept between `begin` and the second factor.
struct PendingSession {
    identifier: String,
    password: SecretString,
    anisette_server: String,
    session_key: Option<Zeroizing<Vec<u8>>>,
}

/// Runs GSA sign-ins.
pub struct SrpAuthenticator {
    transport: Arc<dyn HttpTransport>,
    anisette: Arc<AnisetteProvider>,
    gsa_url: String,
    timeout: Duration,
    in_flight: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<SessionHandle, PendingSession>>,
}

/// Holds an identifier in `in_flight` until dropped.
struct Reservation<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
    keep: bool,
}

impl Reservation<'_> {
    /// Leave the identifier reserved for a parked session.
    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.keep {
            self.set.lock().remove(&self.key);
        }
    }
}

fn reservation_key(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

impl SrpAuthenticator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        anisette: Arc<AnisetteProvider>,
        gsa_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            anisette,
            gsa_url: gsa_url.into(),
            timeout,
            in_flight: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn reserve(&self, identifier: &str) -> Result<Reservation<'_>> {
        let key = reservation_key(identifier);
        if !self.in_flight.lock().insert(key.clone()) {
            warn!(identifier, "login already in progress");
            return Err(Error::SessionInProgress);
        }
        Ok(Reservation {
            set: &self.in_flight,
            key,
            keep: false,
        })
    }

    /// Start signing in `identifier`.
    ///
    /// Fails with [`Error::SessionInProgress`] while another login for the
    /// same identifier is running or waiting for its second factor.
    pub async fn begin(
        &self,
        identifier: &str,
        password: SecretString,
        anisette_server: &str,
    ) -> Result<LoginOutcome> {
        let reservation = self.reserve(identifier)?;
        info!(identifier, "starting sign-in");

        let anisette = self.anisette.fetch(anisette_server).await?;
        let client = SrpClient::new();

        let mut init = Dictionary::new();
        init.insert("A2k".into(), Value::Data(client.public_key().to_vec()));
        init.insert("cpd".into(), Value::Dictionary(gsa::client_data(&anisette)));
        init.insert("o".into(), Value::String("init".into()));
        init.insert(
            "ps".into(),
            Value::Array(vec![
                Value::String("s2k".into()),
                Value::String("s2k_fo".into()),
            ]),
        );
        init.insert("u".into(), Value::String(identifier.into()));

        let (status, reply) = self.exchange(&anisette, init, Stage::Authentication).await?;
        let mut session_key = None;
        let outcome = match gsa::classify(&reply, status, None)? {
            Reply::Challenge(challenge) => {
                debug!(iterations = challenge.iterations, "received SRP challenge");
                let password_key = derive_password_key(
                    password.expose_secret(),
                    &challenge.salt,
                    challenge.iterations,
                    challenge.protocol,
                );
                let verifier = client.process_challenge(
                    identifier,
                    &password_key,
                    &challenge.salt,
                    &challenge.server_public,
                )?;

                let mut complete = Dictionary::new();
                complete.insert("M1".into(), Value::Data(verifier.proof().to_vec()));
                complete.insert("c".into(), Value::String(challenge.cookie));
                complete.insert("cpd".into(), Value::Dictionary(gsa::client_data(&anisette)));
                complete.insert("o".into(), Value::String("complete".into()));
                complete.insert("u".into(), Value::String(identifier.into()));

                let (status, reply) =
                    self.exchange(&anisette, complete, Stage::Authentication).await?;
                let outcome = gsa::classify(&reply, status, Some(verifier.session_key()))?;
                if let Some(m2) = gsa::server_proof(&reply) {
                    verifier.verify_server(m2)?;
                }
                session_key = Some(verifier.into_session_key());
                outcome
            }
            other => other,
        };

        match outcome {
            Reply::Token(token) => {
                info!(identifier, "signed in");
                Ok(LoginOutcome::Authenticated(AuthenticatedSession {
                    identifier: identifier.to_string(),
                    token,
                    password,
                }))
            }
            Reply::SecondFactor => {
                let handle = SessionHandle::new();
                self.pending.lock().insert(
                    handle,
                    PendingSession {
                        identifier: identifier.to_string(),
                        password,
                        anisette_server: anisette_server.to_string(),
                        session_key,
                    },
                );
                reservation.keep();
                info!(identifier, %handle, "second factor required");
                Ok(LoginOutcome::SecondFactorRequired(handle))
            }
            Reply::Challenge(_) => Err(Error::Server {
                code: 0,
                message: "repeated SRP challenge".into(),
            }),
        }
    }

    /// Finish a parked login with the code the user received.
    ///
    /// The parked session is consumed whatever the result; a rejected code
    /// means starting over with [`SrpAuthenticator::begin`].
    pub async fn complete_second_factor(
        &self,
        handle: SessionHandle,
        code: &str,
    ) -> Result<AuthenticatedSession> {
        let pending = self
            .pending
            .lock()
            .remove(&handle)
            .ok_or(Error::UnknownSession)?;
        let _reservation = Reservation {
            set: &self.in_flight,
            key: reservation_key(&pending.identifier),
            keep: false,
        };
        debug!(identifier = %pending.identifier, %handle, "submitting second factor");

        let anisette = self.anisette.fetch(&pending.anisette_server).await?;
        let mut request = Dictionary::new();
        request.insert("o".into(), Value::String("complete".into()));
        request.insert("cpd".into(), Value::Dictionary(gsa::client_data(&anisette)));
        request.insert("security_code".into(), Value::String(code.trim().into()));

        let (status, reply) = self.exchange(&anisette, request, Stage::SecondFactor).await?;
        let session_key = pending.session_key.as_deref().map(Vec::as_slice);
        match gsa::classify(&reply, status, session_key)? {
            Reply::Token(token) => {
                info!(identifier = %pending.identifier, "signed in after second factor");
                Ok(AuthenticatedSession {
                    identifier: pending.identifier.clone(),
                    token,
                    password: pending.password,
                })
            }
            Reply::SecondFactor => Err(Error::Server {
                code: 0,
                message: "second factor was not accepted".into(),
            }),
            Reply::Challenge(_) => Err(Error::Server {
                code: 0,
                message: "unexpected SRP challenge".into(),
            }),
        }
    }

    /// Drop a parked login. Returns whether one existed.
    pub fn cancel(&self, handle: SessionHandle) -> bool {
        let Some(pending) = self.pending.lock().remove(&handle) else {
            return false;
        };
        self.in_flight
            .lock()
            .remove(&reservation_key(&pending.identifier));
        debug!(identifier = %pending.identifier, %handle, "cancelled sign-in");
        true
    }

    /// Whether `handle` names a parked login.
    pub fn is_pending(&self, handle: SessionHandle) -> bool {
        self.pending.lock().contains_key(&handle)
    }

    async fn exchange(
        &self,
        anisette: &AnisetteHeaders,
        request: Dictionary,
        stage: Stage,
    ) -> Result<(u16, Dictionary)> {
        let body = gsa::encode_request(request)?;
        let request = HttpRequest::post(&self.gsa_url, body, self.timeout)
            .headers(anisette.iter())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("User-Agent", "Xcode")
            .header("Accept-Language", "en_US");
        debug!(url = %self.gsa_url, "GSA request");

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| e.at(stage))?;
        let dict = gsa::decode_response(&response)?;
        Ok((response.status, dict))
    }
}
