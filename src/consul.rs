use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::IngestError;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const HEARTBEAT_JOIN_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBehavior {
    Release,
    Delete,
}

impl SessionBehavior {
    fn as_str(&self) -> &'static str {
        match self {
            SessionBehavior::Release => "release",
            SessionBehavior::Delete => "delete",
        }
    }
}

pub trait Coordinator: Send + Sync {
    fn open_session(
        &self,
        behavior: SessionBehavior,
        ttl: Duration,
        lock_delay: Duration,
    ) -> Result<SessionId, IngestError>;
    fn renew(&self, session: &SessionId) -> Result<(), IngestError>;
    fn try_lock(&self, key: &str, session: &SessionId, payload: &str)
    -> Result<bool, IngestError>;
    fn release(&self, key: &str, session: &SessionId) -> Result<(), IngestError>;
    // Removes `key` only while `session` still holds it. Returns false if the
    // key is gone or held by another session.
    fn delete_held(&self, key: &str, session: &SessionId) -> Result<bool, IngestError>;
    fn put(&self, key: &str, value: &str) -> Result<(), IngestError>;
    fn get(&self, key: &str) -> Result<Option<String>, IngestError>;
    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, IngestError>;
    fn destroy(&self, session: &SessionId) -> Result<(), IngestError>;
}

#[derive(Clone)]
pub struct ConsulClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    behavior: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    lock_delay: String,
}

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    modify_index: u64,
}

impl ConsulClient {
    pub fn new(base_url: &str) -> Result<Self, IngestError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| IngestError::Coordination(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, IngestError> {
        request
            .send()
            .map_err(|err| IngestError::Coordination(err.to_string()))
    }

    fn expect_success(response: Response) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "coordination request failed".to_string());
        Err(IngestError::CoordinationStatus { status, message })
    }

    fn decode_value(entry: &KvEntry) -> Result<String, IngestError> {
        let Some(encoded) = entry.value.as_deref() else {
            return Ok(String::new());
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| IngestError::Coordination(format!("{}: {err}", entry.key)))?;
        String::from_utf8(bytes)
            .map_err(|err| IngestError::Coordination(format!("{}: {err}", entry.key)))
    }
}

impl Coordinator for ConsulClient {
    fn open_session(
        &self,
        behavior: SessionBehavior,
        ttl: Duration,
        lock_delay: Duration,
    ) -> Result<SessionId, IngestError> {
        let body = SessionRequest {
            name: "bam-ingest",
            behavior: behavior.as_str(),
            ttl: format!("{}s", ttl.as_secs()),
            lock_delay: format!("{}s", lock_delay.as_secs()),
        };
        let response = self.send(self.client.put(self.url("session/create")).json(&body))?;
        let session: SessionResponse = Self::expect_success(response)?
            .json()
            .map_err(|err| IngestError::Coordination(err.to_string()))?;
        debug!(session = %session.id, "opened coordination session");
        Ok(SessionId(session.id))
    }

    fn renew(&self, session: &SessionId) -> Result<(), IngestError> {
        let response = self.send(
            self.client
                .put(self.url(&format!("session/renew/{}", session.as_str()))),
        )?;
        if response.status().as_u16() == 404 {
            return Err(IngestError::SessionLost(session.to_string()));
        }
        Self::expect_success(response)?;
        Ok(())
    }

    fn try_lock(
        &self,
        key: &str,
        session: &SessionId,
        payload: &str,
    ) -> Result<bool, IngestError> {
        let response = self.send(
            self.client
                .put(self.url(&format!("kv/{key}")))
                .query(&[("acquire", session.as_str())])
                .body(payload.to_string()),
        )?;
        let text = Self::expect_success(response)?
            .text()
            .map_err(|err| IngestError::Coordination(err.to_string()))?;
        Ok(text.trim() == "true")
    }

    fn release(&self, key: &str, session: &SessionId) -> Result<(), IngestError> {
        let response = self.send(
            self.client
                .put(self.url(&format!("kv/{key}")))
                .query(&[("release", session.as_str())]),
        )?;
        Self::expect_success(response)?;
        Ok(())
    }

    fn delete_held(&self, key: &str, session: &SessionId) -> Result<bool, IngestError> {
        let response = self.send(self.client.get(self.url(&format!("kv/{key}"))))?;
        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        let entries: Vec<KvEntry> = Self::expect_success(response)?
            .json()
            .map_err(|err| IngestError::Coordination(err.to_string()))?;
        let Some(entry) = entries
            .into_iter()
            .find(|entry| entry.session.as_deref() == Some(session.as_str()))
        else {
            return Ok(false);
        };
        let response = self.send(
            self.client
                .delete(self.url(&format!("kv/{key}")))
                .query(&[("cas", entry.modify_index.to_string())]),
        )?;
        let text = Self::expect_success(response)?
            .text()
            .map_err(|err| IngestError::Coordination(err.to_string()))?;
        Ok(text.trim() == "true")
    }

    fn put(&self, key: &str, value: &str) -> Result<(), IngestError> {
        let response = self.send(
            self.client
                .put(self.url(&format!("kv/{key}")))
                .body(value.to_string()),
        )?;
        Self::expect_success(response)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, IngestError> {
        let response = self.send(self.client.get(self.url(&format!("kv/{key}"))))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let entries: Vec<KvEntry> = Self::expect_success(response)?
            .json()
            .map_err(|err| IngestError::Coordination(err.to_string()))?;
        entries.first().map(Self::decode_value).transpose()
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, IngestError> {
        let response = self.send(
            self.client
                .get(self.url(&format!("kv/{prefix}")))
                .query(&[("recurse", "true")]),
        )?;
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let entries: Vec<KvEntry> = Self::expect_success(response)?
            .json()
            .map_err(|err| IngestError::Coordination(err.to_string()))?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            let relative = entry.key.strip_prefix(prefix).unwrap_or(&entry.key);
            if relative.is_empty() || relative.ends_with('/') {
                continue;
            }
            out.push((relative.to_string(), Self::decode_value(entry)?));
        }
        Ok(out)
    }

    fn destroy(&self, session: &SessionId) -> Result<(), IngestError> {
        let response = self.send(
            self.client
                .put(self.url(&format!("session/destroy/{}", session.as_str()))),
        )?;
        Self::expect_success(response)?;
        Ok(())
    }
}

pub fn clear_lock<C>(coordinator: &C, key: &str, session: &SessionId)
where
    C: Coordinator + ?Sized,
{
    match coordinator.delete_held(key, session) {
        Ok(true) => debug!(key, %session, "lock key deleted"),
        Ok(false) => debug!(key, %session, "lock no longer held by session"),
        Err(err) => {
            warn!(key, error = %err, "failed to delete lock key, releasing it");
            if let Err(err) = coordinator.release(key, session) {
                warn!(key, error = %err, "failed to release lock");
            }
        }
    }
}

// A failed renewal stops the thread and makes `check` report
// `SessionLost`.
pub struct Heartbeat {
    session: SessionId,
    stop: Sender<()>,
    done: Receiver<()>,
    lost: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn spawn<C>(
        coordinator: Arc<C>,
        session: SessionId,
        interval: Duration,
    ) -> Result<Self, IngestError>
    where
        C: Coordinator + ?Sized + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let lost = Arc::new(AtomicBool::new(false));

        let thread_lost = lost.clone();
        let thread_session = session.clone();
        let handle = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if let Err(err) = coordinator.renew(&thread_session) {
                        warn!(session = %thread_session, error = %err, "session renewal failed");
                        thread_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    debug!(session = %thread_session, "session renewed");
                }
                let _ = done_tx.send(());
            })
            .map_err(|err| IngestError::Coordination(err.to_string()))?;

        Ok(Self {
            session,
            stop: stop_tx,
            done: done_rx,
            lost,
            handle: Some(handle),
        })
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), IngestError> {
        if self.is_lost() {
            return Err(IngestError::SessionLost(self.session.to_string()));
        }
        Ok(())
    }

    // Returns false if the thread did not exit before `deadline`; it is then
    // left detached.
    pub fn stop(mut self, deadline: Duration) -> bool {
        let _ = self.stop.try_send(());
        match self.done.recv_timeout(deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                info!(session = %self.session, "heartbeat stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    session = %self.session,
                    deadline_secs = deadline.as_secs(),
                    "heartbeat did not stop before deadline"
                );
                false
            }
        }
    }
}
