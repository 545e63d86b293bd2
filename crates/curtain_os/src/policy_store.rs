#![forbid(unsafe_code)]

use std::env;
use std::time::Duration;

use curtain_kernel_contracts::ph1vis::{OwnerRef, VisibilityPolicy};
use curtain_kernel_contracts::MonotonicTimeNs;
use curtain_storage::ph1vis::{OwnerRecord, PolicyWriteTicket};
use curtain_storage::repo::Ph1VisOwnerRepo;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Key under which the policy lives inside the host's owner document.
pub const POLICY_DOCUMENT_KEY: &str = "hideHelperSettings";

const CHARACTER_MERGE_PATH: &str = "api/characters/merge-attributes";
const GROUP_EDIT_PATH: &str = "api/groups/edit";
const PERSIST_MESSAGE_MAX_CHARS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PolicyPersistError {
    pub message: String,
    pub status: Option<u16>,
}

impl PolicyPersistError {
    pub fn new(message: impl Into<String>, status: Option<u16>) -> Self {
        let msg = message.into();
        let bounded_msg = if msg.chars().count() > PERSIST_MESSAGE_MAX_CHARS {
            msg.chars().take(PERSIST_MESSAGE_MAX_CHARS).collect::<String>()
        } else {
            msg
        };
        Self {
            message: bounded_msg,
            status,
        }
    }
}

/// What the host store gets asked to do for one policy write.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyPersistRequest {
    pub owner: OwnerRef,
    pub path: &'static str,
    pub body: Value,
    pub idempotency_key: String,
}

impl PolicyPersistRequest {
    /// Characters get a partial merge. Groups have no merge endpoint, so the
    /// whole group record goes back with the policy spliced into `data`.
    pub fn build(
        record: &OwnerRecord,
        policy: &VisibilityPolicy,
        write_seq: u64,
    ) -> Result<Self, PolicyPersistError> {
        let policy_value = serde_json::to_value(policy).map_err(|err| {
            PolicyPersistError::new(format!("policy encode failed: {err}"), None)
        })?;
        let (path, body) = match &record.owner {
            OwnerRef::Character(avatar) => (
                CHARACTER_MERGE_PATH,
                json!({
                    "avatar": avatar.as_str(),
                    "data": { "extensions": { POLICY_DOCUMENT_KEY: policy_value } },
                }),
            ),
            OwnerRef::Group(id) => {
                let mut group = record.host_fields.clone();
                group.insert("id".to_string(), Value::String(id.as_str().to_string()));
                group
                    .entry("name".to_string())
                    .or_insert_with(|| Value::String(record.display_name.clone()));
                let mut data = match group.remove("data") {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                data.insert(POLICY_DOCUMENT_KEY.to_string(), policy_value);
                group.insert("data".to_string(), Value::Object(data));
                (GROUP_EDIT_PATH, Value::Object(group))
            }
        };
        Ok(Self {
            owner: record.owner.clone(),
            path,
            idempotency_key: idempotency_key(&record.owner, policy, write_seq),
            body,
        })
    }
}

fn idempotency_key(owner: &OwnerRef, policy: &VisibilityPolicy, write_seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(policy.hide_last_n.to_be_bytes());
    hasher.update(policy.last_processed_length.to_be_bytes());
    hasher.update([u8::from(policy.user_configured)]);
    hasher.update(write_seq.to_be_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("vis_policy_{}", &hex[..32])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyHttpSenderConfig {
    pub endpoint_base: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl PolicyHttpSenderConfig {
    pub fn from_env() -> Option<Self> {
        let endpoint_base = env::var("CURTAIN_POLICY_ENDPOINT_BASE").ok()?;
        let endpoint_base = endpoint_base.trim().to_string();
        if endpoint_base.is_empty() {
            return None;
        }
        let connect_timeout_ms = env::var("CURTAIN_POLICY_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=60_000).contains(v))
            .unwrap_or(3_000);
        let request_timeout_ms = env::var("CURTAIN_POLICY_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(10_000);

        Some(Self {
            endpoint_base,
            connect_timeout_ms,
            request_timeout_ms,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySenderRuntime {
    LoopbackAck,
    Http(PolicyHttpSenderConfig),
    AlwaysFail { message: String },
}

impl Default for PolicySenderRuntime {
    fn default() -> Self {
        Self::from_env_or_loopback()
    }
}

impl PolicySenderRuntime {
    pub fn from_env_or_loopback() -> Self {
        if let Some(config) = PolicyHttpSenderConfig::from_env() {
            return Self::Http(config);
        }
        Self::LoopbackAck
    }

    pub fn always_fail_for_tests(message: &str) -> Self {
        Self::AlwaysFail {
            message: message.to_string(),
        }
    }

    pub fn send(&self, request: &PolicyPersistRequest) -> Result<(), PolicyPersistError> {
        match self {
            Self::LoopbackAck => {
                debug!(owner = %request.owner, path = request.path, "policy write acked by loopback");
                Ok(())
            }
            Self::AlwaysFail { message } => Err(PolicyPersistError::new(message.clone(), None)),
            Self::Http(config) => send_http_policy(config, request),
        }
    }
}

fn send_http_policy(
    config: &PolicyHttpSenderConfig,
    request: &PolicyPersistRequest,
) -> Result<(), PolicyPersistError> {
    let base = if config.endpoint_base.ends_with('/') {
        config.endpoint_base.clone()
    } else {
        format!("{}/", config.endpoint_base)
    };
    let url = url::Url::parse(&base)
        .and_then(|base| base.join(request.path))
        .map_err(|err| PolicyPersistError::new(format!("bad policy endpoint: {err}"), None))?;
    let payload = serde_json::to_string(&request.body).map_err(|err| {
        PolicyPersistError::new(format!("policy payload encode failed: {err}"), None)
    })?;
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
        .timeout_read(Duration::from_millis(config.request_timeout_ms))
        .timeout_write(Duration::from_millis(config.request_timeout_ms))
        .build();
    let req = agent
        .post(url.as_str())
        .set("content-type", "application/json")
        .set("idempotency-key", &request.idempotency_key);
    match req.send_string(&payload) {
        Ok(resp) if (200..=299).contains(&resp.status()) => Ok(()),
        Ok(resp) => {
            let status = resp.status();
            let body = resp.into_string().unwrap_or_default();
            Err(PolicyPersistError::new(format!("{status} {body}"), Some(status)))
        }
        Err(ureq::Error::Status(code, resp)) => {
            let body = resp.into_string().unwrap_or_default();
            Err(PolicyPersistError::new(format!("{code} {body}"), Some(code)))
        }
        Err(ureq::Error::Transport(err)) => Err(PolicyPersistError::new(
            format!("policy transport error: {err}"),
            None,
        )),
    }
}

/// Result of one policy save as the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySaveOutcome {
    pub success: bool,
    pub rolled_back: bool,
    pub message: Option<String>,
}

impl PolicySaveOutcome {
    fn saved() -> Self {
        Self {
            success: true,
            rolled_back: false,
            message: None,
        }
    }

    fn failed(message: impl Into<String>, rolled_back: bool) -> Self {
        Self {
            success: false,
            rolled_back,
            message: Some(message.into()),
        }
    }
}

/// A policy already applied to the mirror and waiting on the host store.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPolicyWrite {
    pub ticket: PolicyWriteTicket,
    pub request: PolicyPersistRequest,
}

/// Reads policies from the in-process owner mirror and writes them back
/// optimistically: mirror first, then the host store, rolled back on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStoreAdapter {
    sender: PolicySenderRuntime,
}

impl Default for PolicyStoreAdapter {
    fn default() -> Self {
        Self::new(PolicySenderRuntime::default())
    }
}

impl PolicyStoreAdapter {
    pub fn new(sender: PolicySenderRuntime) -> Self {
        Self { sender }
    }

    pub fn sender(&self) -> &PolicySenderRuntime {
        &self.sender
    }

    pub fn load<R>(&self, repo: &R, owner: &OwnerRef) -> Option<VisibilityPolicy>
    where
        R: Ph1VisOwnerRepo + ?Sized,
    {
        repo.policy_row(owner)
    }

    pub fn save<R>(
        &self,
        repo: &mut R,
        owner: &OwnerRef,
        policy: VisibilityPolicy,
        now: MonotonicTimeNs,
    ) -> PolicySaveOutcome
    where
        R: Ph1VisOwnerRepo + ?Sized,
    {
        let pending = match self.begin_save(repo, owner, policy, now) {
            Ok(pending) => pending,
            Err(outcome) => return outcome,
        };
        let sent = self.transmit(&pending);
        self.finish_save(repo, pending, sent, now)
    }

    /// Writes the mirror and builds the host request. Nothing is sent yet.
    pub fn begin_save<R>(
        &self,
        repo: &mut R,
        owner: &OwnerRef,
        policy: VisibilityPolicy,
        now: MonotonicTimeNs,
    ) -> Result<PendingPolicyWrite, PolicySaveOutcome>
    where
        R: Ph1VisOwnerRepo + ?Sized,
    {
        let ticket = repo.write_policy_row(owner, policy, now).map_err(|err| {
            warn!(owner = %owner, error = %err, "policy save refused by mirror");
            PolicySaveOutcome::failed(err.to_string(), false)
        })?;
        let built = match repo.owner_row(owner) {
            Some(record) => PolicyPersistRequest::build(record, &policy, ticket.seq),
            None => Err(PolicyPersistError::new("owner record missing", None)),
        };
        match built {
            Ok(request) => Ok(PendingPolicyWrite { ticket, request }),
            Err(err) => Err(self.finish_save_failed(repo, &ticket, err, now)),
        }
    }

    pub fn transmit(&self, pending: &PendingPolicyWrite) -> Result<(), PolicyPersistError> {
        self.sender.send(&pending.request)
    }

    pub fn finish_save<R>(
        &self,
        repo: &mut R,
        pending: PendingPolicyWrite,
        sent: Result<(), PolicyPersistError>,
        now: MonotonicTimeNs,
    ) -> PolicySaveOutcome
    where
        R: Ph1VisOwnerRepo + ?Sized,
    {
        match sent {
            Ok(()) => {
                info!(
                    owner = %pending.ticket.owner,
                    hide_last_n = pending.ticket.written.hide_last_n,
                    checkpoint = pending.ticket.written.last_processed_length,
                    "policy persisted"
                );
                PolicySaveOutcome::saved()
            }
            Err(err) => self.finish_save_failed(repo, &pending.ticket, err, now),
        }
    }

    fn finish_save_failed<R>(
        &self,
        repo: &mut R,
        ticket: &PolicyWriteTicket,
        err: PolicyPersistError,
        now: MonotonicTimeNs,
    ) -> PolicySaveOutcome
    where
        R: Ph1VisOwnerRepo + ?Sized,
    {
        let rolled_back = repo.rollback_policy_row(ticket, now).unwrap_or(false);
        warn!(
            owner = %ticket.owner,
            status = ?err.status,
            rolled_back,
            error = %err,
            "policy persist failed"
        );
        PolicySaveOutcome::failed(err.message, rolled_back)
    }
}
