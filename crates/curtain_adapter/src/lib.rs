#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

use curtain_engines::ph1vis::{Ph1VisConfig, Ph1VisRuntime};
use curtain_kernel_contracts::ph1vis::{
    OwnerRef, ReconcileMode, VisibilityPolicy, PH1VIS_CONTRACT_VERSION,
};
use curtain_kernel_contracts::MonotonicTimeNs;
use curtain_os::ph1vis::{
    CommandRefusal, NoticeLevel, PersistStatus, Ph1VisSynchronizer, Ph1VisWiringConfig,
    PresentationNotifier, RunModeHint, SavePolicyOutcome, SkipReason, SyncOutcome,
    UnavailableReason, UnhideAllOutcome, UnhideScope, UserNotice, VisGlobalSettings,
};
use curtain_os::policy_store::{PolicySenderRuntime, PolicyStoreAdapter};
use curtain_os::vis_events::{
    AppendSource, DebounceToken, FireDecision, HostSignal, IgnoreReason, ScheduleDecision,
    VisEventConfig, VisEventCoordinator,
};
use curtain_storage::ph1vis::{ChatId, OwnerRecord, Ph1VisStore, TranscriptEntry};
use curtain_storage::repo::{Ph1VisOwnerRepo, Ph1VisTranscriptRepo};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

pub mod debounce;

const PRESENTATION_BACKLOG_MAX: usize = 512;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OwnerRegisterRequest {
    pub owner_kind: String,
    pub owner_key: String,
    pub display_name: String,
    #[serde(default)]
    pub host_fields: Map<String, Value>,
    #[serde(default)]
    pub policy: Option<VisibilityPolicy>,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatOpenRequest {
    pub owner_kind: String,
    pub owner_key: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EntryInput {
    pub from_user: bool,
    pub text: String,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EntryRemoveRequest {
    pub index: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogReplaceRequest {
    pub entries: Vec<EntryInput>,
}

/// `value` is whatever the input box held: a number, a string, or nothing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SavePolicyRequest {
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct VisAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    #[serde(default)]
    pub hidden: Vec<u32>,
    #[serde(default)]
    pub shown: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl VisAdapterResponse {
    pub fn ok(outcome: &str) -> Self {
        Self {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            ..Self::default()
        }
    }

    pub fn error(outcome: &str, reason: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            outcome: outcome.to_string(),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntryView {
    pub index: u32,
    pub from_user: bool,
    pub text: String,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TranscriptViewResponse {
    pub status: String,
    pub enabled: bool,
    pub owner: Option<String>,
    pub chat_id: Option<String>,
    pub policy_label: String,
    pub policy_input: String,
    pub entries: Vec<EntryView>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FlagUpdateView {
    pub indices: Vec<u32>,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NoticeView {
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PresentationDrainResponse {
    pub status: String,
    pub flag_updates: Vec<FlagUpdateView>,
    pub notices: Vec<NoticeView>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct AdapterRunCounters {
    pub reconciled_total: u64,
    pub skipped_total: u64,
    pub unavailable_total: u64,
    pub superseded_firings_total: u64,
    pub stale_firings_total: u64,
    pub persist_failures_total: u64,
    pub last_run_at_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub contract_version: u32,
    pub enabled: bool,
    pub owner_count: usize,
    pub runs: AdapterRunCounters,
}

/// What happened to one host signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDispatch {
    /// Caller must arm a timer that fires `token` after `delay_ms`.
    Scheduled { token: DebounceToken, delay_ms: u64 },
    Ran(SyncOutcome),
    Ignored(IgnoreReason),
}

/// Presentation updates waiting for the UI to poll them.
#[derive(Debug, Default)]
struct PresentationJournal {
    flag_updates: VecDeque<FlagUpdateView>,
    notices: VecDeque<UserNotice>,
}

impl PresentationNotifier for PresentationJournal {
    fn flags_changed(&mut self, indices: &[u32], hidden: bool) {
        if self.flag_updates.len() == PRESENTATION_BACKLOG_MAX {
            self.flag_updates.pop_front();
        }
        self.flag_updates.push_back(FlagUpdateView {
            indices: indices.to_vec(),
            hidden,
        });
    }

    fn notice(&mut self, notice: UserNotice) {
        match notice.level {
            NoticeLevel::Error => error!(text = %notice.message, "user notice"),
            NoticeLevel::Warning => warn!(text = %notice.message, "user notice"),
            NoticeLevel::Success | NoticeLevel::Info => {
                info!(text = %notice.message, "user notice")
            }
        }
        if self.notices.len() == PRESENTATION_BACKLOG_MAX {
            self.notices.pop_front();
        }
        self.notices.push_back(notice);
    }
}

pub struct AdapterRuntime {
    store: Ph1VisStore,
    synchronizer: Ph1VisSynchronizer<Ph1VisRuntime>,
    coordinator: VisEventCoordinator,
    presentation: PresentationJournal,
    runs: AdapterRunCounters,
}

impl AdapterRuntime {
    pub fn new(
        store: Ph1VisStore,
        sender: PolicySenderRuntime,
        wiring: Ph1VisWiringConfig,
        events: VisEventConfig,
    ) -> Self {
        let settings = VisGlobalSettings::from_config(&wiring);
        Self {
            store,
            synchronizer: Ph1VisSynchronizer::new(
                wiring,
                Ph1VisRuntime::new(Ph1VisConfig::mvp_v1()),
                PolicyStoreAdapter::new(sender),
            ),
            coordinator: VisEventCoordinator::new(events, settings),
            presentation: PresentationJournal::default(),
            runs: AdapterRunCounters::default(),
        }
    }

    pub fn default_from_env() -> Self {
        let mut wiring = Ph1VisWiringConfig::mvp_v1(parse_enabled_from_env());
        wiring.unhide_scope = parse_unhide_scope_from_env();
        let sender = PolicySenderRuntime::from_env_or_loopback();
        match &sender {
            PolicySenderRuntime::Http(config) => {
                info!(endpoint = %config.endpoint_base, "policy writes go to host store")
            }
            _ => info!("policy writes acknowledged by loopback sender"),
        }
        Self::new(
            Ph1VisStore::new_in_memory(),
            sender,
            wiring,
            VisEventConfig::from_env(),
        )
    }

    pub fn event_config(&self) -> VisEventConfig {
        self.coordinator.config()
    }

    pub fn register_owner(&mut self, request: OwnerRegisterRequest) -> Result<(), String> {
        let owner = parse_owner(&request.owner_kind, &request.owner_key)?;
        let record = OwnerRecord::v1(
            owner,
            request.display_name,
            request.host_fields,
            request.policy,
            resolve_now(request.now_ns),
        )
        .map_err(|err| err.to_string())?;
        self.store
            .insert_owner_row(record)
            .map_err(|err| err.to_string())
    }

    pub fn open_chat(
        &mut self,
        request: ChatOpenRequest,
        now_ns: Option<u64>,
    ) -> Result<SignalDispatch, String> {
        let owner = parse_owner(&request.owner_kind, &request.owner_key)?;
        let chat_id = ChatId::new(request.chat_id).map_err(|err| err.to_string())?;
        self.store
            .open_chat_row(&owner, chat_id)
            .map_err(|err| err.to_string())?;
        Ok(self.dispatch_signal(HostSignal::OwnerSwitched, now_ns))
    }

    pub fn append_entry(
        &mut self,
        entry: EntryInput,
        now_ns: Option<u64>,
    ) -> Result<(u32, SignalDispatch), String> {
        let source = if entry.from_user {
            AppendSource::Sent
        } else {
            AppendSource::Received
        };
        let index = self
            .store
            .append_active_entry_row(entry_from_input(entry))
            .map_err(|err| err.to_string())?;
        Ok((
            index,
            self.dispatch_signal(HostSignal::EntryAppended(source), now_ns),
        ))
    }

    pub fn remove_entry(
        &mut self,
        request: EntryRemoveRequest,
        now_ns: Option<u64>,
    ) -> Result<SignalDispatch, String> {
        self.store
            .remove_active_entry_row(request.index)
            .map_err(|err| err.to_string())?;
        self.synchronizer.on_entry_removed(request.index);
        Ok(self.dispatch_signal(HostSignal::EntryRemoved, now_ns))
    }

    /// A wholesale replacement invalidates every index, so it is routed like
    /// an owner switch.
    pub fn replace_log(
        &mut self,
        request: LogReplaceRequest,
        now_ns: Option<u64>,
    ) -> Result<SignalDispatch, String> {
        let entries = request.entries.into_iter().map(entry_from_input).collect();
        self.store
            .replace_active_entry_rows(entries)
            .map_err(|err| err.to_string())?;
        Ok(self.dispatch_signal(HostSignal::OwnerSwitched, now_ns))
    }

    pub fn generation_ended(&mut self, now_ns: Option<u64>) -> SignalDispatch {
        self.dispatch_signal(HostSignal::GenerationEnded, now_ns)
    }

    pub fn host_ready(&mut self, now_ns: Option<u64>) -> SignalDispatch {
        self.dispatch_signal(HostSignal::HostReady, now_ns)
    }

    pub fn set_enabled(&mut self, enabled: bool, now_ns: Option<u64>) -> SignalDispatch {
        let dispatch = self.dispatch_signal(HostSignal::GlobalToggled(enabled), now_ns);
        let notice = if enabled {
            UserNotice::new(NoticeLevel::Success, "Hide helper enabled.")
        } else {
            UserNotice::new(NoticeLevel::Warning, "Hide helper disabled.")
        };
        self.presentation.notice(notice);
        dispatch
    }

    pub fn dispatch_signal(&mut self, signal: HostSignal, now_ns: Option<u64>) -> SignalDispatch {
        let now = resolve_now(now_ns);
        if signal == HostSignal::OwnerSwitched {
            self.synchronizer.on_owner_switched();
        }
        match self.coordinator.on_signal(signal, &self.store, now) {
            ScheduleDecision::Debounce { token, .. } => SignalDispatch::Scheduled {
                token,
                delay_ms: self.coordinator.config().debounce_ms,
            },
            ScheduleDecision::Immediate { hint } => SignalDispatch::Ran(self.run_sync(hint, now)),
            ScheduleDecision::Ignore(reason) => SignalDispatch::Ignored(reason),
        }
    }

    /// Timer callback. Returns `None` when the firing was superseded or stale.
    pub fn fire_debounced(
        &mut self,
        token: DebounceToken,
        now_ns: Option<u64>,
    ) -> Option<SyncOutcome> {
        match self.coordinator.fire(token, &self.store) {
            FireDecision::Run { hint, coalesced } => {
                debug!(token = token.0, coalesced, "debounced visibility run firing");
                Some(self.run_sync(hint, resolve_now(now_ns)))
            }
            FireDecision::Superseded => {
                self.runs.superseded_firings_total += 1;
                None
            }
            FireDecision::Stale => {
                self.runs.stale_firings_total += 1;
                self.synchronizer.on_owner_switched();
                None
            }
        }
    }

    pub fn save_policy(&mut self, request: SavePolicyRequest, now_ns: Option<u64>) -> SavePolicyOutcome {
        let raw = match &request.value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        };
        let outcome = self.synchronizer.save_policy(
            &mut self.store,
            &mut self.presentation,
            self.coordinator.settings(),
            &raw,
            resolve_now(now_ns),
        );
        if let SavePolicyOutcome::Saved { reconcile, .. } = &outcome {
            self.record_run(reconcile, now_ns);
        }
        if matches!(outcome, SavePolicyOutcome::PersistFailed { .. }) {
            self.runs.persist_failures_total += 1;
        }
        outcome
    }

    pub fn unhide_all(&mut self, now_ns: Option<u64>) -> UnhideAllOutcome {
        let outcome = self.synchronizer.unhide_all(
            &mut self.store,
            &mut self.presentation,
            self.coordinator.settings(),
            resolve_now(now_ns),
        );
        if let UnhideAllOutcome::Unhidden {
            persist: PersistStatus::Failed { .. },
            ..
        } = &outcome
        {
            self.runs.persist_failures_total += 1;
        }
        outcome
    }

    pub fn transcript_view(&self) -> TranscriptViewResponse {
        let display = self.synchronizer.policy_display(&self.store);
        let active = self.store.active_chat_row();
        let entries = self
            .store
            .active_entry_rows()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, e)| EntryView {
                index: u32::try_from(i).unwrap_or(u32::MAX),
                from_user: e.from_user,
                text: e.text.clone(),
                hidden: e.hidden,
            })
            .collect();
        TranscriptViewResponse {
            status: "ok".to_string(),
            enabled: self.coordinator.settings().enabled,
            owner: active.map(|a| a.owner.to_string()),
            chat_id: active.map(|a| a.chat_id.as_str().to_string()),
            policy_label: display.label,
            policy_input: display.input_prefill,
            entries,
        }
    }

    pub fn drain_presentation(&mut self) -> PresentationDrainResponse {
        PresentationDrainResponse {
            status: "ok".to_string(),
            flag_updates: self.presentation.flag_updates.drain(..).collect(),
            notices: self
                .presentation
                .notices
                .drain(..)
                .map(|n| NoticeView {
                    level: n.level.as_str().to_string(),
                    message: n.message,
                })
                .collect(),
        }
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            contract_version: PH1VIS_CONTRACT_VERSION.0,
            enabled: self.coordinator.settings().enabled,
            owner_count: self.store.owner_rows().len(),
            runs: self.runs.clone(),
        }
    }

    fn run_sync(&mut self, hint: RunModeHint, now: MonotonicTimeNs) -> SyncOutcome {
        let outcome = self.synchronizer.run(
            &mut self.store,
            &mut self.presentation,
            self.coordinator.settings(),
            hint,
            now,
        );
        self.record_run(&outcome, Some(now.0));
        outcome
    }

    fn record_run(&mut self, outcome: &SyncOutcome, now_ns: Option<u64>) {
        match outcome {
            SyncOutcome::Skipped(_) => self.runs.skipped_total += 1,
            SyncOutcome::Unavailable(_) => self.runs.unavailable_total += 1,
            SyncOutcome::Reconciled(report) => {
                self.runs.reconciled_total += 1;
                self.runs.last_run_at_ns = now_ns;
                if matches!(report.persist, PersistStatus::Failed { .. }) {
                    self.runs.persist_failures_total += 1;
                }
            }
        }
    }
}

impl From<&SyncOutcome> for VisAdapterResponse {
    fn from(outcome: &SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Skipped(SkipReason::Disabled) => Self::ok("SKIPPED_DISABLED"),
            SyncOutcome::Skipped(SkipReason::NoPolicy) => Self::ok("SKIPPED_NO_POLICY"),
            SyncOutcome::Skipped(SkipReason::NotUserConfigured) => {
                Self::ok("SKIPPED_NOT_CONFIGURED")
            }
            SyncOutcome::Unavailable(UnavailableReason::NoActiveLog) => {
                Self::ok("UNAVAILABLE_NO_LOG")
            }
            SyncOutcome::Unavailable(UnavailableReason::LogRefused) => {
                Self::ok("UNAVAILABLE_LOG_REFUSED")
            }
            SyncOutcome::Reconciled(report) => {
                let mut out = Self::ok(match report.mode {
                    ReconcileMode::Full => "RECONCILED_FULL",
                    ReconcileMode::Incremental => "RECONCILED_INCREMENTAL",
                });
                if let PersistStatus::Failed { message } = &report.persist {
                    out.reason = Some(message.clone());
                }
                out.hidden = report.applied.to_hide.clone();
                out.shown = report.applied.to_show.clone();
                out
            }
        }
    }
}

impl From<&SignalDispatch> for VisAdapterResponse {
    fn from(dispatch: &SignalDispatch) -> Self {
        match dispatch {
            SignalDispatch::Scheduled { .. } => Self::ok("SCHEDULED"),
            SignalDispatch::Ran(outcome) => Self::from(outcome),
            SignalDispatch::Ignored(IgnoreReason::Disabled) => Self::ok("IGNORED_DISABLED"),
            SignalDispatch::Ignored(IgnoreReason::ToggledOff) => Self::ok("TOGGLED_OFF"),
        }
    }
}

impl From<&SavePolicyOutcome> for VisAdapterResponse {
    fn from(outcome: &SavePolicyOutcome) -> Self {
        match outcome {
            SavePolicyOutcome::Refused(refusal) => refusal_response(*refusal),
            SavePolicyOutcome::Unchanged { .. } => Self::ok("UNCHANGED"),
            SavePolicyOutcome::PersistFailed { message } => {
                Self::error("PERSIST_FAILED", message.clone())
            }
            SavePolicyOutcome::Saved { reconcile, .. } => Self {
                outcome: "SAVED".to_string(),
                ..Self::from(reconcile)
            },
        }
    }
}

impl From<&UnhideAllOutcome> for VisAdapterResponse {
    fn from(outcome: &UnhideAllOutcome) -> Self {
        match outcome {
            UnhideAllOutcome::Refused(refusal) => refusal_response(*refusal),
            UnhideAllOutcome::Unhidden { shown, persist } => {
                let mut out = match persist {
                    PersistStatus::Failed { message } => {
                        Self::error("UNHIDDEN_PERSIST_FAILED", message.clone())
                    }
                    PersistStatus::Persisted | PersistStatus::NotNeeded => Self::ok("UNHIDDEN"),
                };
                out.shown = shown.clone();
                out
            }
        }
    }
}

fn refusal_response(refusal: CommandRefusal) -> VisAdapterResponse {
    match refusal {
        CommandRefusal::Disabled => VisAdapterResponse::error("REFUSED", "hide helper is disabled"),
        CommandRefusal::NoActiveLog => VisAdapterResponse::error("REFUSED", "no active chat"),
        CommandRefusal::LogRefused => {
            VisAdapterResponse::error("REFUSED", "active chat exceeds the reconcile limit")
        }
    }
}

fn parse_owner(kind: &str, key: &str) -> Result<OwnerRef, String> {
    let owner = match kind.trim().to_ascii_lowercase().as_str() {
        "character" => OwnerRef::character(key),
        "group" => OwnerRef::group(key),
        other => return Err(format!("unknown owner kind '{other}'")),
    };
    owner.map_err(|err| err.to_string())
}

fn entry_from_input(entry: EntryInput) -> TranscriptEntry {
    if entry.hidden {
        TranscriptEntry::hidden_v1(entry.from_user, entry.text)
    } else {
        TranscriptEntry::v1(entry.from_user, entry.text)
    }
}

fn parse_enabled_from_env() -> bool {
    match env::var("CURTAIN_ENABLED") {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        Err(_) => true,
    }
}

fn parse_unhide_scope_from_env() -> UnhideScope {
    match env::var("CURTAIN_UNHIDE_SCOPE") {
        Ok(v) if v.trim().eq_ignore_ascii_case("policy_owned") => UnhideScope::PolicyOwned,
        _ => UnhideScope::AllHidden,
    }
}

fn resolve_now(now_ns: Option<u64>) -> MonotonicTimeNs {
    MonotonicTimeNs(now_ns.unwrap_or_else(system_time_now_ns).max(1))
}

fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    u64::try_from(nanos).unwrap_or(u64::MAX)
}
