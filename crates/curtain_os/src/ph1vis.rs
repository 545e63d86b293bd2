#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use curtain_engines::ph1vis::{reason_codes as engine_codes, Ph1VisRuntime};
use curtain_kernel_contracts::ph1vis::{
    HideLastNInput, IncrementalDiff, IncrementalFallbackReason, LogFlagView, OwnerRef,
    ReconcileMode, VisibilityDiff, VisibilityPolicy,
};
use curtain_kernel_contracts::{ContractViolation, MonotonicTimeNs, ReasonCodeId};
use curtain_storage::ph1vis::Ph1VisStore;
use curtain_storage::repo::{Ph1VisOwnerRepo, Ph1VisTranscriptRepo};
use tracing::{debug, info, warn};

use crate::policy_store::PolicyStoreAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhideScope {
    /// Show every hidden entry, whoever hid it.
    #[default]
    AllHidden,
    /// Show only entries this synchronizer hid on the current log.
    PolicyOwned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ph1VisWiringConfig {
    pub enabled_by_default: bool,
    pub unhide_scope: UnhideScope,
}

impl Ph1VisWiringConfig {
    pub fn mvp_v1(enabled_by_default: bool) -> Self {
        Self {
            enabled_by_default,
            unhide_scope: UnhideScope::AllHidden,
        }
    }
}

/// Process-wide switch, owned by whoever routes host signals and handed to
/// every run explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisGlobalSettings {
    pub enabled: bool,
}

impl VisGlobalSettings {
    pub fn from_config(config: &Ph1VisWiringConfig) -> Self {
        Self {
            enabled: config.enabled_by_default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunModeHint {
    /// Incremental when the log strictly grew, full otherwise.
    Auto,
    Full,
}

impl RunModeHint {
    pub fn dominant(self, other: RunModeHint) -> RunModeHint {
        if self == RunModeHint::Full || other == RunModeHint::Full {
            RunModeHint::Full
        } else {
            RunModeHint::Auto
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

impl NoticeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeLevel::Success => "success",
            NoticeLevel::Info => "info",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotice {
    pub level: NoticeLevel,
    pub message: String,
}

impl UserNotice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Narrow view of the host transcript. The synchronizer is the only caller of
/// `set_entry_hidden`; everything else about an entry belongs to the host.
pub trait TranscriptAccessor: LogFlagView {
    fn active_owner(&self) -> Option<OwnerRef>;
    /// Returns whether the flag changed.
    fn set_entry_hidden(&mut self, index: u32, hidden: bool) -> bool;
}

pub trait PresentationNotifier {
    /// Re-render exactly these indices with the given flag.
    fn flags_changed(&mut self, indices: &[u32], hidden: bool);
    fn notice(&mut self, notice: UserNotice);
}

/// Host that owns both the transcript and the owner records.
pub trait VisHost: TranscriptAccessor + Ph1VisOwnerRepo {}

impl<T> VisHost for T where T: TranscriptAccessor + Ph1VisOwnerRepo {}

impl TranscriptAccessor for Ph1VisStore {
    fn active_owner(&self) -> Option<OwnerRef> {
        self.active_chat_row().map(|chat| chat.owner.clone())
    }

    fn set_entry_hidden(&mut self, index: u32, hidden: bool) -> bool {
        match self.set_active_entry_hidden_row(index, hidden) {
            Ok(changed) => changed,
            Err(err) => {
                debug!(index, hidden, error = %err, "entry flag not applied");
                false
            }
        }
    }
}

pub trait Ph1VisEngine {
    fn full_diff(
        &self,
        log: &dyn LogFlagView,
        hide_last_n: u32,
    ) -> Result<VisibilityDiff, ContractViolation>;

    fn incremental_diff(
        &self,
        log: &dyn LogFlagView,
        policy: &VisibilityPolicy,
    ) -> Result<IncrementalDiff, ContractViolation>;

    fn unhide_all_diff(
        &self,
        log: &dyn LogFlagView,
        owned: Option<&BTreeSet<u32>>,
    ) -> Result<VisibilityDiff, ContractViolation>;
}

impl Ph1VisEngine for Ph1VisRuntime {
    fn full_diff(
        &self,
        log: &dyn LogFlagView,
        hide_last_n: u32,
    ) -> Result<VisibilityDiff, ContractViolation> {
        Ph1VisRuntime::full_diff(self, log, hide_last_n)
    }

    fn incremental_diff(
        &self,
        log: &dyn LogFlagView,
        policy: &VisibilityPolicy,
    ) -> Result<IncrementalDiff, ContractViolation> {
        Ph1VisRuntime::incremental_diff(self, log, policy)
    }

    fn unhide_all_diff(
        &self,
        log: &dyn LogFlagView,
        owned: Option<&BTreeSet<u32>>,
    ) -> Result<VisibilityDiff, ContractViolation> {
        Ph1VisRuntime::unhide_all_diff(self, log, owned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoPolicy,
    NotUserConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    NoActiveLog,
    LogRefused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistStatus {
    NotNeeded,
    Persisted,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub owner: OwnerRef,
    pub mode: ReconcileMode,
    pub fallback: Option<IncrementalFallbackReason>,
    pub reason_code: ReasonCodeId,
    /// Flips actually applied to the host.
    pub applied: VisibilityDiff,
    pub log_len: u32,
    pub persist: PersistStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Unavailable(UnavailableReason),
    Reconciled(SyncReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRefusal {
    Disabled,
    NoActiveLog,
    LogRefused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavePolicyOutcome {
    Refused(CommandRefusal),
    Unchanged { hide_last_n: u32 },
    PersistFailed { message: String },
    Saved { hide_last_n: u32, reconcile: SyncOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnhideAllOutcome {
    Refused(CommandRefusal),
    Unhidden { shown: Vec<u32>, persist: PersistStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDisplay {
    pub current: Option<u32>,
    pub label: String,
    pub input_prefill: String,
}

/// Indices hidden by this synchronizer on one owner's log. Removals reported
/// through `on_entry_removed` shift it; a shrink it was not told about, or an
/// owner change, empties it.
#[derive(Debug, Clone, Default)]
struct PolicyHideLedger {
    owner: Option<OwnerRef>,
    indices: BTreeSet<u32>,
    seen_len: Option<u32>,
}

impl PolicyHideLedger {
    fn track(&mut self, owner: &OwnerRef, log_len: u32) {
        if self.owner.as_ref() != Some(owner) {
            self.owner = Some(owner.clone());
            self.indices.clear();
        } else if self.seen_len.is_some_and(|seen| log_len < seen) {
            self.indices.clear();
        }
        self.seen_len = Some(log_len);
    }

    fn note_removed(&mut self, index: u32) {
        self.indices = std::mem::take(&mut self.indices)
            .into_iter()
            .filter(|&i| i != index)
            .map(|i| if i > index { i - 1 } else { i })
            .collect();
        self.seen_len = self.seen_len.map(|n| n.saturating_sub(1));
    }

    fn reset(&mut self) {
        self.owner = None;
        self.indices.clear();
        self.seen_len = None;
    }
}

struct ReconcilePlan {
    mode: ReconcileMode,
    fallback: Option<IncrementalFallbackReason>,
    reason_code: ReasonCodeId,
    diff: VisibilityDiff,
}

#[derive(Debug, Clone)]
pub struct Ph1VisSynchronizer<E>
where
    E: Ph1VisEngine,
{
    config: Ph1VisWiringConfig,
    engine: E,
    policy_store: PolicyStoreAdapter,
    ledger: PolicyHideLedger,
}

impl<E> Ph1VisSynchronizer<E>
where
    E: Ph1VisEngine,
{
    pub fn new(config: Ph1VisWiringConfig, engine: E, policy_store: PolicyStoreAdapter) -> Self {
        Self {
            config,
            engine,
            policy_store,
            ledger: PolicyHideLedger::default(),
        }
    }

    pub fn config(&self) -> Ph1VisWiringConfig {
        self.config
    }

    pub fn policy_store(&self) -> &PolicyStoreAdapter {
        &self.policy_store
    }

    pub fn owned_hidden_indices(&self) -> &BTreeSet<u32> {
        &self.ledger.indices
    }

    pub fn on_owner_switched(&mut self) {
        self.ledger.reset();
    }

    /// The host removed the entry at `index`; later entries moved down by one.
    pub fn on_entry_removed(&mut self, index: u32) {
        self.ledger.note_removed(index);
    }

    /// One lifecycle-triggered pass: gate, pick a mode, apply flips, then
    /// advance the checkpoint if anything moved.
    pub fn run<H, P>(
        &mut self,
        host: &mut H,
        presenter: &mut P,
        settings: &VisGlobalSettings,
        hint: RunModeHint,
        now: MonotonicTimeNs,
    ) -> SyncOutcome
    where
        H: VisHost,
        P: PresentationNotifier,
    {
        if !settings.enabled {
            debug!("visibility run skipped: disabled");
            return SyncOutcome::Skipped(SkipReason::Disabled);
        }
        let Some(owner) = host.active_owner() else {
            warn!("visibility run skipped: no active log");
            return SyncOutcome::Unavailable(UnavailableReason::NoActiveLog);
        };
        let Some(policy) = self.policy_store.load(&*host, &owner) else {
            debug!(owner = %owner, "visibility run skipped: no policy");
            return SyncOutcome::Skipped(SkipReason::NoPolicy);
        };
        if !policy.user_configured {
            debug!(owner = %owner, "visibility run skipped: not user configured");
            return SyncOutcome::Skipped(SkipReason::NotUserConfigured);
        }
        self.reconcile(host, presenter, owner, policy, hint, now)
    }

    pub fn save_policy<H, P>(
        &mut self,
        host: &mut H,
        presenter: &mut P,
        settings: &VisGlobalSettings,
        raw_input: &str,
        now: MonotonicTimeNs,
    ) -> SavePolicyOutcome
    where
        H: VisHost,
        P: PresentationNotifier,
    {
        if !settings.enabled {
            presenter.notice(UserNotice::new(
                NoticeLevel::Warning,
                "Hide helper is disabled. Enable it before changing settings.",
            ));
            return SavePolicyOutcome::Refused(CommandRefusal::Disabled);
        }
        let hide_last_n = HideLastNInput::parse(raw_input).value();
        let Some(owner) = host.active_owner() else {
            warn!("save policy refused: no active log");
            presenter.notice(UserNotice::new(
                NoticeLevel::Error,
                "No active chat. Hide settings were not saved.",
            ));
            return SavePolicyOutcome::Refused(CommandRefusal::NoActiveLog);
        };
        let current = self
            .policy_store
            .load(&*host, &owner)
            .map_or(0, |p| p.hide_last_n);
        if current == hide_last_n {
            presenter.notice(UserNotice::new(
                NoticeLevel::Info,
                "Hide settings unchanged.",
            ));
            return SavePolicyOutcome::Unchanged { hide_last_n };
        }

        let policy = VisibilityPolicy::user_saved(hide_last_n, host.entry_count());
        let saved = self.policy_store.save(host, &owner, policy, now);
        if !saved.success {
            let message = saved
                .message
                .unwrap_or_else(|| "policy save failed".to_string());
            presenter.notice(UserNotice::new(
                NoticeLevel::Error,
                format!("Could not save hide settings: {message}"),
            ));
            return SavePolicyOutcome::PersistFailed { message };
        }
        info!(owner = %owner, hide_last_n, "hide policy saved");

        let reconcile = self.reconcile(host, presenter, owner, policy, RunModeHint::Full, now);
        let message = if hide_last_n == 0 {
            "Hide settings saved. Nothing is hidden.".to_string()
        } else {
            format!("Hide settings saved. Keeping the last {hide_last_n} entries visible.")
        };
        presenter.notice(UserNotice::new(NoticeLevel::Success, message));
        SavePolicyOutcome::Saved {
            hide_last_n,
            reconcile,
        }
    }

    pub fn unhide_all<H, P>(
        &mut self,
        host: &mut H,
        presenter: &mut P,
        settings: &VisGlobalSettings,
        now: MonotonicTimeNs,
    ) -> UnhideAllOutcome
    where
        H: VisHost,
        P: PresentationNotifier,
    {
        if !settings.enabled {
            presenter.notice(UserNotice::new(
                NoticeLevel::Warning,
                "Hide helper is disabled. Enable it before unhiding.",
            ));
            return UnhideAllOutcome::Refused(CommandRefusal::Disabled);
        }
        let Some(owner) = host.active_owner() else {
            warn!("unhide all refused: no active log");
            presenter.notice(UserNotice::new(
                NoticeLevel::Error,
                "No active chat. Nothing was unhidden.",
            ));
            return UnhideAllOutcome::Refused(CommandRefusal::NoActiveLog);
        };
        self.ledger.track(&owner, host.entry_count());

        let owned = match self.config.unhide_scope {
            UnhideScope::AllHidden => None,
            UnhideScope::PolicyOwned => Some(&self.ledger.indices),
        };
        let diff = match self.engine.unhide_all_diff(&*host, owned) {
            Ok(diff) => diff,
            Err(err) => {
                warn!(owner = %owner, error = %err, "unhide all refused");
                return UnhideAllOutcome::Refused(CommandRefusal::LogRefused);
            }
        };
        let applied = self.apply(host, presenter, &diff);
        self.ledger.indices.clear();

        let len = host.entry_count();
        let persist = self.persist(
            host,
            presenter,
            &owner,
            VisibilityPolicy::reset_for_unhide(len),
            "Could not reset hide settings",
            now,
        );
        if persist == PersistStatus::Persisted {
            presenter.notice(UserNotice::new(
                NoticeLevel::Success,
                format!("Unhid {} entries.", applied.to_show.len()),
            ));
        }
        info!(
            owner = %owner,
            shown = applied.to_show.len(),
            reason_code = engine_codes::PH1_VIS_OK_UNHIDE_ALL.0,
            "unhide all applied"
        );
        UnhideAllOutcome::Unhidden {
            shown: applied.to_show,
            persist,
        }
    }

    pub fn policy_display<H>(&self, host: &H) -> PolicyDisplay
    where
        H: VisHost,
    {
        let current = host
            .active_owner()
            .and_then(|owner| self.policy_store.load(host, &owner))
            .and_then(|policy| policy.display_value());
        PolicyDisplay {
            current,
            label: current.map_or_else(|| "none".to_string(), |n| n.to_string()),
            input_prefill: current.map(|n| n.to_string()).unwrap_or_default(),
        }
    }

    fn reconcile<H, P>(
        &mut self,
        host: &mut H,
        presenter: &mut P,
        owner: OwnerRef,
        policy: VisibilityPolicy,
        hint: RunModeHint,
        now: MonotonicTimeNs,
    ) -> SyncOutcome
    where
        H: VisHost,
        P: PresentationNotifier,
    {
        let log_len = host.entry_count();
        self.ledger.track(&owner, log_len);

        let plan = match self.plan(&*host, &policy, hint) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(
                    owner = %owner,
                    log_len,
                    reason_code = engine_codes::PH1_VIS_LOG_TOO_LARGE.0,
                    error = %err,
                    "visibility run refused"
                );
                return SyncOutcome::Unavailable(UnavailableReason::LogRefused);
            }
        };
        let applied = self.apply(host, presenter, &plan.diff);
        debug!(
            owner = %owner,
            mode = plan.mode.as_str(),
            fallback = plan.fallback.map(|r| r.as_str()),
            flips = applied.flip_count(),
            hidden = applied.to_hide.len(),
            shown = applied.to_show.len(),
            log_len,
            "visibility run applied"
        );

        let persist = if policy.last_processed_length != log_len || !applied.is_empty() {
            self.persist(
                host,
                presenter,
                &owner,
                policy.with_checkpoint(log_len),
                "Could not save hide checkpoint",
                now,
            )
        } else {
            PersistStatus::NotNeeded
        };
        SyncOutcome::Reconciled(SyncReport {
            owner,
            mode: plan.mode,
            fallback: plan.fallback,
            reason_code: plan.reason_code,
            applied,
            log_len,
            persist,
        })
    }

    fn plan(
        &self,
        log: &dyn LogFlagView,
        policy: &VisibilityPolicy,
        hint: RunModeHint,
    ) -> Result<ReconcilePlan, ContractViolation> {
        let full = |fallback: Option<IncrementalFallbackReason>,
                    reason_code: ReasonCodeId|
         -> Result<ReconcilePlan, ContractViolation> {
            Ok(ReconcilePlan {
                mode: ReconcileMode::Full,
                fallback,
                reason_code,
                diff: self.engine.full_diff(log, policy.hide_last_n)?,
            })
        };
        if hint == RunModeHint::Full {
            return full(None, engine_codes::PH1_VIS_OK_FULL);
        }
        match self.engine.incremental_diff(log, policy)? {
            IncrementalDiff::Hide { to_hide, .. } => Ok(ReconcilePlan {
                mode: ReconcileMode::Incremental,
                fallback: None,
                reason_code: engine_codes::PH1_VIS_OK_INCREMENTAL,
                diff: VisibilityDiff::hide_only(to_hide)?,
            }),
            IncrementalDiff::NoNewHides => Ok(ReconcilePlan {
                mode: ReconcileMode::Incremental,
                fallback: None,
                reason_code: engine_codes::PH1_VIS_OK_NO_NEW_HIDES,
                diff: VisibilityDiff::default(),
            }),
            IncrementalDiff::Fallback(reason) => {
                full(Some(reason), engine_codes::PH1_VIS_INCREMENTAL_FALLBACK)
            }
        }
    }

    fn apply<H, P>(&mut self, host: &mut H, presenter: &mut P, diff: &VisibilityDiff) -> VisibilityDiff
    where
        H: VisHost,
        P: PresentationNotifier,
    {
        let mut applied = VisibilityDiff::default();
        for &index in &diff.to_hide {
            if host.set_entry_hidden(index, true) {
                self.ledger.indices.insert(index);
                applied.to_hide.push(index);
            }
        }
        for &index in &diff.to_show {
            if host.set_entry_hidden(index, false) {
                self.ledger.indices.remove(&index);
                applied.to_show.push(index);
            }
        }
        if !applied.to_hide.is_empty() {
            presenter.flags_changed(&applied.to_hide, true);
        }
        if !applied.to_show.is_empty() {
            presenter.flags_changed(&applied.to_show, false);
        }
        applied
    }

    fn persist<H, P>(
        &self,
        host: &mut H,
        presenter: &mut P,
        owner: &OwnerRef,
        policy: VisibilityPolicy,
        failure_prefix: &str,
        now: MonotonicTimeNs,
    ) -> PersistStatus
    where
        H: VisHost,
        P: PresentationNotifier,
    {
        let out = self.policy_store.save(host, owner, policy, now);
        if out.success {
            return PersistStatus::Persisted;
        }
        let message = out
            .message
            .unwrap_or_else(|| "policy save failed".to_string());
        presenter.notice(UserNotice::new(
            NoticeLevel::Error,
            format!("{failure_prefix}: {message}"),
        ));
        PersistStatus::Failed { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_store::PolicySenderRuntime;
    use curtain_engines::ph1vis::Ph1VisConfig;
    use curtain_storage::ph1vis::{ChatId, OwnerRecord, TranscriptEntry};
    use serde_json::Map;

    #[derive(Default)]
    struct RecordingPresenter {
        flips: Vec<(Vec<u32>, bool)>,
        notices: Vec<UserNotice>,
    }

    impl PresentationNotifier for RecordingPresenter {
        fn flags_changed(&mut self, indices: &[u32], hidden: bool) {
            self.flips.push((indices.to_vec(), hidden));
        }

        fn notice(&mut self, notice: UserNotice) {
            self.notices.push(notice);
        }
    }

    fn alice() -> OwnerRef {
        OwnerRef::character("alice.png").unwrap()
    }

    fn host_with(len: usize, hidden: &[usize], policy: Option<VisibilityPolicy>) -> Ph1VisStore {
        let mut s = Ph1VisStore::new_in_memory();
        s.insert_owner_row(
            OwnerRecord::v1(alice(), "Alice".to_string(), Map::new(), policy, MonotonicTimeNs(1))
                .unwrap(),
        )
        .unwrap();
        s.open_chat_row(&alice(), ChatId::new("chat_1").unwrap())
            .unwrap();
        for i in 0..len {
            let entry = if hidden.contains(&i) {
                TranscriptEntry::hidden_v1(i % 2 == 0, format!("m{i}"))
            } else {
                TranscriptEntry::v1(i % 2 == 0, format!("m{i}"))
            };
            s.append_active_entry_row(entry).unwrap();
        }
        s
    }

    fn sync_with(
        sender: PolicySenderRuntime,
        scope: UnhideScope,
    ) -> Ph1VisSynchronizer<Ph1VisRuntime> {
        let mut config = Ph1VisWiringConfig::mvp_v1(true);
        config.unhide_scope = scope;
        Ph1VisSynchronizer::new(
            config,
            Ph1VisRuntime::new(Ph1VisConfig::mvp_v1()),
            PolicyStoreAdapter::new(sender),
        )
    }

    fn sync() -> Ph1VisSynchronizer<Ph1VisRuntime> {
        sync_with(PolicySenderRuntime::LoopbackAck, UnhideScope::AllHidden)
    }

    fn on() -> VisGlobalSettings {
        VisGlobalSettings { enabled: true }
    }

    fn hidden_flags(host: &Ph1VisStore) -> Vec<bool> {
        host.active_entry_rows()
            .unwrap()
            .iter()
            .map(|e| e.hidden)
            .collect()
    }

    fn report(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Reconciled(report) => report,
            other => panic!("expected Reconciled, got {other:?}"),
        }
    }

    #[test]
    fn at_vis_sync_01_gate_blocks_unconfigured_and_disabled() {
        let mut p = RecordingPresenter::default();
        let mut s = sync();

        let mut host = host_with(10, &[], None);
        assert_eq!(
            s.run(&mut host, &mut p, &on(), RunModeHint::Full, MonotonicTimeNs(2)),
            SyncOutcome::Skipped(SkipReason::NoPolicy)
        );

        let mut host = host_with(10, &[], Some(VisibilityPolicy::v1(3, 0, false)));
        assert_eq!(
            s.run(&mut host, &mut p, &on(), RunModeHint::Full, MonotonicTimeNs(2)),
            SyncOutcome::Skipped(SkipReason::NotUserConfigured)
        );

        let mut host = host_with(10, &[], Some(VisibilityPolicy::user_saved(3, 0)));
        let off = VisGlobalSettings { enabled: false };
        assert_eq!(
            s.run(&mut host, &mut p, &off, RunModeHint::Full, MonotonicTimeNs(2)),
            SyncOutcome::Skipped(SkipReason::Disabled)
        );
        assert!(hidden_flags(&host).iter().all(|h| !h));
        assert!(p.flips.is_empty());
    }

    #[test]
    fn at_vis_sync_02_save_policy_persists_then_runs_full() {
        let mut host = host_with(10, &[], None);
        let mut p = RecordingPresenter::default();
        let out = sync().save_policy(&mut host, &mut p, &on(), "3", MonotonicTimeNs(2));

        let SavePolicyOutcome::Saved { hide_last_n, reconcile } = out else {
            panic!("expected Saved, got {out:?}");
        };
        assert_eq!(hide_last_n, 3);
        let r = report(reconcile);
        assert_eq!(r.mode, ReconcileMode::Full);
        assert_eq!(r.applied.to_hide, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(p.flips, vec![(vec![0, 1, 2, 3, 4, 5, 6], true)]);
        assert_eq!(host.policy_row(&alice()), Some(VisibilityPolicy::user_saved(3, 10)));
        assert_eq!(p.notices.last().unwrap().level, NoticeLevel::Success);
    }

    #[test]
    fn at_vis_sync_03_append_runs_incremental_and_advances_checkpoint() {
        let mut host = host_with(10, &[], None);
        let mut p = RecordingPresenter::default();
        let mut s = sync();
        s.save_policy(&mut host, &mut p, &on(), "3", MonotonicTimeNs(2));
        for i in 0..3 {
            host.append_active_entry_row(TranscriptEntry::v1(true, format!("new{i}")))
                .unwrap();
        }

        let r = report(s.run(&mut host, &mut p, &on(), RunModeHint::Auto, MonotonicTimeNs(3)));
        assert_eq!(r.mode, ReconcileMode::Incremental);
        assert_eq!(r.applied.to_hide, vec![7, 8, 9]);
        assert_eq!(r.persist, PersistStatus::Persisted);
        assert_eq!(
            host.policy_row(&alice()).unwrap().last_processed_length,
            13
        );
        assert_eq!(s.owned_hidden_indices().len(), 10);
    }

    #[test]
    fn at_vis_sync_04_shrink_falls_back_to_full() {
        let mut host = host_with(10, &[], None);
        let mut p = RecordingPresenter::default();
        let mut s = sync();
        s.save_policy(&mut host, &mut p, &on(), "3", MonotonicTimeNs(2));
        host.remove_active_entry_row(9).unwrap();
        host.remove_active_entry_row(8).unwrap();

        let r = report(s.run(&mut host, &mut p, &on(), RunModeHint::Auto, MonotonicTimeNs(3)));
        assert_eq!(r.mode, ReconcileMode::Full);
        assert_eq!(r.fallback, Some(IncrementalFallbackReason::LengthShrunk));
        assert_eq!(r.applied.to_show, vec![5, 6]);
        assert_eq!(
            hidden_flags(&host),
            vec![true, true, true, true, true, false, false, false]
        );
        assert_eq!(host.policy_row(&alice()).unwrap().last_processed_length, 8);
    }

    #[test]
    fn at_vis_sync_05_settled_log_skips_persistence() {
        let mut host = host_with(10, &[], None);
        let mut p = RecordingPresenter::default();
        let mut s = sync();
        s.save_policy(&mut host, &mut p, &on(), "4", MonotonicTimeNs(2));
        let seq = host.owner_row(&alice()).unwrap().policy_write_seq;

        let r = report(s.run(&mut host, &mut p, &on(), RunModeHint::Auto, MonotonicTimeNs(3)));
        assert_eq!(r.fallback, Some(IncrementalFallbackReason::LengthUnchanged));
        assert!(r.applied.is_empty());
        assert_eq!(r.persist, PersistStatus::NotNeeded);
        assert_eq!(host.owner_row(&alice()).unwrap().policy_write_seq, seq);
    }

    #[test]
    fn at_vis_sync_06_persist_failure_keeps_flips_and_old_checkpoint() {
        let mut host = host_with(10, &[], Some(VisibilityPolicy::user_saved(3, 0)));
        let mut p = RecordingPresenter::default();
        let mut s = sync_with(
            PolicySenderRuntime::always_fail_for_tests("503 unavailable"),
            UnhideScope::AllHidden,
        );

        let r = report(s.run(&mut host, &mut p, &on(), RunModeHint::Auto, MonotonicTimeNs(2)));
        assert_eq!(r.applied.to_hide.len(), 7);
        assert_eq!(
            r.persist,
            PersistStatus::Failed {
                message: "503 unavailable".to_string()
            }
        );
        assert_eq!(host.policy_row(&alice()), Some(VisibilityPolicy::user_saved(3, 0)));
        assert_eq!(hidden_flags(&host).iter().filter(|h| **h).count(), 7);
        assert_eq!(p.notices.len(), 1);
        assert_eq!(p.notices[0].level, NoticeLevel::Error);
    }

    #[test]
    fn at_vis_sync_07_unhide_all_shows_everything_and_resets_policy() {
        let mut host = host_with(9, &[2, 5, 7], Some(VisibilityPolicy::user_saved(2, 9)));
        let mut p = RecordingPresenter::default();
        let out = sync().unhide_all(&mut host, &mut p, &on(), MonotonicTimeNs(2));

        assert_eq!(
            out,
            UnhideAllOutcome::Unhidden {
                shown: vec![2, 5, 7],
                persist: PersistStatus::Persisted,
            }
        );
        assert!(hidden_flags(&host).iter().all(|h| !h));
        assert_eq!(
            host.policy_row(&alice()),
            Some(VisibilityPolicy::v1(0, 9, true))
        );
        assert_eq!(p.flips, vec![(vec![2, 5, 7], false)]);
    }

    #[test]
    fn at_vis_sync_08_policy_owned_unhide_leaves_foreign_hides() {
        let mut host = host_with(6, &[5], None);
        let mut p = RecordingPresenter::default();
        let mut s = sync_with(PolicySenderRuntime::LoopbackAck, UnhideScope::PolicyOwned);
        s.save_policy(&mut host, &mut p, &on(), "4", MonotonicTimeNs(2));
        assert_eq!(
            hidden_flags(&host),
            vec![true, true, false, false, false, false]
        );

        host.set_active_entry_hidden_row(4, true).unwrap();
        let out = s.unhide_all(&mut host, &mut p, &on(), MonotonicTimeNs(3));
        let UnhideAllOutcome::Unhidden { shown, .. } = out else {
            panic!("expected Unhidden");
        };
        assert_eq!(shown, vec![0, 1]);
        assert_eq!(
            hidden_flags(&host),
            vec![false, false, false, false, true, false]
        );
    }

    #[test]
    fn at_vis_sync_15_reported_removal_shifts_owned_indices() {
        let mut host = host_with(10, &[2], None);
        let mut p = RecordingPresenter::default();
        let mut s = sync_with(PolicySenderRuntime::LoopbackAck, UnhideScope::PolicyOwned);
        s.save_policy(&mut host, &mut p, &on(), "3", MonotonicTimeNs(2));
        assert_eq!(
            s.owned_hidden_indices().iter().copied().collect::<Vec<_>>(),
            vec![0, 1, 3, 4, 5, 6]
        );

        host.remove_active_entry_row(0).unwrap();
        s.on_entry_removed(0);
        assert_eq!(
            s.owned_hidden_indices().iter().copied().collect::<Vec<_>>(),
            vec![0, 2, 3, 4, 5]
        );
        host.append_active_entry_row(TranscriptEntry::v1(true, "late"))
            .unwrap();
        let r = report(s.run(&mut host, &mut p, &on(), RunModeHint::Full, MonotonicTimeNs(3)));
        assert_eq!(r.applied.to_hide, vec![6]);

        let out = s.unhide_all(&mut host, &mut p, &on(), MonotonicTimeNs(4));
        let UnhideAllOutcome::Unhidden { shown, .. } = out else {
            panic!("expected Unhidden");
        };
        assert_eq!(shown, vec![0, 2, 3, 4, 5, 6]);
        assert_eq!(
            hidden_flags(&host),
            vec![false, true, false, false, false, false, false, false, false, false]
        );
    }

    #[test]
    fn at_vis_sync_16_unreported_shrink_empties_owned_indices() {
        let mut host = host_with(10, &[], None);
        let mut p = RecordingPresenter::default();
        let mut s = sync_with(PolicySenderRuntime::LoopbackAck, UnhideScope::PolicyOwned);
        s.save_policy(&mut host, &mut p, &on(), "3", MonotonicTimeNs(2));
        host.remove_active_entry_row(9).unwrap();

        let r = report(s.run(&mut host, &mut p, &on(), RunModeHint::Auto, MonotonicTimeNs(3)));
        assert_eq!(r.applied.to_show, vec![6]);
        assert!(s.owned_hidden_indices().is_empty());

        let out = s.unhide_all(&mut host, &mut p, &on(), MonotonicTimeNs(4));
        let UnhideAllOutcome::Unhidden { shown, .. } = out else {
            panic!("expected Unhidden");
        };
        assert!(shown.is_empty());
        assert_eq!(hidden_flags(&host).iter().filter(|h| **h).count(), 6);
    }

    #[test]
    fn at_vis_sync_09_unchanged_and_invalid_input_are_noops() {
        let mut host = host_with(5, &[], Some(VisibilityPolicy::user_saved(2, 5)));
        let mut p = RecordingPresenter::default();
        let mut s = sync();
        assert_eq!(
            s.save_policy(&mut host, &mut p, &on(), " 2 entries", MonotonicTimeNs(2)),
            SavePolicyOutcome::Unchanged { hide_last_n: 2 }
        );
        assert_eq!(p.notices[0].level, NoticeLevel::Info);

        let mut fresh = host_with(5, &[], None);
        assert_eq!(
            s.save_policy(&mut fresh, &mut p, &on(), "-4", MonotonicTimeNs(2)),
            SavePolicyOutcome::Unchanged { hide_last_n: 0 }
        );
        assert_eq!(fresh.policy_row(&alice()), None);
    }

    #[test]
    fn at_vis_sync_10_commands_refused_while_disabled() {
        let mut host = host_with(5, &[1], Some(VisibilityPolicy::user_saved(2, 5)));
        let mut p = RecordingPresenter::default();
        let mut s = sync();
        let off = VisGlobalSettings { enabled: false };
        assert_eq!(
            s.save_policy(&mut host, &mut p, &off, "1", MonotonicTimeNs(2)),
            SavePolicyOutcome::Refused(CommandRefusal::Disabled)
        );
        assert_eq!(
            s.unhide_all(&mut host, &mut p, &off, MonotonicTimeNs(2)),
            UnhideAllOutcome::Refused(CommandRefusal::Disabled)
        );
        assert!(p.notices.iter().all(|n| n.level == NoticeLevel::Warning));
        assert_eq!(hidden_flags(&host), vec![false, true, false, false, false]);
    }

    #[test]
    fn at_vis_sync_11_policy_display_shows_value_or_none() {
        let s = sync();
        let host = host_with(3, &[], Some(VisibilityPolicy::user_saved(4, 3)));
        let shown = s.policy_display(&host);
        assert_eq!(shown.current, Some(4));
        assert_eq!(shown.label, "4");
        assert_eq!(shown.input_prefill, "4");

        let host = host_with(3, &[], Some(VisibilityPolicy::user_saved(0, 3)));
        let shown = s.policy_display(&host);
        assert_eq!(shown.current, None);
        assert_eq!(shown.label, "none");
        assert_eq!(shown.input_prefill, "");
    }

    #[test]
    fn at_vis_sync_12_missing_log_is_unavailable_not_error() {
        let mut host = host_with(3, &[], Some(VisibilityPolicy::user_saved(1, 0)));
        host.close_active_chat_row();
        let mut p = RecordingPresenter::default();
        assert_eq!(
            sync().run(&mut host, &mut p, &on(), RunModeHint::Auto, MonotonicTimeNs(2)),
            SyncOutcome::Unavailable(UnavailableReason::NoActiveLog)
        );
        assert!(p.notices.is_empty());
    }

    #[test]
    fn at_vis_sync_13_unhide_on_empty_log_still_resets_policy() {
        let mut host = host_with(0, &[], Some(VisibilityPolicy::user_saved(5, 0)));
        let mut p = RecordingPresenter::default();
        let out = sync().unhide_all(&mut host, &mut p, &on(), MonotonicTimeNs(2));
        assert_eq!(
            out,
            UnhideAllOutcome::Unhidden {
                shown: vec![],
                persist: PersistStatus::Persisted,
            }
        );
        assert_eq!(host.policy_row(&alice()), Some(VisibilityPolicy::v1(0, 0, true)));
    }

    #[test]
    fn at_vis_sync_14_run_mode_hint_full_dominates() {
        assert_eq!(RunModeHint::Auto.dominant(RunModeHint::Full), RunModeHint::Full);
        assert_eq!(RunModeHint::Full.dominant(RunModeHint::Auto), RunModeHint::Full);
        assert_eq!(RunModeHint::Auto.dominant(RunModeHint::Auto), RunModeHint::Auto);
    }
}
