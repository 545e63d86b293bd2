#![forbid(unsafe_code)]

use std::env;
use std::ops::RangeInclusive;

use curtain_kernel_contracts::ph1vis::OwnerRef;
use curtain_kernel_contracts::MonotonicTimeNs;
use tracing::{debug, info, warn};

use crate::ph1vis::{RunModeHint, TranscriptAccessor, VisGlobalSettings};

pub const DEBOUNCE_MS_DEFAULT: u64 = 200;
pub const STARTUP_DELAY_MS_DEFAULT: u64 = 1_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendSource {
    Sent,
    Received,
}

/// Host lifecycle signals the coordinator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    HostReady,
    /// A different owner or chat was loaded, or the log was replaced wholesale.
    OwnerSwitched,
    EntryAppended(AppendSource),
    EntryRemoved,
    GenerationEnded,
    GlobalToggled(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisEventConfig {
    pub debounce_ms: u64,
    pub startup_delay_ms: u64,
}

impl VisEventConfig {
    pub fn mvp_v1() -> Self {
        Self {
            debounce_ms: DEBOUNCE_MS_DEFAULT,
            startup_delay_ms: STARTUP_DELAY_MS_DEFAULT,
        }
    }

    pub fn from_env() -> Self {
        Self {
            debounce_ms: ms_setting(
                env::var("CURTAIN_DEBOUNCE_MS").ok().as_deref(),
                50..=5_000,
                DEBOUNCE_MS_DEFAULT,
            ),
            startup_delay_ms: ms_setting(
                env::var("CURTAIN_STARTUP_DELAY_MS").ok().as_deref(),
                0..=60_000,
                STARTUP_DELAY_MS_DEFAULT,
            ),
        }
    }
}

fn ms_setting(raw: Option<&str>, accepted: RangeInclusive<u64>, default: u64) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| accepted.contains(v))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContextEpoch(pub u64);

/// Owner resolved under one context epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    pub epoch: ContextEpoch,
    pub owner: Option<OwnerRef>,
}

/// Cached active owner. Invalidation bumps the epoch, which is how a run
/// scheduled before a switch recognizes itself as stale.
#[derive(Debug, Clone, Default)]
pub struct OwnerContextCache {
    epoch: ContextEpoch,
    cached: Option<Option<OwnerRef>>,
}

impl OwnerContextCache {
    pub fn epoch(&self) -> ContextEpoch {
        self.epoch
    }

    pub fn resolve<H>(&mut self, host: &H) -> OwnerContext
    where
        H: TranscriptAccessor + ?Sized,
    {
        let owner = self
            .cached
            .get_or_insert_with(|| host.active_owner())
            .clone();
        OwnerContext {
            epoch: self.epoch,
            owner,
        }
    }

    pub fn invalidate(&mut self) -> ContextEpoch {
        self.cached = None;
        self.epoch = ContextEpoch(self.epoch.0.saturating_add(1));
        self.epoch
    }

    /// Re-reads the host rather than trusting the cache.
    pub fn still_current<H>(&self, context: &OwnerContext, host: &H) -> bool
    where
        H: TranscriptAccessor + ?Sized,
    {
        context.epoch == self.epoch && host.active_owner() == context.owner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DebounceToken(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRun {
    pub token: DebounceToken,
    pub hint: RunModeHint,
    pub context: OwnerContext,
    pub due_at: MonotonicTimeNs,
    pub coalesced: u32,
}

/// Holds at most one pending run. Scheduling replaces the pending run and
/// pushes its deadline out; only the newest token can fire.
#[derive(Debug, Clone, Default)]
pub struct DebounceSlot {
    pending: Option<PendingRun>,
    next_token: u64,
}

impl DebounceSlot {
    pub fn schedule(
        &mut self,
        now: MonotonicTimeNs,
        quiet_ms: u64,
        hint: RunModeHint,
        context: OwnerContext,
    ) -> &PendingRun {
        let (hint, coalesced) = match self.pending.take() {
            Some(prev) if prev.context == context => {
                (prev.hint.dominant(hint), prev.coalesced.saturating_add(1))
            }
            _ => (hint, 0),
        };
        self.next_token = self.next_token.saturating_add(1);
        self.pending.insert(PendingRun {
            token: DebounceToken(self.next_token),
            hint,
            context,
            due_at: now.saturating_add_ms(quiet_ms),
            coalesced,
        })
    }

    pub fn pending(&self) -> Option<&PendingRun> {
        self.pending.as_ref()
    }

    pub fn take_if_current(&mut self, token: DebounceToken) -> Option<PendingRun> {
        if self.pending.as_ref().map(|p| p.token) != Some(token) {
            return None;
        }
        self.pending.take()
    }

    pub fn take_due(&mut self, now: MonotonicTimeNs) -> Option<PendingRun> {
        if self.pending.as_ref().is_some_and(|p| p.due_at <= now) {
            return self.pending.take();
        }
        None
    }

    pub fn cancel(&mut self) -> Option<PendingRun> {
        self.pending.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Disabled,
    ToggledOff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    Debounce {
        token: DebounceToken,
        hint: RunModeHint,
        due_at: MonotonicTimeNs,
    },
    Immediate {
        hint: RunModeHint,
    },
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireDecision {
    Run { hint: RunModeHint, coalesced: u32 },
    /// A newer schedule replaced this token.
    Superseded,
    /// The owner changed between scheduling and firing.
    Stale,
}

/// Maps host signals to scheduling decisions and guards debounced firings.
#[derive(Debug, Clone)]
pub struct VisEventCoordinator {
    config: VisEventConfig,
    settings: VisGlobalSettings,
    context: OwnerContextCache,
    slot: DebounceSlot,
}

impl VisEventCoordinator {
    pub fn new(config: VisEventConfig, settings: VisGlobalSettings) -> Self {
        Self {
            config,
            settings,
            context: OwnerContextCache::default(),
            slot: DebounceSlot::default(),
        }
    }

    pub fn config(&self) -> VisEventConfig {
        self.config
    }

    pub fn settings(&self) -> &VisGlobalSettings {
        &self.settings
    }

    pub fn context_epoch(&self) -> ContextEpoch {
        self.context.epoch()
    }

    pub fn pending(&self) -> Option<&PendingRun> {
        self.slot.pending()
    }

    pub fn on_signal<H>(
        &mut self,
        signal: HostSignal,
        host: &H,
        now: MonotonicTimeNs,
    ) -> ScheduleDecision
    where
        H: TranscriptAccessor + ?Sized,
    {
        match signal {
            HostSignal::GlobalToggled(enabled) => {
                self.settings.enabled = enabled;
                info!(enabled, "hide helper toggled");
                return if enabled {
                    ScheduleDecision::Immediate {
                        hint: RunModeHint::Full,
                    }
                } else {
                    self.slot.cancel();
                    ScheduleDecision::Ignore(IgnoreReason::ToggledOff)
                };
            }
            HostSignal::OwnerSwitched => {
                let epoch = self.context.invalidate();
                debug!(epoch = epoch.0, "owner context invalidated");
            }
            _ => {}
        }

        if !self.settings.enabled {
            if let Some(dropped) = self.slot.cancel() {
                debug!(token = dropped.token.0, "pending run dropped while disabled");
            }
            return ScheduleDecision::Ignore(IgnoreReason::Disabled);
        }

        let hint = match signal {
            HostSignal::HostReady => {
                return ScheduleDecision::Immediate {
                    hint: RunModeHint::Full,
                }
            }
            HostSignal::EntryAppended(_) => RunModeHint::Auto,
            HostSignal::OwnerSwitched
            | HostSignal::EntryRemoved
            | HostSignal::GenerationEnded
            | HostSignal::GlobalToggled(_) => RunModeHint::Full,
        };
        let context = self.context.resolve(host);
        let run = self
            .slot
            .schedule(now, self.config.debounce_ms, hint, context);
        debug!(
            signal = ?signal,
            token = run.token.0,
            coalesced = run.coalesced,
            "visibility run debounced"
        );
        ScheduleDecision::Debounce {
            token: run.token,
            hint: run.hint,
            due_at: run.due_at,
        }
    }

    /// Called when the timer behind `token` expires.
    pub fn fire<H>(&mut self, token: DebounceToken, host: &H) -> FireDecision
    where
        H: TranscriptAccessor + ?Sized,
    {
        let Some(run) = self.slot.take_if_current(token) else {
            return FireDecision::Superseded;
        };
        self.check_context(run, host)
    }

    /// Deterministic alternative to timers: fires the pending run once its
    /// quiet period has elapsed.
    pub fn fire_due<H>(&mut self, host: &H, now: MonotonicTimeNs) -> Option<FireDecision>
    where
        H: TranscriptAccessor + ?Sized,
    {
        let run = self.slot.take_due(now)?;
        Some(self.check_context(run, host))
    }

    fn check_context<H>(&mut self, run: PendingRun, host: &H) -> FireDecision
    where
        H: TranscriptAccessor + ?Sized,
    {
        if !self.context.still_current(&run.context, host) {
            warn!(
                token = run.token.0,
                epoch = run.context.epoch.0,
                "stale visibility run discarded"
            );
            if run.context.epoch == self.context.epoch() {
                self.context.invalidate();
            }
            return FireDecision::Stale;
        }
        FireDecision::Run {
            hint: run.hint,
            coalesced: run.coalesced,
        }
    }
}
