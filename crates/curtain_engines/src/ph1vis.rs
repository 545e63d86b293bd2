#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use curtain_kernel_contracts::ph1vis::{
    IncrementalDiff, IncrementalFallbackReason, LogFlagView, VisibilityDiff, VisibilityPolicy,
};
use curtain_kernel_contracts::ContractViolation;

pub mod reason_codes {
    use curtain_kernel_contracts::ReasonCodeId;

    // PH1.VIS reconciler reason-code namespace.
    pub const PH1_VIS_OK_FULL: ReasonCodeId = ReasonCodeId(0x5649_0001);
    pub const PH1_VIS_OK_INCREMENTAL: ReasonCodeId = ReasonCodeId(0x5649_0002);
    pub const PH1_VIS_OK_NO_NEW_HIDES: ReasonCodeId = ReasonCodeId(0x5649_0003);
    pub const PH1_VIS_OK_UNHIDE_ALL: ReasonCodeId = ReasonCodeId(0x5649_0004);

    pub const PH1_VIS_INCREMENTAL_FALLBACK: ReasonCodeId = ReasonCodeId(0x5649_00F1);
    pub const PH1_VIS_LOG_TOO_LARGE: ReasonCodeId = ReasonCodeId(0x5649_00F2);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ph1VisConfig {
    pub max_log_entries: u32,
}

impl Ph1VisConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_log_entries: 1_000_000,
        }
    }
}

/// First index that stays visible. `hide_last_n == 0` and `hide_last_n >= len`
/// both mean nothing is hidden.
pub fn visible_start(len: u32, hide_last_n: u32) -> u32 {
    if hide_last_n == 0 || hide_last_n >= len {
        0
    } else {
        len - hide_last_n
    }
}

#[derive(Debug, Clone)]
pub struct Ph1VisRuntime {
    config: Ph1VisConfig,
}

impl Ph1VisRuntime {
    pub fn new(config: Ph1VisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> Ph1VisConfig {
        self.config
    }

    /// Scans the whole log and returns the flips that make
    /// `hidden(i) == (i < visible_start)` hold. Already-correct entries and
    /// empty slots are left alone, so a second pass over the result is empty.
    pub fn full_diff<L>(&self, log: &L, hide_last_n: u32) -> Result<VisibilityDiff, ContractViolation>
    where
        L: LogFlagView + ?Sized,
    {
        let len = self.guarded_len(log)?;
        let boundary = visible_start(len, hide_last_n);
        let mut diff = VisibilityDiff::default();
        for index in 0..len {
            let Some(hidden) = log.entry_hidden(index) else {
                continue;
            };
            let should_hide = index < boundary;
            if should_hide && !hidden {
                diff.to_hide.push(index);
            } else if !should_hide && hidden {
                diff.to_show.push(index);
            }
        }
        Ok(diff)
    }

    /// Append-only path: only the entries that crossed out of the keep-N window
    /// since `policy.last_processed_length` are scanned.
    pub fn incremental_diff<L>(
        &self,
        log: &L,
        policy: &VisibilityPolicy,
    ) -> Result<IncrementalDiff, ContractViolation>
    where
        L: LogFlagView + ?Sized,
    {
        let len = self.guarded_len(log)?;
        let previous_len = policy.last_processed_length;
        if !policy.hides_anything() {
            return Ok(IncrementalDiff::Fallback(
                IncrementalFallbackReason::PolicyHidesNothing,
            ));
        }
        if len == previous_len {
            return Ok(IncrementalDiff::Fallback(
                IncrementalFallbackReason::LengthUnchanged,
            ));
        }
        if len < previous_len {
            return Ok(IncrementalDiff::Fallback(
                IncrementalFallbackReason::LengthShrunk,
            ));
        }

        let target_start = len.saturating_sub(policy.hide_last_n);
        let previous_start = previous_len.saturating_sub(policy.hide_last_n);
        if target_start <= previous_start {
            return Ok(IncrementalDiff::NoNewHides);
        }

        let to_hide = (previous_start..target_start)
            .filter(|&index| log.entry_hidden(index) == Some(false))
            .collect();
        Ok(IncrementalDiff::Hide {
            window_start: previous_start,
            window_end: target_start,
            to_hide,
        })
    }

    /// Shows every hidden entry, or only those in `owned` when the caller
    /// tracks which indices it hid itself.
    pub fn unhide_all_diff<L>(
        &self,
        log: &L,
        owned: Option<&BTreeSet<u32>>,
    ) -> Result<VisibilityDiff, ContractViolation>
    where
        L: LogFlagView + ?Sized,
    {
        let len = self.guarded_len(log)?;
        let to_show = (0..len)
            .filter(|&index| log.entry_hidden(index) == Some(true))
            .filter(|index| owned.map_or(true, |set| set.contains(index)))
            .collect();
        Ok(VisibilityDiff {
            to_hide: Vec::new(),
            to_show,
        })
    }

    fn guarded_len<L>(&self, log: &L) -> Result<u32, ContractViolation>
    where
        L: LogFlagView + ?Sized,
    {
        let len = log.entry_count();
        if len > self.config.max_log_entries {
            return Err(ContractViolation::InvalidValue {
                field: "ph1vis.log.entry_count",
                reason: "exceeds max_log_entries",
            });
        }
        Ok(len)
    }
}
