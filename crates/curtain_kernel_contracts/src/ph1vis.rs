#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1VIS_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

const OWNER_KEY_MAX_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacterAvatar(String);

impl CharacterAvatar {
    pub fn new(avatar: impl Into<String>) -> Result<Self, ContractViolation> {
        let avatar = avatar.into();
        validate_owner_key("character_avatar", &avatar)?;
        Ok(Self(avatar))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        validate_owner_key("group_id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    Character,
    Group,
}

impl OwnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OwnerKind::Character => "CHARACTER",
            OwnerKind::Group => "GROUP",
        }
    }
}

/// The character- or group-like entity a transcript and its policy belong to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OwnerRef {
    Character(CharacterAvatar),
    Group(GroupId),
}

impl OwnerRef {
    pub fn character(avatar: impl Into<String>) -> Result<Self, ContractViolation> {
        Ok(OwnerRef::Character(CharacterAvatar::new(avatar)?))
    }

    pub fn group(id: impl Into<String>) -> Result<Self, ContractViolation> {
        Ok(OwnerRef::Group(GroupId::new(id)?))
    }

    pub fn kind(&self) -> OwnerKind {
        match self {
            OwnerRef::Character(_) => OwnerKind::Character,
            OwnerRef::Group(_) => OwnerKind::Group,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            OwnerRef::Character(avatar) => avatar.as_str(),
            OwnerRef::Group(id) => id.as_str(),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerRef::Character(avatar) => write!(f, "character:{}", avatar.as_str()),
            OwnerRef::Group(id) => write!(f, "group:{}", id.as_str()),
        }
    }
}

impl Validate for OwnerRef {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            OwnerRef::Character(avatar) => validate_owner_key("owner_ref.character", avatar.as_str()),
            OwnerRef::Group(id) => validate_owner_key("owner_ref.group", id.as_str()),
        }
    }
}

/// Per-owner "keep the last N entries visible" policy plus its resumption checkpoint.
///
/// Serialized with the host's field names (`hideLastN`, `lastProcessedLength`,
/// `userConfigured`). Counts are clamped to non-negative integers on read, so a
/// document written by a looser client never reaches the reconciler negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityPolicy {
    #[serde(default, deserialize_with = "deserialize_clamped_count")]
    pub hide_last_n: u32,
    #[serde(default, deserialize_with = "deserialize_clamped_count")]
    pub last_processed_length: u32,
    #[serde(default)]
    pub user_configured: bool,
}

impl VisibilityPolicy {
    pub fn v1(hide_last_n: u32, last_processed_length: u32, user_configured: bool) -> Self {
        Self {
            hide_last_n,
            last_processed_length,
            user_configured,
        }
    }

    /// Policy written by an explicit human save: always marked configured.
    pub fn user_saved(hide_last_n: u32, current_length: u32) -> Self {
        Self::v1(hide_last_n, current_length, true)
    }

    pub fn with_checkpoint(self, current_length: u32) -> Self {
        Self {
            last_processed_length: current_length,
            ..self
        }
    }

    pub fn reset_for_unhide(current_length: u32) -> Self {
        Self::user_saved(0, current_length)
    }

    pub fn hides_anything(&self) -> bool {
        self.hide_last_n > 0
    }

    pub fn display_value(&self) -> Option<u32> {
        self.hides_anything().then_some(self.hide_last_n)
    }
}

/// Read-only view over the host's ordered entries and their hidden flags.
///
/// `entry_hidden` returns `None` for an empty slot; reconciliation skips those.
pub trait LogFlagView {
    fn entry_count(&self) -> u32;
    fn entry_hidden(&self, index: u32) -> Option<bool>;
}

impl LogFlagView for [bool] {
    fn entry_count(&self) -> u32 {
        u32::try_from(self.len()).unwrap_or(u32::MAX)
    }

    fn entry_hidden(&self, index: u32) -> Option<bool> {
        self.get(index as usize).copied()
    }
}

impl LogFlagView for [Option<bool>] {
    fn entry_count(&self) -> u32 {
        u32::try_from(self.len()).unwrap_or(u32::MAX)
    }

    fn entry_hidden(&self, index: u32) -> Option<bool> {
        self.get(index as usize).copied().flatten()
    }
}

impl LogFlagView for Vec<bool> {
    fn entry_count(&self) -> u32 {
        self.as_slice().entry_count()
    }

    fn entry_hidden(&self, index: u32) -> Option<bool> {
        self.as_slice().entry_hidden(index)
    }
}

impl LogFlagView for Vec<Option<bool>> {
    fn entry_count(&self) -> u32 {
        self.as_slice().entry_count()
    }

    fn entry_hidden(&self, index: u32) -> Option<bool> {
        self.as_slice().entry_hidden(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileMode {
    Full,
    Incremental,
}

impl ReconcileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileMode::Full => "FULL",
            ReconcileMode::Incremental => "INCREMENTAL",
        }
    }
}

/// Index-level flag flips. Both lists are strictly ascending and disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VisibilityDiff {
    pub to_hide: Vec<u32>,
    pub to_show: Vec<u32>,
}

impl VisibilityDiff {
    pub fn v1(to_hide: Vec<u32>, to_show: Vec<u32>) -> Result<Self, ContractViolation> {
        let diff = Self { to_hide, to_show };
        diff.validate()?;
        Ok(diff)
    }

    pub fn hide_only(to_hide: Vec<u32>) -> Result<Self, ContractViolation> {
        Self::v1(to_hide, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.to_hide.is_empty() && self.to_show.is_empty()
    }

    pub fn flip_count(&self) -> usize {
        self.to_hide.len() + self.to_show.len()
    }

    pub fn merge(mut self, other: VisibilityDiff) -> Result<Self, ContractViolation> {
        self.to_hide.extend(other.to_hide);
        self.to_show.extend(other.to_show);
        self.to_hide.sort_unstable();
        self.to_hide.dedup();
        self.to_show.sort_unstable();
        self.to_show.dedup();
        self.validate()?;
        Ok(self)
    }
}

impl Validate for VisibilityDiff {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascending("visibility_diff.to_hide", &self.to_hide)?;
        validate_ascending("visibility_diff.to_show", &self.to_show)?;
        let (mut h, mut s) = (0usize, 0usize);
        while h < self.to_hide.len() && s < self.to_show.len() {
            match self.to_hide[h].cmp(&self.to_show[s]) {
                std::cmp::Ordering::Less => h += 1,
                std::cmp::Ordering::Greater => s += 1,
                std::cmp::Ordering::Equal => {
                    return Err(ContractViolation::InvalidValue {
                        field: "visibility_diff",
                        reason: "to_hide and to_show must be disjoint",
                    })
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncrementalFallbackReason {
    LengthUnchanged,
    LengthShrunk,
    PolicyHidesNothing,
}

impl IncrementalFallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            IncrementalFallbackReason::LengthUnchanged => "LENGTH_UNCHANGED",
            IncrementalFallbackReason::LengthShrunk => "LENGTH_SHRUNK",
            IncrementalFallbackReason::PolicyHidesNothing => "POLICY_HIDES_NOTHING",
        }
    }
}

/// Result of the append-only reconciliation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementalDiff {
    /// Entries in `[window_start, window_end)` that are not hidden yet.
    Hide {
        window_start: u32,
        window_end: u32,
        to_hide: Vec<u32>,
    },
    /// Growth did not move the visible boundary; only the checkpoint may advance.
    NoNewHides,
    Fallback(IncrementalFallbackReason),
}

impl IncrementalDiff {
    pub fn is_fallback(&self) -> bool {
        matches!(self, IncrementalDiff::Fallback(_))
    }
}

/// Value typed into the policy input before it is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HideLastNInput {
    Valid(u32),
    Cleared,
}

impl HideLastNInput {
    /// Parses with integer-prefix semantics: `" 12abc"` is 12, `"3.9"` is 3,
    /// anything without leading digits or negative clears the field.
    pub fn parse(raw: &str) -> Self {
        match parse_int_prefix(raw) {
            Some(v) if v >= 0 => HideLastNInput::Valid(clamp_to_u32(v)),
            _ => HideLastNInput::Cleared,
        }
    }

    pub fn value(self) -> u32 {
        match self {
            HideLastNInput::Valid(v) => v,
            HideLastNInput::Cleared => 0,
        }
    }
}

pub fn clamp_hide_last_n(raw: i64) -> u32 {
    if raw <= 0 {
        0
    } else {
        clamp_to_u32(raw)
    }
}

fn clamp_to_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

fn parse_int_prefix(raw: &str) -> Option<i64> {
    let s = raw.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let mut value: i64 = 0;
    for b in digits[..end].bytes() {
        value = value
            .saturating_mul(10)
            .saturating_add(i64::from(b - b'0'));
    }
    Some(if negative { -value } else { value })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireCount {
    Number(f64),
    Text(String),
    Missing(()),
    Other(serde::de::IgnoredAny),
}

fn deserialize_clamped_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let count = match WireCount::deserialize(deserializer)? {
        WireCount::Number(n) if n.is_finite() && n > 0.0 => {
            if n >= u32::MAX as f64 {
                u32::MAX
            } else {
                n.trunc() as u32
            }
        }
        WireCount::Number(_) | WireCount::Missing(()) | WireCount::Other(_) => 0,
        WireCount::Text(text) => parse_int_prefix(&text).map(clamp_hide_last_n).unwrap_or(0),
    };
    Ok(count)
}

fn validate_ascending(field: &'static str, items: &[u32]) -> Result<(), ContractViolation> {
    if items.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be strictly ascending",
        });
    }
    Ok(())
}

fn validate_owner_key(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > OWNER_KEY_MAX_LEN {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be <= 256 chars",
        });
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_vis_contract_01_policy_reads_host_field_names_and_clamps_negatives() {
        let policy: VisibilityPolicy = serde_json::from_str(
            r#"{"hideLastN":-4,"lastProcessedLength":12.7,"userConfigured":true}"#,
        )
        .unwrap();
        assert_eq!(policy, VisibilityPolicy::v1(0, 12, true));
    }

    #[test]
    fn at_vis_contract_02_policy_missing_fields_default_to_unconfigured() {
        let policy: VisibilityPolicy = serde_json::from_str(r#"{"hideLastN":3}"#).unwrap();
        assert_eq!(policy.hide_last_n, 3);
        assert_eq!(policy.last_processed_length, 0);
        assert!(!policy.user_configured);

        let policy: VisibilityPolicy =
            serde_json::from_str(r#"{"hideLastN":"5","lastProcessedLength":null}"#).unwrap();
        assert_eq!(policy.hide_last_n, 5);
        assert_eq!(policy.last_processed_length, 0);
    }

    #[test]
    fn at_vis_contract_09_policy_clamps_non_numeric_counts_to_zero() {
        let policy: VisibilityPolicy = serde_json::from_str(
            r#"{"hideLastN":true,"lastProcessedLength":{"n":4},"userConfigured":true}"#,
        )
        .unwrap();
        assert_eq!(policy, VisibilityPolicy::v1(0, 0, true));

        let policy: VisibilityPolicy =
            serde_json::from_str(r#"{"hideLastN":4,"lastProcessedLength":[7],"userConfigured":true}"#)
                .unwrap();
        assert_eq!(policy, VisibilityPolicy::v1(4, 0, true));
    }

    #[test]
    fn at_vis_contract_03_policy_serializes_with_host_field_names() {
        let json = serde_json::to_value(VisibilityPolicy::user_saved(3, 10)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"hideLastN": 3, "lastProcessedLength": 10, "userConfigured": true})
        );
    }

    #[test]
    fn at_vis_contract_04_input_parse_uses_integer_prefix_semantics() {
        assert_eq!(HideLastNInput::parse("12"), HideLastNInput::Valid(12));
        assert_eq!(HideLastNInput::parse("  7abc"), HideLastNInput::Valid(7));
        assert_eq!(HideLastNInput::parse("3.9"), HideLastNInput::Valid(3));
        assert_eq!(HideLastNInput::parse("-2"), HideLastNInput::Cleared);
        assert_eq!(HideLastNInput::parse("abc"), HideLastNInput::Cleared);
        assert_eq!(HideLastNInput::parse(""), HideLastNInput::Cleared);
        assert_eq!(HideLastNInput::parse("-0"), HideLastNInput::Valid(0));
        assert_eq!(HideLastNInput::parse("99999999999999"), HideLastNInput::Valid(u32::MAX));
        assert_eq!(HideLastNInput::Cleared.value(), 0);
    }

    #[test]
    fn at_vis_contract_05_diff_rejects_overlap_and_unsorted_indices() {
        assert!(VisibilityDiff::v1(vec![1, 2], vec![2]).is_err());
        assert!(VisibilityDiff::v1(vec![3, 1], vec![]).is_err());
        assert!(VisibilityDiff::v1(vec![0, 1], vec![4, 5]).is_ok());
    }

    #[test]
    fn at_vis_contract_06_owner_ref_rejects_empty_keys() {
        assert!(OwnerRef::character("").is_err());
        assert!(OwnerRef::group("  ").is_err());
        let owner = OwnerRef::character("alice.png").unwrap();
        assert_eq!(owner.to_string(), "character:alice.png");
        assert_eq!(owner.kind(), OwnerKind::Character);
    }

    #[test]
    fn at_vis_contract_07_log_view_treats_missing_slots_as_none() {
        let log: Vec<Option<bool>> = vec![Some(true), None, Some(false)];
        assert_eq!(log.entry_count(), 3);
        assert_eq!(log.entry_hidden(1), None);
        assert_eq!(log.entry_hidden(0), Some(true));
        assert_eq!(log.entry_hidden(9), None);
    }

    #[test]
    fn at_vis_contract_08_display_value_hides_zero() {
        assert_eq!(VisibilityPolicy::user_saved(0, 4).display_value(), None);
        assert_eq!(VisibilityPolicy::user_saved(6, 4).display_value(), Some(6));
    }
}
