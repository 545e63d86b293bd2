#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use curtain_kernel_contracts::ph1vis::{LogFlagView, OwnerRef, VisibilityPolicy};
use curtain_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("no active row in {table}")]
    NoActiveRow { table: &'static str },
    #[error("index {index} out of range for {table} (len {len})")]
    IndexOutOfRange {
        table: &'static str,
        index: u32,
        len: u32,
    },
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "chat_id",
                reason: "must not be empty",
            });
        }
        if id.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "chat_id",
                reason: "must be <= 256 chars",
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Host-owned owner row. `host_fields` carries whatever the host stores on the
/// record besides the policy, so a full-record write can send it back intact.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerRecord {
    pub owner: OwnerRef,
    pub display_name: String,
    pub host_fields: Map<String, Value>,
    pub policy: Option<VisibilityPolicy>,
    pub policy_write_seq: u64,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
}

impl OwnerRecord {
    pub fn v1(
        owner: OwnerRef,
        display_name: String,
        host_fields: Map<String, Value>,
        policy: Option<VisibilityPolicy>,
        now: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            owner,
            display_name,
            host_fields,
            policy,
            policy_write_seq: 0,
            created_at: now,
            updated_at: now,
        };
        record.validate()?;
        Ok(record)
    }
}

impl Validate for OwnerRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.owner.validate()?;
        if self.display_name.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "owner_record.display_name",
                reason: "must not be empty",
            });
        }
        if self.display_name.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: "owner_record.display_name",
                reason: "must be <= 128 chars",
            });
        }
        if self.updated_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "owner_record.updated_at",
                reason: "must be >= created_at",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub from_user: bool,
    pub text: String,
    pub hidden: bool,
}

impl TranscriptEntry {
    pub fn v1(from_user: bool, text: impl Into<String>) -> Self {
        Self {
            from_user,
            text: text.into(),
            hidden: false,
        }
    }

    pub fn hidden_v1(from_user: bool, text: impl Into<String>) -> Self {
        Self {
            hidden: true,
            ..Self::v1(from_user, text)
        }
    }
}

/// Hidden-flag view over a borrowed transcript.
#[derive(Debug, Clone, Copy)]
pub struct EntryFlags<'a>(pub &'a [TranscriptEntry]);

impl LogFlagView for EntryFlags<'_> {
    fn entry_count(&self) -> u32 {
        u32::try_from(self.0.len()).unwrap_or(u32::MAX)
    }

    fn entry_hidden(&self, index: u32) -> Option<bool> {
        self.0.get(index as usize).map(|e| e.hidden)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChat {
    pub owner: OwnerRef,
    pub chat_id: ChatId,
}

/// Handle for undoing one optimistic policy write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyWriteTicket {
    pub owner: OwnerRef,
    pub seq: u64,
    pub previous: Option<VisibilityPolicy>,
    pub written: VisibilityPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct Ph1VisStore {
    owners: BTreeMap<OwnerRef, OwnerRecord>,
    transcripts: BTreeMap<(OwnerRef, ChatId), Vec<TranscriptEntry>>,
    active: Option<ActiveChat>,
}

impl Ph1VisStore {
    pub fn new_in_memory() -> Self {
        Self {
            owners: BTreeMap::new(),
            transcripts: BTreeMap::new(),
            active: None,
        }
    }

    pub fn insert_owner(&mut self, record: OwnerRecord) -> Result<(), StorageError> {
        record.validate()?;
        if self.owners.contains_key(&record.owner) {
            return Err(StorageError::DuplicateKey {
                table: "owners",
                key: record.owner.to_string(),
            });
        }
        self.owners.insert(record.owner.clone(), record);
        Ok(())
    }

    pub fn owner(&self, owner: &OwnerRef) -> Option<&OwnerRecord> {
        self.owners.get(owner)
    }

    pub fn owners(&self) -> &BTreeMap<OwnerRef, OwnerRecord> {
        &self.owners
    }

    pub fn policy(&self, owner: &OwnerRef) -> Option<VisibilityPolicy> {
        self.owners.get(owner).and_then(|r| r.policy)
    }

    /// Replaces the mirrored policy ahead of the remote write and bumps the
    /// owner's write sequence.
    pub fn policy_optimistic_write(
        &mut self,
        owner: &OwnerRef,
        policy: VisibilityPolicy,
        now: MonotonicTimeNs,
    ) -> Result<PolicyWriteTicket, StorageError> {
        let record = self.owner_mut(owner)?;
        let previous = record.policy.replace(policy);
        record.policy_write_seq = record.policy_write_seq.saturating_add(1);
        record.updated_at = now.max(record.updated_at);
        Ok(PolicyWriteTicket {
            owner: owner.clone(),
            seq: record.policy_write_seq,
            previous,
            written: policy,
        })
    }

    /// Restores the pre-write policy unless a newer write landed since.
    /// Returns whether the mirror was rolled back.
    pub fn policy_rollback(
        &mut self,
        ticket: &PolicyWriteTicket,
        now: MonotonicTimeNs,
    ) -> Result<bool, StorageError> {
        let record = self.owner_mut(&ticket.owner)?;
        if record.policy_write_seq != ticket.seq {
            return Ok(false);
        }
        record.policy = ticket.previous;
        record.policy_write_seq = record.policy_write_seq.saturating_add(1);
        record.updated_at = now.max(record.updated_at);
        Ok(true)
    }

    /// Opens (creating if needed) a chat for `owner` and makes it the active log.
    pub fn open_chat(&mut self, owner: &OwnerRef, chat_id: ChatId) -> Result<(), StorageError> {
        if !self.owners.contains_key(owner) {
            return Err(StorageError::ForeignKeyViolation {
                table: "transcripts.owner",
                key: owner.to_string(),
            });
        }
        self.transcripts
            .entry((owner.clone(), chat_id.clone()))
            .or_default();
        self.active = Some(ActiveChat {
            owner: owner.clone(),
            chat_id,
        });
        Ok(())
    }

    pub fn close_active_chat(&mut self) {
        self.active = None;
    }

    pub fn active_chat(&self) -> Option<&ActiveChat> {
        self.active.as_ref()
    }

    pub fn transcript(&self, owner: &OwnerRef, chat_id: &ChatId) -> Option<&[TranscriptEntry]> {
        self.transcripts
            .get(&(owner.clone(), chat_id.clone()))
            .map(Vec::as_slice)
    }

    pub fn active_entries(&self) -> Option<&[TranscriptEntry]> {
        let active = self.active.as_ref()?;
        self.transcript(&active.owner, &active.chat_id)
    }

    pub fn append_active_entry(&mut self, entry: TranscriptEntry) -> Result<u32, StorageError> {
        let entries = self.active_entries_mut()?;
        entries.push(entry);
        Ok(u32::try_from(entries.len() - 1).unwrap_or(u32::MAX))
    }

    pub fn remove_active_entry(&mut self, index: u32) -> Result<TranscriptEntry, StorageError> {
        let entries = self.active_entries_mut()?;
        check_index(entries, index)?;
        Ok(entries.remove(index as usize))
    }

    pub fn replace_active_transcript(
        &mut self,
        replacement: Vec<TranscriptEntry>,
    ) -> Result<(), StorageError> {
        let entries = self.active_entries_mut()?;
        *entries = replacement;
        Ok(())
    }

    /// Returns whether the flag actually changed.
    pub fn set_active_entry_hidden(&mut self, index: u32, hidden: bool) -> Result<bool, StorageError> {
        let entries = self.active_entries_mut()?;
        check_index(entries, index)?;
        let entry = &mut entries[index as usize];
        let changed = entry.hidden != hidden;
        entry.hidden = hidden;
        Ok(changed)
    }

    fn owner_mut(&mut self, owner: &OwnerRef) -> Result<&mut OwnerRecord, StorageError> {
        self.owners
            .get_mut(owner)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "owners",
                key: owner.to_string(),
            })
    }

    fn active_entries_mut(&mut self) -> Result<&mut Vec<TranscriptEntry>, StorageError> {
        let active = self
            .active
            .as_ref()
            .ok_or(StorageError::NoActiveRow {
                table: "transcripts",
            })?;
        self.transcripts
            .get_mut(&(active.owner.clone(), active.chat_id.clone()))
            .ok_or(StorageError::NoActiveRow {
                table: "transcripts",
            })
    }
}

/// Flags of the active transcript. No active chat reads as an empty log.
impl LogFlagView for Ph1VisStore {
    fn entry_count(&self) -> u32 {
        self.active_entries()
            .map_or(0, |entries| EntryFlags(entries).entry_count())
    }

    fn entry_hidden(&self, index: u32) -> Option<bool> {
        self.active_entries()
            .and_then(|entries| EntryFlags(entries).entry_hidden(index))
    }
}

fn check_index(entries: &[TranscriptEntry], index: u32) -> Result<(), StorageError> {
    if index as usize >= entries.len() {
        return Err(StorageError::IndexOutOfRange {
            table: "transcripts.entries",
            index,
            len: EntryFlags(entries).entry_count(),
        });
    }
    Ok(())
}
