#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use curtain_kernel_contracts::ph1vis::{OwnerRef, VisibilityPolicy};
use curtain_kernel_contracts::MonotonicTimeNs;

use crate::ph1vis::{
    ActiveChat, ChatId, OwnerRecord, Ph1VisStore, PolicyWriteTicket, StorageError,
    TranscriptEntry,
};

/// Typed repository interface for PH1.VIS owner rows and their mirrored policy.
pub trait Ph1VisOwnerRepo {
    fn insert_owner_row(&mut self, record: OwnerRecord) -> Result<(), StorageError>;
    fn owner_row(&self, owner: &OwnerRef) -> Option<&OwnerRecord>;
    fn owner_rows(&self) -> &BTreeMap<OwnerRef, OwnerRecord>;
    fn policy_row(&self, owner: &OwnerRef) -> Option<VisibilityPolicy>;
    fn write_policy_row(
        &mut self,
        owner: &OwnerRef,
        policy: VisibilityPolicy,
        now: MonotonicTimeNs,
    ) -> Result<PolicyWriteTicket, StorageError>;
    fn rollback_policy_row(
        &mut self,
        ticket: &PolicyWriteTicket,
        now: MonotonicTimeNs,
    ) -> Result<bool, StorageError>;
}

/// Typed repository interface for the host transcript the synchronizer flags.
pub trait Ph1VisTranscriptRepo {
    fn open_chat_row(&mut self, owner: &OwnerRef, chat_id: ChatId) -> Result<(), StorageError>;
    fn close_active_chat_row(&mut self);
    fn active_chat_row(&self) -> Option<&ActiveChat>;
    fn active_entry_rows(&self) -> Option<&[TranscriptEntry]>;
    fn append_active_entry_row(&mut self, entry: TranscriptEntry) -> Result<u32, StorageError>;
    fn remove_active_entry_row(&mut self, index: u32) -> Result<TranscriptEntry, StorageError>;
    fn replace_active_entry_rows(
        &mut self,
        entries: Vec<TranscriptEntry>,
    ) -> Result<(), StorageError>;
    fn set_active_entry_hidden_row(
        &mut self,
        index: u32,
        hidden: bool,
    ) -> Result<bool, StorageError>;
}

impl Ph1VisOwnerRepo for Ph1VisStore {
    fn insert_owner_row(&mut self, record: OwnerRecord) -> Result<(), StorageError> {
        self.insert_owner(record)
    }

    fn owner_row(&self, owner: &OwnerRef) -> Option<&OwnerRecord> {
        self.owner(owner)
    }

    fn owner_rows(&self) -> &BTreeMap<OwnerRef, OwnerRecord> {
        self.owners()
    }

    fn policy_row(&self, owner: &OwnerRef) -> Option<VisibilityPolicy> {
        self.policy(owner)
    }

    fn write_policy_row(
        &mut self,
        owner: &OwnerRef,
        policy: VisibilityPolicy,
        now: MonotonicTimeNs,
    ) -> Result<PolicyWriteTicket, StorageError> {
        self.policy_optimistic_write(owner, policy, now)
    }

    fn rollback_policy_row(
        &mut self,
        ticket: &PolicyWriteTicket,
        now: MonotonicTimeNs,
    ) -> Result<bool, StorageError> {
        self.policy_rollback(ticket, now)
    }
}

impl Ph1VisTranscriptRepo for Ph1VisStore {
    fn open_chat_row(&mut self, owner: &OwnerRef, chat_id: ChatId) -> Result<(), StorageError> {
        self.open_chat(owner, chat_id)
    }

    fn close_active_chat_row(&mut self) {
        self.close_active_chat()
    }

    fn active_chat_row(&self) -> Option<&ActiveChat> {
        self.active_chat()
    }

    fn active_entry_rows(&self) -> Option<&[TranscriptEntry]> {
        self.active_entries()
    }

    fn append_active_entry_row(&mut self, entry: TranscriptEntry) -> Result<u32, StorageError> {
        self.append_active_entry(entry)
    }

    fn remove_active_entry_row(&mut self, index: u32) -> Result<TranscriptEntry, StorageError> {
        self.remove_active_entry(index)
    }

    fn replace_active_entry_rows(
        &mut self,
        entries: Vec<TranscriptEntry>,
    ) -> Result<(), StorageError> {
        self.replace_active_transcript(entries)
    }

    fn set_active_entry_hidden_row(
        &mut self,
        index: u32,
        hidden: bool,
    ) -> Result<bool, StorageError> {
        self.set_active_entry_hidden(index, hidden)
    }
}
