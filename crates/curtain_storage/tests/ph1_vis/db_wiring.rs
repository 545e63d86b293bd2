#![forbid(unsafe_code)]

use curtain_kernel_contracts::ph1vis::{OwnerRef, VisibilityPolicy};
use curtain_kernel_contracts::MonotonicTimeNs;
use curtain_storage::ph1vis::{ChatId, OwnerRecord, Ph1VisStore, StorageError, TranscriptEntry};
use curtain_storage::repo::{Ph1VisOwnerRepo, Ph1VisTranscriptRepo};
use serde_json::{json, Map, Value};

fn character() -> OwnerRef {
    OwnerRef::character("dbw_alice.png").unwrap()
}

fn group() -> OwnerRef {
    OwnerRef::group("dbw_group_1").unwrap()
}

fn group_fields() -> Map<String, Value> {
    match json!({"members": ["dbw_alice.png"], "avatar_url": "group.png"}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn store_with_owners() -> Ph1VisStore {
    let mut s = Ph1VisStore::new_in_memory();
    s.insert_owner_row(
        OwnerRecord::v1(
            character(),
            "Alice".to_string(),
            Map::new(),
            None,
            MonotonicTimeNs(1),
        )
        .unwrap(),
    )
    .unwrap();
    s.insert_owner_row(
        OwnerRecord::v1(
            group(),
            "Party".to_string(),
            group_fields(),
            Some(VisibilityPolicy::user_saved(2, 0)),
            MonotonicTimeNs(1),
        )
        .unwrap(),
    )
    .unwrap();
    s
}

#[test]
fn at_vis_db_01_owner_rows_are_unique_and_policies_are_per_owner() {
    let mut s = store_with_owners();
    let dup = s.insert_owner_row(
        OwnerRecord::v1(
            character(),
            "Alice again".to_string(),
            Map::new(),
            None,
            MonotonicTimeNs(2),
        )
        .unwrap(),
    );
    assert!(matches!(dup, Err(StorageError::DuplicateKey { .. })));
    assert_eq!(s.owner_rows().len(), 2);
    assert_eq!(s.policy_row(&character()), None);
    assert_eq!(
        s.policy_row(&group()),
        Some(VisibilityPolicy::user_saved(2, 0))
    );
    assert_eq!(
        s.owner_row(&group()).unwrap().host_fields.get("avatar_url"),
        Some(&json!("group.png"))
    );
}

#[test]
fn at_vis_db_02_policy_write_requires_existing_owner() {
    let mut s = store_with_owners();
    let stranger = OwnerRef::character("nobody.png").unwrap();
    let out = s.write_policy_row(
        &stranger,
        VisibilityPolicy::user_saved(1, 0),
        MonotonicTimeNs(3),
    );
    assert!(matches!(
        out,
        Err(StorageError::ForeignKeyViolation { table: "owners", .. })
    ));
}

#[test]
fn at_vis_db_03_optimistic_write_then_rollback_round_trip() {
    let mut s = store_with_owners();
    let ticket = s
        .write_policy_row(&group(), VisibilityPolicy::user_saved(2, 9), MonotonicTimeNs(4))
        .unwrap();
    assert_eq!(ticket.previous, Some(VisibilityPolicy::user_saved(2, 0)));
    assert_eq!(s.owner_row(&group()).unwrap().policy_write_seq, 1);

    assert!(s.rollback_policy_row(&ticket, MonotonicTimeNs(5)).unwrap());
    assert_eq!(
        s.policy_row(&group()),
        Some(VisibilityPolicy::user_saved(2, 0))
    );
    assert!(!s.rollback_policy_row(&ticket, MonotonicTimeNs(6)).unwrap());
}

#[test]
fn at_vis_db_04_chats_are_isolated_per_owner_and_chat_id() {
    let mut s = store_with_owners();
    s.open_chat_row(&character(), ChatId::new("c1").unwrap())
        .unwrap();
    s.append_active_entry_row(TranscriptEntry::v1(true, "hello"))
        .unwrap();
    s.append_active_entry_row(TranscriptEntry::v1(false, "hi"))
        .unwrap();

    s.open_chat_row(&group(), ChatId::new("c1").unwrap()).unwrap();
    assert_eq!(s.active_entry_rows().unwrap().len(), 0);
    s.append_active_entry_row(TranscriptEntry::hidden_v1(false, "system note"))
        .unwrap();

    s.open_chat_row(&character(), ChatId::new("c1").unwrap())
        .unwrap();
    let entries = s.active_entry_rows().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| !e.hidden));
    assert_eq!(
        s.active_chat_row().unwrap().owner,
        character()
    );
}

#[test]
fn at_vis_db_05_remove_and_replace_mutate_only_active_chat() {
    let mut s = store_with_owners();
    s.open_chat_row(&character(), ChatId::new("c1").unwrap())
        .unwrap();
    for i in 0..4 {
        s.append_active_entry_row(TranscriptEntry::v1(i % 2 == 0, format!("m{i}")))
            .unwrap();
    }
    let removed = s.remove_active_entry_row(1).unwrap();
    assert_eq!(removed.text, "m1");
    assert_eq!(s.active_entry_rows().unwrap().len(), 3);
    assert!(s.remove_active_entry_row(3).is_err());

    s.replace_active_entry_rows(vec![TranscriptEntry::v1(true, "fresh")])
        .unwrap();
    assert_eq!(s.active_entry_rows().unwrap().len(), 1);

    s.close_active_chat_row();
    assert!(s.active_entry_rows().is_none());
    assert!(matches!(
        s.set_active_entry_hidden_row(0, true),
        Err(StorageError::NoActiveRow { .. })
    ));
}

#[test]
fn at_vis_db_06_open_chat_for_unknown_owner_fails_closed() {
    let mut s = store_with_owners();
    let stranger = OwnerRef::group("ghost_group").unwrap();
    assert!(matches!(
        s.open_chat_row(&stranger, ChatId::new("c1").unwrap()),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
    assert!(s.active_chat_row().is_none());
}
