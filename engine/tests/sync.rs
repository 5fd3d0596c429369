//! Remote reconciliation, connectivity and the live channel.

mod common;

use common::{create, record, Client};
use rebound_engine::memory::{MemoryServer, RestCall};
use rebound_engine::{
    DatabaseEvent, DatabaseOptions, LiveMessage, ModelEvent, NetworkEvent, Record, Status,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::{Arc, Mutex};

// ============================================================================
// Reconciliation
// ============================================================================

#[test]
fn unknown_remote_data_is_adopted() {
    let client = Client::new();
    let tasks = client.tasks();
    let added = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&added);
    tasks.on(move |event: &DatabaseEvent| {
        if let DatabaseEvent::ModelAdded { model, remote } = event {
            seen.lock().unwrap().push((model.key(), *remote));
        }
    });

    let model = tasks
        .put_remote_data(record(json!({"id": 1, "name": "server"})), None, None, false)
        .unwrap();

    assert_eq!(model.key(), "1");
    assert_eq!(model.status(), Status::Synced);
    assert!(model.is_saved());
    assert!(!model.has_changes());
    assert_eq!(*added.lock().unwrap(), vec![("1".to_string(), true)]);
    let stored = client.backend.store_for("task").record("1").unwrap();
    assert_eq!(stored["name"], json!("server"));
}

#[test]
fn remote_data_without_key_is_ignored() {
    let client = Client::new();
    let tasks = client.tasks();

    let result = tasks.put_remote_data(record(json!({"name": "anonymous"})), None, None, false);

    assert!(result.is_none());
    assert!(tasks.is_empty());
}

#[test]
fn local_edits_are_not_clobbered() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    task.set("name", json!("local"));

    let conflicts = Arc::new(Mutex::new(Record::new()));
    let seen = Arc::clone(&conflicts);
    task.on(move |event: &ModelEvent| {
        if let ModelEvent::PartialUpdate { conflicts, .. } = event {
            *seen.lock().unwrap() = conflicts.clone();
        }
    });

    tasks.put_remote_data(
        record(json!({"id": "1", "name": "server", "done": true})),
        None,
        None,
        false,
    );

    assert_eq!(task.get("name"), Some(json!("local")));
    assert_eq!(task.get("done"), Some(json!(true)));
    assert_eq!(*conflicts.lock().unwrap(), record(json!({"name": "server"})));
    // the local edit is now a change against the server value
    assert_eq!(task.get_changes(), record(json!({"name": "local"})));
}

#[test]
fn overwrite_replaces_local_edits() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    task.set("name", json!("local"));

    tasks.put_remote_data(record(json!({"id": "1", "name": "server"})), None, None, true);

    assert_eq!(task.get("name"), Some(json!("server")));
    assert!(task.get_changes().is_empty());
}

#[test]
fn stale_revisions_are_ignored() {
    let client = Client::new();
    let tasks = client.define(
        DatabaseOptions::new("task")
            .fields(["id", "name", "version"])
            .revision("version"),
    );
    let task = create(&tasks, json!({"id": "1", "name": "current", "version": 2}));

    tasks.put_remote_data(
        record(json!({"id": "1", "name": "older", "version": 1})),
        None,
        None,
        false,
    );
    assert_eq!(task.get("name"), Some(json!("current")));

    tasks.put_remote_data(
        record(json!({"id": "1", "name": "newer", "version": 3})),
        None,
        None,
        false,
    );
    assert_eq!(task.get("name"), Some(json!("newer")));
    assert_eq!(task.get("version"), Some(json!(3)));
}

#[test]
fn conflict_response_merges_server_copy() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    client.backend.rest_for("task").fail_next(409);

    let conflicted = Arc::new(Mutex::new(false));
    let seen = Arc::clone(&conflicted);
    task.on(move |event: &ModelEvent| {
        if matches!(event, ModelEvent::RemoteSaveConflict { .. }) {
            *seen.lock().unwrap() = true;
        }
    });
    task.set("name", json!("b"));
    task.save();

    assert!(*conflicted.lock().unwrap());
    assert_eq!(task.status(), Status::Synced);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn remote_merge_never_clobbers_local_edits(
        edit in "[a-z]{1,6}",
        remote_name in "[a-z]{0,6}",
        remote_done in any::<bool>(),
    ) {
        let client = Client::new();
        let tasks = client.tasks();
        let task = create(&tasks, json!({"id": "1", "name": "original", "done": false}));
        let edit = format!("local {edit}");
        task.set("name", json!(edit));

        tasks.put_remote_data(
            record(json!({"id": "1", "name": remote_name, "done": remote_done})),
            None,
            None,
            false,
        );

        let saved = task.saved().unwrap();
        prop_assert_eq!(task.get("name"), Some(json!(edit)));
        prop_assert_eq!(task.get("done"), Some(json!(remote_done)));
        prop_assert_eq!(&saved["name"], &json!(remote_name));
        prop_assert_eq!(&saved["done"], &json!(remote_done));
    }
}

// ============================================================================
// Connectivity
// ============================================================================

#[test]
fn offline_save_resumes_when_online() {
    let client = Client::new();
    let tasks = client.tasks();
    let network = client.registry.network().clone();
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&transitions);
    network.on(move |event: &NetworkEvent| seen.lock().unwrap().push(*event));

    client.backend.set_offline(true);
    let task = create(&tasks, json!({"id": "1", "name": "offline"}));

    assert_eq!(task.status(), Status::SavePending);
    assert!(!network.is_online());
    assert!(client.server().record("task", "1").is_none());

    client.backend.set_offline(false);
    network.set_online(true);

    assert_eq!(task.status(), Status::Synced);
    assert_eq!(client.server().record("task", "1").unwrap()["name"], json!("offline"));
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![NetworkEvent::Offline, NetworkEvent::Online]
    );
}

#[test]
fn offline_load_retries_when_online() {
    let client = Client::new();
    client.server().insert("task", "1", record(json!({"id": "1", "name": "remote"})));
    client.backend.rest_for("task").set_offline(true);

    let tasks = client.tasks();
    assert!(tasks.is_ready());
    assert!(!tasks.is_remote_loaded());
    assert!(tasks.is_empty());

    client.backend.set_offline(false);
    client.registry.network().set_online(true);

    assert!(tasks.is_remote_loaded());
    assert_eq!(tasks.get("1").unwrap().get("name"), Some(json!("remote")));
}

#[test]
fn refresh_waits_for_pending_operations() {
    let client = Client::new();
    let tasks = client.tasks();
    let rest = client.backend.rest_for("task");

    rest.set_offline(true);
    create(&tasks, json!({"id": "1", "name": "a"}));
    rest.set_offline(false);
    rest.hold();
    rest.clear_calls();

    // the resumed save is in flight when connectivity returns
    client.registry.network().set_online(true);
    assert_eq!(rest.calls(), vec![RestCall::Create("1".into())]);

    rest.flush();
    assert_eq!(
        rest.calls(),
        vec![RestCall::Create("1".into()), RestCall::All]
    );
}

// ============================================================================
// Live Channel
// ============================================================================

#[test]
fn saves_fan_out_to_other_clients() {
    let server = MemoryServer::new_shared();
    let alice = Client::with_server(Arc::clone(&server));
    let bob = Client::with_server(Arc::clone(&server));
    let alice_tasks = alice.tasks();
    let bob_tasks = bob.tasks();

    let task = create(&alice_tasks, json!({"id": "1", "name": "shared"}));

    let copy = bob_tasks.get("1").unwrap();
    assert_eq!(copy.get("name"), Some(json!("shared")));
    assert_eq!(copy.status(), Status::Synced);
    assert_eq!(
        alice.backend.live_for("task").unwrap().published(),
        vec![LiveMessage::save("1", record(json!({"id": "1", "name": "shared"})))]
    );

    task.set("name", json!("renamed"));
    task.save();
    assert_eq!(copy.get("name"), Some(json!("renamed")));

    task.remove();
    assert!(bob_tasks.get("1").is_none());
    assert_eq!(copy.status(), Status::Removed);
}

#[test]
fn live_remove_keeps_unsent_local_changes() {
    let server = MemoryServer::new_shared();
    let alice = Client::with_server(Arc::clone(&server));
    let bob = Client::with_server(Arc::clone(&server));
    let alice_tasks = alice.tasks();
    let bob_tasks = bob.tasks();

    let task = create(&alice_tasks, json!({"id": "1", "name": "shared"}));
    let copy = bob_tasks.get("1").unwrap();
    copy.set("name", json!("bob's edit"));

    task.remove();

    assert!(bob_tasks.get("1").is_some());
    assert!(!copy.is_saved());
    copy.save();
    assert_eq!(copy.status(), Status::Synced);
    assert_eq!(server.record("task", "1").unwrap()["name"], json!("bob's edit"));
}
