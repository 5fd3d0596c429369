//! Save and remove lifecycles through the operation queue.

mod common;

use common::{create, record, Client};
use rebound_engine::memory::{MemoryBackend, RestCall};
use rebound_engine::{
    CacheMode, DatabaseOptions, LoadMode, ModelEvent, OperationKind, Registry, SingleOptions, Status,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

// ============================================================================
// Saving
// ============================================================================

#[test]
fn create_reaches_local_store_and_server() {
    let client = Client::new();
    let tasks = client.tasks();

    let task = create(&tasks, json!({"id": "1", "name": "write docs"}));

    assert_eq!(task.status(), Status::Synced);
    assert!(task.is_saved());
    assert!(task.is_registered());
    assert_eq!(
        client.server().record("task", "1").unwrap()["name"],
        json!("write docs")
    );
    let stored = client.backend.store_for("task").record("1").unwrap();
    assert_eq!(stored["name"], json!("write docs"));
    assert_eq!(stored["$status"], json!(0));
}

#[test]
fn generated_key_when_none_given() {
    let client = Client::new();
    let tasks = client.tasks();

    let task = create(&tasks, json!({"name": "untitled"}));

    assert!(task.has_key());
    assert_eq!(task.key().len(), 36);
    assert!(tasks.get(&task.key()).is_some());
}

#[test]
fn save_pending_while_request_in_flight() {
    let client = Client::new();
    let tasks = client.tasks();
    let rest = client.backend.rest_for("task");
    rest.hold();

    let task = create(&tasks, json!({"id": "1", "name": "pending"}));

    assert_eq!(task.status(), Status::SavePending);
    assert_eq!(task.queued_operations(), vec![OperationKind::SaveRemote]);
    let stored = client.backend.store_for("task").record("1").unwrap();
    assert_eq!(stored["$status"], json!(1));
    assert!(client.server().record("task", "1").is_none());

    assert_eq!(rest.flush(), 1);
    assert_eq!(task.status(), Status::Synced);
    assert!(!task.is_busy());
    assert_eq!(
        client.backend.store_for("task").record("1").unwrap()["$status"],
        json!(0)
    );
}

#[test]
fn second_save_sends_only_changes() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a", "done": false}));

    task.set("done", json!(true));
    assert_eq!(task.get_changes(), record(json!({"done": true})));
    task.save();

    let rest = client.backend.rest_for("task");
    assert_eq!(
        rest.calls(),
        vec![RestCall::All, RestCall::Create("1".into()), RestCall::Update("1".into())]
    );
    assert!(task.get_changes().is_empty());
    assert_eq!(client.server().record("task", "1").unwrap()["done"], json!(true));
}

#[test]
fn edits_made_during_save_survive_the_response() {
    let client = Client::new();
    let tasks = client.tasks();
    let rest = client.backend.rest_for("task");
    rest.hold();

    let task = create(&tasks, json!({"id": "1", "name": "first"}));
    task.set("name", json!("second"));
    rest.flush();

    assert_eq!(task.get("name"), Some(json!("second")));
    assert_eq!(task.get_changes(), record(json!({"name": "second"})));
}

#[test]
fn rejected_save_is_reported() {
    let client = Client::new();
    let tasks = client.tasks();
    client.backend.rest_for("task").fail_next(422);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let task = tasks.instantiate(record(json!({"id": "1", "name": "invalid"})));
    let seen = Arc::clone(&failures);
    task.on(move |event: &ModelEvent| {
        if let ModelEvent::RemoteSaveFailure { status } = event {
            seen.lock().unwrap().push(*status);
        }
    });
    task.save();

    assert_eq!(*failures.lock().unwrap(), vec![422]);
    assert_eq!(task.status(), Status::Synced);
    assert!(client.server().record("task", "1").is_none());
}

#[test]
fn update_of_record_gone_remotely_removes_model() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    client.server().delete("task", "1");

    task.set("name", json!("b"));
    task.save();

    assert_eq!(task.status(), Status::Removed);
    assert!(tasks.get("1").is_none());
    assert!(client.backend.store_for("task").record("1").is_none());
}

#[test]
fn update_answered_with_gone_removes_model() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&failures);
    task.on(move |event: &ModelEvent| {
        if let ModelEvent::RemoteSaveFailure { status } = event {
            seen.lock().unwrap().push(*status);
        }
    });
    client.backend.rest_for("task").fail_next(410);

    task.set("name", json!("b"));
    task.save();

    assert_eq!(*failures.lock().unwrap(), vec![410]);
    assert_eq!(task.status(), Status::Removed);
    assert!(tasks.get("1").is_none());
    assert!(client.backend.store_for("task").is_empty());
}

// ============================================================================
// Cache modes
// ============================================================================

#[test]
fn pending_cache_keeps_records_only_until_synced() {
    let client = Client::new();
    let tasks = client.define(common::task_options().cache(CacheMode::Pending));
    let store = client.backend.store_for("task");
    client.backend.set_offline(true);

    let task = create(&tasks, json!({"id": "1", "name": "offline"}));

    assert_eq!(task.status(), Status::SavePending);
    assert_eq!(store.len(), 1);
    assert_eq!(store.record("1").unwrap()["$status"], json!(1));

    client.backend.set_offline(false);
    client.registry.network().set_online(true);

    assert_eq!(task.status(), Status::Synced);
    assert_eq!(client.server().record("task", "1").unwrap()["name"], json!("offline"));
    assert!(store.is_empty());
}

#[test]
fn no_cache_never_touches_the_store() {
    let client = Client::new();
    let tasks = client.define(common::task_options().cache(CacheMode::None));
    let store = client.backend.store_for("task");

    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    assert!(store.is_empty());
    assert_eq!(task.status(), Status::Synced);
    assert!(task.local().is_none());

    task.set("name", json!("b"));
    task.save();
    assert!(store.is_empty());
    assert_eq!(client.server().record("task", "1").unwrap()["name"], json!("b"));

    task.remove();
    assert!(store.is_empty());
    assert_eq!(task.status(), Status::Removed);
    assert!(client.server().record("task", "1").is_none());
}

// ============================================================================
// Removing
// ============================================================================

#[test]
fn remove_deletes_everywhere() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));

    task.remove();

    assert_eq!(task.status(), Status::Removed);
    assert!(tasks.is_empty());
    assert!(client.server().record("task", "1").is_none());
    assert!(client.backend.store_for("task").is_empty());
}

#[test]
fn remove_leaves_registry_before_request_completes() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    let rest = client.backend.rest_for("task");
    rest.hold();

    task.remove();

    assert_eq!(task.status(), Status::RemovePending);
    assert!(tasks.get("1").is_none());
    let stored = client.backend.store_for("task").record("1").unwrap();
    assert_eq!(stored["$status"], json!(2));

    // remote data for a key being removed must not bring it back
    assert!(tasks
        .put_remote_data(record(json!({"id": "1", "name": "a"})), None, None, false)
        .is_none());
    assert!(tasks.get("1").is_none());

    rest.flush();
    assert_eq!(task.status(), Status::Removed);
    assert!(client.server().record("task", "1").is_none());
}

#[test]
fn remove_of_unsaved_model_skips_server() {
    let client = Client::new();
    let tasks = client.tasks();
    client.backend.set_offline(true);
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    assert_eq!(task.status(), Status::SavePending);
    client.backend.rest_for("task").clear_calls();

    task.remove();

    assert_eq!(task.status(), Status::Removed);
    assert!(client.backend.rest_for("task").calls().is_empty());
    assert!(client.backend.store_for("task").is_empty());
}

#[test]
fn remove_interrupts_pending_save() {
    let client = Client::new();
    let tasks = client.tasks();
    let rest = client.backend.rest_for("task");
    rest.hold();

    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    task.save_with(Some(record(json!({"name": "b"}))), rebound_engine::Cascade::ALL);
    assert_eq!(
        task.queued_operations(),
        vec![OperationKind::SaveRemote, OperationKind::SaveLocal]
    );

    task.remove();
    assert_eq!(
        task.queued_operations(),
        vec![OperationKind::SaveRemote, OperationKind::RemoveLocal]
    );

    rest.flush();
    assert_eq!(task.status(), Status::Removed);
    assert!(client.server().record("task", "1").is_none());
    assert_eq!(
        rest.calls()
            .into_iter()
            .filter(|call| !matches!(call, RestCall::All))
            .collect::<Vec<_>>(),
        vec![RestCall::Create("1".into()), RestCall::Remove("1".into())]
    );
}

#[test]
fn rejected_remove_restores_model() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    client.backend.rest_for("task").fail_next(403);

    task.remove();

    assert_eq!(task.status(), Status::Synced);
    assert!(tasks.get("1").is_some());
    assert!(client.server().record("task", "1").is_some());
}

// ============================================================================
// Restarts
// ============================================================================

#[test]
fn pending_save_resumes_after_restart() {
    let first = Client::new();
    let tasks = first.tasks();
    first.backend.set_offline(true);
    let task = create(&tasks, json!({"id": "1", "name": "offline edit"}));
    assert_eq!(task.status(), Status::SavePending);
    let stored = first.backend.store_for("task").record("1").unwrap();
    assert_eq!(stored["$status"], json!(1));

    // a new process sharing the server finds the record in its store
    let backend = Arc::new(MemoryBackend::with_server(Arc::clone(first.server())));
    backend.store_for("task").insert("1", stored);
    let registry = Registry::new(backend.clone());
    let tasks = registry.define(common::task_options()).unwrap();

    let resumed = tasks.get("1").unwrap();
    assert_eq!(resumed.status(), Status::Synced);
    assert_eq!(
        backend.server().record("task", "1").unwrap()["name"],
        json!("offline edit")
    );
    let creates = backend
        .rest_for("task")
        .calls()
        .into_iter()
        .filter(|call| matches!(call, RestCall::Create(_)))
        .count();
    assert_eq!(creates, 1);
}

#[test]
fn pending_remove_resumes_after_restart() {
    let first = Client::new();
    let tasks = first.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    first.backend.set_offline(true);
    task.remove();
    assert_eq!(task.status(), Status::RemovePending);
    let stored = first.backend.store_for("task").record("1").unwrap();

    let backend = Arc::new(MemoryBackend::with_server(Arc::clone(first.server())));
    backend.store_for("task").insert("1", stored);
    let registry = Registry::new(backend.clone());
    let tasks = registry.define(common::task_options()).unwrap();

    assert!(tasks.get("1").is_none());
    assert!(backend.server().record("task", "1").is_none());
    assert!(backend.store_for("task").is_empty());
}

#[test]
fn refresh_drops_synced_models_missing_remotely() {
    let client = Client::new();
    client.server().insert("task", "2", record(json!({"id": "2", "name": "remote"})));
    let store = client.backend.store_for("task");
    store.insert(
        "1",
        record(json!({"id": "1", "name": "gone", "$status": 0, "$saved": {"id": "1", "name": "gone"}})),
    );
    store.insert(
        "3",
        record(json!({"id": "3", "name": "unsent", "$status": 1, "$saving": {"id": "3", "name": "unsent"}})),
    );

    let tasks = client.tasks();
    assert!(tasks.is_ready());
    assert!(tasks.is_remote_loaded());

    assert!(tasks.get("1").is_none());
    assert!(store.record("1").is_none());
    assert_eq!(tasks.get("2").unwrap().get("name"), Some(json!("remote")));
    assert_eq!(tasks.get("3").unwrap().status(), Status::Synced);
    assert!(client.server().record("task", "3").is_some());
}

#[test]
fn local_removal_lets_the_key_come_back() {
    let client = Client::new();
    let tasks = client.tasks();
    client.backend.set_offline(true);
    let task = create(&tasks, json!({"id": "1", "name": "draft"}));
    let other = create(&tasks, json!({"id": "2", "name": "draft"}));
    task.remove();
    other.remove();
    assert_eq!(task.status(), Status::Removed);
    assert_eq!(other.status(), Status::Removed);

    client.backend.set_offline(false);
    client.registry.network().set_online(true);
    assert!(client.server().record("task", "1").is_none());

    // another client creates the same keys
    let adopted = tasks.put_remote_data(record(json!({"id": "1", "name": "elsewhere"})), None, None, false);
    assert!(adopted.is_some());
    assert_eq!(tasks.get("1").unwrap().get("name"), Some(json!("elsewhere")));

    client.server().insert("task", "2", record(json!({"id": "2", "name": "elsewhere"})));
    tasks.refresh();
    assert_eq!(tasks.get("2").unwrap().get("name"), Some(json!("elsewhere")));
}

#[test]
fn stored_write_resumes_when_its_target_loads_later() {
    let first = Client::new();
    let task = record(json!({"id": "T1", "name": "t", "list_id": "L1"}));
    first.server().insert("task", "T1", task.clone());
    let backend = Arc::new(MemoryBackend::with_server(Arc::clone(first.server())));
    backend.store_for("list").insert(
        "L1",
        record(json!({"id": "L1", "name": "offline", "$status": 1, "$saving": {"id": "L1", "name": "offline"}})),
    );
    backend.store_for("task").insert("T1", task);
    let registry = Registry::new(backend.clone());

    // the owner is defined before the list it points at
    let tasks = registry
        .define(
            DatabaseOptions::new("task")
                .fields(["id", "name"])
                .belongs_to("list", SingleOptions::to("list")),
        )
        .unwrap();
    let lists = registry
        .define(DatabaseOptions::new("list").fields(["id", "name"]))
        .unwrap();

    let list = lists.get("L1").unwrap();
    assert_eq!(list.status(), Status::Synced);
    assert_eq!(backend.server().record("list", "L1").unwrap()["name"], json!("offline"));
    assert!(!backend
        .rest_for("list")
        .calls()
        .contains(&RestCall::Get("L1".into())));

    let task = tasks.get("T1").unwrap();
    assert!(task.related("list").model().unwrap().ptr_eq(&list));
    assert_eq!(task.status(), Status::Synced);
}

#[test]
fn fetch_resumes_write_found_in_local_store() {
    let client = Client::new();
    client.backend.store_for("task").insert(
        "1",
        record(json!({"id": "1", "name": "offline", "$status": 1, "$saving": {"id": "1", "name": "offline"}})),
    );
    let tasks = client.define(common::task_options().load(LoadMode::None));

    let task = tasks.fetch("1");

    assert_eq!(task.status(), Status::Synced);
    assert!(tasks.get("1").unwrap().ptr_eq(&task));
    assert_eq!(client.server().record("task", "1").unwrap()["name"], json!("offline"));
    assert!(client.backend.store_for("task").record("1").is_some());
}

// ============================================================================
// Fetching
// ============================================================================

#[test]
fn fetch_pulls_unknown_key_from_server() {
    let client = Client::new();
    client.server().insert("task", "7", record(json!({"id": "7", "name": "remote"})));
    let tasks = client.define(common::task_options().load(LoadMode::None));
    assert!(tasks.get("7").is_none());

    let task = tasks.fetch("7");

    assert_eq!(task.get("name"), Some(json!("remote")));
    assert!(tasks.get("7").unwrap().ptr_eq(&task));
    assert!(client.backend.store_for("task").record("7").is_some());
}

#[test]
fn fetch_prefers_registered_model() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    let rest = client.backend.rest_for("task");
    rest.clear_calls();

    assert!(tasks.fetch("1").ptr_eq(&task));
    assert!(rest.calls().is_empty());
}

#[test]
fn grab_runs_once_ready() {
    let client = Client::new();
    let tasks = client.tasks();
    create(&tasks, json!({"id": "1", "name": "a"}));

    let found = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&found);
    tasks.grab("1".to_string(), move |model| {
        *seen.lock().unwrap() = model.map(|model| model.key());
    });

    assert!(tasks.is_ready());
    assert_eq!(*found.lock().unwrap(), Some("1".to_string()));
}

#[test]
fn refresh_picks_up_server_changes() {
    let client = Client::new();
    let tasks = client.tasks();
    let task = create(&tasks, json!({"id": "1", "name": "a"}));
    client.server().insert("task", "1", record(json!({"id": "1", "name": "edited elsewhere"})));

    task.refresh();

    assert_eq!(task.get("name"), Some(json!("edited elsewhere")));
    assert!(!task.has_changes());
    assert!(client.registry.get("task").unwrap().ptr_eq(&tasks));
}
