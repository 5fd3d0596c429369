//! Relation maintenance across entities.

mod common;

use common::{create, record, Client};
use rebound_engine::{
    Cascade, Database, DatabaseOptions, HasManyOptions, ModelEvent, RelationValue, SingleOptions,
    Status, ThroughOptions,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

fn lists_and_tasks(client: &Client, cascade_remove: bool) -> (Database, Database) {
    let tasks = client.define(DatabaseOptions::new("task").fields(["id", "name", "list_id"]));
    let lists = client.define(DatabaseOptions::new("list").fields(["id", "name"]).has_many(
        "tasks",
        HasManyOptions {
            cascade_remove,
            ..HasManyOptions::to("task")
        },
    ));
    (lists, tasks)
}

fn keys(value: RelationValue) -> Vec<String> {
    let mut keys: Vec<String> = value.models().iter().map(|model| model.key()).collect();
    keys.sort();
    keys
}

// ============================================================================
// hasMany
// ============================================================================

#[test]
fn relate_writes_foreign_key_and_saves() {
    let client = Client::new();
    let (lists, tasks) = lists_and_tasks(&client, false);
    let list = create(&lists, json!({"id": "L", "name": "groceries"}));
    let task = tasks.instantiate(record(json!({"id": "T", "name": "milk"})));

    assert!(list.relate("tasks", &task));

    assert_eq!(task.get("list_id"), Some(json!("L")));
    assert!(task.is_registered());
    assert_eq!(task.status(), Status::Synced);
    assert_eq!(client.server().record("task", "T").unwrap()["list_id"], json!("L"));
    assert!(list.is_related("tasks", &task));
    assert_eq!(keys(list.related("tasks")), vec!["T".to_string()]);
}

#[test]
fn unrelate_clears_foreign_key() {
    let client = Client::new();
    let (lists, tasks) = lists_and_tasks(&client, false);
    let list = create(&lists, json!({"id": "L"}));
    let task = create(&tasks, json!({"id": "T", "list_id": "L"}));
    assert_eq!(keys(list.related("tasks")), vec!["T".to_string()]);

    assert!(list.unrelate("tasks", Some((&task).into())));

    assert_eq!(task.get("list_id"), Some(Value::Null));
    assert!(list.related("tasks").is_empty());
    assert_eq!(task.status(), Status::Synced);
    assert_eq!(client.server().record("task", "T").unwrap()["list_id"], Value::Null);
}

#[test]
fn models_pointing_at_owner_are_adopted() {
    let client = Client::new();
    let (lists, tasks) = lists_and_tasks(&client, false);
    let list = create(&lists, json!({"id": "L"}));

    create(&tasks, json!({"id": "A", "list_id": "L"}));
    tasks.put_remote_data(record(json!({"id": "B", "list_id": "L"})), None, None, false);
    create(&tasks, json!({"id": "C", "list_id": "other"}));

    assert_eq!(keys(list.related("tasks")), vec!["A".to_string(), "B".to_string()]);

    // a member whose key changes away from the owner is dropped
    tasks.get("A").unwrap().set("list_id", json!("other"));
    assert_eq!(keys(list.related("tasks")), vec!["B".to_string()]);
}

#[test]
fn removed_member_leaves_relation() {
    let client = Client::new();
    let (lists, tasks) = lists_and_tasks(&client, false);
    let list = create(&lists, json!({"id": "L"}));
    let task = create(&tasks, json!({"id": "T", "list_id": "L"}));

    task.remove();

    assert!(list.related("tasks").is_empty());
    assert_eq!(list.status(), Status::Synced);
}

#[test]
fn cascade_remove_takes_members_first() {
    let client = Client::new();
    let (lists, tasks) = lists_and_tasks(&client, true);
    let list = create(&lists, json!({"id": "L"}));
    let first = create(&tasks, json!({"id": "A", "list_id": "L"}));
    let second = create(&tasks, json!({"id": "B", "list_id": "L"}));

    let order = Arc::new(Mutex::new(Vec::new()));
    for model in [&list, &first, &second] {
        let seen = Arc::clone(&order);
        let key = model.key();
        model.on(move |event: &ModelEvent| {
            if matches!(event, ModelEvent::Removed) {
                seen.lock().unwrap().push(key.clone());
            }
        });
    }

    list.remove();

    let order = order.lock().unwrap().clone();
    assert_eq!(order.len(), 3);
    assert_eq!(order.last(), Some(&"L".to_string()));
    assert!(tasks.is_empty());
    assert!(client.server().records("task").is_empty());
    assert!(client.server().record("list", "L").is_none());
}

#[test]
fn unrelate_with_cascade_remove_removes_member() {
    let client = Client::new();
    let (lists, tasks) = lists_and_tasks(&client, true);
    let list = create(&lists, json!({"id": "L"}));
    let task = create(&tasks, json!({"id": "T", "list_id": "L"}));

    list.unrelate("tasks", None);

    assert_eq!(task.status(), Status::Removed);
    assert!(client.server().record("task", "T").is_none());
    assert_eq!(list.status(), Status::Synced);
}

#[test]
fn owner_created_later_adopts_current_members() {
    let client = Client::new();
    let (lists, tasks) = lists_and_tasks(&client, false);
    create(&tasks, json!({"id": "A", "list_id": "L"}));
    let moved = create(&tasks, json!({"id": "B", "list_id": "L"}));
    let joined = create(&tasks, json!({"id": "C", "list_id": "other"}));
    moved.set("list_id", json!("other"));
    joined.set("list_id", json!("L"));

    let list = create(&lists, json!({"id": "L"}));

    assert_eq!(keys(list.related("tasks")), vec!["A".to_string(), "C".to_string()]);
}

#[test]
fn dropped_owners_release_database_listeners() {
    let client = Client::new();
    let (lists, tasks) = lists_and_tasks(&client, false);
    let baseline = tasks.listener_count();

    let owners: Vec<_> = (0..5)
        .map(|i| lists.instantiate(record(json!({"id": format!("L{i}")}))))
        .collect();
    for owner in &owners {
        assert!(owner.related("tasks").is_empty());
    }
    assert!(tasks.listener_count() > baseline);

    drop(owners);
    assert_eq!(tasks.listener_count(), baseline);
}

// ============================================================================
// belongsTo
// ============================================================================

fn tasks_belonging_to_lists(client: &Client, cascade: Option<Cascade>) -> (Database, Database) {
    let lists = client.define(DatabaseOptions::new("list").fields(["id", "name"]));
    let tasks = client.define(DatabaseOptions::new("task").fields(["id", "name"]).belongs_to(
        "list",
        SingleOptions {
            cascade,
            ..SingleOptions::to("list")
        },
    ));
    (lists, tasks)
}

#[test]
fn belongs_to_resolves_from_foreign_key() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, None);
    let list = create(&lists, json!({"id": "L"}));

    let task = create(&tasks, json!({"id": "T", "list_id": "L"}));

    assert!(task.related("list").model().unwrap().ptr_eq(&list));
    assert!(tasks.fields().contains(&"list_id".to_string()));
}

#[test]
fn belongs_to_relate_sets_foreign_key() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, None);
    let list = create(&lists, json!({"id": "L"}));
    let task = create(&tasks, json!({"id": "T"}));

    task.relate("list", &list);

    assert_eq!(task.get("list_id"), Some(json!("L")));
    assert_eq!(client.server().record("task", "T").unwrap()["list_id"], json!("L"));

    task.unrelate("list", None);
    assert_eq!(task.get("list_id"), Some(Value::Null));
    assert!(task.related("list").is_empty());
}

#[test]
fn relate_reports_foreign_key_write() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, None);
    let list = create(&lists, json!({"id": "L"}));
    let task = create(&tasks, json!({"id": "T"}));
    let updates = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&updates);
    task.on(move |event: &ModelEvent| {
        if let ModelEvent::ForeignKeyUpdate { relation } = event {
            seen.lock().unwrap().push(relation.clone());
        }
    });

    task.relate("list", &list);
    task.relate("list", &list);

    assert_eq!(*updates.lock().unwrap(), vec!["list".to_string()]);
}

#[test]
fn foreign_key_write_switches_target() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, None);
    create(&lists, json!({"id": "L1"}));
    let second = create(&lists, json!({"id": "L2"}));
    let task = create(&tasks, json!({"id": "T", "list_id": "L1"}));

    task.set("list_id", json!("L2"));

    assert!(task.related("list").model().unwrap().ptr_eq(&second));

    task.set("list_id", Value::Null);
    assert!(task.related("list").is_empty());
}

#[test]
fn remote_foreign_key_change_switches_target() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, None);
    let first = create(&lists, json!({"id": "L1"}));
    let second = create(&lists, json!({"id": "L2"}));
    let task = create(&tasks, json!({"id": "T", "list_id": "L1"}));
    assert!(task.related("list").model().unwrap().ptr_eq(&first));

    tasks.put_remote_data(record(json!({"id": "T", "list_id": "L2"})), None, None, false);

    assert_eq!(task.get("list_id"), Some(json!("L2")));
    assert!(task.related("list").model().unwrap().ptr_eq(&second));

    // the previous target no longer reaches the owner
    first.remove();
    assert_eq!(task.get("list_id"), Some(json!("L2")));
}

#[test]
fn dropped_owner_stops_watching_its_target() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, None);
    let list = create(&lists, json!({"id": "L"}));
    let baseline = list.listener_count();

    let task = tasks.instantiate(record(json!({"id": "T", "list_id": "L"})));
    assert!(task.related("list").model().unwrap().ptr_eq(&list));
    assert_eq!(list.listener_count(), baseline + 1);

    drop(task);
    assert_eq!(list.listener_count(), baseline);
}

#[test]
fn removed_target_clears_foreign_key() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, None);
    let list = create(&lists, json!({"id": "L"}));
    let task = create(&tasks, json!({"id": "T", "list_id": "L"}));

    list.remove();

    assert_eq!(task.status(), Status::Synced);
    assert_eq!(task.get("list_id"), Some(Value::Null));
    assert_eq!(client.server().record("task", "T").unwrap()["list_id"], Value::Null);
}

#[test]
fn removed_target_removes_owner_with_cascade() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, Some(Cascade::ALL));
    let list = create(&lists, json!({"id": "L"}));
    let task = create(&tasks, json!({"id": "T", "list_id": "L"}));

    list.remove();

    assert_eq!(task.status(), Status::Removed);
    assert!(tasks.is_empty());
}

#[test]
fn remote_save_waits_for_target() {
    let client = Client::new();
    let (lists, tasks) = tasks_belonging_to_lists(&client, None);
    let list_rest = client.backend.rest_for("list");
    list_rest.hold();

    let list = create(&lists, json!({"id": "L"}));
    let task = tasks.instantiate(record(json!({"id": "T"})));
    task.relate("list", &list);
    task.save();

    assert_eq!(list.status(), Status::SavePending);
    assert!(client.server().record("task", "T").is_none());

    list_rest.flush();

    assert_eq!(list.status(), Status::Synced);
    assert_eq!(task.status(), Status::Synced);
    assert_eq!(client.server().record("task", "T").unwrap()["list_id"], json!("L"));
}

// ============================================================================
// hasOne
// ============================================================================

#[test]
fn has_one_replacement_removes_previous() {
    let client = Client::new();
    let profiles = client.define(DatabaseOptions::new("profile").fields(["id", "bio"]));
    let users = client.define(
        DatabaseOptions::new("user")
            .fields(["id", "name"])
            .has_one("profile", SingleOptions::to("profile")),
    );
    let user = create(&users, json!({"id": "U"}));
    let first = create(&profiles, json!({"id": "P1"}));
    let second = create(&profiles, json!({"id": "P2"}));

    user.relate("profile", &first);
    assert_eq!(user.get("profile_id"), Some(json!("P1")));

    user.relate("profile", &second);
    assert_eq!(user.get("profile_id"), Some(json!("P2")));
    assert_eq!(first.status(), Status::Removed);
    assert!(client.server().record("profile", "P1").is_none());

    user.remove();
    assert_eq!(second.status(), Status::Removed);
    assert!(profiles.is_empty());
}

// ============================================================================
// Polymorphic
// ============================================================================

#[test]
fn polymorphic_belongs_to_uses_discriminator() {
    let client = Client::new();
    let posts = client.define(DatabaseOptions::new("post").fields(["id", "title"]));
    let photos = client.define(DatabaseOptions::new("photo").fields(["id", "url"]));
    let discriminators: BTreeMap<String, String> = [
        ("post".to_string(), "post".to_string()),
        ("photo".to_string(), "photo".to_string()),
    ]
    .into_iter()
    .collect();
    let comments = client.define(
        DatabaseOptions::new("comment")
            .fields(["id", "body"])
            .belongs_to(
                "commentable",
                SingleOptions {
                    discriminator: Some("commentable_type".into()),
                    discriminators,
                    ..SingleOptions::default()
                },
            ),
    );
    let post = create(&posts, json!({"id": "1"}));
    let photo = create(&photos, json!({"id": "1"}));

    let on_post = create(
        &comments,
        json!({"id": "c1", "commentable_id": "1", "commentable_type": "post"}),
    );
    assert!(on_post.related("commentable").model().unwrap().ptr_eq(&post));

    let comment = create(&comments, json!({"id": "c2"}));
    comment.relate("commentable", &photo);
    assert_eq!(comment.get("commentable_id"), Some(json!("1")));
    assert_eq!(comment.get("commentable_type"), Some(json!("photo")));
    assert!(comment.related("commentable").model().unwrap().ptr_eq(&photo));
}

// ============================================================================
// hasManyThrough
// ============================================================================

fn users_and_groups(client: &Client, cascade_remove: bool) -> (Database, Database, Database) {
    let groups = client.define(DatabaseOptions::new("group").fields(["id", "name"]));
    let memberships =
        client.define(DatabaseOptions::new("membership").fields(["id", "user_id", "group_id"]));
    let users = client.define(DatabaseOptions::new("user").fields(["id", "name"]).has_many_through(
        "groups",
        ThroughOptions {
            cascade_remove,
            ..ThroughOptions::to("group", "membership")
        },
    ));
    (users, groups, memberships)
}

#[test]
fn through_relate_creates_join_record() {
    let client = Client::new();
    let (users, groups, memberships) = users_and_groups(&client, false);
    let user = create(&users, json!({"id": "U"}));
    let group = create(&groups, json!({"id": "G"}));

    user.relate("groups", &group);

    assert_eq!(keys(user.related("groups")), vec!["G".to_string()]);
    let joins = memberships.all();
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].get("user_id"), Some(json!("U")));
    assert_eq!(joins[0].get("group_id"), Some(json!("G")));
    assert_eq!(joins[0].status(), Status::Synced);
    assert_eq!(client.server().records("membership").len(), 1);
}

#[test]
fn through_unrelate_removes_join_record_only() {
    let client = Client::new();
    let (users, groups, memberships) = users_and_groups(&client, false);
    let user = create(&users, json!({"id": "U"}));
    let group = create(&groups, json!({"id": "G"}));
    user.relate("groups", &group);

    user.unrelate("groups", Some((&group).into()));

    assert!(user.related("groups").is_empty());
    assert!(memberships.is_empty());
    assert!(client.server().records("membership").is_empty());
    assert_eq!(group.status(), Status::Synced);
}

#[test]
fn through_loads_existing_join_records() {
    let client = Client::new();
    let (users, groups, memberships) = users_and_groups(&client, false);
    create(&groups, json!({"id": "G1"}));
    create(&groups, json!({"id": "G2"}));
    create(&memberships, json!({"id": "m1", "user_id": "U", "group_id": "G1"}));
    create(&memberships, json!({"id": "m2", "user_id": "U", "group_id": "G2"}));
    create(&memberships, json!({"id": "m3", "user_id": "V", "group_id": "G2"}));

    let user = create(&users, json!({"id": "U"}));

    assert_eq!(
        keys(user.related("groups")),
        vec!["G1".to_string(), "G2".to_string()]
    );
}

#[test]
fn removed_related_model_drops_its_join_record() {
    let client = Client::new();
    let (users, groups, memberships) = users_and_groups(&client, false);
    let user = create(&users, json!({"id": "U"}));
    let group = create(&groups, json!({"id": "G"}));
    user.relate("groups", &group);

    group.remove();

    assert!(user.related("groups").is_empty());
    assert!(memberships.is_empty());
}

#[test]
fn through_cascade_remove_takes_related_models() {
    let client = Client::new();
    let (users, groups, memberships) = users_and_groups(&client, true);
    let user = create(&users, json!({"id": "U"}));
    let group = create(&groups, json!({"id": "G"}));
    user.relate("groups", &group);

    user.remove();

    assert_eq!(group.status(), Status::Removed);
    assert!(groups.is_empty());
    assert!(memberships.is_empty());
}
