//! Availability-tree scenarios: retained info replay, instance tracking,
//! graceful shutdown and multi-domain listings.

use serde_json::{json, Value};
use std::time::Duration;
use vrpc::{
    args, Agent, AgentOptions, ClassRegistry, CreateRequest, DeleteRequest, MemoryBroker, Remote,
    RemoteOptions,
};

fn gadget_registry() -> ClassRegistry {
    let registry = ClassRegistry::new();
    registry
        .class::<()>("Gadget")
        .constructor(|_args| Ok(()))
        .member("poke", |_g, _ctx| async move { Ok(json!("poked")) })
        .member("peek", |_g, ctx| async move {
            Ok(ctx.arg(0).cloned().unwrap_or(Value::Null))
        })
        .static_fn("version", |_ctx| async move { Ok(json!("1.0")) })
        .register();
    registry
}

async fn start_agent(
    broker: &MemoryBroker,
    domain: &str,
    name: &str,
) -> (vrpc::StopHandle, tokio::task::JoinHandle<Result<(), vrpc::Error>>) {
    let agent = Agent::new(AgentOptions::new(domain).agent(name), gadget_registry()).unwrap();
    let stop = agent.stop_handle();
    let handle = tokio::spawn(agent.serve_via(broker.connector()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    (stop, handle)
}

#[tokio::test]
async fn late_joiner_rebuilds_the_tree_from_retained_info() {
    let broker = MemoryBroker::new();
    let (_stop, _task) = start_agent(&broker, "d", "a1").await;

    // the remote connects long after the info was published
    tokio::time::sleep(Duration::from_millis(100)).await;
    let remote = Remote::connect_via(
        broker.connector(),
        RemoteOptions::new().domain("d").agent("a1"),
    )
    .await
    .unwrap();

    assert_eq!(remote.get_available_agents("d").await, vec!["a1"]);
    assert_eq!(remote.get_available_classes("d", "a1").await, vec!["Gadget"]);
    assert_eq!(
        remote.get_available_member_functions("d", "a1", "Gadget").await,
        vec!["peek", "poke"]
    );
    assert_eq!(
        remote.get_available_static_functions("d", "a1", "Gadget").await,
        vec!["version"]
    );
    remote.end().await.unwrap();
}

#[tokio::test]
async fn instance_lists_track_creation_and_deletion() {
    let broker = MemoryBroker::new();
    let (_stop, _task) = start_agent(&broker, "d", "a1").await;
    let remote = Remote::connect_via(
        broker.connector(),
        RemoteOptions::new().domain("d").agent("a1"),
    )
    .await
    .unwrap();

    assert!(remote.get_available_instances("d", "a1", "Gadget").await.is_empty());

    let proxy = remote
        .create(CreateRequest::new("Gadget").instance("g1"))
        .await
        .unwrap();
    assert_eq!(proxy.call("poke", args![]).await.unwrap(), json!("poked"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        remote.get_available_instances("d", "a1", "Gadget").await,
        vec!["g1"]
    );

    remote
        .delete_instance(DeleteRequest::new("Gadget", "g1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(remote.get_available_instances("d", "a1", "Gadget").await.is_empty());
    remote.end().await.unwrap();
}

#[tokio::test]
async fn attaching_to_a_named_instance() {
    let broker = MemoryBroker::new();
    let (_stop, _task) = start_agent(&broker, "d", "a1").await;
    let remote = Remote::connect_via(
        broker.connector(),
        RemoteOptions::new().domain("d").agent("a1"),
    )
    .await
    .unwrap();

    remote
        .create(CreateRequest::new("Gadget").instance("shared"))
        .await
        .unwrap();
    let attached = remote
        .get_instance(CreateRequest::new("Gadget").instance("shared"))
        .await
        .unwrap();
    assert_eq!(attached.target_id(), "shared");
    assert_eq!(
        attached.call("peek", args![7]).await.unwrap(),
        json!(7)
    );

    let missing = remote
        .get_instance(CreateRequest::new("Gadget").instance("ghost"))
        .await;
    assert!(missing.is_err());
    remote.end().await.unwrap();
}

#[tokio::test]
async fn graceful_stop_goes_offline_without_a_will() {
    let broker = MemoryBroker::new();
    let (stop, task) = start_agent(&broker, "d", "a1").await;
    let remote = Remote::connect_via(
        broker.connector(),
        RemoteOptions::new().domain("d").agent("a1"),
    )
    .await
    .unwrap();
    assert_eq!(remote.get_available_agents("d").await, vec!["a1"]);

    stop.stop();
    task.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(remote.get_available_agents("d").await.is_empty());
    remote.end().await.unwrap();
}

#[tokio::test]
async fn wildcard_remote_sees_every_domain() {
    let broker = MemoryBroker::new();
    let (_s1, _t1) = start_agent(&broker, "d1", "a1").await;
    let (_s2, _t2) = start_agent(&broker, "d2", "a2").await;

    let remote = Remote::connect_via(broker.connector(), RemoteOptions::new())
        .await
        .unwrap();
    assert_eq!(remote.get_available_domains().await, vec!["d1", "d2"]);
    assert_eq!(remote.get_available_agents("d1").await, vec!["a1"]);
    assert_eq!(remote.get_available_agents("d2").await, vec!["a2"]);
    remote.end().await.unwrap();
}
