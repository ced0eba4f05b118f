//! End-to-end scenarios: an agent and a remote talking through the
//! in-process broker.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use vrpc::{
    args, Agent, AgentOptions, Arg, ClassRegistry, CreateRequest, DeleteRequest, DiscoveryEvent,
    Error, EventEmitter, MemoryBroker, Remote, RemoteCallback, RemoteOptions, StaticCall, Status,
};

struct Counter {
    value: AtomicI64,
}

#[derive(Default)]
struct Hub {
    handlers: Mutex<HashMap<String, RemoteCallback>>,
}

fn test_registry() -> ClassRegistry {
    let registry = ClassRegistry::new();
    registry
        .class::<Counter>("Counter")
        .constructor(|args| {
            let start = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(Counter {
                value: AtomicI64::new(start),
            })
        })
        .member("increment", |c, _ctx| async move {
            Ok(json!(c.value.fetch_add(1, Ordering::SeqCst) + 1))
        })
        .member("echo", |_c, ctx| async move {
            Ok(ctx.arg(0).cloned().unwrap_or(Value::Null))
        })
        .member("sleep", |_c, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!("late"))
        })
        .register();
    registry
        .class::<()>("Foo")
        .static_fn("greet", |ctx| async move {
            let name = ctx.arg(0).and_then(Value::as_str).unwrap_or("");
            Ok(json!(format!("hi {name}")))
        })
        .static_fn("slow", |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!("late"))
        })
        .static_fn("later", |ctx| async move {
            let (token, resolver) = ctx.promise();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                resolver.resolve(Ok(json!("done")));
            });
            Ok(token)
        })
        .register();
    registry
        .class::<()>("Caller")
        .constructor(|_args| Ok(()))
        .member("run", |_i, ctx| async move {
            match ctx.callback(1) {
                Some(cb) => {
                    cb.invoke(vec![json!(42), json!("x")]);
                    cb.invoke(vec![json!(43), json!("y")]);
                    Ok(Value::Null)
                }
                None => Err("expected a callback".to_owned()),
            }
        })
        .register();
    registry
        .class::<Hub>("Hub")
        .constructor(|_args| Ok(Hub::default()))
        .member("on", |hub, ctx| async move {
            let event = ctx
                .arg(0)
                .and_then(Value::as_str)
                .ok_or("expected an event name")?
                .to_owned();
            let cb = ctx.callback(1).ok_or("expected a callback")?;
            let mut handlers = hub.handlers.lock().unwrap();
            if handlers.get(&event).map(|h| h.id()) == Some(cb.id()) {
                return Err("Repeated event registration".to_owned());
            }
            handlers.insert(event, cb);
            Ok(Value::Null)
        })
        .member("fire", |hub, ctx| async move {
            let event = ctx
                .arg(0)
                .and_then(Value::as_str)
                .ok_or("expected an event name")?;
            let handler = hub.handlers.lock().unwrap().get(event).cloned();
            if let Some(handler) = handler {
                handler.invoke(ctx.args()[1..].to_vec());
            }
            Ok(Value::Null)
        })
        .register();
    registry
}

async fn start_agent(broker: &MemoryBroker) -> tokio::task::JoinHandle<Result<(), Error>> {
    let agent = Agent::new(AgentOptions::new("d").agent("a1"), test_registry()).unwrap();
    let connector = broker.connector();
    let handle = tokio::spawn(agent.serve_via(connector));
    // let the agent subscribe and publish its retained info
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle
}

fn remote_options() -> RemoteOptions {
    RemoteOptions::new()
        .domain("d")
        .agent("a1")
        .timeout(Duration::from_millis(2000))
}

async fn connect_remote(broker: &MemoryBroker) -> Remote {
    Remote::connect_via(broker.connector(), remote_options())
        .await
        .unwrap()
}

#[tokio::test]
async fn static_call_round_trip() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = connect_remote(&broker).await;

    let reply = remote
        .call_static(StaticCall::new("Foo", "greet").args(args!["bob"]))
        .await
        .unwrap();
    assert_eq!(reply, json!("hi bob"));
    remote.end().await.unwrap();
}

#[tokio::test]
async fn instance_lifecycle() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = connect_remote(&broker).await;

    let proxy = remote
        .create(CreateRequest::new("Counter").instance("c1").args(args![0]))
        .await
        .unwrap();
    assert_eq!(proxy.target_id(), "c1");
    assert!(proxy.has_method("increment"));
    assert_eq!(proxy.call("increment", args![]).await.unwrap(), json!(1));
    assert_eq!(proxy.call("increment", args![]).await.unwrap(), json!(2));

    remote
        .delete_instance(DeleteRequest::new("Counter", "c1"))
        .await
        .unwrap();

    let err = proxy.call("increment", args![]).await.unwrap_err();
    match err {
        Error::Remote(e) => assert!(e.contains("Instance not found"), "{e}"),
        other => panic!("expected a remote error, got {other}"),
    }
    remote.end().await.unwrap();
}

#[tokio::test]
async fn echo_round_trips_arbitrary_values() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = connect_remote(&broker).await;

    let proxy = remote
        .create(CreateRequest::new("Counter").instance("c2"))
        .await
        .unwrap();
    let value = json!({"a": [1, 2.5, {"b": "c"}], "d": null, "e": true});
    let reply = proxy
        .call("echo", vec![Arg::from(value.clone())])
        .await
        .unwrap();
    assert_eq!(reply, value);
    remote.end().await.unwrap();
}

#[tokio::test]
async fn one_shot_callback_delivers_exactly_once() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = connect_remote(&broker).await;

    let proxy = remote
        .create(CreateRequest::new("Caller").instance("caller"))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cb = Arg::callback(move |args| {
        let _ = tx.send(args);
    });
    proxy.call("run", vec![Arg::from("evt"), cb]).await.unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first, vec![json!(42), json!("x")]);
    // the second agent-side invocation of the same one-shot id is dropped
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    remote.end().await.unwrap();
}

struct ChannelEmitter {
    tx: mpsc::UnboundedSender<(String, Vec<Value>)>,
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: &str, args: Vec<Value>) {
        let _ = self.tx.send((event.to_owned(), args));
    }
}

#[tokio::test]
async fn emitter_pairs_stay_registered() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = connect_remote(&broker).await;

    let proxy = remote
        .create(CreateRequest::new("Caller").instance("caller2"))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let emitter = Arc::new(ChannelEmitter { tx });
    proxy
        .call("run", vec![Arg::from("evt"), Arg::emitter(emitter, "tick")])
        .await
        .unwrap();

    // unlike a bare callback, the emitter sink survives the first delivery
    assert_eq!(
        rx.recv().await.unwrap(),
        ("tick".to_owned(), vec![json!(42), json!("x")])
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        ("tick".to_owned(), vec![json!(43), json!("y")])
    );
    remote.end().await.unwrap();
}

#[tokio::test]
async fn repeated_event_registration_is_swallowed() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = connect_remote(&broker).await;

    let proxy = remote
        .create(CreateRequest::new("Hub").instance("h1"))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx2 = tx.clone();
    proxy
        .on("data", move |args| {
            let _ = tx.send(args);
        })
        .await
        .unwrap();
    // same event, same tunnel id: the agent rejects, the remote swallows
    proxy
        .on("data", move |args| {
            let _ = tx2.send(args);
        })
        .await
        .unwrap();

    proxy.call("fire", args!["data", 1]).await.unwrap();
    proxy.call("fire", args!["data", 2]).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), vec![json!(1)]);
    assert_eq!(rx.recv().await.unwrap(), vec![json!(2)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "each emission must arrive once");
    remote.end().await.unwrap();
}

#[tokio::test]
async fn agent_loss_flips_presence_to_offline() {
    let broker = MemoryBroker::new();
    let agent = start_agent(&broker).await;
    let remote = connect_remote(&broker).await;

    assert_eq!(remote.get_available_agents("d").await, vec!["a1"]);
    let mut events = remote.events();

    // simulate process loss; the broker delivers the retained will
    agent.abort();

    let offline = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(DiscoveryEvent::Agent { agent, status, .. })
                    if agent == "a1" && status == Status::Offline =>
                {
                    return true;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(offline, "no offline agent event arrived");

    assert!(remote.get_available_agents("d").await.is_empty());
    // the entry itself survives with its classes, only the status flips
    let tree = remote.availability().await;
    let entry = tree.agent("d", "a1").unwrap();
    assert_eq!(entry.status, Status::Offline);
    assert!(entry.classes.contains_key("Counter"));
    remote.end().await.unwrap();
}

#[tokio::test]
async fn slow_reply_times_out_and_is_dropped_late() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = Remote::connect_via(
        broker.connector(),
        remote_options().timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap();

    let err = remote
        .call_static(StaticCall::new("Foo", "slow"))
        .await
        .unwrap_err();
    match err {
        Error::Timeout(ms) => assert_eq!(ms, 100),
        other => panic!("expected a timeout, got {other}"),
    }
    // the late reply at ~500 ms finds no pending entry and is dropped
    tokio::time::sleep(Duration::from_millis(600)).await;
    let reply = remote
        .call_static(StaticCall::new("Foo", "greet").args(args!["eve"]))
        .await;
    // fast replies still come through within the short deadline
    assert_eq!(reply.unwrap(), json!("hi eve"));
    remote.end().await.unwrap();
}

#[tokio::test]
async fn promise_tokens_chain_into_the_original_call() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = connect_remote(&broker).await;

    let reply = remote
        .call_static(StaticCall::new("Foo", "later"))
        .await
        .unwrap();
    assert_eq!(reply, json!("done"));
    remote.end().await.unwrap();
}

#[tokio::test]
async fn reconnect_fails_in_flight_calls() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = Arc::new(connect_remote(&broker).await);

    let in_flight = {
        let remote = remote.clone();
        tokio::spawn(async move { remote.call_static(StaticCall::new("Foo", "slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    remote.reconnect_with_token("fresh-token").await.unwrap();
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::Transport(_)),
        "expected a transport error, got {err}"
    );

    // the rebuilt connection works and rediscovers the agent
    let reply = remote
        .call_static(StaticCall::new("Foo", "greet").args(args!["bob"]))
        .await
        .unwrap();
    assert_eq!(reply, json!("hi bob"));
}

#[tokio::test]
async fn wildcard_defaults_reject_concrete_operations() {
    let broker = MemoryBroker::new();
    let _agent = start_agent(&broker).await;
    let remote = Remote::connect_via(broker.connector(), RemoteOptions::new())
        .await
        .unwrap();

    let err = remote
        .call_static(StaticCall::new("Foo", "greet").args(args!["bob"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err}");

    // explicit overrides make the same call succeed
    let reply = remote
        .call_static(
            StaticCall::new("Foo", "greet")
                .args(args!["bob"])
                .domain("d")
                .agent("a1"),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!("hi bob"));
    remote.end().await.unwrap();
}
