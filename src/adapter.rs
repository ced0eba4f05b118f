//! The seam between the agent's dispatch loop and user code. An [`Adapter`]
//! owns the instance table and fills each request's `data` with `r` or `e`;
//! [`ClassRegistry`] is the built-in adapter that maps class names to
//! constructors and type-erased method closures.

use crate::topic::{CREATE, CREATE_NAMED, DELETE, GET_NAMED};
use crate::tunnel::TUNNEL_PREFIX;
use crate::wire::{
    self, positional_args, set_error, set_return, ClassInfo, RpcMessage, PROMISE_PREFIX,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Reflects callable classes into the agent. `dispatch` mutates the
/// message's `data` in place to carry the result (`r`) or an error (`e`).
#[async_trait]
pub trait Adapter: Send + Sync {
    fn class_names(&self) -> Vec<String>;

    fn class_info(&self, class: &str) -> Option<ClassInfo>;

    async fn dispatch(&self, class: &str, msg: &mut RpcMessage, outbox: &Outbox);
}

/// Queue for asynchronous outbound invocations (tunneled callbacks and
/// promise completions). Methods never publish directly; the agent's serve
/// loop drains this queue to the original sender.
#[derive(Clone)]
pub struct Outbox {
    tx: UnboundedSender<(String, RpcMessage)>,
}

impl Outbox {
    pub(crate) fn channel() -> (Outbox, UnboundedReceiver<(String, RpcMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox { tx }, rx)
    }

    pub fn send(&self, sender_topic: &str, msg: RpcMessage) {
        let _ = self.tx.send((sender_topic.to_owned(), msg));
    }
}

/// What a method body receives: its positional arguments plus the plumbing
/// to call back into the remote peer.
#[derive(Clone)]
pub struct CallContext {
    args: Vec<Value>,
    sender: String,
    outbox: Outbox,
}

impl CallContext {
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// A handle for the tunneled callable the remote passed at `index`, if
    /// the argument there is a tunnel id.
    pub fn callback(&self, index: usize) -> Option<RemoteCallback> {
        let id = self.args.get(index)?.as_str()?;
        if !id.starts_with(TUNNEL_PREFIX) {
            return None;
        }
        Some(RemoteCallback {
            id: id.to_owned(),
            sender: self.sender.clone(),
            outbox: self.outbox.clone(),
        })
    }

    /// Creates a promise token. Return the token value from the method and
    /// resolve the handle later; the remote's pending call completes when
    /// the resolution message arrives.
    pub fn promise(&self) -> (Value, PromiseResolver) {
        let id = format!("{}{:016x}", PROMISE_PREFIX, rand::random::<u64>());
        let resolver = PromiseResolver {
            id: id.clone(),
            sender: self.sender.clone(),
            outbox: self.outbox.clone(),
        };
        (Value::String(id), resolver)
    }
}

/// Invokes a tunneled callable on the remote side.
#[derive(Clone)]
pub struct RemoteCallback {
    id: String,
    sender: String,
    outbox: Outbox,
}

impl RemoteCallback {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn invoke(&self, args: Vec<Value>) {
        let msg = RpcMessage {
            id: self.id.clone(),
            data: wire::pack_positional(args),
            ..Default::default()
        };
        self.outbox.send(&self.sender, msg);
    }
}

/// Completes a promise token handed out by [`CallContext::promise`].
pub struct PromiseResolver {
    id: String,
    sender: String,
    outbox: Outbox,
}

impl PromiseResolver {
    pub fn resolve(self, result: Result<Value, String>) {
        let mut data = Map::new();
        match result {
            Ok(v) => set_return(&mut data, v),
            Err(e) => set_error(&mut data, e),
        }
        let msg = RpcMessage {
            id: self.id,
            data,
            ..Default::default()
        };
        self.outbox.send(&self.sender, msg);
    }
}

type Instance = Arc<dyn Any + Send + Sync>;
type CtorFn = Arc<dyn Fn(Vec<Value>) -> Result<Instance, String> + Send + Sync>;
type MemberFn =
    Arc<dyn Fn(Instance, CallContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
type StaticFn =
    Arc<dyn Fn(CallContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

#[derive(Default)]
struct ClassEntry {
    ctor: Option<CtorFn>,
    statics: BTreeMap<String, StaticFn>,
    members: BTreeMap<String, MemberFn>,
    instances: BTreeMap<String, Instance>,
}

/// The built-in [`Adapter`]: classes registered as a constructor plus named
/// static and member closures, instances held in a per-class table.
#[derive(Default)]
pub struct ClassRegistry {
    classes: Mutex<BTreeMap<String, ClassEntry>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts registering a class backed by `T`. Finish with
    /// [`ClassBuilder::register`].
    pub fn class<T: Send + Sync + 'static>(&self, name: &str) -> ClassBuilder<'_, T> {
        ClassBuilder {
            registry: self,
            name: name.to_owned(),
            entry: ClassEntry::default(),
            _marker: PhantomData,
        }
    }
}

pub struct ClassBuilder<'r, T> {
    registry: &'r ClassRegistry,
    name: String,
    entry: ClassEntry,
    _marker: PhantomData<T>,
}

impl<'r, T: Send + Sync + 'static> ClassBuilder<'r, T> {
    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<T, String> + Send + Sync + 'static,
    {
        self.entry.ctor = Some(Arc::new(move |args| Ok(Arc::new(f(args)?) as Instance)));
        self
    }

    pub fn member<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Arc<T>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.entry.members.insert(
            name.to_owned(),
            Arc::new(move |instance, ctx| {
                let fut: BoxFuture<'static, Result<Value, String>> =
                    match instance.downcast::<T>() {
                        Ok(typed) => Box::pin(f(typed, ctx)),
                        Err(_) => Box::pin(async { Err("Instance type mismatch".to_owned()) }),
                    };
                fut
            }),
        );
        self
    }

    pub fn static_fn<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.entry.statics.insert(
            name.to_owned(),
            Arc::new(move |ctx| {
                let fut: BoxFuture<'static, Result<Value, String>> = Box::pin(f(ctx));
                fut
            }),
        );
        self
    }

    pub fn register(self) {
        if let Ok(mut classes) = self.registry.classes.lock() {
            classes.insert(self.name, self.entry);
        }
    }
}

enum Routed {
    Create { args: Vec<Value> },
    CreateNamed { name: String, args: Vec<Value> },
    GetNamed { name: String },
    Delete { name: String },
    Static { func: StaticFn, ctx: CallContext },
    Member { func: MemberFn, instance: Instance, ctx: CallContext },
    Fail(String),
}

impl ClassRegistry {
    fn route(&self, class: &str, msg: &RpcMessage, outbox: &Outbox) -> Routed {
        let Ok(classes) = self.classes.lock() else {
            return Routed::Fail("Registry unavailable".to_owned());
        };
        let Some(entry) = classes.get(class) else {
            return Routed::Fail(format!("Class not found: {class}"));
        };
        let mut args = positional_args(&msg.data);
        let ctx = |args: Vec<Value>| CallContext {
            args,
            sender: msg.sender.clone(),
            outbox: outbox.clone(),
        };
        let named = |args: &mut Vec<Value>| -> Option<String> {
            if args.is_empty() {
                return None;
            }
            args.remove(0).as_str().map(str::to_owned)
        };
        match msg.method.as_str() {
            CREATE => Routed::Create { args },
            CREATE_NAMED => match named(&mut args) {
                Some(name) => Routed::CreateNamed { name, args },
                None => Routed::Fail("Missing instance name".to_owned()),
            },
            GET_NAMED => match named(&mut args) {
                Some(name) => Routed::GetNamed { name },
                None => Routed::Fail("Missing instance name".to_owned()),
            },
            DELETE => match named(&mut args) {
                Some(name) => Routed::Delete { name },
                None => Routed::Fail("Missing instance name".to_owned()),
            },
            method => {
                let bare = wire::signature_base(method);
                if msg.target_id == class {
                    match entry.statics.get(bare) {
                        Some(func) => Routed::Static {
                            func: func.clone(),
                            ctx: ctx(args),
                        },
                        None => Routed::Fail(format!("Method not found: {bare}")),
                    }
                } else {
                    let Some(instance) = entry.instances.get(&msg.target_id) else {
                        return Routed::Fail(format!("Instance not found: {}", msg.target_id));
                    };
                    match entry.members.get(bare) {
                        Some(func) => Routed::Member {
                            func: func.clone(),
                            instance: instance.clone(),
                            ctx: ctx(args),
                        },
                        None => Routed::Fail(format!("Method not found: {bare}")),
                    }
                }
            }
        }
    }

    fn construct(&self, class: &str, name: Option<String>, args: Vec<Value>) -> Result<String, String> {
        let Ok(mut classes) = self.classes.lock() else {
            return Err("Registry unavailable".to_owned());
        };
        let Some(entry) = classes.get_mut(class) else {
            return Err(format!("Class not found: {class}"));
        };
        let name = name.unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));
        if entry.instances.contains_key(&name) {
            // Named creation is idempotent.
            return Ok(name);
        }
        let Some(ctor) = entry.ctor.clone() else {
            return Err(format!("Class is not constructible: {class}"));
        };
        let instance = ctor(args)?;
        entry.instances.insert(name.clone(), instance);
        Ok(name)
    }

    fn lookup(&self, class: &str, name: &str) -> Result<String, String> {
        let Ok(classes) = self.classes.lock() else {
            return Err("Registry unavailable".to_owned());
        };
        match classes.get(class) {
            Some(entry) if entry.instances.contains_key(name) => Ok(name.to_owned()),
            Some(_) => Err(format!("Instance not found: {name}")),
            None => Err(format!("Class not found: {class}")),
        }
    }

    fn destroy(&self, class: &str, name: &str) -> Result<Value, String> {
        let Ok(mut classes) = self.classes.lock() else {
            return Err("Registry unavailable".to_owned());
        };
        match classes.get_mut(class) {
            Some(entry) => Ok(Value::Bool(entry.instances.remove(name).is_some())),
            None => Err(format!("Class not found: {class}")),
        }
    }
}

#[async_trait]
impl Adapter for ClassRegistry {
    fn class_names(&self) -> Vec<String> {
        self.classes
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn class_info(&self, class: &str) -> Option<ClassInfo> {
        let classes = self.classes.lock().ok()?;
        let entry = classes.get(class)?;
        Some(ClassInfo {
            class_name: class.to_owned(),
            instances: entry.instances.keys().cloned().collect(),
            member_functions: entry.members.keys().cloned().collect(),
            static_functions: entry.statics.keys().cloned().collect(),
        })
    }

    async fn dispatch(&self, class: &str, msg: &mut RpcMessage, outbox: &Outbox) {
        let outcome = match self.route(class, msg, outbox) {
            Routed::Create { args } => self.construct(class, None, args).map(Value::String),
            Routed::CreateNamed { name, args } => {
                self.construct(class, Some(name), args).map(Value::String)
            }
            Routed::GetNamed { name } => self.lookup(class, &name).map(Value::String),
            Routed::Delete { name } => self.destroy(class, &name),
            Routed::Static { func, ctx } => func(ctx).await,
            Routed::Member { func, instance, ctx } => func(instance, ctx).await,
            Routed::Fail(e) => Err(e),
        };
        match outcome {
            Ok(v) => set_return(&mut msg.data, v),
            Err(e) => set_error(&mut msg.data, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Counter {
        value: AtomicI64,
    }

    fn registry() -> ClassRegistry {
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
            .static_fn("greet", |ctx| async move {
                let name = ctx.arg(0).and_then(Value::as_str).unwrap_or("");
                Ok(json!(format!("hi {name}")))
            })
            .register();
        registry
    }

    fn request(target_id: &str, method: &str, args: Vec<Value>) -> RpcMessage {
        RpcMessage {
            target_id: target_id.to_owned(),
            method: method.to_owned(),
            id: "t-0".to_owned(),
            sender: "d/host/t".to_owned(),
            data: wire::pack_positional(args),
        }
    }

    #[tokio::test]
    async fn static_and_member_dispatch() {
        let registry = registry();
        let (outbox, _rx) = Outbox::channel();

        let mut msg = request("Counter", "greet", vec![json!("bob")]);
        registry.dispatch("Counter", &mut msg, &outbox).await;
        assert_eq!(wire::return_value(&msg.data), Some(&json!("hi bob")));

        let mut msg = request("Counter", CREATE_NAMED, vec![json!("c1"), json!(5)]);
        registry.dispatch("Counter", &mut msg, &outbox).await;
        assert_eq!(wire::return_value(&msg.data), Some(&json!("c1")));

        let mut msg = request("c1", "increment", vec![]);
        registry.dispatch("Counter", &mut msg, &outbox).await;
        assert_eq!(wire::return_value(&msg.data), Some(&json!(6)));
    }

    #[tokio::test]
    async fn named_creation_is_idempotent() {
        let registry = registry();
        let (outbox, _rx) = Outbox::channel();
        for _ in 0..2 {
            let mut msg = request("Counter", CREATE_NAMED, vec![json!("c1"), json!(5)]);
            registry.dispatch("Counter", &mut msg, &outbox).await;
            assert_eq!(wire::return_value(&msg.data), Some(&json!("c1")));
        }
        assert_eq!(registry.class_info("Counter").unwrap().instances, vec!["c1"]);
    }

    #[tokio::test]
    async fn errors_land_in_e() {
        let registry = registry();
        let (outbox, _rx) = Outbox::channel();

        let mut msg = request("Nope", "greet", vec![]);
        registry.dispatch("Nope", &mut msg, &outbox).await;
        assert!(wire::error_value(&msg.data).unwrap().contains("Class not found"));

        let mut msg = request("ghost", "increment", vec![]);
        registry.dispatch("Counter", &mut msg, &outbox).await;
        assert!(wire::error_value(&msg.data).unwrap().contains("Instance not found"));

        let mut msg = request("Counter", "nope", vec![]);
        registry.dispatch("Counter", &mut msg, &outbox).await;
        assert!(wire::error_value(&msg.data).unwrap().contains("Method not found"));
    }

    #[tokio::test]
    async fn delete_removes_the_instance() {
        let registry = registry();
        let (outbox, _rx) = Outbox::channel();
        let mut msg = request("Counter", CREATE_NAMED, vec![json!("c1")]);
        registry.dispatch("Counter", &mut msg, &outbox).await;

        let mut msg = request("Counter", DELETE, vec![json!("c1")]);
        registry.dispatch("Counter", &mut msg, &outbox).await;
        assert_eq!(wire::return_value(&msg.data), Some(&json!(true)));

        let mut msg = request("c1", "increment", vec![]);
        registry.dispatch("Counter", &mut msg, &outbox).await;
        assert!(wire::error_value(&msg.data).is_some());
    }

    #[tokio::test]
    async fn callbacks_go_through_the_outbox() {
        let registry = registry();
        registry
            .class::<()>("Caller")
            .static_fn("run", |ctx| async move {
                if let Some(cb) = ctx.callback(1) {
                    cb.invoke(vec![json!(42), json!("x")]);
                }
                Ok(Value::Null)
            })
            .register();
        let (outbox, mut rx) = Outbox::channel();
        let mut msg = request(
            "Caller",
            "run",
            vec![json!("evt"), json!("__f__ab12-run-1-0")],
        );
        registry.dispatch("Caller", &mut msg, &outbox).await;
        let (sender, out) = rx.recv().await.unwrap();
        assert_eq!(sender, "d/host/t");
        assert_eq!(out.id, "__f__ab12-run-1-0");
        assert_eq!(positional_args(&out.data), vec![json!(42), json!("x")]);
    }
}
