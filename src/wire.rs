use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result prefix marking a promise token: the real result arrives in a
/// second message whose `id` equals the token.
pub const PROMISE_PREFIX: &str = "__p__";

/// The envelope every RPC request, reply and callback invocation travels in.
///
/// Arguments are positional, keyed `_1.._N`; a reply carries `r` (return
/// value) or `e` (error message) inside `data`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RpcMessage {
    #[serde(rename = "targetId", default)]
    pub target_id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

pub(crate) fn arg_key(index: usize) -> String {
    format!("_{}", index + 1)
}

/// Collects the positional arguments out of a `data` map: keys beginning
/// with `_`, sorted lexicographically. The lexicographic sort keeps wire
/// compatibility and is order-stable only up to nine positional arguments
/// (`_10` sorts before `_2`).
pub fn positional_args(data: &Map<String, Value>) -> Vec<Value> {
    let mut keys: Vec<&String> = data.keys().filter(|k| k.starts_with('_')).collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|k| data.get(k).cloned())
        .collect()
}

pub(crate) fn pack_positional(args: Vec<Value>) -> Map<String, Value> {
    let mut data = Map::new();
    for (i, v) in args.into_iter().enumerate() {
        data.insert(arg_key(i), v);
    }
    data
}

pub fn return_value(data: &Map<String, Value>) -> Option<&Value> {
    data.get("r")
}

pub fn error_value(data: &Map<String, Value>) -> Option<&str> {
    data.get("e").and_then(Value::as_str)
}

pub(crate) fn set_return(data: &mut Map<String, Value>, value: Value) {
    data.insert("r".to_owned(), value);
}

pub(crate) fn set_error(data: &mut Map<String, Value>, message: impl Into<String>) {
    data.insert("e".to_owned(), Value::String(message.into()));
}

/// Extracts a promise token from a return value.
pub(crate) fn promise_token(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| s.starts_with(PROMISE_PREFIX))
}

/// Retained per-class discovery payload.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub class_name: String,
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub member_functions: Vec<String>,
    #[serde(default)]
    pub static_functions: Vec<String>,
}

/// Retained agent presence payload; the offline version is the
/// broker-delivered will.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentInfo {
    pub status: Status,
    #[serde(default)]
    pub hostname: String,
}

impl AgentInfo {
    pub fn online(hostname: impl Into<String>) -> Self {
        Self {
            status: Status::Online,
            hostname: hostname.into(),
        }
    }

    pub fn offline(hostname: impl Into<String>) -> Self {
        Self {
            status: Status::Offline,
            hostname: hostname.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

/// Strips the overload tag: everything from the first `-` on.
pub fn signature_base(name: &str) -> &str {
    match name.find('-') {
        Some(i) => &name[..i],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_roundtrip_uses_wire_names() {
        let mut data = Map::new();
        data.insert("_1".into(), json!("bob"));
        let msg = RpcMessage {
            target_id: "Foo".into(),
            method: "greet".into(),
            id: "ab12-0".into(),
            sender: "d/host/ab12".into(),
            data,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"targetId\":\"Foo\""));
        let back: RpcMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.target_id, "Foo");
        assert_eq!(positional_args(&back.data), vec![json!("bob")]);
    }

    #[test]
    fn positional_order_is_lexicographic() {
        let mut data = Map::new();
        for i in 0..11 {
            data.insert(arg_key(i), json!(i + 1));
        }
        set_return(&mut data, json!("ignored"));
        let args = positional_args(&data);
        // _1, _10, _11, _2, ...: the documented skew past nine arguments
        assert_eq!(args[0], json!(1));
        assert_eq!(args[1], json!(10));
        assert_eq!(args[2], json!(11));
        assert_eq!(args[3], json!(2));
        assert_eq!(args.len(), 11);
    }

    #[test]
    fn result_and_error_accessors() {
        let mut data = Map::new();
        assert!(return_value(&data).is_none());
        set_return(&mut data, json!(42));
        set_error(&mut data, "boom");
        assert_eq!(return_value(&data), Some(&json!(42)));
        assert_eq!(error_value(&data), Some("boom"));
    }

    #[test]
    fn promise_tokens() {
        assert_eq!(promise_token(&json!("__p__ab12-3")), Some("__p__ab12-3"));
        assert_eq!(promise_token(&json!("plain")), None);
        assert_eq!(promise_token(&json!(7)), None);
    }

    #[test]
    fn info_payloads_use_wire_names() {
        let info = ClassInfo {
            class_name: "Foo".into(),
            instances: vec!["f1".into()],
            member_functions: vec!["bar-uint32".into()],
            static_functions: vec!["greet".into()],
        };
        let text = serde_json::to_string(&info).unwrap();
        assert!(text.contains("\"className\""));
        assert!(text.contains("\"memberFunctions\""));

        let agent = AgentInfo::offline("box");
        let text = serde_json::to_string(&agent).unwrap();
        assert!(text.contains("\"status\":\"offline\""));
    }

    #[test]
    fn signature_stripping() {
        assert_eq!(signature_base("foo-uint32-string"), "foo");
        assert_eq!(signature_base("foo"), "foo");
    }
}
