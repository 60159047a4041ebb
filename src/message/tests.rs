use super::*;
use serde_json::json;

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Tick {
    #[serde(flatten)]
    mq: MessageId,
    name: String,
}

impl Message for Tick {
    fn id(&mut self) -> &str {
        self.mq.get_or_init()
    }
}

#[test]
fn test_arbitrary_id_is_generated_once() {
    let mut msg = ArbitraryMessage::new().with("hello", "world");
    assert!(msg.get(ID_FIELD).is_none());

    let first = msg.id().to_string();
    let second = msg.id().to_string();

    assert!(!first.is_empty());
    assert_eq!(first, second);
    assert_eq!(msg.get(ID_FIELD), Some(&json!(first)));
}

#[test]
fn test_arbitrary_id_survives_mutation() {
    let mut msg = ArbitraryMessage::new().with("a", 1);
    let id = msg.id().to_string();

    msg.insert("b", 2);
    msg.insert(ID_FIELD, "overwritten");

    assert_eq!(msg.id(), id);
    assert_eq!(msg.get("b"), Some(&json!(2)));
}

#[test]
fn test_arbitrary_preset_id_is_kept() {
    let mut msg = ArbitraryMessage::new().with(ID_FIELD, "fixed");
    assert_eq!(msg.id(), "fixed");
}

#[test]
fn test_arbitrary_non_string_id_is_normalised() {
    let mut msg = ArbitraryMessage::new().with(ID_FIELD, 42);
    assert_eq!(msg.id(), "42");
    assert_eq!(msg.get(ID_FIELD), Some(&json!("42")));
}

#[test]
fn test_ids_are_unique() {
    let mut a = ArbitraryMessage::new();
    let mut b = ArbitraryMessage::new();
    let mut c = Tick::default();
    let mut d = Tick::default();

    assert_ne!(a.id(), b.id());
    assert_ne!(c.id().to_string(), d.id().to_string());
}

#[test]
fn test_arbitrary_serializes_as_plain_object() {
    let mut msg: ArbitraryMessage = [("hello", "world")].into_iter().collect();
    let id = msg.id().to_string();

    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value, json!({"hello": "world", "id": id}));

    let decoded: ArbitraryMessage = serde_json::from_value(value).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn test_structured_id_empty_until_read() {
    let mut tick = Tick {
        name: "tick".to_string(),
        ..Default::default()
    };
    assert!(!tick.mq.is_set());
    assert_eq!(tick.mq.get(), None);

    let id = tick.id().to_string();
    assert_eq!(tick.mq.get(), Some(id.as_str()));

    tick.name = "tock".to_string();
    assert_eq!(tick.id(), id);
}

#[test]
fn test_structured_id_flattens_to_id_key() {
    let mut tick = Tick {
        name: "tick".to_string(),
        ..Default::default()
    };
    let id = tick.id().to_string();

    let value = serde_json::to_value(&tick).unwrap();
    assert_eq!(value, json!({"id": id, "name": "tick"}));

    let decoded: Tick = serde_json::from_value(json!({"name": "untagged"})).unwrap();
    assert!(!decoded.mq.is_set());
}

#[test]
fn test_encode_materializes_id() {
    let mut msg = ArbitraryMessage::new().with("k", "v");
    let (id, payload) = encode(&mut msg).unwrap();

    let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(value["id"], json!(id));
    assert_eq!(msg.id(), id);
}
