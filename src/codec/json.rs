//! JSON message codec.
//!
//! The wire envelope is a JSON object with exactly one key: the
//! message identifier, mapped to the message body. Identifiers are
//! derived from the short type name at registration, so the type
//! system stands in for a hand-maintained identifier table; duplicate
//! registration panics.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::codec::{Message, Processor, UserData};
use crate::error::CodecError;
use crate::rpc::ServerHandle;

/// Inline handler for a typed message: `(msg, user_data)`.
pub type MsgHandler = Box<dyn Fn(&(dyn Any + Send), &(dyn Any + Send)) + Send + Sync>;

/// Handler for a raw message: `(msg_id, raw_body, user_data)`.
pub type RawHandler = Box<dyn Fn(&str, &RawValue, &(dyn Any + Send)) + Send + Sync>;

/// A message whose body was left undecoded because a raw handler is
/// registered for its identifier.
struct MsgRaw {
    id: String,
    body: Box<RawValue>,
}

type DecodeFn = Box<dyn Fn(&RawValue) -> Result<Message, serde_json::Error> + Send + Sync>;
type EncodeFn = Box<dyn Fn(&(dyn Any + Send)) -> Result<serde_json::Value, CodecError> + Send + Sync>;

struct MsgInfo {
    decode: DecodeFn,
    encode: EncodeFn,
    handler: Option<MsgHandler>,
    raw_handler: Option<RawHandler>,
    router: Option<ServerHandle>,
}

/// Identifier-keyed registry of message descriptors. All registration
/// happens before the gate starts serving; afterwards the maps are
/// read-only.
#[derive(Default)]
pub struct JsonProcessor {
    msg_info: HashMap<String, MsgInfo>,
    ids_by_type: HashMap<TypeId, String>,
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

impl JsonProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type, deriving its wire identifier from the
    /// short type name. Returns the identifier.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration.
    pub fn register<T>(&mut self) -> String
    where
        T: Serialize + DeserializeOwned + Any + Send,
    {
        let msg_id = short_type_name::<T>().to_string();
        if self.msg_info.contains_key(&msg_id) {
            panic!("message {} is already registered", msg_id);
        }

        self.msg_info.insert(
            msg_id.clone(),
            MsgInfo {
                decode: Box::new(|raw| {
                    let msg: T = serde_json::from_str(raw.get())?;
                    Ok(Box::new(msg) as Message)
                }),
                encode: Box::new(|msg| {
                    let msg = msg.downcast_ref::<T>().ok_or(CodecError::UnknownType)?;
                    Ok(serde_json::to_value(msg)?)
                }),
                handler: None,
                raw_handler: None,
                router: None,
            },
        );
        self.ids_by_type.insert(TypeId::of::<T>(), msg_id.clone());
        msg_id
    }

    fn info_mut_for<T: Any>(&mut self) -> &mut MsgInfo {
        let msg_id = self
            .ids_by_type
            .get(&TypeId::of::<T>())
            .unwrap_or_else(|| panic!("message {} not registered", short_type_name::<T>()));
        self.msg_info.get_mut(msg_id).expect("registry out of sync")
    }

    /// Attach the owning module's RPC server: decoded messages of this
    /// type are dispatched fire-and-forget as `(msg_id, [msg,
    /// user_data])`.
    pub fn set_router<T: Any>(&mut self, router: ServerHandle) {
        self.info_mut_for::<T>().router = Some(router);
    }

    /// Attach an inline handler invoked synchronously on the decoding
    /// task.
    pub fn set_handler<T: Any>(
        &mut self,
        handler: impl Fn(&(dyn Any + Send), &(dyn Any + Send)) + Send + Sync + 'static,
    ) {
        self.info_mut_for::<T>().handler = Some(Box::new(handler));
    }

    /// Attach a raw handler: matching payloads skip body decoding
    /// entirely.
    ///
    /// # Panics
    ///
    /// Panics if `msg_id` was never registered.
    pub fn set_raw_handler(
        &mut self,
        msg_id: &str,
        handler: impl Fn(&str, &RawValue, &(dyn Any + Send)) + Send + Sync + 'static,
    ) {
        let info = self
            .msg_info
            .get_mut(msg_id)
            .unwrap_or_else(|| panic!("message {} not registered", msg_id));
        info.raw_handler = Some(Box::new(handler));
    }

    /// Encode a typed message without the trait object indirection.
    pub fn encode_msg<T: Serialize + Any + Send>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        let mut bufs = self.encode(msg)?;
        Ok(bufs.remove(0))
    }
}

#[async_trait]
impl Processor for JsonProcessor {
    async fn route(&self, msg: Message, user_data: UserData) -> Result<(), CodecError> {
        // Raw messages carry their identifier alongside the undecoded
        // body.
        let msg = match msg.downcast::<MsgRaw>() {
            Ok(raw) => {
                let info = self
                    .msg_info
                    .get(&raw.id)
                    .ok_or_else(|| CodecError::UnknownMessage(raw.id.clone()))?;
                if let Some(handler) = &info.raw_handler {
                    handler(&raw.id, &raw.body, user_data.as_ref());
                }
                return Ok(());
            }
            Err(msg) => msg,
        };

        let msg_id = self
            .ids_by_type
            .get(&(*msg).type_id())
            .ok_or(CodecError::UnknownType)?;
        let info = self
            .msg_info
            .get(msg_id)
            .ok_or_else(|| CodecError::UnknownMessage(msg_id.clone()))?;

        if let Some(handler) = &info.handler {
            handler(msg.as_ref(), user_data.as_ref());
        }
        if let Some(router) = &info.router {
            router.go(msg_id, vec![msg, user_data]).await;
        }
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<Message, CodecError> {
        let envelope: HashMap<String, Box<RawValue>> = serde_json::from_slice(data)?;
        if envelope.len() != 1 {
            return Err(CodecError::InvalidEnvelope);
        }
        let (msg_id, body) = envelope.into_iter().next().expect("one-key envelope");

        let info = self
            .msg_info
            .get(&msg_id)
            .ok_or_else(|| CodecError::UnknownMessage(msg_id.clone()))?;

        if info.raw_handler.is_some() {
            return Ok(Box::new(MsgRaw { id: msg_id, body }));
        }
        Ok((info.decode)(&body)?)
    }

    fn encode(&self, msg: &(dyn Any + Send)) -> Result<Vec<Vec<u8>>, CodecError> {
        let msg_id = self
            .ids_by_type
            .get(&msg.type_id())
            .ok_or(CodecError::UnknownType)?;
        let info = self
            .msg_info
            .get(msg_id)
            .ok_or_else(|| CodecError::UnknownMessage(msg_id.clone()))?;

        let body = (info.encode)(msg)?;
        let mut envelope = serde_json::Map::with_capacity(1);
        envelope.insert(msg_id.clone(), body);
        Ok(vec![serde_json::to_vec(&serde_json::Value::Object(
            envelope,
        ))?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::{Arc, Mutex};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Hello {
        name: String,
    }

    #[derive(Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[test]
    fn test_encode_envelope() {
        let mut processor = JsonProcessor::new();
        assert_eq!(processor.register::<Hello>(), "Hello");

        let bufs = processor
            .encode(&Hello {
                name: "x".to_string(),
            })
            .unwrap();
        assert_eq!(bufs.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&bufs[0]).unwrap();
        assert_eq!(value, serde_json::json!({"Hello": {"name": "x"}}));
    }

    #[test]
    fn test_decode_typed() {
        let mut processor = JsonProcessor::new();
        processor.register::<Hello>();

        let msg = processor.decode(br#"{"Hello":{"name":"x"}}"#).unwrap();
        let hello = msg.downcast::<Hello>().unwrap();
        assert_eq!(hello.name, "x");
    }

    #[test]
    fn test_decode_rejects_multi_key_envelope() {
        let mut processor = JsonProcessor::new();
        processor.register::<Hello>();
        processor.register::<Ping>();

        assert!(matches!(
            processor.decode(br#"{"Hello":{},"Ping":{}}"#),
            Err(CodecError::InvalidEnvelope)
        ));
    }

    #[test]
    fn test_decode_unknown_id() {
        let processor = JsonProcessor::new();
        assert!(matches!(
            processor.decode(br#"{"Hello":{"name":"x"}}"#),
            Err(CodecError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_route_inline_handler() {
        let mut processor = JsonProcessor::new();
        processor.register::<Hello>();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        processor.set_handler::<Hello>(move |msg, _user| {
            let hello = msg.downcast_ref::<Hello>().unwrap();
            sink.lock().unwrap().push(hello.name.clone());
        });

        let msg = processor.decode(br#"{"Hello":{"name":"router"}}"#).unwrap();
        processor.route(msg, Box::new(())).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["router"]);
    }

    #[tokio::test]
    async fn test_raw_handler_skips_decoding() {
        let mut processor = JsonProcessor::new();
        processor.register::<Hello>();

        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        processor.set_raw_handler("Hello", move |id, body, _user| {
            sink.lock().unwrap().push((id.to_string(), body.get().to_string()));
        });

        // The body is intentionally not a valid Hello; raw handling
        // must not try to parse it.
        let msg = processor.decode(br#"{"Hello":12345}"#).unwrap();
        processor.route(msg, Box::new(())).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "Hello");
        assert_eq!(seen[0].1, "12345");
    }

    #[tokio::test]
    async fn test_route_dispatches_to_rpc_server() {
        let mut processor = JsonProcessor::new();
        processor.register::<Hello>();

        let server = crate::rpc::Server::new(4);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        server.register(
            "Hello",
            crate::rpc::Function::no_ret(move |args| {
                let hello = args[0].downcast_ref::<Hello>().unwrap();
                sink.lock().unwrap().push(hello.name.clone());
            }),
        );
        processor.set_router::<Hello>(server.handle());

        let msg = processor.decode(br#"{"Hello":{"name":"mod"}}"#).unwrap();
        processor.route(msg, Box::new(())).await.unwrap();

        // Drain the module queue the way a runloop would.
        let mut server = server;
        let ci = server.chan_call.recv().await.unwrap();
        server.exec(ci);
        assert_eq!(*seen.lock().unwrap(), vec!["mod"]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let mut processor = JsonProcessor::new();
        processor.register::<Hello>();
        processor.register::<Hello>();
    }

    #[test]
    fn test_encode_unregistered_type() {
        let processor = JsonProcessor::new();
        assert!(matches!(
            processor.encode(&Hello {
                name: "x".to_string()
            }),
            Err(CodecError::UnknownType)
        ));
    }
}
