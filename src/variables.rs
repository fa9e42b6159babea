//! Variable Store: turns runtime object ids into small integer references a
//! DAP client can hold on to, and resolves their children on demand.
//!
//! Two reference spaces exist. Pause references start at 1, are valid until
//! the next resume and are never reused afterwards. Ephemeral references
//! (console arguments) start at [`EPHEMERAL_BASE`] and live until the
//! execution context is cleared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::CdpTransport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::dap::{Variable, VariablesArguments, VariablesFilter};
use crate::errors::{BridgeError, BridgeResult};

pub const EPHEMERAL_BASE: u64 = 1_000_000_000;

const PROTO_PROPERTY: &str = "__proto__";
const ACCESSOR_PLACEHOLDER: &str = "(...)";

const SLICE_FUNCTION: &str = "function (start, count) {\n  const slice = {};\n  const end = Math.min(this.length, start + count);\n  for (let i = start; i < end; i++) slice[i] = this[i];\n  return slice;\n}";

/// `Runtime.RemoteObject`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unserializable_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl RemoteObject {
    /// Object id worth expanding; primitives and `null` have none.
    pub fn expandable_id(&self) -> Option<&str> {
        match self.kind.as_str() {
            "object" if self.subtype.as_deref() == Some("null") => None,
            "object" | "function" => self.object_id.as_deref(),
            _ => None,
        }
    }

    pub fn display(&self) -> String {
        match self.kind.as_str() {
            "string" => format!(
                "\"{}\"",
                self.value.as_ref().and_then(Value::as_str).unwrap_or_default()
            ),
            "undefined" => "undefined".to_string(),
            "object" if self.subtype.as_deref() == Some("null") => "null".to_string(),
            "number" | "bigint" | "boolean" => self
                .unserializable_value
                .clone()
                .or_else(|| self.value.as_ref().map(Value::to_string))
                .or_else(|| self.description.clone())
                .unwrap_or_default(),
            "function" => self
                .description
                .as_deref()
                .and_then(|text| text.lines().next())
                .unwrap_or("function")
                .to_string(),
            _ => self
                .description
                .clone()
                .or_else(|| self.class_name.clone())
                .or_else(|| self.value.as_ref().map(Value::to_string))
                .unwrap_or_else(|| self.kind.clone()),
        }
    }

    /// Element count for arrays, read from descriptions like `Array(100)`.
    pub fn array_length(&self) -> Option<u64> {
        if !matches!(self.subtype.as_deref(), Some("array") | Some("typedarray")) {
            return None;
        }
        let description = self.description.as_deref()?;
        let open = description.rfind('(')?;
        let close = description[open..].find(')')? + open;
        description[open + 1..close].trim().parse().ok()
    }
}

/// `Runtime.PropertyDescriptor`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<RemoteObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<RemoteObject>,
}

impl PropertyDescriptor {
    pub fn named(name: impl Into<String>, value: RemoteObject) -> Self {
        Self {
            name: name.into(),
            value: Some(value),
            get: None,
        }
    }

    fn is_accessor_only(&self) -> bool {
        self.value.is_none()
            && self
                .get
                .as_ref()
                .is_some_and(|getter| getter.kind != "undefined")
    }
}

/// Performs the round trips that list an object's children.
#[async_trait]
pub trait PropertySource: Send + Sync {
    async fn properties(&self, object_id: &str) -> BridgeResult<Vec<PropertyDescriptor>>;

    /// Elements `start..start + count` of an array, named by their index.
    async fn array_slice(
        &self,
        object_id: &str,
        start: u64,
        count: u64,
    ) -> BridgeResult<Vec<PropertyDescriptor>>;
}

pub struct CdpPropertySource {
    transport: Arc<dyn CdpTransport>,
    timeout: Option<Duration>,
}

impl CdpPropertySource {
    pub fn new(transport: Arc<dyn CdpTransport>, timeout: Option<Duration>) -> Self {
        Self { transport, timeout }
    }
}

#[async_trait]
impl PropertySource for CdpPropertySource {
    async fn properties(&self, object_id: &str) -> BridgeResult<Vec<PropertyDescriptor>> {
        let result = self
            .transport
            .send_with_timeout(
                "Runtime.getProperties",
                json!({ "objectId": object_id, "ownProperties": true }),
                self.timeout,
            )
            .await?;
        let descriptors = result.get("result").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(descriptors).map_err(BridgeError::payload)
    }

    async fn array_slice(
        &self,
        object_id: &str,
        start: u64,
        count: u64,
    ) -> BridgeResult<Vec<PropertyDescriptor>> {
        let result = self
            .transport
            .send_with_timeout(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": SLICE_FUNCTION,
                    "arguments": [{ "value": start }, { "value": count }],
                    "returnByValue": false,
                    "silent": true,
                }),
                self.timeout,
            )
            .await?;
        let slice: RemoteObject =
            serde_json::from_value(result.get("result").cloned().unwrap_or_default())
                .map_err(BridgeError::payload)?;
        let Some(slice_id) = slice.object_id else {
            return Ok(Vec::new());
        };
        self.properties(&slice_id).await
    }
}

/// Reference allocator whose ids are never handed out twice. `clear` drops
/// every live slot and starts a new generation.
#[derive(Debug)]
struct Arena<T> {
    next: u64,
    generation: u64,
    live: HashMap<u64, T>,
}

impl<T> Arena<T> {
    fn starting_at(base: u64) -> Self {
        Self {
            next: base,
            generation: 0,
            live: HashMap::new(),
        }
    }

    fn insert(&mut self, value: T) -> u64 {
        let reference = self.next;
        self.next += 1;
        self.live.insert(reference, value);
        reference
    }

    fn get(&self, reference: u64) -> Option<&T> {
        self.live.get(&reference)
    }

    fn clear(&mut self) {
        self.live.clear();
        self.generation += 1;
    }
}

#[derive(Clone, Debug)]
enum PauseHandle {
    Object(String),
    Cached(Vec<Variable>),
}

#[derive(Debug)]
struct PauseHandles {
    arena: Arena<PauseHandle>,
    by_object: HashMap<String, u64>,
}

#[derive(Debug)]
pub struct VariableStore {
    pause: Mutex<PauseHandles>,
    ephemeral: Mutex<Arena<Vec<PropertyDescriptor>>>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            pause: Mutex::new(PauseHandles {
                arena: Arena::starting_at(1),
                by_object: HashMap::new(),
            }),
            ephemeral: Mutex::new(Arena::starting_at(EPHEMERAL_BASE)),
        }
    }

    /// Stable reference for `object_id` within the current pause.
    pub fn adapt_runtime_id(&self, object_id: &str) -> u64 {
        let mut pause = self.pause.lock();
        if let Some(reference) = pause.by_object.get(object_id) {
            return *reference;
        }
        let reference = pause
            .arena
            .insert(PauseHandle::Object(object_id.to_string()));
        pause.by_object.insert(object_id.to_string(), reference);
        reference
    }

    pub fn runtime_id(&self, reference: u64) -> Option<String> {
        match self.pause.lock().arena.get(reference) {
            Some(PauseHandle::Object(object_id)) => Some(object_id.clone()),
            _ => None,
        }
    }

    /// Pause-scoped reference to an already built list.
    pub fn push_cached(&self, variables: Vec<Variable>) -> u64 {
        self.pause.lock().arena.insert(PauseHandle::Cached(variables))
    }

    pub fn push_ephemeral(&self, descriptors: Vec<PropertyDescriptor>) -> u64 {
        self.ephemeral.lock().insert(descriptors)
    }

    /// DAP view of a value; objects get a child reference in the pause space.
    pub fn variable(&self, name: impl Into<String>, value: &RemoteObject) -> Variable {
        let variables_reference = value
            .expandable_id()
            .map(|object_id| self.adapt_runtime_id(object_id))
            .unwrap_or(0);
        Variable {
            name: name.into(),
            value: value.display(),
            type_name: Some(value.subtype.clone().unwrap_or_else(|| value.kind.clone())),
            variables_reference,
            indexed_variables: value.array_length(),
        }
    }

    fn adapt_descriptor(&self, descriptor: &PropertyDescriptor) -> Option<Variable> {
        if descriptor.name == PROTO_PROPERTY {
            return None;
        }
        match &descriptor.value {
            Some(value) => Some(self.variable(descriptor.name.clone(), value)),
            None if descriptor.is_accessor_only() => Some(Variable {
                name: descriptor.name.clone(),
                value: ACCESSOR_PLACEHOLDER.to_string(),
                type_name: None,
                variables_reference: 0,
                indexed_variables: None,
            }),
            None => None,
        }
    }

    pub fn get_all(&self, descriptors: &[PropertyDescriptor]) -> Vec<Variable> {
        descriptors
            .iter()
            .filter_map(|descriptor| self.adapt_descriptor(descriptor))
            .collect()
    }

    pub async fn get(
        &self,
        args: &VariablesArguments,
        source: &dyn PropertySource,
    ) -> BridgeResult<Vec<Variable>> {
        let reference = args.variables_reference;

        if reference >= EPHEMERAL_BASE {
            let descriptors = self
                .ephemeral
                .lock()
                .get(reference)
                .cloned()
                .ok_or(BridgeError::UnknownReference(reference))?;
            return Ok(self.get_all(&descriptors));
        }

        let handle = self
            .pause
            .lock()
            .arena
            .get(reference)
            .cloned()
            .ok_or(BridgeError::UnknownReference(reference))?;

        let object_id = match handle {
            PauseHandle::Cached(variables) => return Ok(variables),
            PauseHandle::Object(object_id) => object_id,
        };

        let descriptors = match args.filter {
            Some(VariablesFilter::Indexed) => {
                let start = args.start.unwrap_or(0);
                let count = args.count.unwrap_or(u64::MAX - start);
                trace!(target: "variables", reference, start, count, "indexed slice");
                source
                    .array_slice(&object_id, start, count)
                    .await?
                    .into_iter()
                    .filter(|descriptor| descriptor.name.parse::<u64>().is_ok())
                    .collect()
            }
            Some(VariablesFilter::Named) => source
                .properties(&object_id)
                .await?
                .into_iter()
                .filter(|descriptor| descriptor.name.parse::<u64>().is_err())
                .collect(),
            None => source.properties(&object_id).await?,
        };

        Ok(self.get_all(&descriptors))
    }

    /// Drops pause-scoped references. Ephemeral references survive.
    pub fn clear(&self) {
        let mut pause = self.pause.lock();
        pause.arena.clear();
        pause.by_object.clear();
        debug!(target: "variables", generation = pause.arena.generation, "pause references cleared");
    }

    pub fn clear_ephemeral(&self) {
        self.ephemeral.lock().clear();
    }

    pub fn live_references(&self) -> usize {
        self.pause.lock().arena.live.len() + self.ephemeral.lock().live.len()
    }
}
