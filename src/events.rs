// Matrix Event Model and Transaction Body
// Events stay loosely typed: content is an untyped map until a preprocessor
// or consumer narrows it. Also defines the events the runtime emits to user
// code, with one-shot responders for the query surface.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::intent::Intent;

/// A room event as pushed by the homeserver. State events carry a
/// `state_key`; everything else is optional on the wire and stays optional
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RoomEvent {
    /// Coerce a raw transaction entry into the canonical event shape.
    /// Homeservers (and some bridges) have been seen sending `roomId`
    /// instead of `room_id`; normalize that spelling before decoding.
    pub fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let mut raw = raw;
        if let Value::Object(ref mut object) = raw {
            if !object.contains_key("room_id") {
                if let Some(room_id) = object.get("roomId").cloned() {
                    object.insert("room_id".to_string(), room_id);
                }
            }
        }
        serde_json::from_value(raw)
    }

    /// The `membership` field of an `m.room.member` event's content.
    pub fn membership(&self) -> Option<MembershipState> {
        let membership = self.content.get("membership")?;
        serde_json::from_value(membership.clone()).ok()
    }

    /// True for `m.room.create` events that carry a `predecessor` record.
    pub fn has_predecessor(&self) -> bool {
        matches!(self.content.get("predecessor"), Some(Value::Object(_)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MembershipState {
    #[serde(rename = "join")]
    Join,
    #[serde(rename = "leave")]
    Leave,
    #[serde(rename = "invite")]
    Invite,
    #[serde(rename = "ban")]
    Ban,
    #[serde(rename = "knock")]
    Knock,
}

/// `{changed, removed}` from the MSC3202 device-list section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl DeviceLists {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// `user_id -> device_id -> algorithm -> count`.
pub type OneTimeKeyCounts = HashMap<String, HashMap<String, HashMap<String, u64>>>;

/// `user_id -> device_id -> [algorithm]`.
pub type FallbackKeyTypes = HashMap<String, HashMap<String, Vec<String>>>;

/// The body of a homeserver transaction push. Only `events` is mandatory;
/// the remaining sections are MSC extensions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub events: Vec<Value>,
    #[serde(
        rename = "de.sorunome.msc2409.ephemeral",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ephemeral: Option<Vec<Value>>,
    #[serde(
        rename = "org.matrix.msc3202.device_lists",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub device_lists: Option<DeviceLists>,
    #[serde(
        rename = "org.matrix.msc3202.device_one_time_keys_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub one_time_keys_count: Option<OneTimeKeyCounts>,
    #[serde(
        rename = "org.matrix.msc3202.device_unused_fallback_key_types",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unused_fallback_keys: Option<FallbackKeyTypes>,
}

/// One-shot completion handle for query events. Consumed by `respond`, so a
/// listener can answer at most once; dropping it unanswered reads as "not
/// handled" and yields the route's not-found response.
pub struct QueryResponder<T> {
    tx: oneshot::Sender<T>,
}

impl<T> QueryResponder<T> {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn respond(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// Answer to a `query.user` event. `None` means the user does not exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserQueryResponse {
    pub display_name: Option<String>,
    pub avatar_mxc: Option<String>,
}

/// Answer to a `query.room` event: room-creation options forwarded to the
/// bot's `createRoom`. `None` means the room does not exist.
pub type RoomQueryResponse = Map<String, Value>;

/// Everything the dispatcher emits to user code, in processing order.
pub enum AppserviceEvent {
    RoomEvent {
        room_id: String,
        event: RoomEvent,
    },
    RoomMessage {
        room_id: String,
        event: RoomEvent,
    },
    RoomEncrypted {
        room_id: String,
        event: RoomEvent,
    },
    RoomDecrypted {
        room_id: String,
        event: RoomEvent,
    },
    RoomFailedDecryption {
        room_id: String,
        event: RoomEvent,
        error: String,
    },
    RoomJoin {
        room_id: String,
        event: RoomEvent,
    },
    RoomLeave {
        room_id: String,
        event: RoomEvent,
    },
    RoomInvite {
        room_id: String,
        event: RoomEvent,
    },
    RoomArchived {
        room_id: String,
        event: RoomEvent,
    },
    RoomUpgraded {
        room_id: String,
        event: RoomEvent,
    },
    EphemeralEvent {
        event: RoomEvent,
    },
    DeviceLists(DeviceLists),
    OneTimeKeyCounts(OneTimeKeyCounts),
    UnusedFallbackKeys(FallbackKeyTypes),
    IntentNew(Arc<Intent>),
    QueryUser {
        user_id: String,
        responder: QueryResponder<Option<UserQueryResponse>>,
    },
    QueryRoom {
        alias: String,
        responder: QueryResponder<Option<RoomQueryResponse>>,
    },
    KeyClaim {
        body: Value,
        responder: QueryResponder<Value>,
    },
    KeyQuery {
        body: Value,
        responder: QueryResponder<Value>,
    },
    ThirdpartyProtocol {
        protocol: String,
        responder: QueryResponder<Option<Value>>,
    },
    ThirdpartyUserRemote {
        protocol: String,
        fields: HashMap<String, String>,
        responder: QueryResponder<Vec<Value>>,
    },
    ThirdpartyUserMatrix {
        user_id: String,
        responder: QueryResponder<Vec<Value>>,
    },
    ThirdpartyLocationRemote {
        protocol: String,
        fields: HashMap<String, String>,
        responder: QueryResponder<Vec<Value>>,
    },
    ThirdpartyLocationMatrix {
        alias: String,
        responder: QueryResponder<Vec<Value>>,
    },
}
