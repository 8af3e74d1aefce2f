use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use thiserror::Error;

/// Identifier of a chat room. One room exists per course.
pub type RoomId = String;

/// Who sent a chat message, as the browser client describes its user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sender {
    #[serde(alias = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

/// Typed view of the payload shared by `sendMessage` and `receiveMessage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "courseId")]
    pub room_id: RoomId,
    pub message: String,
    pub sender: Sender,
}

/// A chat payload as it travels through the broker.
///
/// Routing uses the typed [`ChatMessage`], but the JSON object the client
/// sent is what gets relayed. Field spellings such as `courseId` or
/// `sender._id`, and any extra fields, reach the other members untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPayload {
    pub chat: ChatMessage,
    raw: Value,
}

impl ChatPayload {
    pub fn room_id(&self) -> &str {
        &self.chat.room_id
    }

    /// The JSON object exactly as it will be relayed.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

impl From<ChatMessage> for ChatPayload {
    fn from(chat: ChatMessage) -> Self {
        let raw = json!({
            "roomId": chat.room_id,
            "message": chat.message,
            "sender": {
                "id": chat.sender.id,
                "name": chat.sender.name,
                "avatar": chat.sender.avatar,
            },
        });
        Self { chat, raw }
    }
}

impl Serialize for ChatPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChatPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let chat = ChatMessage::deserialize(&raw).map_err(serde::de::Error::custom)?;
        Ok(Self { chat, raw })
    }
}

/// Events a client may send over its socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinRoom(RoomId),
    LeaveRoom(RoomId),
    SendMessage(ChatPayload),
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    ReceiveMessage(ChatPayload),
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("room identifier cannot be empty")]
    EmptyRoom,
    #[error("message body cannot be empty")]
    EmptyMessage,
}

impl ClientEvent {
    /// Parses and validates one text frame received from a client.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let event: ClientEvent = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), EventError> {
        match self {
            ClientEvent::JoinRoom(room) | ClientEvent::LeaveRoom(room) => validate_room(room),
            ClientEvent::SendMessage(payload) => {
                validate_room(payload.room_id())?;
                if payload.chat.message.trim().is_empty() {
                    return Err(EventError::EmptyMessage);
                }
                Ok(())
            }
        }
    }
}

fn validate_room(room: &str) -> Result<(), EventError> {
    if room.trim().is_empty() {
        return Err(EventError::EmptyRoom);
    }
    Ok(())
}

/// Encodes an event as the JSON text carried by one socket frame.
pub fn encode<T: Serialize>(event: &T) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

/// Decodes a server event received by a client.
pub fn decode_server_event(text: &str) -> serde_json::Result<ServerEvent> {
    serde_json::from_str(text)
}
