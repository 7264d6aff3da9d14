//! Commands exchanged between the host app and the tunnel extension.
//!
//! Every message is an [`IpcCommand`]: a unique id plus an action. The
//! host sends [`IpcAction`]s; the extension answers with [`IpcReply`]s.
//! Both travel as JSON.

use crate::error::IpcError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Number of reply slots the client keeps open on the server
pub const SERVER_BUFFER_SIZE: usize = 5;

/// Host to extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcAction {
    /// (Re)start the server side, dropping all buffered slots
    Start,
    /// Open one reply slot the server may answer at will
    FillBuffer,
}

/// Extension to host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcReply {
    ServerStarted,
    /// The server is about to run out of slots
    NeedBuffer,
    /// The tunnel reconnected to the given endpoint
    Reconnected(String),
}

/// A message on the wire. Equality and hashing only look at `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcCommand<T> {
    pub id: Uuid,
    pub action: T,
}

impl<T> IpcCommand<T> {
    /// Wrap `action` under a fresh id.
    pub fn new(action: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
        }
    }
}

impl<T> PartialEq for IpcCommand<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for IpcCommand<T> {}

impl<T> Hash for IpcCommand<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Serialize a command for the wire.
pub fn encode<T: Serialize>(command: &IpcCommand<T>) -> Result<Vec<u8>, IpcError> {
    Ok(serde_json::to_vec(command)?)
}

/// Deserialize a command received from the wire.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<IpcCommand<T>, IpcError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_by_id_only() {
        let a = IpcCommand::new(IpcAction::Start);
        let same_id = IpcCommand {
            id: a.id,
            action: IpcAction::FillBuffer,
        };
        let other = IpcCommand::new(IpcAction::Start);

        assert_eq!(a, same_id);
        assert_ne!(a, other);

        let set: HashSet<_> = [a, same_id, other].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = IpcCommand::new(IpcReply::Reconnected("185.65.135.1:51820".into()));
        let bytes = encode(&reply).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["id"], reply.id.to_string());
        assert_eq!(json["action"]["reconnected"], "185.65.135.1:51820");

        let decoded: IpcCommand<IpcReply> = decode(&bytes).unwrap();
        assert_eq!(decoded.action, reply.action);
    }

    #[test]
    fn test_decode_rejects_wrong_direction() {
        let bytes = encode(&IpcCommand::new(IpcReply::NeedBuffer)).unwrap();
        assert!(matches!(
            decode::<IpcAction>(&bytes),
            Err(IpcError::Codec(_))
        ));
    }
}
