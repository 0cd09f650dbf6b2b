//! Message capability traits.
//!
//! Applications define their own message types and opt into capabilities
//! by implementing these marker traits. The client and server are generic
//! over them, so sending a server message from a client is a type error.

use std::fmt::Debug;

use serde::{Serialize, de::DeserializeOwned};

/// Base capability shared by every application message.
pub trait Message: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Type name used in logs.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A message a client sends to the server.
pub trait ClientMessage: Message {}

/// A message the server sends to clients.
pub trait ServerMessage: Message {}

/// A client message that expects a correlated answer.
pub trait Requestable: Message {}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Heartbeat;
    impl Message for Heartbeat {}

    #[test]
    fn type_name_identifies_the_message() {
        assert!(Heartbeat.type_name().ends_with("Heartbeat"));
    }
}
