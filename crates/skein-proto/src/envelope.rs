//! Request correlation envelope.

use serde::{Deserialize, Serialize};

/// Identifier echoed from a request into its answer.
pub type RequestId = u64;

/// What actually travels on the TCP channel for every message.
///
/// Plain sends carry no correlation. A request carries a fresh id and the
/// answer to it carries the same id, so answers are never confused with
/// unsolicited messages that happen to arrive first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<M> {
    /// Request id for requests and their answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<RequestId>,
    /// The application message.
    pub body: M,
}

impl<M> Envelope<M> {
    /// Envelope for a fire-and-forget message.
    pub fn plain(body: M) -> Self {
        Self { correlation: None, body }
    }

    /// Envelope for a request or an answer.
    pub fn correlated(request_id: RequestId, body: M) -> Self {
        Self { correlation: Some(request_id), body }
    }
}
