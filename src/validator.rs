//! MessageValidator: structural preconditions every inbound and outbound
//! protocol message must satisfy.
//!
//! Invalid inbound messages are dropped with a warning; invalid outbound
//! construction is a fatal internal bug (the engine built something its
//! own validator rejects) and is surfaced as [`crate::error::EngineError::Internal`].

use crate::model::SessionState;
use crate::wire::{ClientToServer, ClientToServerPayload, ServerToClient, ServerToClientPayload};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("client_token is empty while session is not AwaitingToken")]
    MissingToken,
    #[error("registration op has an empty object name")]
    EmptyObjectName,
    #[error("invalidation version is negative: {0}")]
    NegativeVersion(i64),
    #[error("Initialize response is missing a nonce")]
    MissingNonce,
    #[error("message exceeds the configured size limit: {actual} > {limit}")]
    TooLarge { actual: usize, limit: usize },
    #[error("registration sync subtree has a nonempty prefix but claims zero significant bits")]
    EmptySubtree,
}

pub struct MessageValidator {
    max_message_bytes: usize,
}

impl MessageValidator {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }

    /// Validates a message this engine is about to send. Failure here
    /// means the engine itself built a malformed message — an internal
    /// bug, not an environmental condition.
    pub fn validate_outbound(
        &self,
        msg: &ClientToServer,
        session: &SessionState,
        encoded_len: usize,
    ) -> Result<(), ValidationError> {
        if encoded_len > self.max_message_bytes {
            return Err(ValidationError::TooLarge { actual: encoded_len, limit: self.max_message_bytes });
        }

        if !matches!(session, SessionState::AwaitingToken(_)) && msg.header.client_token.is_none() {
            // Initialize legitimately has no token yet even outside
            // AwaitingToken (e.g. the very first send before any session
            // state has been entered), but every other payload requires
            // one once a token has ever been requested.
            if !matches!(msg.payload, ClientToServerPayload::Initialize { .. }) {
                return Err(ValidationError::MissingToken);
            }
        }

        match &msg.payload {
            ClientToServerPayload::RegistrationMsg { ops } => {
                for op in ops {
                    if op.object_id.name.is_empty() {
                        return Err(ValidationError::EmptyObjectName);
                    }
                }
            }
            ClientToServerPayload::RegistrationSyncMsg { subtrees } => {
                // An empty prefix with a zero length is the canonical
                // "whole namespace" sentinel; a nonempty prefix claiming
                // zero significant bits is the malformed case.
                for subtree in subtrees {
                    if subtree.length == 0 && !subtree.prefix.is_empty() {
                        return Err(ValidationError::EmptySubtree);
                    }
                }
            }
            ClientToServerPayload::InvalidationAckMsg { invalidations, .. } => {
                for inv in invalidations {
                    if inv.version < 0 {
                        return Err(ValidationError::NegativeVersion(inv.version));
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Validates a message received from the server. Failure here is an
    /// ordinary, expected occurrence (malformed wire bytes, a server bug,
    /// a stale retransmit) and the caller drops the message and logs a
    /// warning rather than treating it as fatal.
    pub fn validate_inbound(&self, msg: &ServerToClient, encoded_len: usize) -> Result<(), ValidationError> {
        if encoded_len > self.max_message_bytes {
            return Err(ValidationError::TooLarge { actual: encoded_len, limit: self.max_message_bytes });
        }

        match &msg.payload {
            ServerToClientPayload::TokenControl { nonce, .. } => {
                if nonce.0.is_empty() {
                    return Err(ValidationError::MissingNonce);
                }
            }
            ServerToClientPayload::InvalidationMsg { invalidations, .. } => {
                for inv in invalidations {
                    if inv.version < 0 {
                        return Err(ValidationError::NegativeVersion(inv.version));
                    }
                }
            }
            ServerToClientPayload::RegistrationStatusMsg { statuses } => {
                for status in statuses {
                    if status.object_id.name.is_empty() {
                        return Err(ValidationError::EmptyObjectName);
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_invalidation_version() {
        use crate::model::{Invalidation, ObjectId};
        let validator = MessageValidator::new(1 << 20);
        let msg = ServerToClient {
            header: crate::wire::ServerHeader {
                client_token: None,
                server_time_ms: 0,
                registration_summary: None,
                next_heartbeat_interval_ms: None,
                next_poll_interval_ms: None,
            },
            payload: ServerToClientPayload::InvalidationMsg {
                invalidations: vec![Invalidation { object_id: ObjectId::new(1, b"x".to_vec()), version: -1, payload: None, is_known_version: true }],
                all_object_ids: false,
            },
        };
        assert_eq!(validator.validate_inbound(&msg, 10), Err(ValidationError::NegativeVersion(-1)));
    }

    #[test]
    fn rejects_oversized_message() {
        let validator = MessageValidator::new(10);
        let msg = ServerToClient {
            header: crate::wire::ServerHeader {
                client_token: None,
                server_time_ms: 0,
                registration_summary: None,
                next_heartbeat_interval_ms: None,
                next_poll_interval_ms: None,
            },
            payload: ServerToClientPayload::RegistrationSyncRequest,
        };
        assert_eq!(validator.validate_inbound(&msg, 11), Err(ValidationError::TooLarge { actual: 11, limit: 10 }));
    }
}
