//! Collaborator interfaces consumed by the core.
//!
//! The surrounding backend owns persistent storage, credentials, media
//! processing, and the media relay; the core reaches them only through
//! these traits.

use async_trait::async_trait;

use crate::Result;
use pulse_proto::{CallId, MediaRef, MediaVariants, RoomId, ServerMessageId, UserId};

/// Verifies a connection credential, invoked once at connection establishment
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Resolve a token to a verified user identity, or an authentication error
    async fn verify_connection(&self, token: &str) -> Result<UserId>;
}

/// Durable message persistence; the source of truth for sync reconciliation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagePersistence: Send + Sync {
    /// Durably record a delivered message, returning its server-assigned id
    async fn append_message(
        &self,
        room_id: &RoomId,
        sender: UserId,
        content: &str,
        media: &[MediaRef],
    ) -> Result<ServerMessageId>;

    /// Remove a stored message (explicit delete or ephemeral expiry)
    async fn delete_message(&self, message_id: &ServerMessageId) -> Result<()>;
}

/// Resolves raw media references into signed, time-limited variant URLs.
/// The core never constructs these URLs itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaVariantResolver: Send + Sync {
    async fn resolve(&self, media: &MediaRef) -> Result<MediaVariants>;
}

/// Room membership source of record, consulted for group actions that
/// originate outside the signaling layer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn is_member(&self, room_id: &RoomId, user: UserId) -> Result<bool>;
}

/// Control plane of the external media relay used for group calls.
/// Audio/video packet forwarding happens entirely on the other side of this
/// interface.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayControl: Send + Sync {
    /// Allocate a relay room for a call session
    async fn allocate(&self, call_id: &CallId, room_id: &RoomId) -> Result<()>;

    /// Release one participant's relay slot
    async fn release(&self, call_id: &CallId, user: UserId) -> Result<()>;

    /// Tear down the whole relay room
    async fn teardown(&self, call_id: &CallId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn test_mock_credential_verifier() {
        let mut verifier = MockCredentialVerifier::new();
        verifier
            .expect_verify_connection()
            .withf(|token| token == "good")
            .returning(|_| Ok(UserId::new(7)));
        verifier
            .expect_verify_connection()
            .withf(|token| token != "good")
            .returning(|_| Err(Error::Authentication("unknown token".into())));

        assert_eq!(
            verifier.verify_connection("good").await.unwrap(),
            UserId::new(7)
        );
        assert!(verifier.verify_connection("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_membership_source() {
        let mut membership = MockMembershipSource::new();
        membership
            .expect_is_member()
            .returning(|_, user| Ok(user == UserId::new(1)));

        let room = RoomId::from("r1");
        assert!(membership.is_member(&room, UserId::new(1)).await.unwrap());
        assert!(!membership.is_member(&room, UserId::new(2)).await.unwrap());
    }
}
