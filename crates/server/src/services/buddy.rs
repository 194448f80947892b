use super::userinfo::user_info_block;
use super::{fresh_request_id, ConnContext, Service, ServiceError, FAMILY_BUDDY};
use crate::session::Session;
use crate::session_manager::SessionManager;
use async_trait::async_trait;
use oscard_proto::{encode_tlvs, Buffer, Snac, Tlv};
use oscard_storage::{Storage, StorageError, UserRecord};
use std::sync::Arc;
use tracing::debug;

pub const SUBTYPE_RIGHTS_REQUEST: u16 = 0x0002;
pub const SUBTYPE_RIGHTS_REPLY: u16 = 0x0003;
pub const SUBTYPE_ADD_BUDDIES: u16 = 0x0004;
pub const SUBTYPE_REMOVE_BUDDIES: u16 = 0x0005;
pub const SUBTYPE_BUDDY_ARRIVED: u16 = 0x000b;
pub const SUBTYPE_BUDDY_DEPARTED: u16 = 0x000c;

const TLV_RIGHTS_MAX_BUDDIES: u16 = 0x0001;
const TLV_RIGHTS_MAX_WATCHERS: u16 = 0x0002;
const MAX_BUDDIES: u16 = 500;
const MAX_WATCHERS: u16 = 750;

/// Family 0x03: buddy list edges and the presence notifications they
/// subscribe to.
pub struct BuddyService {
    pub sessions: Arc<SessionManager>,
}

#[async_trait]
impl Service for BuddyService {
    fn family(&self) -> u16 {
        FAMILY_BUDDY
    }

    async fn handle_snac(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        match snac.header.subtype {
            SUBTYPE_RIGHTS_REQUEST => {
                session
                    .send_snac(&Snac::new(
                        FAMILY_BUDDY,
                        SUBTYPE_RIGHTS_REPLY,
                        snac.header.request_id,
                        rights_payload(),
                    ))
                    .await?;
                Ok(ctx)
            }
            SUBTYPE_ADD_BUDDIES => self.handle_add(ctx, session, storage, snac).await,
            SUBTYPE_REMOVE_BUDDIES => self.handle_remove(ctx, storage, snac).await,
            subtype => {
                debug!(subtype, "ignored buddy command");
                Ok(ctx)
            }
        }
    }
}

impl BuddyService {
    async fn handle_add(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        let Some(owner) = ctx.user.clone() else {
            return Ok(ctx);
        };
        for name in parse_buddy_names(&snac.payload)? {
            match storage.upsert_buddy(&owner.screen_name, &name, "").await {
                Ok(()) => {}
                // Self-edges and empty names are dropped, not fatal.
                Err(StorageError::Invalid) => {
                    debug!(buddy = %name, "rejected buddy edge");
                    continue;
                }
                Err(_) => return Err(ServiceError::Storage),
            }
            // Snapshot so a freshly added online buddy renders without
            // waiting for their next transition.
            if self.sessions.get(&name).is_some() {
                if let Ok(target) = storage.load_user(&name).await {
                    if target.status.is_present() {
                        session.send_snac(&arrival_snac(&target)).await?;
                    }
                }
            }
        }
        Ok(ctx)
    }

    async fn handle_remove(
        &self,
        ctx: ConnContext,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        let Some(owner) = ctx.user.clone() else {
            return Ok(ctx);
        };
        for name in parse_buddy_names(&snac.payload)? {
            storage.remove_buddy(&owner.screen_name, &name).await?;
        }
        Ok(ctx)
    }
}

/// The add/remove payload: length-prefixed screen names, back to back.
fn parse_buddy_names(payload: &[u8]) -> Result<Vec<String>, ServiceError> {
    let mut buffer = Buffer::from_slice(payload);
    let mut names = Vec::new();
    while !buffer.is_empty() {
        let raw = buffer.read_b8().map_err(|_| ServiceError::Codec)?;
        names.push(String::from_utf8_lossy(&raw).into_owned());
    }
    Ok(names)
}

fn rights_payload() -> Vec<u8> {
    encode_tlvs(&[
        Tlv::from_u16(TLV_RIGHTS_MAX_BUDDIES, MAX_BUDDIES),
        Tlv::from_u16(TLV_RIGHTS_MAX_WATCHERS, MAX_WATCHERS),
    ])
}

/// (0x03, 0x0B): the subject's full info block.
pub fn arrival_snac(user: &UserRecord) -> Snac {
    Snac::new(
        FAMILY_BUDDY,
        SUBTYPE_BUDDY_ARRIVED,
        fresh_request_id(),
        user_info_block(user),
    )
}

/// (0x03, 0x0C): name and warning level only; no TLVs follow a departure.
pub fn departure_snac(user: &UserRecord) -> Snac {
    let mut buffer = Buffer::new();
    buffer.write_b8(user.formatted_screen_name.as_bytes());
    buffer.write_u16(0); // warning level
    buffer.write_u16(0); // tlv count
    Snac::new(
        FAMILY_BUDDY,
        SUBTYPE_BUDDY_DEPARTED,
        fresh_request_id(),
        buffer.into_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::userinfo::test_user;
    use oscard_storage::UserStatus;

    #[test]
    fn buddy_name_list_parses() {
        let mut buffer = Buffer::new();
        buffer.write_b8(b"alice");
        buffer.write_b8(b"Bob Jones");
        let names = parse_buddy_names(buffer.as_slice()).unwrap();
        assert_eq!(names, vec!["alice".to_string(), "Bob Jones".to_string()]);
        assert!(parse_buddy_names(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_buddy_list_is_codec_error() {
        // Header claims seven bytes, three follow.
        assert!(parse_buddy_names(&[0x07, b'a', b'b', b'c']).is_err());
    }

    #[test]
    fn departure_is_truncated_info_block() {
        let user = test_user("alice", UserStatus::Away);
        let snac = departure_snac(&user);
        assert_eq!(snac.header.subtype, SUBTYPE_BUDDY_DEPARTED);
        assert_eq!(snac.payload, vec![5, b'a', b'l', b'i', b'c', b'e', 0, 0, 0, 0]);
    }

    #[test]
    fn arrival_carries_info_block() {
        let user = test_user("alice", UserStatus::Online);
        let snac = arrival_snac(&user);
        assert_eq!(snac.header.family, FAMILY_BUDDY);
        assert_eq!(snac.header.subtype, SUBTYPE_BUDDY_ARRIVED);
        assert_eq!(snac.payload, user_info_block(&user));
    }
}
