use super::userinfo::user_info_block;
use super::{fresh_request_id, ConnContext, Service, ServiceError, FAMILY_GENERIC};
use crate::session::Session;
use async_trait::async_trait;
use oscard_proto::{Buffer, Snac, Tlv};
use oscard_storage::{Storage, UserRecord, UserStatus};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

pub const SUBTYPE_CLIENT_READY: u16 = 0x0002;
pub const SUBTYPE_SERVICE_LIST: u16 = 0x0003;
pub const SUBTYPE_RATE_REQUEST: u16 = 0x0006;
pub const SUBTYPE_RATE_REPLY: u16 = 0x0007;
pub const SUBTYPE_SELF_INFO_REQUEST: u16 = 0x000e;
pub const SUBTYPE_SELF_INFO_REPLY: u16 = 0x000f;
pub const SUBTYPE_SET_IDLE: u16 = 0x0011;
pub const SUBTYPE_MOTD: u16 = 0x0013;

const MOTD_TYPE_NORMAL: u16 = 0x0004;
const TLV_MOTD_TEXT: u16 = 0x000b;
const MOTD_TEXT: &str = "Welcome to oscard.";

/// Family 0x01: sign-on choreography (motd, rate descriptor), self info
/// and idle transitions.
pub struct GenericService {
    pub presence_tx: UnboundedSender<UserRecord>,
}

#[async_trait]
impl Service for GenericService {
    fn family(&self) -> u16 {
        FAMILY_GENERIC
    }

    async fn handle_snac(
        &self,
        mut ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        match snac.header.subtype {
            SUBTYPE_CLIENT_READY => {
                // The client declares its family versions; the server
                // answers with the motd and the advisory rate classes.
                session
                    .send_snac(&Snac::new(
                        FAMILY_GENERIC,
                        SUBTYPE_MOTD,
                        fresh_request_id(),
                        motd_payload(),
                    ))
                    .await?;
                session
                    .send_snac(&Snac::new(
                        FAMILY_GENERIC,
                        SUBTYPE_RATE_REPLY,
                        fresh_request_id(),
                        rate_descriptor_payload(),
                    ))
                    .await?;
                Ok(ctx)
            }
            SUBTYPE_RATE_REQUEST => {
                session
                    .send_snac(&Snac::new(
                        FAMILY_GENERIC,
                        SUBTYPE_RATE_REPLY,
                        snac.header.request_id,
                        rate_descriptor_payload(),
                    ))
                    .await?;
                Ok(ctx)
            }
            SUBTYPE_SELF_INFO_REQUEST => {
                if let Some(user) = &ctx.user {
                    session
                        .send_snac(&Snac::new(
                            FAMILY_GENERIC,
                            SUBTYPE_SELF_INFO_REPLY,
                            snac.header.request_id,
                            user_info_block(user),
                        ))
                        .await?;
                }
                Ok(ctx)
            }
            SUBTYPE_SET_IDLE => {
                let idle_seconds = Buffer::from_slice(&snac.payload).read_u32().unwrap_or(0);
                let Some(mut user) = ctx.user.clone() else {
                    return Ok(ctx);
                };
                let next = match (idle_seconds, user.status) {
                    (0, UserStatus::Idle) => Some(UserStatus::Online),
                    (n, UserStatus::Online) if n > 0 => Some(UserStatus::Idle),
                    _ => None,
                };
                if let Some(status) = next {
                    storage.update_status(&user.screen_name, status).await?;
                    user.status = status;
                    let _ = self.presence_tx.send(user.clone());
                    ctx.user = Some(user);
                }
                Ok(ctx)
            }
            subtype => {
                debug!(subtype, "ignored generic command");
                Ok(ctx)
            }
        }
    }
}

fn motd_payload() -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.write_u16(MOTD_TYPE_NORMAL);
    Tlv::from_str(TLV_MOTD_TEXT, MOTD_TEXT).encode_into(&mut buffer);
    buffer.into_vec()
}

/// One permissive rate class covering everything; advertised so 5.x
/// clients settle down, never enforced.
fn rate_descriptor_payload() -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.write_u16(1); // class count
    buffer.write_u16(1); // class id
    buffer.write_u32(80); // window size
    buffer.write_u32(2500); // clear threshold
    buffer.write_u32(2000); // alert threshold
    buffer.write_u32(1500); // limit threshold
    buffer.write_u32(800); // disconnect threshold
    buffer.write_u32(2500); // current level
    buffer.write_u32(6000); // max level
    buffer.write_u32(0); // last observed time
    buffer.write_u8(0); // current state
    buffer.write_u16(1); // pair blocks follow: class id, empty pair set
    buffer.write_u16(0);
    buffer.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use oscard_proto::decode_tlvs;

    #[test]
    fn motd_carries_text_tlv() {
        let mut buffer = Buffer::from_vec(motd_payload());
        assert_eq!(buffer.read_u16().unwrap(), MOTD_TYPE_NORMAL);
        let tlvs = decode_tlvs(&mut buffer).unwrap();
        assert_eq!(tlvs[0].tag, TLV_MOTD_TEXT);
        assert_eq!(tlvs[0].value_string(), MOTD_TEXT);
    }

    #[test]
    fn rate_descriptor_is_single_permissive_class() {
        let mut buffer = Buffer::from_vec(rate_descriptor_payload());
        assert_eq!(buffer.read_u16().unwrap(), 1);
        assert_eq!(buffer.read_u16().unwrap(), 1);
        assert_eq!(buffer.read_u32().unwrap(), 80);
        assert_eq!(buffer.read_u32().unwrap(), 2500);
        assert_eq!(buffer.read_u32().unwrap(), 2000);
        assert_eq!(buffer.read_u32().unwrap(), 1500);
        assert_eq!(buffer.read_u32().unwrap(), 800);
    }
}
