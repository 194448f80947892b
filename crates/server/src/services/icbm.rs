use super::userinfo::user_info_block;
use super::{fresh_request_id, ConnContext, Service, ServiceError, FAMILY_ICBM};
use crate::session::Session;
use async_trait::async_trait;
use oscard_proto::{decode_tlvs, find_tlv, Buffer, Snac, Tlv};
use oscard_storage::{MessageRecord, Storage, StorageError, UserRecord};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

pub const SUBTYPE_ERROR: u16 = 0x0001;
pub const SUBTYPE_SET_PARAMS: u16 = 0x0002;
pub const SUBTYPE_PARAM_REQUEST: u16 = 0x0004;
pub const SUBTYPE_PARAM_REPLY: u16 = 0x0005;
pub const SUBTYPE_SEND_MESSAGE: u16 = 0x0006;
pub const SUBTYPE_INCOMING_MESSAGE: u16 = 0x0007;
pub const SUBTYPE_DELIVERY_ACK: u16 = 0x000c;

const CHANNEL_PLAIN_TEXT: u16 = 0x0001;

const TLV_MESSAGE_DATA: u16 = 0x0002;
const TLV_REQUEST_ACK: u16 = 0x0003;

const FRAGMENT_TEXT: u8 = 0x01;
const FRAGMENT_CAPABILITIES: u8 = 0x05;

const ERROR_NOT_LOGGED_IN: u16 = 0x0004;

/// Family 0x04: point-to-point messages. Live routing and offline
/// persistence both start here; the delivery loop owns the rest.
pub struct IcbmService {
    pub delivery_tx: UnboundedSender<MessageRecord>,
}

#[async_trait]
impl Service for IcbmService {
    fn family(&self) -> u16 {
        FAMILY_ICBM
    }

    async fn handle_snac(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        match snac.header.subtype {
            SUBTYPE_SET_PARAMS => {
                // Client pushes its preferred limits; accepted as-is.
                debug!("client icbm parameters accepted");
                Ok(ctx)
            }
            SUBTYPE_PARAM_REQUEST => {
                session
                    .send_snac(&Snac::new(
                        FAMILY_ICBM,
                        SUBTYPE_PARAM_REPLY,
                        snac.header.request_id,
                        param_payload(),
                    ))
                    .await?;
                Ok(ctx)
            }
            SUBTYPE_SEND_MESSAGE => self.handle_send(ctx, session, storage, snac).await,
            subtype => {
                debug!(subtype, "ignored icbm command");
                Ok(ctx)
            }
        }
    }
}

impl IcbmService {
    async fn handle_send(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        let Some(sender) = ctx.user.clone() else {
            return Ok(ctx);
        };
        let outbound = parse_outbound_message(&snac.payload)?;
        if outbound.channel != CHANNEL_PLAIN_TEXT {
            debug!(channel = outbound.channel, "unsupported icbm channel");
            return Ok(ctx);
        }

        match storage.load_user(&outbound.recipient).await {
            Ok(_) => {}
            Err(StorageError::Missing) => {
                session
                    .send_snac(&Snac::new(
                        FAMILY_ICBM,
                        SUBTYPE_ERROR,
                        snac.header.request_id,
                        ERROR_NOT_LOGGED_IN.to_be_bytes().to_vec(),
                    ))
                    .await?;
                return Ok(ctx);
            }
            Err(_) => return Err(ServiceError::Storage),
        }

        let message = storage
            .insert_message(&sender.screen_name, &outbound.recipient, &outbound.text)
            .await?;
        debug!(
            message_id = message.message_id,
            recipient = %message.recipient,
            "message queued for delivery"
        );
        let _ = self.delivery_tx.send(message);

        // The ack confirms queueing, not client receipt.
        if outbound.wants_ack {
            session
                .send_snac(&Snac::new(
                    FAMILY_ICBM,
                    SUBTYPE_DELIVERY_ACK,
                    fresh_request_id(),
                    ack_payload(&outbound.cookie, &outbound.recipient),
                ))
                .await?;
        }
        Ok(ctx)
    }
}

struct OutboundMessage {
    cookie: [u8; 8],
    channel: u16,
    recipient: String,
    text: String,
    wants_ack: bool,
}

fn parse_outbound_message(payload: &[u8]) -> Result<OutboundMessage, ServiceError> {
    let mut buffer = Buffer::from_slice(payload);
    let raw_cookie = buffer.read_bytes(8)?;
    let mut cookie = [0u8; 8];
    cookie.copy_from_slice(&raw_cookie);
    let channel = buffer.read_u16()?;
    let recipient = String::from_utf8_lossy(&buffer.read_b8()?).into_owned();
    let tlvs = decode_tlvs(&mut buffer)?;
    let data = find_tlv(&tlvs, TLV_MESSAGE_DATA).ok_or(ServiceError::Codec)?;
    let text = message_text_from_fragments(&data.value)
        .unwrap_or_else(|| String::from_utf8_lossy(&data.value).into_owned());
    Ok(OutboundMessage {
        cookie,
        channel,
        recipient,
        text,
        wants_ack: find_tlv(&tlvs, TLV_REQUEST_ACK).is_some(),
    })
}

/// (0x04, 0x07) for a stored message: the message id doubles as the
/// 8-byte cookie, followed by the originator's info block and the
/// rebuilt message fragment.
pub fn incoming_message_snac(sender: &UserRecord, message: &MessageRecord) -> Snac {
    let mut buffer = Buffer::new();
    buffer.write_bytes(&message.message_id.to_be_bytes());
    buffer.write_u16(CHANNEL_PLAIN_TEXT);
    buffer.write_bytes(&user_info_block(sender));
    Tlv::new(TLV_MESSAGE_DATA, build_message_fragments(&message.contents))
        .encode_into(&mut buffer);
    Snac::new(
        FAMILY_ICBM,
        SUBTYPE_INCOMING_MESSAGE,
        fresh_request_id(),
        buffer.into_vec(),
    )
}

fn ack_payload(cookie: &[u8; 8], recipient: &str) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.write_bytes(cookie);
    buffer.write_u16(CHANNEL_PLAIN_TEXT);
    buffer.write_b8(recipient.as_bytes());
    buffer.into_vec()
}

fn param_payload() -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.write_u16(CHANNEL_PLAIN_TEXT);
    buffer.write_u32(0x0000_0003); // flags: channel messages allowed both ways
    buffer.write_u16(8000); // max message length
    buffer.write_u16(999); // max sender warning
    buffer.write_u16(999); // max receiver warning
    buffer.write_u32(0); // minimum message interval
    buffer.into_vec()
}

/// The mime-typed fragment stack inside TLV 0x02: a capabilities
/// fragment and a text fragment (charset 0x0000).
fn build_message_fragments(text: &str) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.write_u8(FRAGMENT_CAPABILITIES);
    buffer.write_u8(0x01);
    buffer.write_b16(&[0x01]);
    buffer.write_u8(FRAGMENT_TEXT);
    buffer.write_u8(0x01);
    let mut body = Buffer::new();
    body.write_u16(0x0000); // charset
    body.write_u16(0x0000); // charset subset
    body.write_bytes(text.as_bytes());
    buffer.write_b16(body.as_slice());
    buffer.into_vec()
}

fn message_text_from_fragments(raw: &[u8]) -> Option<String> {
    let mut buffer = Buffer::from_slice(raw);
    while !buffer.is_empty() {
        let id = buffer.read_u8().ok()?;
        let _version = buffer.read_u8().ok()?;
        let body = buffer.read_b16().ok()?;
        if id == FRAGMENT_TEXT {
            let mut body = Buffer::from_vec(body);
            body.read_u16().ok()?; // charset
            body.read_u16().ok()?; // charset subset
            return Some(String::from_utf8_lossy(&body.read_remaining()).into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::userinfo::test_user;
    use chrono::Utc;
    use oscard_storage::UserStatus;

    fn outbound_payload(text: &str, wants_ack: bool) -> Vec<u8> {
        let mut buffer = Buffer::new();
        buffer.write_bytes(&[0x11; 8]);
        buffer.write_u16(CHANNEL_PLAIN_TEXT);
        buffer.write_b8(b"bob");
        Tlv::new(TLV_MESSAGE_DATA, build_message_fragments(text)).encode_into(&mut buffer);
        if wants_ack {
            Tlv::new(TLV_REQUEST_ACK, Vec::new()).encode_into(&mut buffer);
        }
        buffer.into_vec()
    }

    #[test]
    fn fragment_text_roundtrip() {
        let fragments = build_message_fragments("hello there");
        assert_eq!(
            message_text_from_fragments(&fragments).as_deref(),
            Some("hello there")
        );
    }

    #[test]
    fn outbound_message_parses() {
        let outbound = parse_outbound_message(&outbound_payload("later tonight?", true)).unwrap();
        assert_eq!(outbound.cookie, [0x11; 8]);
        assert_eq!(outbound.channel, CHANNEL_PLAIN_TEXT);
        assert_eq!(outbound.recipient, "bob");
        assert_eq!(outbound.text, "later tonight?");
        assert!(outbound.wants_ack);
        let plain = parse_outbound_message(&outbound_payload("hi", false)).unwrap();
        assert!(!plain.wants_ack);
    }

    #[test]
    fn truncated_outbound_message_rejected() {
        assert!(parse_outbound_message(&[0x11; 8]).is_err());
    }

    #[test]
    fn incoming_snac_embeds_message_id_cookie() {
        let sender = test_user("alice", UserStatus::Online);
        let message = MessageRecord {
            message_id: 42,
            sender: "alice".to_string(),
            recipient: "bob".to_string(),
            contents: "ping".to_string(),
            created_at: Utc::now(),
            delivered_at: None,
        };
        let snac = incoming_message_snac(&sender, &message);
        assert_eq!(snac.header.subtype, SUBTYPE_INCOMING_MESSAGE);
        let mut buffer = Buffer::from_vec(snac.payload);
        assert_eq!(buffer.read_u64().unwrap(), 42);
        assert_eq!(buffer.read_u16().unwrap(), CHANNEL_PLAIN_TEXT);
        let name = buffer.read_b8().unwrap();
        assert_eq!(name, b"alice");
    }

    #[test]
    fn ack_payload_echoes_cookie() {
        let payload = ack_payload(&[0x11; 8], "bob");
        let mut buffer = Buffer::from_vec(payload);
        assert_eq!(buffer.read_bytes(8).unwrap(), vec![0x11; 8]);
        assert_eq!(buffer.read_u16().unwrap(), CHANNEL_PLAIN_TEXT);
        assert_eq!(buffer.read_b8().unwrap(), b"bob");
    }
}
