use super::userinfo::user_info_block;
use super::{ConnContext, Service, ServiceError, FAMILY_LOCATION};
use crate::session::Session;
use async_trait::async_trait;
use oscard_proto::{decode_tlvs, encode_tlvs, find_tlv, Buffer, Snac, Tlv};
use oscard_storage::{Storage, StorageError, UserRecord, UserStatus};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub const SUBTYPE_ERROR: u16 = 0x0001;
pub const SUBTYPE_RIGHTS_REQUEST: u16 = 0x0002;
pub const SUBTYPE_RIGHTS_REPLY: u16 = 0x0003;
pub const SUBTYPE_SET_INFO: u16 = 0x0004;
pub const SUBTYPE_USER_INFO_REQUEST: u16 = 0x0005;
pub const SUBTYPE_USER_INFO_REPLY: u16 = 0x0006;

const TLV_PROFILE_MIME: u16 = 0x0001;
const TLV_PROFILE: u16 = 0x0002;
const TLV_AWAY_MIME: u16 = 0x0003;
const TLV_AWAY_MESSAGE: u16 = 0x0004;

const TLV_RIGHTS_MAX_PROFILE_LEN: u16 = 0x0001;
const TLV_RIGHTS_MAX_CAPABILITIES: u16 = 0x0002;
const MAX_PROFILE_LEN: u16 = 1024;
const MAX_CAPABILITIES: u16 = 16;

// Query types: 0x0001 profile (the default), 0x0003 away message.
const INFO_TYPE_AWAY: u16 = 0x0003;

const ERROR_NO_MATCH: u16 = 0x0014;

/// Family 0x02: profile and away-message publication, and directed
/// profile queries.
pub struct LocationService {
    pub presence_tx: UnboundedSender<UserRecord>,
}

#[async_trait]
impl Service for LocationService {
    fn family(&self) -> u16 {
        FAMILY_LOCATION
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
                        FAMILY_LOCATION,
                        SUBTYPE_RIGHTS_REPLY,
                        snac.header.request_id,
                        rights_payload(),
                    ))
                    .await?;
                Ok(ctx)
            }
            SUBTYPE_SET_INFO => self.handle_set_info(ctx, storage, snac).await,
            SUBTYPE_USER_INFO_REQUEST => self.handle_user_info(ctx, session, storage, snac).await,
            subtype => {
                debug!(subtype, "ignored location command");
                Ok(ctx)
            }
        }
    }
}

impl LocationService {
    /// Profile updates are non-critical: a malformed payload is dropped
    /// with a warning instead of killing the connection.
    async fn handle_set_info(
        &self,
        mut ctx: ConnContext,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        let tlvs = match decode_tlvs(&mut Buffer::from_slice(&snac.payload)) {
            Ok(tlvs) => tlvs,
            Err(err) => {
                warn!("malformed set-info payload: {}", err);
                return Ok(ctx);
            }
        };
        let Some(mut user) = ctx.user.clone() else {
            return Ok(ctx);
        };

        if let Some(profile) = find_tlv(&tlvs, TLV_PROFILE) {
            let mime = find_tlv(&tlvs, TLV_PROFILE_MIME)
                .map(|tlv| tlv.value_string())
                .unwrap_or_else(|| user.profile_mime.clone());
            let text = profile.value_string();
            storage.set_profile(&user.screen_name, &mime, &text).await?;
            user.profile = text;
            user.profile_mime = mime;
        }

        if let Some(away) = find_tlv(&tlvs, TLV_AWAY_MESSAGE) {
            let mime = find_tlv(&tlvs, TLV_AWAY_MIME)
                .map(|tlv| tlv.value_string())
                .unwrap_or_else(|| user.away_mime.clone());
            let text = away.value_string();
            storage
                .set_away_message(&user.screen_name, &mime, &text)
                .await?;
            user.away_message = text.clone();
            user.away_mime = mime;

            // An empty away message returns an Away user to Online; a
            // non-empty one sends a present user Away. Either transition
            // fans out to watchers.
            let next = if text.is_empty() {
                (user.status == UserStatus::Away).then_some(UserStatus::Online)
            } else {
                (user.status != UserStatus::Away).then_some(UserStatus::Away)
            };
            if let Some(status) = next {
                storage.update_status(&user.screen_name, status).await?;
                user.status = status;
                let _ = self.presence_tx.send(user.clone());
            }
        }
        ctx.user = Some(user);
        Ok(ctx)
    }

    async fn handle_user_info(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        let mut buffer = Buffer::from_slice(&snac.payload);
        let (info_type, target) = match parse_user_info_request(&mut buffer) {
            Ok(request) => request,
            Err(err) => {
                warn!("malformed user-info request: {}", err);
                return Ok(ctx);
            }
        };
        let target = match storage.load_user(&target).await {
            Ok(user) => user,
            Err(StorageError::Missing) => {
                session
                    .send_snac(&Snac::new(
                        FAMILY_LOCATION,
                        SUBTYPE_ERROR,
                        snac.header.request_id,
                        ERROR_NO_MATCH.to_be_bytes().to_vec(),
                    ))
                    .await?;
                return Ok(ctx);
            }
            Err(_) => return Err(ServiceError::Storage),
        };

        let mut payload = user_info_block(&target);
        let tlvs = if info_type == INFO_TYPE_AWAY {
            [
                Tlv::from_str(TLV_AWAY_MIME, &target.away_mime),
                Tlv::from_str(TLV_AWAY_MESSAGE, &target.away_message),
            ]
        } else {
            [
                Tlv::from_str(TLV_PROFILE_MIME, &target.profile_mime),
                Tlv::from_str(TLV_PROFILE, &target.profile),
            ]
        };
        payload.extend_from_slice(&encode_tlvs(&tlvs));
        session
            .send_snac(&Snac::new(
                FAMILY_LOCATION,
                SUBTYPE_USER_INFO_REPLY,
                snac.header.request_id,
                payload,
            ))
            .await?;
        Ok(ctx)
    }
}

fn parse_user_info_request(buffer: &mut Buffer) -> Result<(u16, String), oscard_proto::CodecError> {
    let info_type = buffer.read_u16()?;
    let name = buffer.read_b8()?;
    Ok((info_type, String::from_utf8_lossy(&name).into_owned()))
}

fn rights_payload() -> Vec<u8> {
    encode_tlvs(&[
        Tlv::from_u16(TLV_RIGHTS_MAX_PROFILE_LEN, MAX_PROFILE_LEN),
        Tlv::from_u16(TLV_RIGHTS_MAX_CAPABILITIES, MAX_CAPABILITIES),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rights_payload_lists_limits() {
        let tlvs = decode_tlvs(&mut Buffer::from_vec(rights_payload())).unwrap();
        assert_eq!(tlvs[0].value_u16().unwrap(), MAX_PROFILE_LEN);
        assert_eq!(tlvs[1].value_u16().unwrap(), MAX_CAPABILITIES);
    }

    #[test]
    fn user_info_request_parses() {
        let mut buffer = Buffer::new();
        buffer.write_u16(INFO_TYPE_AWAY);
        buffer.write_b8(b"Running Man 83");
        let (info_type, name) = parse_user_info_request(&mut buffer).unwrap();
        assert_eq!(info_type, INFO_TYPE_AWAY);
        assert_eq!(name, "Running Man 83");
    }

    #[test]
    fn truncated_user_info_request_rejected() {
        let mut buffer = Buffer::from_slice(&[0x00]);
        assert!(parse_user_info_request(&mut buffer).is_err());
    }
}
