use super::{ConnContext, Service, ServiceError, FAMILY_AUTH};
use crate::metrics::Metrics;
use crate::session::Session;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use oscard_auth::{
    generate_auth_key, generate_verification_token, hash_password, mint_cookie, verify_challenge,
};
use oscard_proto::{canonical_screen_name, decode_tlvs, encode_tlvs, find_tlv, Buffer, Snac, Tlv};
use oscard_storage::{NewUser, Storage, StorageError};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SUBTYPE_LOGIN_REQUEST: u16 = 0x0002;
pub const SUBTYPE_LOGIN_REPLY: u16 = 0x0003;
pub const SUBTYPE_KEY_REQUEST: u16 = 0x0006;
pub const SUBTYPE_KEY_REPLY: u16 = 0x0007;
pub const SUBTYPE_REGISTER_REQUEST: u16 = 0x0010;
pub const SUBTYPE_REGISTER_REPLY: u16 = 0x0011;

const TLV_SCREEN_NAME: u16 = 0x0001;
const TLV_PASSWORD: u16 = 0x0002;
const TLV_BOS_ADDRESS: u16 = 0x0005;
const TLV_COOKIE: u16 = 0x0006;
const TLV_ERROR: u16 = 0x0008;
const TLV_EMAIL: u16 = 0x0011;
const TLV_DIGEST: u16 = 0x0025;

const ERROR_UNKNOWN_SCREEN_NAME: u16 = 0x0001;
const ERROR_BAD_PASSWORD: u16 = 0x0005;
const ERROR_NAME_UNAVAILABLE: u16 = 0x000a;

const VERIFICATION_TTL_HOURS: i64 = 24;
const MAX_SCREEN_NAME_LEN: usize = 16;

/// Family 0x17: the MD5 challenge sign-in flow and account registration.
pub struct AuthService {
    pub bos_address: String,
    pub cookie_secret: [u8; 32],
    pub cookie_ttl_seconds: i64,
    pub metrics: Arc<Metrics>,
}

#[async_trait]
impl Service for AuthService {
    fn family(&self) -> u16 {
        FAMILY_AUTH
    }

    async fn handle_snac(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        match snac.header.subtype {
            SUBTYPE_KEY_REQUEST => self.handle_key_request(ctx, session, snac).await,
            SUBTYPE_LOGIN_REQUEST => self.handle_login(ctx, session, storage, snac).await,
            SUBTYPE_REGISTER_REQUEST => self.handle_register(ctx, session, storage, snac).await,
            subtype => {
                debug!(subtype, "ignored auth command");
                Ok(ctx)
            }
        }
    }
}

impl AuthService {
    async fn handle_key_request(
        &self,
        mut ctx: ConnContext,
        session: &Arc<Session>,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        let auth_key = generate_auth_key();
        session
            .send_snac(&Snac::new(
                FAMILY_AUTH,
                SUBTYPE_KEY_REPLY,
                snac.header.request_id,
                challenge_payload(&auth_key),
            ))
            .await?;
        ctx.auth_key = Some(auth_key);
        Ok(ctx)
    }

    async fn handle_login(
        &self,
        mut ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        let tlvs = decode_tlvs(&mut Buffer::from_slice(&snac.payload))?;
        let screen_name = find_tlv(&tlvs, TLV_SCREEN_NAME)
            .ok_or(ServiceError::Codec)?
            .value_string();
        let digest = &find_tlv(&tlvs, TLV_DIGEST).ok_or(ServiceError::Codec)?.value;

        let Some(auth_key) = ctx.auth_key.clone() else {
            warn!(screen_name, "login without a challenge on this connection");
            self.metrics.mark_auth_failure();
            self.send_login_failure(session, snac.header.request_id, ERROR_BAD_PASSWORD)
                .await?;
            return Ok(ctx);
        };

        let user = match storage.load_user(&screen_name).await {
            Ok(user) => user,
            Err(StorageError::Missing) => {
                info!(screen_name, "login for unknown screen name");
                self.metrics.mark_auth_failure();
                self.send_login_failure(session, snac.header.request_id, ERROR_UNKNOWN_SCREEN_NAME)
                    .await?;
                return Ok(ctx);
            }
            Err(_) => return Err(ServiceError::Storage),
        };

        if !verify_challenge(auth_key.as_bytes(), user.password.as_bytes(), digest) {
            info!(screen_name, "login digest mismatch");
            self.metrics.mark_auth_failure();
            self.send_login_failure(session, snac.header.request_id, ERROR_BAD_PASSWORD)
                .await?;
            return Ok(ctx);
        }

        let expires_at = Utc::now() + Duration::seconds(self.cookie_ttl_seconds);
        let cookie = mint_cookie(&self.cookie_secret, &user.screen_name, expires_at);
        session
            .send_snac(&Snac::new(
                FAMILY_AUTH,
                SUBTYPE_LOGIN_REPLY,
                snac.header.request_id,
                login_success_payload(&user.formatted_screen_name, &self.bos_address, &cookie),
            ))
            .await?;
        info!(screen_name = %user.screen_name, "login accepted, redirecting to BOS");
        ctx.auth_key = None;
        Ok(ctx)
    }

    async fn handle_register(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        let tlvs = decode_tlvs(&mut Buffer::from_slice(&snac.payload))?;
        let screen_name = find_tlv(&tlvs, TLV_SCREEN_NAME)
            .ok_or(ServiceError::Codec)?
            .value_string();
        let email = find_tlv(&tlvs, TLV_EMAIL)
            .ok_or(ServiceError::Codec)?
            .value_string();
        let password = find_tlv(&tlvs, TLV_PASSWORD)
            .ok_or(ServiceError::Codec)?
            .value_string();

        if !screen_name_acceptable(&screen_name) || password.is_empty() {
            self.send_register_failure(session, snac.header.request_id)
                .await?;
            return Ok(ctx);
        }

        let new_user = NewUser {
            formatted_screen_name: screen_name.clone(),
            email,
            password: password.clone(),
            password_hash: hash_password(&password)?,
        };
        let user = match storage.create_user(&new_user).await {
            Ok(user) => user,
            Err(StorageError::Duplicate) | Err(StorageError::Invalid) => {
                info!(screen_name, "registration rejected");
                self.send_register_failure(session, snac.header.request_id)
                    .await?;
                return Ok(ctx);
            }
            Err(_) => return Err(ServiceError::Storage),
        };

        let token = generate_verification_token();
        storage
            .upsert_email_verification(
                &user.screen_name,
                &token,
                Utc::now() + Duration::hours(VERIFICATION_TTL_HOURS),
            )
            .await?;
        session
            .send_snac(&Snac::new(
                FAMILY_AUTH,
                SUBTYPE_REGISTER_REPLY,
                snac.header.request_id,
                encode_tlvs(&[Tlv::from_str(TLV_SCREEN_NAME, &user.formatted_screen_name)]),
            ))
            .await?;
        info!(screen_name = %user.screen_name, "registered, verification provisioned");
        Ok(ctx)
    }

    async fn send_login_failure(
        &self,
        session: &Arc<Session>,
        request_id: u32,
        code: u16,
    ) -> Result<(), ServiceError> {
        session
            .send_snac(&Snac::new(
                FAMILY_AUTH,
                SUBTYPE_LOGIN_REPLY,
                request_id,
                auth_failure_payload(code),
            ))
            .await?;
        Ok(())
    }

    async fn send_register_failure(
        &self,
        session: &Arc<Session>,
        request_id: u32,
    ) -> Result<(), ServiceError> {
        session
            .send_snac(&Snac::new(
                FAMILY_AUTH,
                SUBTYPE_REGISTER_REPLY,
                request_id,
                auth_failure_payload(ERROR_NAME_UNAVAILABLE),
            ))
            .await?;
        Ok(())
    }
}

/// The (0x17, 0x07) payload: length-prefixed challenge key.
pub fn challenge_payload(auth_key: &str) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.write_b16(auth_key.as_bytes());
    buffer.into_vec()
}

fn login_success_payload(formatted_screen_name: &str, bos_address: &str, cookie: &[u8]) -> Vec<u8> {
    encode_tlvs(&[
        Tlv::from_str(TLV_SCREEN_NAME, formatted_screen_name),
        Tlv::from_str(TLV_BOS_ADDRESS, bos_address),
        Tlv::new(TLV_COOKIE, cookie.to_vec()),
    ])
}

fn auth_failure_payload(code: u16) -> Vec<u8> {
    encode_tlvs(&[Tlv::from_u16(TLV_ERROR, code)])
}

fn screen_name_acceptable(screen_name: &str) -> bool {
    let canonical = canonical_screen_name(screen_name);
    !canonical.is_empty()
        && screen_name.len() <= MAX_SCREEN_NAME_LEN
        && canonical.chars().all(|c| c.is_ascii_alphanumeric())
        && !canonical.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_password_reply_is_error_tlv_only() {
        assert_eq!(
            auth_failure_payload(ERROR_BAD_PASSWORD),
            vec![0x00, 0x08, 0x00, 0x02, 0x00, 0x05]
        );
    }

    #[test]
    fn success_payload_carries_bos_and_cookie() {
        let payload = login_success_payload("Alice", "bos.example.org:5190", &[0xaa, 0xbb]);
        let tlvs = decode_tlvs(&mut Buffer::from_vec(payload)).unwrap();
        assert_eq!(tlvs.len(), 3);
        assert_eq!(tlvs[0].tag, TLV_SCREEN_NAME);
        assert_eq!(tlvs[1].value_string(), "bos.example.org:5190");
        assert_eq!(tlvs[2].tag, TLV_COOKIE);
        assert_eq!(tlvs[2].value, vec![0xaa, 0xbb]);
    }

    #[test]
    fn challenge_payload_is_length_prefixed() {
        let payload = challenge_payload("K");
        assert_eq!(payload, vec![0x00, 0x01, b'K']);
    }

    #[test]
    fn screen_name_rules() {
        assert!(screen_name_acceptable("Running Man 8"));
        assert!(screen_name_acceptable("alice"));
        assert!(!screen_name_acceptable(""));
        assert!(!screen_name_acceptable("   "));
        assert!(!screen_name_acceptable("83runner"));
        assert!(!screen_name_acceptable("a name far too long to accept"));
        assert!(!screen_name_acceptable("bad!name"));
    }
}
