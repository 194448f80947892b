use crate::services::auth::{challenge_payload, SUBTYPE_KEY_REPLY};
use crate::services::generic::SUBTYPE_SERVICE_LIST;
use crate::services::icbm::incoming_message_snac;
use crate::services::{fresh_request_id, ConnContext, FAMILY_AUTH, FAMILY_GENERIC};
use crate::session::{Session, SessionError};
use crate::ServerState;
use chrono::Utc;
use oscard_auth::{generate_auth_key, verify_cookie, AuthError};
use oscard_proto::{
    decode_tlvs, find_tlv, Buffer, Channel, CodecError, Flap, FlapHeader, Snac,
    FLAG_MORE_REPLIES, FLAP_HEADER_LEN,
};
use oscard_storage::{StorageError, UserRecord, UserStatus};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

const VERSION_MARKER: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const TLV_COOKIE: u16 = 0x0006;

#[derive(Debug)]
enum SignonError {
    Cookie(AuthError),
    Storage(StorageError),
    Session(SessionError),
}

impl Display for SignonError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cookie(err) => write!(f, "cookie rejected: {}", err),
            Self::Storage(err) => write!(f, "storage failure: {}", err),
            Self::Session(err) => write!(f, "session failure: {}", err),
        }
    }
}

impl Error for SignonError {}

impl From<AuthError> for SignonError {
    fn from(err: AuthError) -> Self {
        SignonError::Cookie(err)
    }
}

impl From<StorageError> for SignonError {
    fn from(err: StorageError) -> Self {
        SignonError::Storage(err)
    }
}

impl From<SessionError> for SignonError {
    fn from(err: SessionError) -> Self {
        SignonError::Session(err)
    }
}

enum Flow {
    Continue(ConnContext),
    Close(ConnContext),
}

/// The per-connection protocol loop: reads one FLAP at a time, threads
/// the connection context through each dispatch, and runs the close
/// bookkeeping exactly once on the way out.
pub async fn drive(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, writer) = stream.into_split();
    let session = Session::new(writer, peer, state.metrics.clone());
    state.metrics.mark_connection_opened();
    debug!(peer = %peer, "connection opened");

    // Subscribed before the session can possibly close, so a disconnect
    // from a displacing login or shutdown always unblocks the read.
    let mut closed = session.closed_signal();

    let mut ctx = ConnContext::default();
    loop {
        let read = tokio::select! {
            read = read_flap(&mut reader) => read,
            _ = closed.changed() => break,
        };
        let flap = match read {
            Ok(Some(flap)) => flap,
            // EOF or a dead socket; the peer is gone.
            Ok(None) => break,
            Err(err) => {
                // Out-of-sync framing: close without an error frame.
                warn!(peer = %peer, "framing failure: {}", err);
                break;
            }
        };
        state.metrics.mark_flap_in(flap.channel);
        match handle_flap(&state, &session, ctx, &flap).await {
            Flow::Continue(next) => ctx = next,
            Flow::Close(next) => {
                ctx = next;
                break;
            }
        }
    }
    close_connection(&state, ctx, &session).await;
}

async fn read_flap(reader: &mut OwnedReadHalf) -> Result<Option<Flap>, CodecError> {
    let mut header = [0u8; FLAP_HEADER_LEN];
    if reader.read_exact(&mut header).await.is_err() {
        return Ok(None);
    }
    let header = FlapHeader::decode(&header)?;
    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() && reader.read_exact(&mut payload).await.is_err() {
        return Ok(None);
    }
    Ok(Some(Flap {
        channel: header.channel,
        sequence: header.sequence,
        payload,
    }))
}

async fn handle_flap(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    ctx: ConnContext,
    flap: &Flap,
) -> Flow {
    match flap.channel() {
        Some(Channel::SignOn) => handle_signon(state, session, ctx, flap).await,
        Some(Channel::Data) => handle_data(state, session, ctx, flap).await,
        Some(Channel::Error) => {
            warn!(peer = %session.remote_addr(), "client error frame");
            Flow::Continue(ctx)
        }
        Some(Channel::SignOff) => {
            debug!(peer = %session.remote_addr(), "client signed off");
            Flow::Close(ctx)
        }
        // Liveness only; absence of keepalives is left to TCP.
        Some(Channel::KeepAlive) => Flow::Continue(ctx),
        None => {
            debug!(channel = flap.channel, "frame on unhandled channel");
            Flow::Continue(ctx)
        }
    }
}

async fn handle_signon(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    mut ctx: ConnContext,
    flap: &Flap,
) -> Flow {
    // A bare version marker opens the authentication conversation: the
    // server greets back and immediately issues the MD5 challenge.
    if flap.payload == VERSION_MARKER {
        if session.mark_greeted() {
            debug!(peer = %session.remote_addr(), "duplicate greeting");
            return Flow::Continue(ctx);
        }
        if session
            .send(Flap::new(Channel::SignOn, VERSION_MARKER.to_vec()))
            .await
            .is_err()
        {
            return Flow::Close(ctx);
        }
        let auth_key = generate_auth_key();
        let challenge = Snac::new(
            FAMILY_AUTH,
            SUBTYPE_KEY_REPLY,
            fresh_request_id(),
            challenge_payload(&auth_key),
        );
        if session.send_snac(&challenge).await.is_err() {
            return Flow::Close(ctx);
        }
        ctx.auth_key = Some(auth_key);
        return Flow::Continue(ctx);
    }

    // Otherwise this is a BOS arrival: version marker plus attributes,
    // among them the auth cookie.
    let mut buffer = Buffer::from_slice(&flap.payload);
    match buffer.read_u32() {
        Ok(1) => {}
        Ok(version) => {
            warn!(version, "unsupported protocol version");
            return Flow::Close(ctx);
        }
        Err(_) => {
            warn!(peer = %session.remote_addr(), "short signon frame");
            return Flow::Close(ctx);
        }
    }
    let tlvs = match decode_tlvs(&mut buffer) {
        Ok(tlvs) => tlvs,
        Err(err) => {
            warn!(peer = %session.remote_addr(), "malformed signon attributes: {}", err);
            return Flow::Close(ctx);
        }
    };
    let Some(cookie) = find_tlv(&tlvs, TLV_COOKIE) else {
        warn!(peer = %session.remote_addr(), "signon without auth cookie");
        state.metrics.mark_auth_failure();
        return Flow::Close(ctx);
    };
    match bos_signon(state, session, &cookie.value).await {
        Ok(user) => {
            ctx.user = Some(user);
            Flow::Continue(ctx)
        }
        Err(err) => {
            warn!(peer = %session.remote_addr(), "signon rejected: {}", err);
            state.metrics.mark_auth_failure();
            Flow::Close(ctx)
        }
    }
}

/// Cookie validation and everything service-ready implies: presence,
/// single-login enforcement, the offline-message drain, then the
/// services advertisement.
async fn bos_signon(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    cookie: &[u8],
) -> Result<UserRecord, SignonError> {
    let screen_name = verify_cookie(&state.cookie_secret, cookie, Utc::now())?;
    let mut user = state.storage.load_user(&screen_name).await?;

    if !session.mark_greeted() {
        // BOS clients greet in the same frame that carries the cookie.
        session
            .send(Flap::new(Channel::SignOn, VERSION_MARKER.to_vec()))
            .await?;
    }

    session.set_screen_name(&user.formatted_screen_name);
    state
        .storage
        .update_status(&user.screen_name, UserStatus::Online)
        .await?;
    state.storage.touch_activity(&user.screen_name).await?;
    user.status = UserStatus::Online;
    user.last_activity_at = Utc::now();

    if let Some(displaced) = state.sessions.set(&user.screen_name, session.clone()) {
        if !Arc::ptr_eq(&displaced, session) {
            info!(screen_name = %user.screen_name, "displacing previous session");
            displaced.disconnect().await;
        }
    }
    let _ = state.presence_tx.send(user.clone());
    state.metrics.mark_auth_success();
    info!(screen_name = %user.screen_name, peer = %session.remote_addr(), "authenticated");

    // Queued messages drain, oldest first, before the advertisement.
    let pending = state.storage.undelivered_for(&user.screen_name).await?;
    for message in pending {
        let sender = match state.storage.load_user(&message.sender).await {
            Ok(sender) => sender,
            Err(err) => {
                error!(
                    message_id = message.message_id,
                    "originator lookup failed: {}",
                    err
                );
                continue;
            }
        };
        session
            .send_snac(&incoming_message_snac(&sender, &message))
            .await?;
        state.storage.mark_delivered(message.message_id).await?;
        state.metrics.mark_message_delivered();
    }

    session
        .send_snac(&Snac::new(
            FAMILY_GENERIC,
            SUBTYPE_SERVICE_LIST,
            fresh_request_id(),
            state.services.advertisement_payload(),
        ))
        .await?;
    Ok(user)
}

async fn handle_data(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    ctx: ConnContext,
    flap: &Flap,
) -> Flow {
    if !session.is_greeted() {
        warn!(peer = %session.remote_addr(), "data frame before greeting");
        return Flow::Close(ctx);
    }
    let snac = match Snac::decode(&flap.payload) {
        Ok(snac) => snac,
        Err(err) => {
            warn!(peer = %session.remote_addr(), "unparseable snac: {}", err);
            return Flow::Close(ctx);
        }
    };
    state
        .metrics
        .mark_snac(snac.header.family, snac.header.subtype);
    if snac.header.flags & FLAG_MORE_REPLIES != 0 {
        debug!(
            family = snac.header.family,
            subtype = snac.header.subtype,
            "more-replies flag set"
        );
    }
    if ctx.user.is_none() && snac.header.family != FAMILY_AUTH {
        debug!(
            family = snac.header.family,
            "command before authentication ignored"
        );
        return Flow::Continue(ctx);
    }
    let Some(service) = state.services.get(snac.header.family) else {
        info!(family = snac.header.family, "no service for family");
        return Flow::Continue(ctx);
    };
    match service
        .handle_snac(ctx.clone(), session, &state.storage, &snac)
        .await
    {
        Ok(next) => Flow::Continue(next),
        Err(err) => {
            error!(
                family = snac.header.family,
                subtype = snac.header.subtype,
                "service failure: {}",
                err
            );
            Flow::Close(ctx)
        }
    }
}

/// Runs exactly once per connection: unbind the registry entry, mark
/// the user Away, let watchers know, close the socket. The Away/presence
/// steps are skipped when the unbind finds a newer session holding the
/// name, so a displaced connection cannot knock its replacement offline.
async fn close_connection(state: &Arc<ServerState>, ctx: ConnContext, session: &Arc<Session>) {
    state.metrics.mark_connection_closed();
    if let Some(mut user) = ctx.user {
        if state.sessions.remove(&user.screen_name, session) {
            if let Err(err) = state
                .storage
                .update_status(&user.screen_name, UserStatus::Away)
                .await
            {
                error!(screen_name = %user.screen_name, "could not mark user away: {}", err);
            }
            user.status = UserStatus::Away;
            let _ = state.presence_tx.send(user);
        }
        info!(screen_name = %session.screen_name(), peer = %session.remote_addr(), "disconnected");
    } else {
        debug!(peer = %session.remote_addr(), "connection closed");
    }
    session.disconnect().await;
}
