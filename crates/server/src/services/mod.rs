use crate::session::{Session, SessionError};
use async_trait::async_trait;
use oscard_auth::AuthError;
use oscard_proto::{Buffer, CodecError, Snac};
use oscard_storage::{Storage, StorageError, UserRecord};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub mod alert;
pub mod auth;
pub mod buddy;
pub mod generic;
pub mod icbm;
pub mod location;
pub mod userinfo;

pub const FAMILY_GENERIC: u16 = 0x0001;
pub const FAMILY_LOCATION: u16 = 0x0002;
pub const FAMILY_BUDDY: u16 = 0x0003;
pub const FAMILY_ICBM: u16 = 0x0004;
pub const FAMILY_AUTH: u16 = 0x0017;
pub const FAMILY_ALERT: u16 = 0x0018;

/// Per-connection state threaded through the read loop: the handler
/// passes the context into every dispatch and adopts whatever comes
/// back, which is how the authenticated user (and the pending auth key)
/// ride on the connection.
#[derive(Default, Clone)]
pub struct ConnContext {
    pub user: Option<UserRecord>,
    pub auth_key: Option<String>,
}

#[derive(Debug)]
pub enum ServiceError {
    Codec,
    Storage,
    Session,
    Credential,
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec => write!(f, "malformed command payload"),
            Self::Storage => write!(f, "storage failure"),
            Self::Session => write!(f, "session write failure"),
            Self::Credential => write!(f, "credential failure"),
        }
    }
}

impl Error for ServiceError {}

impl From<CodecError> for ServiceError {
    fn from(_: CodecError) -> Self {
        ServiceError::Codec
    }
}

impl From<StorageError> for ServiceError {
    fn from(_: StorageError) -> Self {
        ServiceError::Storage
    }
}

impl From<SessionError> for ServiceError {
    fn from(_: SessionError) -> Self {
        ServiceError::Session
    }
}

impl From<AuthError> for ServiceError {
    fn from(_: AuthError) -> Self {
        ServiceError::Credential
    }
}

static REQUEST_ID: AtomicU32 = AtomicU32::new(1);

/// Request id for a server-initiated SNAC; direct replies echo the
/// client's id instead.
pub fn fresh_request_id() -> u32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A stateless handler owning every subtype of one family. All per-user
/// state lives in the repositories; the composition of services is fixed
/// at startup.
#[async_trait]
pub trait Service: Send + Sync {
    fn family(&self) -> u16;

    /// Processes one command, possibly emitting frames through the
    /// session, and returns the replacement connection context. An error
    /// is fatal for the connection.
    async fn handle_snac(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError>;
}

/// Family → service table. Registration happens once at startup and the
/// table is read-only afterwards; registration order is the order the
/// families are advertised in.
#[derive(Default)]
pub struct ServiceRegistry {
    order: Vec<u16>,
    table: HashMap<u16, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn Service>) {
        let family = service.family();
        if self.table.insert(family, service).is_none() {
            self.order.push(family);
        }
    }

    pub fn get(&self, family: u16) -> Option<&Arc<dyn Service>> {
        self.table.get(&family)
    }

    /// The (0x01, 0x03) advertisement payload: every registered family
    /// id, in registration order.
    pub fn advertisement_payload(&self) -> Vec<u8> {
        let mut buffer = Buffer::new();
        for family in &self.order {
            buffer.write_u16(*family);
        }
        buffer.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullService {
        family: u16,
    }

    #[async_trait]
    impl Service for NullService {
        fn family(&self) -> u16 {
            self.family
        }

        async fn handle_snac(
            &self,
            ctx: ConnContext,
            _session: &Arc<Session>,
            _storage: &Storage,
            _snac: &Snac,
        ) -> Result<ConnContext, ServiceError> {
            Ok(ctx)
        }
    }

    #[test]
    fn advertisement_lists_families_in_registration_order() {
        let mut registry = ServiceRegistry::new();
        for family in [
            FAMILY_GENERIC,
            FAMILY_LOCATION,
            FAMILY_BUDDY,
            FAMILY_ICBM,
            FAMILY_AUTH,
            FAMILY_ALERT,
        ] {
            registry.register(Arc::new(NullService { family }));
        }
        assert_eq!(
            registry.advertisement_payload(),
            vec![0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00, 0x17, 0x00, 0x18]
        );
    }

    #[test]
    fn duplicate_registration_keeps_first_position() {
        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(NullService {
            family: FAMILY_ICBM,
        }));
        registry.register(Arc::new(NullService {
            family: FAMILY_ICBM,
        }));
        assert_eq!(registry.advertisement_payload(), vec![0x00, 0x04]);
        assert!(registry.get(FAMILY_ICBM).is_some());
        assert!(registry.get(FAMILY_ALERT).is_none());
    }

    #[test]
    fn fresh_request_ids_advance() {
        let first = fresh_request_id();
        let second = fresh_request_id();
        assert!(second > first);
    }
}
