use super::{ConnContext, Service, ServiceError, FAMILY_ALERT};
use crate::session::Session;
use async_trait::async_trait;
use oscard_proto::Snac;
use oscard_storage::Storage;
use std::sync::Arc;
use tracing::debug;

pub const SUBTYPE_STATUS_REQUEST: u16 = 0x0006;
pub const SUBTYPE_STATUS_REPLY: u16 = 0x0007;

/// Family 0x18: alert/email status stubs. Clients poll this family at
/// sign-on; an empty reply keeps them quiet.
pub struct AlertService;

#[async_trait]
impl Service for AlertService {
    fn family(&self) -> u16 {
        FAMILY_ALERT
    }

    async fn handle_snac(
        &self,
        ctx: ConnContext,
        session: &Arc<Session>,
        _storage: &Storage,
        snac: &Snac,
    ) -> Result<ConnContext, ServiceError> {
        match snac.header.subtype {
            SUBTYPE_STATUS_REQUEST => {
                session
                    .send_snac(&Snac::new(
                        FAMILY_ALERT,
                        SUBTYPE_STATUS_REPLY,
                        snac.header.request_id,
                        Vec::new(),
                    ))
                    .await?;
                Ok(ctx)
            }
            subtype => {
                debug!(subtype, "ignored alert command");
                Ok(ctx)
            }
        }
    }
}
