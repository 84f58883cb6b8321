/// DiscoveryServant: receives announcements on the datagram endpoint and
/// hands them to the runtime, which owns the directory.
use async_trait::async_trait;
use lantalk_transport::{decode, Current, DispatchError, Servant};

use crate::runtime::RuntimeHandle;
use crate::types::{ops, Announce};

pub struct DiscoveryServant {
    handle: RuntimeHandle,
}

impl DiscoveryServant {
    pub fn new(handle: RuntimeHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Servant for DiscoveryServant {
    async fn dispatch(
        &self,
        operation: &str,
        payload: &[u8],
        current: &Current,
    ) -> Result<Vec<u8>, DispatchError> {
        if operation != ops::ANNOUNCE {
            return Err(DispatchError::OperationNotExist(operation.to_string()));
        }

        let mut announce: Announce = decode(payload)?;
        // Announcers bound to every interface do not know their own address.
        if announce.peer.has_unspecified_host() {
            announce.peer = announce.peer.with_host(current.remote_addr.ip());
        }

        if self.handle.announce(announce).await.is_err() {
            tracing::debug!("announcement dropped: runtime shut down");
        }
        Ok(Vec::new())
    }
}
