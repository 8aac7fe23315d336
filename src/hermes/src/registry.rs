//! RPC id → handler map. Lookups are concurrent; insert/remove take the
//! write lock.

use std::any::Any;
use std::sync::Arc;

use fnv::FnvHashMap;
use spin::RwLock;

use crate::error::{Error, Result};
use crate::handle::Handle;

pub type RpcId = u64;

/// Handler invoked by trigger when a request for the registered id arrives.
///
/// The handler receives its own reference on the handle and must release it
/// with [`Handle::destroy`] once done (a response may be sent later, from
/// another thread). A handler that returns an error must not destroy: the
/// core reclaims the reference and, when the request expects a response,
/// sends an automatic error response carrying the returned code.
pub type RpcHandler = Arc<dyn Fn(&Arc<Handle>) -> Result<()> + Send + Sync>;

pub(crate) struct RpcInfo {
    pub id: RpcId,
    pub handler: RpcHandler,
    #[allow(dead_code)]
    data: Option<Box<dyn Any + Send + Sync>>,
}

pub(crate) struct RpcRegistry {
    map: RwLock<FnvHashMap<RpcId, Arc<RpcInfo>>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(FnvHashMap::default()),
        }
    }

    /// Registers `handler` under `id`, replacing any previous registration.
    pub fn insert(
        &self,
        id: RpcId,
        handler: RpcHandler,
        data: Option<Box<dyn Any + Send + Sync>>,
    ) {
        let info = Arc::new(RpcInfo { id, handler, data });
        self.map.write().insert(id, info);
    }

    pub fn remove(&self, id: RpcId) -> Result<()> {
        self.map
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NoEntry(format!("RPC id {id}")))
    }

    pub fn lookup(&self, id: RpcId) -> Option<Arc<RpcInfo>> {
        self.map.read().get(&id).cloned()
    }

    #[inline]
    pub fn contains(&self, id: RpcId) -> bool {
        self.map.read().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove() {
        let reg = RpcRegistry::new();
        assert!(!reg.contains(7));
        reg.insert(7, Arc::new(|_| Ok(())), None);
        assert!(reg.contains(7));
        assert_eq!(reg.lookup(7).unwrap().id, 7);

        // Re-registration replaces.
        reg.insert(7, Arc::new(|_| Err(Error::Timeout)), None);
        let info = reg.lookup(7).unwrap();
        assert_eq!(info.id, 7);

        reg.remove(7).unwrap();
        assert!(reg.lookup(7).is_none());
        assert!(matches!(reg.remove(7), Err(Error::NoEntry(_))));
    }
}
