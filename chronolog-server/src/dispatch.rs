//! Routes authenticated requests to store operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use chronolog_store::{validate_key, CollectionRouter, Store};

use crate::protocol::{
    encode, AckResponse, DeleteUserRequest, Envelope, InsertItem, MessageType, ProtocolError,
    QueryRequest, QueryResponse, QueryUserRequest, QueryUserResponse,
};

/// Turns request envelopes into response frames.
pub struct Dispatcher {
    router: Arc<CollectionRouter>,
}

impl Dispatcher {
    pub fn new(router: Arc<CollectionRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<CollectionRouter> {
        &self.router
    }

    /// Handle one request. The `api-key` handshake is the connection's job.
    ///
    /// Blocking: resolving a collection may load it from disk and deleting
    /// a uid removes its directory. Async callers run this on the blocking
    /// pool.
    pub fn dispatch(&self, envelope: &Envelope) -> Result<String, ProtocolError> {
        match envelope.msg_type {
            MessageType::Insert => self.insert(envelope),
            MessageType::Query => self.query(envelope),
            MessageType::QueryUser => self.query_user(envelope),
            MessageType::DeleteUser => self.delete_user(envelope),
            MessageType::ApiKey => Err(ProtocolError::InvalidPayload(
                "api-key is handled by the connection".into(),
            )),
        }
    }

    /// Validate the whole batch first so a bad item inserts nothing.
    fn insert(&self, envelope: &Envelope) -> Result<String, ProtocolError> {
        let items: Vec<InsertItem> = envelope.payload()?;

        let mut batch: Vec<(Arc<Store>, String, i64, String)> = Vec::with_capacity(items.len());
        for item in items {
            let ts = item.ts.ok_or(ProtocolError::MissingField("ts"))?;
            let uid = item.uid.ok_or(ProtocolError::MissingField("uid"))?;
            let data = item.data.ok_or(ProtocolError::MissingField("data"))?;
            let collection = item.collection.ok_or(ProtocolError::MissingField("collection"))?;
            validate_key(&uid)?;
            let store = self.router.resolve(&collection)?;
            batch.push((store, uid, ts, data));
        }

        let count = batch.len();
        for (store, uid, ts, data) in batch {
            store.insert(&uid, ts, data)?;
        }
        log::debug!("Inserted {count} records");

        encode(&AckResponse {
            id: envelope.id.clone(),
        })
    }

    fn query(&self, envelope: &Envelope) -> Result<String, ProtocolError> {
        let req: QueryRequest = envelope.payload()?;
        let ts = req.ts.ok_or(ProtocolError::MissingField("ts"))?;
        let collection = req.collection.ok_or(ProtocolError::MissingField("collection"))?;
        let store = self.router.resolve(&collection)?;

        let records: BTreeMap<_, _> = match req.uid.filter(|uid| !uid.is_empty()) {
            Some(uid) => store
                .latest_for_user(&uid, ts)
                .map(|record| (uid, record))
                .into_iter()
                .collect(),
            None => store.all_latest(ts).into_iter().collect(),
        };

        encode(&QueryResponse {
            id: envelope.id.clone(),
            records,
        })
    }

    fn query_user(&self, envelope: &Envelope) -> Result<String, ProtocolError> {
        let req: QueryUserRequest = envelope.payload()?;
        let uid = req.uid.ok_or(ProtocolError::MissingField("uid"))?;
        let from = req.from.ok_or(ProtocolError::MissingField("from"))?;
        let to = req.to.ok_or(ProtocolError::MissingField("to"))?;
        let collection = req.collection.ok_or(ProtocolError::MissingField("collection"))?;
        if from > to {
            return Err(ProtocolError::InvalidPayload(format!(
                "from ({from}) is after to ({to})"
            )));
        }
        let store = self.router.resolve(&collection)?;

        encode(&QueryUserResponse {
            id: envelope.id.clone(),
            records: store.range(&uid, from, to),
        })
    }

    fn delete_user(&self, envelope: &Envelope) -> Result<String, ProtocolError> {
        let req: DeleteUserRequest = envelope.payload()?;
        let uid = req.uid.ok_or(ProtocolError::MissingField("uid"))?;

        match req.collection.filter(|c| !c.is_empty()) {
            Some(collection) => {
                if let Some(store) = self.router.get(&collection) {
                    store.delete_user(&uid);
                }
            }
            None => {
                for store in self.router.stores() {
                    store.delete_user(&uid);
                }
            }
        }
        log::info!("Deleted user {uid}");

        encode(&AckResponse {
            id: envelope.id.clone(),
        })
    }
}
