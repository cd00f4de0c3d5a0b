//! Transport-agnostic server core: the collection registry and the
//! request handlers.
//!
//! Bodies come in as raw bytes and go out as raw bytes; the HTTP shell
//! only maps paths to [`Operation`]s and error kinds to status codes.
//! The registry map is guarded by one mutex taken briefly around
//! lookup, insert, and erase; each collection's state sits behind its
//! own mutex, so every operation on one collection is totally ordered
//! while distinct collections proceed independently. A panicking
//! request must not poison a collection, so lock poisoning is
//! explicitly discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{info, warn};

use crate::cipher::MlweCiphertext;
use crate::client::Client;
use crate::error::{EvdError, Result};
use crate::keys::{AutedModPackKeys, AutedModPackMlweKeys, CollectionKeys, InvAutKeys};
use crate::math::Polynomial;
use crate::params::{
    log_rank_for_dimension, MetricType, DEGREE, MOD_Q, PIR_LOG_RANK, PIR_PAYLOAD_SIZE, PIR_RANK,
};
use crate::pir::PirServer;
use crate::server::{CachedKeys, Server};
use crate::wire::{
    read_mlwe_ciphertext, read_mlwe_switching_key, read_rlwe_ciphertext, read_switching_key,
    write_rlwe_ciphertext, BinaryReader, BinaryWriter, Operation, SetupStatus,
};

/// Per-collection server state.
struct CollectionState {
    dimension: u64,
    metric: MetricType,
    rank: u64,
    db_size: u64,

    server: Server,
    pir_server: PirServer,
    /// Payload-grid encoder at the PIR rank.
    payload_encoder: Client,

    /// NTT-encoded payload grid, grown lazily: cell `i` holds the
    /// payload at global index `i`; absent cells are all-zero payloads.
    pir_payloads: Vec<Polynomial>,
    /// AES payload blocks for direct retrieval.
    payloads: Vec<Vec<u8>>,

    full_block_caches: Vec<CachedKeys>,
    partial_block_keys: Vec<MlweCiphertext>,
    partial_block_cache: Option<CachedKeys>,
}

impl CollectionState {
    fn new(dimension: u64, metric: MetricType, keys: CollectionKeys) -> Result<Self> {
        let log_rank = log_rank_for_dimension(dimension)?;
        let keys = Arc::new(keys);
        let server = Server::new(log_rank, Arc::clone(&keys))?;
        let pir_server = PirServer::new(Arc::clone(&keys))?;
        Ok(Self {
            dimension,
            metric,
            rank: 1 << log_rank,
            db_size: 0,
            server,
            pir_server,
            payload_encoder: Client::new(PIR_LOG_RANK)?,
            pir_payloads: Vec::new(),
            payloads: Vec::new(),
            full_block_caches: Vec::new(),
            partial_block_keys: Vec::new(),
            partial_block_cache: None,
        })
    }
}

type SharedCollection = Arc<Mutex<CollectionState>>;

/// The server core: a registry of collections plus the request
/// handlers operating on wire bodies.
#[derive(Default)]
pub struct EvdService {
    collections: Mutex<HashMap<u64, SharedCollection>>,
}

impl EvdService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches one request body; `Terminate` and `DropCollection`
    /// are also reachable through their dedicated entry points.
    pub fn handle(&self, op: Operation, body: &[u8]) -> Result<Vec<u8>> {
        match op {
            Operation::Setup => self.handle_setup(body),
            Operation::Insert => self.handle_insert(body),
            Operation::Query => self.handle_query(body, true),
            Operation::QueryPtxt => self.handle_query(body, false),
            Operation::Retrieve => self.handle_retrieve(body),
            Operation::PirRetrieve => self.handle_pir_retrieve(body),
            Operation::DropCollection => {
                let mut r = BinaryReader::new(body);
                let hash = r.read_u64()?;
                Ok(self.drop_collection(hash))
            }
            Operation::Terminate => Ok(b"terminated".to_vec()),
        }
    }

    fn find(&self, hash: u64) -> Option<SharedCollection> {
        let map = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.get(&hash).cloned()
    }

    fn get_or_err(&self, hash: u64) -> Result<SharedCollection> {
        self.find(hash).ok_or(EvdError::UnknownCollection(hash))
    }

    /// Two-phase setup. Phase 1 probes; phase 2 carries the key blob.
    /// Re-running setup on an existing collection only reports its
    /// current dimension, metric, and size (status 0), or a dimension
    /// mismatch (status 2); it never mutates state.
    fn handle_setup(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut r = BinaryReader::new(body);
        let hash = r.read_u64()?;
        let dimension = r.read_u64()?;
        let metric = MetricType::from_u8(r.read_u8()?)?;
        let has_keys = r.read_u8()? != 0;

        if let Some(col) = self.find(hash) {
            let st = col.lock().unwrap_or_else(PoisonError::into_inner);
            let status = if st.dimension != dimension {
                warn!(
                    collection = hash,
                    got = dimension,
                    expected = st.dimension,
                    "setup dimension mismatch"
                );
                SetupStatus::DimensionMismatch
            } else {
                info!(collection = hash, db_size = st.db_size, "collection re-connected");
                SetupStatus::Ready
            };
            return Ok(setup_response(status, st.dimension, st.metric, st.db_size));
        }

        if !has_keys {
            return Ok(setup_response(SetupStatus::NeedKeys, dimension, metric, 0));
        }

        if dimension == 0 || dimension > DEGREE {
            return Err(EvdError::InvalidDimension(dimension));
        }
        let log_rank = log_rank_for_dimension(dimension)?;
        let rank = 1u64 << log_rank;
        let stack = DEGREE / rank;

        let relin = read_switching_key(&mut r)?;

        let mut auted_mod_pack = AutedModPackKeys::empty(rank)?;
        for i in 0..rank as usize {
            for j in 0..stack as usize {
                auted_mod_pack.keys[i][j] = read_switching_key(&mut r)?;
            }
        }

        let mut auted_mod_pack_mlwe = AutedModPackMlweKeys::empty(rank)?;
        for i in 0..rank as usize {
            for j in 0..stack as usize {
                auted_mod_pack_mlwe.keys[i][j] = read_mlwe_switching_key(&mut r, rank)?;
            }
        }

        let mut pir_inv_aut = InvAutKeys::empty(PIR_RANK)?;
        for i in 0..PIR_RANK as usize {
            pir_inv_aut.keys[i] = read_switching_key(&mut r)?;
        }

        let keys = CollectionKeys {
            relin,
            auted_mod_pack,
            auted_mod_pack_mlwe,
            pir_inv_aut,
        };
        let state = CollectionState::new(dimension, metric, keys)?;

        {
            let mut map = self
                .collections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.insert(hash, Arc::new(Mutex::new(state)));
        }
        info!(collection = hash, dimension, "collection set up");

        Ok(setup_response(SetupStatus::Ready, dimension, metric, 0))
    }

    /// Accumulates encrypted key vectors and their sealed payloads.
    /// Every N keys become a permanent full-block cache; a leftover
    /// partial block is re-cached (zero-padded) after each insert.
    fn handle_insert(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut r = BinaryReader::new(body);
        let hash = r.read_u64()?;
        let num = r.read_u64()?;

        let col = self.get_or_err(hash)?;
        let mut st = col.lock().unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();

        let projected = st
            .db_size
            .checked_add(num)
            .ok_or(EvdError::Protocol("insert count overflows"))?;
        if projected > PIR_RANK * PIR_RANK {
            return Err(EvdError::PirCapacityExceeded(projected));
        }

        for _ in 0..num {
            let key = read_mlwe_ciphertext(&mut r, st.rank)?;
            let payload = r.read_bytes(PIR_PAYLOAD_SIZE)?.to_vec();

            let encoded = st.payload_encoder.encode_pir_payload(&payload)?;
            st.pir_payloads.push(encoded);
            st.payloads.push(payload);
            st.partial_block_keys.push(key);

            if st.partial_block_keys.len() as u64 == DEGREE {
                let cache = st.server.cache_keys(&st.partial_block_keys)?;
                st.full_block_caches.push(cache);
                st.partial_block_keys.clear();
                st.partial_block_cache = None;
            }
        }

        if !st.partial_block_keys.is_empty() {
            let mut padded = st.partial_block_keys.clone();
            while (padded.len() as u64) < DEGREE {
                padded.push(MlweCiphertext::zero(st.rank)?);
            }
            st.partial_block_cache = Some(st.server.cache_keys(&padded)?);
        }

        st.db_size += num;
        info!(
            collection = hash,
            inserted = num,
            db_size = st.db_size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "insert complete"
        );
        Ok(Vec::new())
    }

    /// Runs one similarity query: cache the query, inner-product it
    /// against every block cache, and return ⌈db/N⌉ score ciphertexts.
    fn handle_query(&self, body: &[u8], is_encrypted: bool) -> Result<Vec<u8>> {
        let mut r = BinaryReader::new(body);
        let hash = r.read_u64()?;

        let col = self.get_or_err(hash)?;
        let st = col.lock().unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();

        if st.db_size == 0 {
            return Err(EvdError::EmptyCollection(hash));
        }

        let mut w = BinaryWriter::with_capacity(
            (st.full_block_caches.len() + 1) * 2 * DEGREE as usize * 8,
        );

        if is_encrypted {
            let query = read_mlwe_ciphertext(&mut r, st.rank)?;
            let cache = st.server.cache_query(&query)?;
            for block in &st.full_block_caches {
                let res = st.server.inner_product(&cache, block)?;
                write_rlwe_ciphertext(&mut w, &res);
            }
            if let Some(partial) = &st.partial_block_cache {
                let res = st.server.inner_product(&cache, partial)?;
                write_rlwe_ciphertext(&mut w, &res);
            }
        } else {
            let query = r.read_poly(st.rank, MOD_Q, false)?;
            let cache = st.server.cache_query_plain(&query)?;
            for block in &st.full_block_caches {
                let res = st.server.inner_product_plain(&cache, block)?;
                write_rlwe_ciphertext(&mut w, &res);
            }
            if let Some(partial) = &st.partial_block_cache {
                let res = st.server.inner_product_plain(&cache, partial)?;
                write_rlwe_ciphertext(&mut w, &res);
            }
        }

        info!(
            collection = hash,
            encrypted = is_encrypted,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "query answered"
        );
        Ok(w.into_inner())
    }

    /// Direct payload retrieval; out-of-range indices yield all-zero
    /// blocks rather than an error, matching the insert-side padding.
    fn handle_retrieve(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut r = BinaryReader::new(body);
        let hash = r.read_u64()?;
        let num = r.read_u64()?;

        let col = self.get_or_err(hash)?;
        let st = col.lock().unwrap_or_else(PoisonError::into_inner);

        if r.remaining() < num.saturating_mul(8) as usize {
            return Err(EvdError::Protocol("short read"));
        }
        let mut w = BinaryWriter::with_capacity(num as usize * PIR_PAYLOAD_SIZE);
        for _ in 0..num {
            let index = r.read_u64()?;
            if index < st.db_size {
                w.put_bytes(&st.payloads[index as usize]);
            } else {
                w.put_bytes(&vec![0u8; PIR_PAYLOAD_SIZE]);
            }
        }
        Ok(w.into_inner())
    }

    /// Oblivious payload retrieval over the encoded grid.
    fn handle_pir_retrieve(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut r = BinaryReader::new(body);
        let hash = r.read_u64()?;

        let col = self.get_or_err(hash)?;
        let st = col.lock().unwrap_or_else(PoisonError::into_inner);

        if st.db_size == 0 {
            return Err(EvdError::EmptyCollection(hash));
        }
        if st.db_size > PIR_RANK * PIR_RANK {
            return Err(EvdError::PirCapacityExceeded(st.db_size));
        }

        let first_dim = read_rlwe_ciphertext(&mut r, false)?;
        let second_dim = read_rlwe_ciphertext(&mut r, false)?;

        let res = st.pir_server.pir(&first_dim, &second_dim, &st.pir_payloads)?;

        let mut w = BinaryWriter::with_capacity(2 * DEGREE as usize * 8);
        write_rlwe_ciphertext(&mut w, &res);
        Ok(w.into_inner())
    }

    /// Removes a collection; dropping an unknown hash is not an error.
    pub fn drop_collection(&self, hash: u64) -> Vec<u8> {
        let removed = {
            let mut map = self
                .collections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.remove(&hash).is_some()
        };
        if removed {
            info!(collection = hash, "collection dropped");
        } else {
            warn!(collection = hash, "drop requested for unknown collection");
        }
        b"dropped".to_vec()
    }
}

fn setup_response(status: SetupStatus, dimension: u64, metric: MetricType, db_size: u64) -> Vec<u8> {
    let mut w = BinaryWriter::with_capacity(18);
    w.put_u8(status as u8);
    w.put_u64(dimension);
    w.put_u8(metric as u8);
    w.put_u64(db_size);
    w.into_inner()
}

/// A [`crate::coordinator::Transport`] that invokes the service in the
/// same process; used by embedded deployments and the test suite.
pub struct InProcessTransport {
    service: Arc<EvdService>,
}

impl InProcessTransport {
    pub fn new(service: Arc<EvdService>) -> Self {
        Self { service }
    }
}

impl crate::coordinator::Transport for InProcessTransport {
    fn post(&mut self, op: Operation, body: Vec<u8>) -> Result<Vec<u8>> {
        self.service.handle(op, &body)
    }

    fn delete_collection(&mut self, collection_hash: u64) -> Result<Vec<u8>> {
        Ok(self.service.drop_collection(collection_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_collection_is_input_error() {
        let service = EvdService::new();
        let mut w = BinaryWriter::new();
        w.put_u64(0xdead);
        w.put_u64(1);
        let err = service.handle(Operation::Insert, &w.into_inner()).unwrap_err();
        assert!(matches!(err, EvdError::UnknownCollection(0xdead)));
    }

    #[test]
    fn phase_one_setup_asks_for_keys() {
        let service = EvdService::new();
        let mut w = BinaryWriter::new();
        w.put_u64(7);
        w.put_u64(16);
        w.put_u8(MetricType::Cosine as u8);
        w.put_u8(0);
        let resp = service.handle(Operation::Setup, &w.into_inner()).unwrap();
        let mut r = BinaryReader::new(&resp);
        assert_eq!(r.read_u8().unwrap(), SetupStatus::NeedKeys as u8);
        assert_eq!(r.read_u64().unwrap(), 16);
    }

    #[test]
    fn truncated_setup_is_protocol_error() {
        let service = EvdService::new();
        let err = service.handle(Operation::Setup, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, EvdError::Protocol(_)));
    }

    #[test]
    fn drop_unknown_collection_is_ok() {
        let service = EvdService::new();
        assert_eq!(service.drop_collection(123), b"dropped".to_vec());
    }
}
