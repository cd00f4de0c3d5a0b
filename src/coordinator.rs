//! Client-side orchestration: per-collection contexts, request
//! building, score handling, and the payload envelope.
//!
//! The coordinator owns the secret key and the AES payload key
//! (optionally persisted to disk), one cryptographic [`Client`] per
//! collection at the collection's rank, and one shared PIR client at
//! `PIR_RANK`. All traffic goes through a [`Transport`], so the same
//! coordinator drives an HTTP connection or an in-process service.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::client::{top_k_entries, Client};
use crate::error::{EvdError, Result};
use crate::keys::SecretKey;
use crate::math::rng;
use crate::params::{
    log_rank_for_dimension, MetricType, ScaleConfig, AES_KEY_SIZE, DEGREE, PIR_FIRST_LOG_SCALE,
    PIR_LOG_RANK, PIR_PAYLOAD_SIZE, PIR_RANK, PIR_SECOND_LOG_SCALE,
};
use crate::payload::{open_payload, seal_payload};
use crate::wire::{
    collection_hash, read_rlwe_ciphertext, write_mlwe_ciphertext, write_mlwe_switching_key,
    write_switching_key, BinaryReader, BinaryWriter, Operation, SetupStatus,
};

/// Byte transport between coordinator and service.
///
/// `post` carries one request body and returns the response body;
/// transport-level failures surface as protocol errors and the
/// implementation must close its session on them.
pub trait Transport {
    fn post(&mut self, op: Operation, body: Vec<u8>) -> Result<Vec<u8>>;
    fn delete_collection(&mut self, collection_hash: u64) -> Result<Vec<u8>>;
}

/// Optional on-disk key locations.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Secret-key file; loaded if present, written after generation.
    pub secret_key_path: Option<PathBuf>,
    /// AES payload-key file; loaded if present, written after generation.
    pub aes_key_path: Option<PathBuf>,
}

struct CollectionContext {
    rank: u64,
    scales: ScaleConfig,
    is_query_encrypted: bool,
    client: Client,
}

/// Client-side entry point for the encrypted vector database.
pub struct Coordinator<T: Transport> {
    transport: T,
    contexts: HashMap<String, CollectionContext>,
    db_sizes: HashMap<String, u64>,
    secret_key: Option<SecretKey>,
    secret_key_path: Option<PathBuf>,
    aes_key: [u8; AES_KEY_SIZE],
    pir_client: Client,
}

impl<T: Transport> Coordinator<T> {
    /// Creates a coordinator, loading or generating the AES key and
    /// loading the secret key if a readable file is configured.
    pub fn new(transport: T, config: CoordinatorConfig) -> Result<Self> {
        let secret_key = config
            .secret_key_path
            .as_ref()
            .and_then(|p| SecretKey::load(p).ok());
        if secret_key.is_some() {
            info!("loaded secret key from disk");
        }

        let mut aes_key = [0u8; AES_KEY_SIZE];
        let mut have_aes = false;
        if let Some(path) = &config.aes_key_path {
            if let Ok(bytes) = std::fs::read(path) {
                if bytes.len() == AES_KEY_SIZE {
                    aes_key.copy_from_slice(&bytes);
                    have_aes = true;
                    info!("loaded AES key from disk");
                }
            }
        }
        if !have_aes {
            rng::fill_uniform_bytes(&mut aes_key)?;
            if let Some(path) = &config.aes_key_path {
                if std::fs::write(path, aes_key).is_ok() {
                    info!("saved new AES key");
                }
            }
        }

        Ok(Self {
            transport,
            contexts: HashMap::new(),
            db_sizes: HashMap::new(),
            secret_key,
            secret_key_path: config.secret_key_path,
            aes_key,
            pir_client: Client::new(PIR_LOG_RANK)?,
        })
    }

    /// Known size of a collection, if set up in this session.
    pub fn db_size(&self, name: &str) -> Option<u64> {
        self.db_sizes.get(name).copied()
    }

    /// Generates and (optionally) persists the secret key if none is
    /// loaded yet.
    fn ensure_secret_key(&mut self, client: &Client) -> Result<()> {
        if self.secret_key.is_none() {
            let sk = client.gen_sec_key()?;
            if let Some(path) = &self.secret_key_path {
                if sk.save(path).is_ok() {
                    info!("saved new secret key");
                }
            }
            self.secret_key = Some(sk);
        }
        Ok(())
    }

    /// Two-phase collection setup.
    ///
    /// Phase 1 probes the server. If the collection exists with a
    /// matching dimension the call is a no-op returning its current
    /// size; a mismatch is an input error. A new collection triggers
    /// key generation and the phase-2 key upload.
    pub fn setup_collection(
        &mut self,
        name: &str,
        dimension: u64,
        metric_name: &str,
        is_query_encrypted: bool,
    ) -> Result<u64> {
        let metric = MetricType::from_name(metric_name)?;
        let scales = ScaleConfig::select(metric, is_query_encrypted)?;
        let log_rank = log_rank_for_dimension(dimension)?;
        let rank = 1u64 << log_rank;
        let stack = DEGREE / rank;
        let hash = collection_hash(name);

        let mut probe = BinaryWriter::with_capacity(18);
        probe.put_u64(hash);
        probe.put_u64(dimension);
        probe.put_u8(metric as u8);
        probe.put_u8(0);
        let resp = self.transport.post(Operation::Setup, probe.into_inner())?;

        let (status, server_dim, server_metric, server_db) = parse_setup_response(&resp)?;
        match status {
            SetupStatus::DimensionMismatch => {
                return Err(EvdError::DimensionMismatch {
                    expected: server_dim,
                    got: dimension,
                });
            }
            SetupStatus::Ready => {
                if !self.contexts.contains_key(name) {
                    let server_log_rank = log_rank_for_dimension(server_dim)?;
                    self.contexts.insert(
                        name.to_string(),
                        CollectionContext {
                            rank: 1 << server_log_rank,
                            scales: ScaleConfig::select(server_metric, is_query_encrypted)?,
                            is_query_encrypted,
                            client: Client::new(server_log_rank)?,
                        },
                    );
                }
                self.db_sizes.insert(name.to_string(), server_db);
                info!(collection = name, db_size = server_db, "collection ready");
                return Ok(server_db);
            }
            SetupStatus::NeedKeys => {}
        }

        // New collection: generate key material and upload it.
        let client = Client::new(log_rank)?;
        self.ensure_secret_key(&client)?;
        let sec = self.secret_key.as_ref().ok_or(EvdError::SecretKeyUnavailable)?;

        let relin = client.gen_relin_key(sec)?;
        let auted = client.gen_auted_mod_pack_keys(sec)?;
        let auted_mlwe = client.gen_inv_auted_mod_pack_keys(sec)?;
        let pir_keys = self.pir_client.gen_inv_aut_keys(sec, PIR_RANK)?;
        debug!(collection = name, "generated evaluation keys");

        let key_poly_bytes = DEGREE as usize * 8;
        let blob_size = 18
            + 4 * key_poly_bytes
            + 2 * (rank * stack) as usize * 4 * key_poly_bytes
            + PIR_RANK as usize * 4 * key_poly_bytes;
        let mut upload = BinaryWriter::with_capacity(blob_size);
        upload.put_u64(hash);
        upload.put_u64(dimension);
        upload.put_u8(metric as u8);
        upload.put_u8(1);

        write_switching_key(&mut upload, &relin);
        for row in &auted.keys {
            for key in row {
                write_switching_key(&mut upload, key);
            }
        }
        for row in &auted_mlwe.keys {
            for key in row {
                write_mlwe_switching_key(&mut upload, key);
            }
        }
        for key in &pir_keys.keys {
            write_switching_key(&mut upload, key);
        }

        let resp = self.transport.post(Operation::Setup, upload.into_inner())?;
        let (status, server_dim, _, server_db) = parse_setup_response(&resp)?;
        match status {
            SetupStatus::Ready => {}
            SetupStatus::DimensionMismatch => {
                return Err(EvdError::DimensionMismatch {
                    expected: server_dim,
                    got: dimension,
                });
            }
            SetupStatus::NeedKeys => {
                return Err(EvdError::UnexpectedStatus(status as u8));
            }
        }

        self.contexts.insert(
            name.to_string(),
            CollectionContext {
                rank,
                scales,
                is_query_encrypted,
                client,
            },
        );
        self.db_sizes.insert(name.to_string(), server_db);
        info!(collection = name, dimension, "collection registered");
        Ok(server_db)
    }

    /// Encrypts and uploads a batch of vectors with their payloads.
    pub fn insert(&mut self, name: &str, vectors: &[Vec<f32>], payloads: &[String]) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }
        if vectors.len() != payloads.len() {
            return Err(EvdError::PayloadCountMismatch {
                vectors: vectors.len(),
                payloads: payloads.len(),
            });
        }
        let hash = collection_hash(name);
        let ctx = self
            .contexts
            .get(name)
            .ok_or(EvdError::UnknownCollection(hash))?;
        for v in vectors {
            if v.len() as u64 > ctx.rank {
                return Err(EvdError::DimensionExceedsRank {
                    got: v.len() as u64,
                    capacity: ctx.rank,
                });
            }
        }
        let sec = self.secret_key.as_ref().ok_or(EvdError::SecretKeyUnavailable)?;
        let current = self.db_sizes.get(name).copied().unwrap_or(0);

        let stack = DEGREE / ctx.rank;
        let per_item = (stack + 1) as usize * ctx.rank as usize * 8 + PIR_PAYLOAD_SIZE;
        let mut body = BinaryWriter::with_capacity(16 + vectors.len() * per_item);
        body.put_u64(hash);
        body.put_u64(vectors.len() as u64);

        for (i, (v, payload)) in vectors.iter().zip(payloads).enumerate() {
            let mut msg = vec![0.0f64; ctx.rank as usize];
            for (dst, &src) in msg.iter_mut().zip(v.iter()) {
                *dst = src as f64;
            }
            let key = ctx.client.encrypt_key(&msg, sec, ctx.scales.key_scale)?;
            write_mlwe_ciphertext(&mut body, &key);

            let global_idx = current + i as u64;
            let sealed = seal_payload(payload.as_bytes(), &self.aes_key, global_idx)?;
            body.put_bytes(&sealed);
        }

        self.transport.post(Operation::Insert, body.into_inner())?;
        *self.db_sizes.entry(name.to_string()).or_insert(0) += vectors.len() as u64;
        info!(collection = name, inserted = vectors.len(), "insert sent");
        Ok(())
    }

    /// Runs a similarity query and returns the decoded scores for every
    /// stored vector, in insertion order. Positions past the database
    /// size are discarded.
    pub fn query(&mut self, name: &str, query_vec: &[f32]) -> Result<Vec<f32>> {
        if !self.contexts.contains_key(name) {
            self.setup_collection(name, query_vec.len() as u64, "COSINE", true)?;
        }
        let hash = collection_hash(name);
        let db_size = self.db_sizes.get(name).copied().unwrap_or(0);
        if db_size == 0 {
            return Err(EvdError::EmptyCollection(hash));
        }
        let ctx = self
            .contexts
            .get(name)
            .ok_or(EvdError::UnknownCollection(hash))?;
        if query_vec.len() as u64 > ctx.rank {
            return Err(EvdError::DimensionExceedsRank {
                got: query_vec.len() as u64,
                capacity: ctx.rank,
            });
        }
        let sec = self.secret_key.as_ref().ok_or(EvdError::SecretKeyUnavailable)?;

        let mut msg = vec![0.0f64; ctx.rank as usize];
        for (dst, &src) in msg.iter_mut().zip(query_vec.iter()) {
            *dst = src as f64;
        }

        let mut body = BinaryWriter::new();
        body.put_u64(hash);
        let op = if ctx.is_query_encrypted {
            let query = ctx.client.encrypt_query(&msg, sec, ctx.scales.query_scale)?;
            write_mlwe_ciphertext(&mut body, &query);
            Operation::Query
        } else {
            let query = ctx.client.encode_query(&msg, ctx.scales.query_scale)?;
            body.put_poly(&query);
            Operation::QueryPtxt
        };

        let resp = self.transport.post(op, body.into_inner())?;

        let ctx = self
            .contexts
            .get(name)
            .ok_or(EvdError::UnknownCollection(hash))?;
        let sec = self.secret_key.as_ref().ok_or(EvdError::SecretKeyUnavailable)?;

        let blocks = db_size.div_ceil(DEGREE) as usize;
        let expected = blocks * 2 * DEGREE as usize * 8;
        if resp.len() != expected {
            return Err(EvdError::Protocol("query response has wrong length"));
        }
        let mut r = BinaryReader::new(&resp);
        let mut score_cts = Vec::with_capacity(blocks);
        for _ in 0..blocks {
            score_cts.push(read_rlwe_ciphertext(&mut r, true)?);
        }

        let decoded = ctx
            .client
            .decrypt_score(&score_cts, sec, ctx.scales.output_scale())?;

        let mut results = Vec::with_capacity(db_size as usize);
        'outer: for block in &decoded {
            for &score in block {
                if results.len() as u64 >= db_size {
                    break 'outer;
                }
                results.push(score as f32);
            }
        }
        Ok(results)
    }

    /// Query followed by client-side top-k selection; returns indices
    /// in descending score order, ties toward the lower index.
    pub fn query_top_k(&mut self, name: &str, query_vec: &[f32], k: usize) -> Result<Vec<u64>> {
        let scores = self.query(name, query_vec)?;
        Ok(Self::top_k_indices(&scores, k))
    }

    /// Like [`Self::query_top_k`] but keeps the scores.
    pub fn query_top_k_with_scores(
        &mut self,
        name: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<(u64, f32)>> {
        let scores = self.query(name, query_vec)?;
        Ok(top_k_entries(
            scores.iter().enumerate().map(|(i, &s)| (s as f64, i as u64)),
            k.min(scores.len()),
        )
        .into_iter()
        .map(|(s, i)| (i, s as f32))
        .collect())
    }

    /// Top-k indices of a score slice, descending, lower index on ties.
    pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<u64> {
        top_k_entries(
            scores.iter().enumerate().map(|(i, &s)| (s as f64, i as u64)),
            k.min(scores.len()),
        )
        .into_iter()
        .map(|(_, i)| i)
        .collect()
    }

    /// Direct (non-oblivious) payload retrieval.
    pub fn retrieve(&mut self, name: &str, index: u64) -> Result<Vec<u8>> {
        let hash = collection_hash(name);
        if !self.contexts.contains_key(name) {
            return Err(EvdError::UnknownCollection(hash));
        }
        let db_size = self.db_sizes.get(name).copied().unwrap_or(0);
        if index >= db_size {
            return Err(EvdError::IndexOutOfRange { index, db_size });
        }

        let mut body = BinaryWriter::with_capacity(24);
        body.put_u64(hash);
        body.put_u64(1);
        body.put_u64(index);

        let resp = self.transport.post(Operation::Retrieve, body.into_inner())?;
        if resp.len() != PIR_PAYLOAD_SIZE {
            return Err(EvdError::Protocol("retrieve response has wrong length"));
        }
        open_payload(&resp, &self.aes_key, index)
    }

    /// Oblivious payload retrieval: the server never learns `index`.
    pub fn retrieve_pir(&mut self, name: &str, index: u64) -> Result<Vec<u8>> {
        let hash = collection_hash(name);
        if !self.contexts.contains_key(name) {
            return Err(EvdError::UnknownCollection(hash));
        }
        let db_size = self.db_sizes.get(name).copied().unwrap_or(0);
        if index >= db_size {
            return Err(EvdError::IndexOutOfRange { index, db_size });
        }
        if db_size > PIR_RANK * PIR_RANK {
            return Err(EvdError::PirCapacityExceeded(db_size));
        }
        let sec = self.secret_key.as_ref().ok_or(EvdError::SecretKeyUnavailable)?;

        let first_scale = (2.0f64).powf(PIR_FIRST_LOG_SCALE);
        let second_scale = (2.0f64).powf(PIR_SECOND_LOG_SCALE);
        let row = index / PIR_RANK;
        let col = index % PIR_RANK;

        let first = self.pir_client.encrypt_pir(row, sec, first_scale)?;
        let second = self.pir_client.encrypt_pir(col, sec, second_scale)?;

        let mut body = BinaryWriter::with_capacity(8 + 4 * DEGREE as usize * 8);
        body.put_u64(hash);
        body.put_poly(&first.a);
        body.put_poly(&first.b);
        body.put_poly(&second.a);
        body.put_poly(&second.b);

        let resp = self
            .transport
            .post(Operation::PirRetrieve, body.into_inner())?;
        if resp.len() != 2 * DEGREE as usize * 8 {
            return Err(EvdError::Protocol("PIR response has wrong length"));
        }
        let mut r = BinaryReader::new(&resp);
        let result = read_rlwe_ciphertext(&mut r, true)?;

        let sec = self.secret_key.as_ref().ok_or(EvdError::SecretKeyUnavailable)?;
        let combined_scale = (2.0f64).powf(PIR_FIRST_LOG_SCALE + PIR_SECOND_LOG_SCALE);
        let dmsg = self.pir_client.decrypt(&result, sec, combined_scale)?;
        let sealed = self.pir_client.decode_pir_payload(&dmsg)?;
        open_payload(&sealed, &self.aes_key, index)
    }

    /// Drops the collection on the server and forgets it locally.
    pub fn drop_collection(&mut self, name: &str) -> Result<()> {
        self.transport.delete_collection(collection_hash(name))?;
        self.contexts.remove(name);
        self.db_sizes.remove(name);
        info!(collection = name, "collection dropped");
        Ok(())
    }

    /// Best-effort transport shutdown signal.
    pub fn terminate(&mut self) {
        let _ = self.transport.post(Operation::Terminate, Vec::new());
    }
}

fn parse_setup_response(resp: &[u8]) -> Result<(SetupStatus, u64, MetricType, u64)> {
    let mut r = BinaryReader::new(resp);
    let status = SetupStatus::from_u8(r.read_u8()?)?;
    let dimension = r.read_u64()?;
    let metric = MetricType::from_u8(r.read_u8()?)?;
    let db_size = r.read_u64()?;
    Ok((status, dimension, metric, db_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl Transport for Dummy {
        fn post(&mut self, _op: Operation, _body: Vec<u8>) -> Result<Vec<u8>> {
            Err(EvdError::Protocol("dummy transport"))
        }
        fn delete_collection(&mut self, _hash: u64) -> Result<Vec<u8>> {
            Err(EvdError::Protocol("dummy transport"))
        }
    }

    #[test]
    fn top_k_indices_orders_descending() {
        let scores = [0.1f32, 0.7, 0.7, -0.3, 0.9];
        assert_eq!(Coordinator::<Dummy>::top_k_indices(&scores, 3), vec![4, 1, 2]);
    }

    #[test]
    fn top_k_caps_at_available_scores() {
        let scores = [0.5f32, 0.2];
        assert_eq!(Coordinator::<Dummy>::top_k_indices(&scores, 10), vec![0, 1]);
    }
}
