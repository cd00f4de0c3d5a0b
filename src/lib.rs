//! EVD: an encrypted vector database.
//!
//! Clients store embedding vectors and opaque payloads under a
//! ring-LWE / module-LWE scheme over the negacyclic ring
//! Z_q[X]/(X^4096 + 1), obtain inner-product or cosine similarity
//! scores against the whole database without revealing the query, and
//! retrieve payloads directly or through two-dimensional private
//! information retrieval.
//!
//! Key components:
//! - `math` / `eval`: NTT-based polynomial algebra, automorphisms,
//!   mod-switching, key-switching, batched multiply-sums
//! - `client`: key generation, encoding, encryption, score decryption
//! - `server`: modulus-packing query/key caches and batched inner
//!   products
//! - `pir`: oblivious two-dimensional selection over the payload grid
//! - `service` / `coordinator`: the transport-agnostic server core and
//!   the client-side orchestration around it

pub mod cipher;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod eval;
pub mod keys;
pub mod math;
pub mod params;
pub mod payload;
pub mod pir;
pub mod server;
pub mod service;
pub mod wire;

pub use cipher::{MlweCiphertext, RlweCiphertext};
pub use client::{Client, Message};
pub use coordinator::{Coordinator, CoordinatorConfig, Transport};
pub use error::{ErrorKind, EvdError, Result};
pub use eval::HEval;
pub use keys::{CollectionKeys, SecretKey, SwitchingKey};
pub use params::MetricType;
pub use pir::PirServer;
pub use server::Server;
pub use service::{EvdService, InProcessTransport};
