//! # Sealpost Engine - Encrypt and Ship Library
//!
//! A headless engine that drains an input directory into a remote store.
//! Every matching file is moved out of the input tree, encrypted to a
//! recipient public key, uploaded in resumable chunks and removed locally
//! once the remote copy is committed.
//!
//! ## Overview
//!
//! The engine is built around a per-file pipeline. It features:
//! - Recursive traversal with post-order pruning of emptied directories
//! - Atomic staging so a file is never picked up twice
//! - Encryption to an age X25519 recipient, optionally ASCII-armored
//! - Chunked uploads that resume from the server-confirmed offset
//! - Per-file fault isolation with a run report
//! - Progress reporting via an observer trait (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sealpost_engine::{run_ingest, store, AgeGateway, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load and validate the configuration
//! let mut config = Config::from_file("sealpost.toml".as_ref())?;
//! config.validate()?;
//!
//! // Connect the remote store
//! let remote = store::open(&config.store)?;
//!
//! // Drain the input directory once
//! let report = run_ingest(Arc::new(config), remote, Arc::new(AgeGateway), None)?;
//!
//! for task in &report.tasks {
//!     println!("{}: {}", task.source_path.display(), task.stage);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **config**: Configuration loading and validation
//! - **model**: Core data structures (FileTask, Stage, UploadSession, RunReport)
//! - **error**: Error and fault types
//! - **walk**: Input tree traversal
//! - **fs_ops**: Low-level filesystem operations (staging, pruning)
//! - **crypto**: Encryption gateway and key generation
//! - **store**: Remote store protocol and its Dropbox and directory backends
//! - **upload**: Chunked, resumable uploader
//! - **pipeline**: Per-file stage machine
//! - **job**: Run orchestration
//! - **progress**: Observer trait
//! - **checksums**: Content hashing and upload verification

pub mod checksums;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs_ops;
pub mod job;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod store;
pub mod upload;
pub mod walk;

// Re-export main types and functions
pub use config::{Config, RecipientKey, Secret, StoreConfig};
pub use crypto::{generate_keypair, AgeGateway, EncryptionGateway, GeneratedKeys};
pub use error::{
    ConfigError, EncryptionFault, EngineError, RemoteFault, StageFault, TaskFault, TraversalFault, UploadFault,
};
pub use fs_ops::format_bytes;
pub use job::run_ingest;
pub use model::{FileTask, RunReport, Stage, UploadSession};
pub use pipeline::FilePipeline;
pub use progress::PipelineObserver;
pub use store::{ChunkedStore, DirectoryStore, DropboxStore};
pub use upload::ChunkedUploader;
pub use walk::{TreeWalker, Visit};
