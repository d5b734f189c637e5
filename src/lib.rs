//! `b2up` is a client for the Backblaze B2 native API, focused on uploading
//! files of any size.
//!
//! These features are supported:
//! * Account authorization, bucket listing and creation, file name listing.
//! * Single request uploads for small files.
//! * Multi-part large file uploads: the file is split into fixed-size pieces
//!   held in temp files, every piece is uploaded by a bounded pool of workers,
//!   then the remote file is assembled from the piece SHA-1s.
//! * SHA-1 and BLAKE2b content hashes for integrity checks.
//! * Per-part upload progress through a listener.
//!
//! ## Example
//!
//! To upload a file, picking single request or multi-part by size:
//! ```no_run
//! # use std::sync::{Arc, Mutex};
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = b2up::config::Config::load(None)?;  // credentials from B2_ACCOUNT_ID and B2_APPLICATION_KEY
//! let api = Arc::new(b2up::api::HttpApi::new(&config)?);
//! let uploaded = b2up::helper::upload_file(
//!     api,
//!     &config,
//!     "b6ee61624837a6c6588b0715",  // the bucket id
//!     "launch.mp4",  // the file path
//!     Some(Arc::new(Mutex::new(|name: Arc<String>, part: usize, pos: usize, total: usize| {  // the progress listener
//!         println!("name: {name} part:{part} {pos}/{total}");
//!     }))),
//! )
//! .await?;
//! println!("file id: {}", uploaded.file().file_id);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod hasher;
pub mod helper;
pub mod large_file;
pub mod progress;
