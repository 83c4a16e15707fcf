pub mod audit;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod items;
pub mod pq;
pub mod recovery;
pub mod storage;
pub mod vault;

pub use error::{Result, VaultError};
pub use vault::VaultCore;
