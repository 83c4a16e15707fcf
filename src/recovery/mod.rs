/// Threshold recovery: Shamir sharing, guardian recovery kits and share files.
pub(crate) mod field;
pub mod kit;
pub mod shamir;
pub mod share_file;

pub use kit::{Guardian, KitStatus, RecoveryKit, RecoveryKitService, RecoveryShare, ShareStatus};
pub use shamir::{combine, split, verify_share, Share};
pub use share_file::ShareFile;
