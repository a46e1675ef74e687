mod patch;
mod patch_key;

pub use patch::{HeadName, Patch, Snapshot};
pub use patch_key::{PatchKey, SessionKey};
