mod dh;
mod identity_key;

pub(crate) use dh::DhKeyPair;
pub use identity_key::{PrivateKey, PublicKey};
