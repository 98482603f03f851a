mod error;
pub use error::Error;

mod crypto;
pub use crypto::RandomSource;

mod codec;
pub use codec::{append_whitespace_tag, extract_whitespace_tag, query_message};

mod version;
pub use version::{Version, VersionSet};

mod types;
pub use types::{PrivateKey, PublicKey};

mod keys;

mod ake;

mod data_message;

mod smp;

mod fragment;

mod event;
pub use event::*;

mod conversation;
pub use conversation::*;
