//! Identities and typed references
//!
//! An identity is an ed25519 key pair; its public half, written
//! `@<base64>.ed25519`, names both the identity and its feed.
//!
//! ## Example
//!
//! ```rust
//! use scuttlenode_core::identity::{Identity, IdentityRef};
//!
//! let identity = Identity::generate();
//! let public: IdentityRef = identity.public();
//! let text = public.to_string();
//! assert_eq!(text.parse::<IdentityRef>().unwrap(), public);
//! ```

mod keypair;
mod refs;

pub use keypair::{verify_signature, Identity};
pub use refs::{BanHash, BlobRef, FeedRef, IdentityRef, MessageRef};
