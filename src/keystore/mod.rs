//! Service account key management
//!
//! The [`KeyStore`] trait is the rotation engine's view of the identity
//! provider; [`IamKeyStore`] implements it over the Google IAM REST API.

pub mod iam;
mod key_store;

pub use iam::IamKeyStore;
pub use key_store::{short_name, CreatedKey, Credential, KeyStore, KeyType, ServiceAccountKey};
