//! Bearer-token credentials for Azure data-plane APIs.
//!
//! Every outbound Azure call (Key Vault, AI Search, Azure `OpenAI`, the hosted
//! agent service) authenticates with a token obtained through
//! [`TokenCredential`]. The token acquisition flow itself is owned by the
//! platform; this module only speaks its documented request/response contract.

mod credential;

pub use credential::{
    AccessToken, CredentialError, ManagedIdentityCredential, StaticTokenCredential,
    TokenCredential,
};
