pub mod manager;
pub mod token;

pub use manager::{CredentialPool, PoolError, PoolSummary, TokenLease};
pub use token::{Credential, TokenId, TokenSnapshot, TokenState};
