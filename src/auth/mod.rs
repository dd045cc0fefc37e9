// Authentication module
// Credential storage, refresh coordination and the login flow

mod coordinator;
mod credentials;
mod refresh;
pub(crate) mod session;
mod store;
mod types;

pub use coordinator::RefreshCoordinator;
pub use credentials::SqliteStore;
pub use refresh::TokenData;
pub use store::{CredentialStore, MemoryStore, TokenStorage};
pub use types::{CredentialPair, SessionState, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
