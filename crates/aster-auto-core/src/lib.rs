/*
[INPUT]:  SQLite database file, vault master key.
[OUTPUT]: Domain types, CredentialVault and the Database store.
[POS]:    Core library - shared by the orchestrator and every execution unit.
[UPDATE]: When adding new storage concerns or domain entities.
*/

pub mod db;
pub mod types;
pub mod vault;

pub use db::{Database, SMARTPROXY_ENABLED_KEY, SystemConfigEntry};
pub use vault::{CredentialVault, VaultError};
