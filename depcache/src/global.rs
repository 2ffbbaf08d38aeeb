//! Opt-in process-wide client.
//!
//! Nothing in this crate reads the default; it exists for applications
//! that prefer a global handle over passing a [`Client`] around.

use once_cell::sync::OnceCell;

use crate::client::Client;

static DEFAULT: OnceCell<Client> = OnceCell::new();

/// Install `client` as the process default.
///
/// Returns the client back if a default was already installed.
pub fn set_default(client: Client) -> Result<(), Client> {
    DEFAULT.set(client)
}

/// The process default, if one was installed.
pub fn default_client() -> Option<&'static Client> {
    DEFAULT.get()
}
