//! cairn-vault — child-side controller for vault processes.

pub mod controller;

pub use controller::{VaultController, VaultCredentials, IDENTITY_WAIT_TIMEOUT};
