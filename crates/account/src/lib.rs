//! `vouchsafe-account` — contract for the external credential/billing service.
//!
//! The redemption engine treats the account system as a collaborator behind a
//! trait: validate a presented credential, apply a credit-limit increase. An
//! in-memory double backs tests and dev deployments.

pub mod service;

pub use service::{
    AccountProfile, AccountService, AccountServiceError, CredentialToken, InMemoryAccountService,
};
