//! Seam towards the SIP transaction engine
//!
//! Retransmission timers, branch matching and response bookkeeping live in
//! the engine behind [`TransactionEngine`]. This module carries the handles
//! and events exchanged with it, plus the identifier generators and message
//! builders shared by the session code.
use crate::{transport::PartyBinding, Result};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::{Arc, Weak};

pub mod key;
pub mod message;
#[allow(clippy::module_inception)]
pub mod transaction;

pub use key::TransactionKey;
pub use transaction::{
    Transaction, TransactionEvent, TransactionHandler, TransactionRole, TransactionState,
};

pub const TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CALL_ID_LEN: usize = 22;

pub fn random_text(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn make_tag() -> rsip::param::Tag {
    rsip::param::Tag::new(random_text(TAG_LEN))
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(rsip::param::Branch::new(format!(
        "z9hG4bK{}",
        random_text(BRANCH_LEN)
    )))
}

pub fn make_call_id(domain: Option<&str>) -> String {
    match domain {
        Some(domain) => format!("{}@{}", random_text(CALL_ID_LEN), domain),
        None => random_text(CALL_ID_LEN),
    }
}

/// Operations the session layer needs from the transaction engine
#[async_trait]
pub trait TransactionEngine: Send + Sync {
    /// Starts a client transaction sent through `binding`
    ///
    /// Every event of the new transaction is delivered to `owner`.
    async fn submit(
        &self,
        request: rsip::Request,
        binding: Arc<PartyBinding>,
        owner: Weak<dyn TransactionHandler>,
    ) -> Result<Transaction>;

    /// Sends a response within a server transaction
    async fn respond(&self, transaction: &Transaction, response: rsip::Response) -> Result<()>;

    /// Cancels a pending client INVITE transaction
    async fn cancel(&self, transaction: &Transaction) -> Result<()>;

    /// Overrides the retransmission count of one transaction
    fn set_max_retries(&self, transaction: &Transaction, retries: u32);

    /// Answers a server transaction with an authentication challenge
    ///
    /// `proxy` selects 407 with Proxy-Authenticate over 401. On `Ok` the
    /// challenge is the final response of `transaction` and callers send
    /// nothing else on it; the engine need not record it on the handle.
    /// On `Err` no response went out.
    async fn request_auth(&self, transaction: &Transaction, realm: &str, proxy: bool)
        -> Result<()>;
}
