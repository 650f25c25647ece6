//! Multi-signature wallet coordination.
//!
//! Copayers register into an m-of-n wallet, derive shared addresses, and
//! drive transaction proposals through publish, vote and broadcast. The
//! engine never holds private keys; it verifies what copayers sign.

pub mod addresses;
pub mod fsm;
pub mod monitor;
pub mod proposals;
pub mod registry;
pub mod selector;
pub mod service;

#[cfg(test)]
mod test_support;

pub use addresses::AddressManager;
pub use fsm::ProposalFsm;
pub use monitor::ConfirmationMonitor;
pub use proposals::{
    AddressBalance, Balance, CreateOptions, FeeSpec, PendingProposal, ProposalEngine,
    ProposalRequest, Vote,
};
pub use registry::{authorize, NewCopayer, NewWallet, WalletRegistry};
pub use selector::{Selection, SendMaxInfo, UtxoSelector};
pub use service::WalletService;
