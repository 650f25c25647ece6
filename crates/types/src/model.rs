use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, WalletError};

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletId(pub String);

impl WalletId {
    pub fn generate() -> Self {
        WalletId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WalletId {
    fn from(s: String) -> Self {
        WalletId(s)
    }
}

impl From<&str> for WalletId {
    fn from(s: &str) -> Self {
        WalletId(s.to_string())
    }
}

/// Copayer ids are the hex SHA-256 of the copayer's extended public key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CopayerId(pub String);

impl CopayerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CopayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CopayerId {
    fn from(s: String) -> Self {
        CopayerId(s)
    }
}

impl From<&str> for CopayerId {
    fn from(s: &str) -> Self {
        CopayerId(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProposalId(pub String);

impl ProposalId {
    pub fn generate() -> Self {
        ProposalId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProposalId {
    fn from(s: String) -> Self {
        ProposalId(s)
    }
}

impl From<&str> for ProposalId {
    fn from(s: &str) -> Self {
        ProposalId(s.to_string())
    }
}

// ============================================================================
// Chains and networks
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Btc,
    Eth,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Btc => write!(f, "btc"),
            Chain::Eth => write!(f, "eth"),
        }
    }
}

impl FromStr for Chain {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "btc" => Ok(Chain::Btc),
            "eth" => Ok(Chain::Eth),
            other => Err(WalletError::invalid_request(format!("Invalid chain: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Livenet,
    Testnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Livenet => write!(f, "livenet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "livenet" | "mainnet" => Ok(Network::Livenet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(WalletError::invalid_request(format!("Invalid network: {}", other))),
        }
    }
}

// ============================================================================
// Wallets and copayers
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Pending,
    Complete,
}

/// Required signatures out of total copayers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quorum {
    pub m: usize,
    pub n: usize,
}

impl Quorum {
    /// Validates `1 <= m <= n <= max_keys`.
    pub fn new(m: usize, n: usize, max_keys: usize) -> Result<Self, WalletError> {
        if m == 0 {
            return Err(WalletError::invalid_request("m must be at least 1"));
        }
        if m > n {
            return Err(WalletError::invalid_request(format!(
                "m ({}) cannot be greater than n ({})",
                m, n
            )));
        }
        if n > max_keys {
            return Err(WalletError::invalid_request(format!(
                "n ({}) cannot exceed {} keys",
                n, max_keys
            )));
        }
        Ok(Self { m, n })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Copayer {
    pub id: CopayerId,
    pub wallet_id: WalletId,
    pub name: String,
    /// BIP32 extended public key; child keys verify this copayer's votes.
    pub xpub: String,
    /// Compressed secp256k1 key (hex) used to sign proposal publication.
    pub request_pub_key: String,
    /// Position of this copayer within the wallet (0..n-1).
    pub index: usize,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wallet {
    pub id: WalletId,
    pub name: String,
    pub chain: Chain,
    pub network: Network,
    pub m: usize,
    pub n: usize,
    /// Shared wallet key (compressed hex) that authorizes joins.
    pub pub_key: String,
    pub copayers: Vec<Copayer>,
    pub status: WalletStatus,
    pub created_on: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl Wallet {
    pub fn is_complete(&self) -> bool {
        self.status == WalletStatus::Complete
    }

    pub fn quorum(&self) -> Quorum {
        Quorum {
            m: self.m,
            n: self.n,
        }
    }

    pub fn copayer(&self, copayer_id: &CopayerId) -> Option<&Copayer> {
        self.copayers.iter().find(|c| &c.id == copayer_id)
    }

    /// Extended public keys in copayer order.
    pub fn xpubs(&self) -> Vec<String> {
        self.copayers.iter().map(|c| c.xpub.clone()).collect()
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// `m/<isChange>/<index>` relative to every copayer's extended key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationPath {
    pub is_change: bool,
    pub index: u32,
}

impl DerivationPath {
    pub fn new(is_change: bool, index: u32) -> Self {
        Self { is_change, index }
    }

    pub fn branch(&self) -> u32 {
        u32::from(self.is_change)
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m/{}/{}", self.branch(), self.index)
    }
}

impl FromStr for DerivationPath {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WalletError::invalid_request(format!("Invalid derivation path: {}", s));
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 || parts[0] != "m" {
            return Err(invalid());
        }
        let is_change = match parts[1] {
            "0" => false,
            "1" => true,
            _ => return Err(invalid()),
        };
        let index = parts[2].parse::<u32>().map_err(|_| invalid())?;
        Ok(Self { is_change, index })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    pub wallet_id: WalletId,
    pub chain: Chain,
    pub network: Network,
    pub address: String,
    pub path: DerivationPath,
    /// Set once a coin or transaction references the address.
    pub has_activity: bool,
    pub created_on: DateTime<Utc>,
}

impl Address {
    pub fn is_change(&self) -> bool {
        self.path.is_change
    }
}

// ============================================================================
// Coins
// ============================================================================

/// Read-only view of an unspent output reported by the chain state provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coin {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: u64,
    #[serde(default = "default_true")]
    pub spendable: bool,
    /// Block height the coin was mined at; `None` while unconfirmed.
    pub mint_height: Option<u64>,
    /// Wallet path of the owning address, filled from the address book.
    #[serde(default)]
    pub path: Option<DerivationPath>,
    #[serde(default)]
    pub confirmations: u32,
}

fn default_true() -> bool {
    true
}

impl Coin {
    pub fn key(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

// ============================================================================
// Transaction proposals
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub to_address: String,
    pub amount: u64,
    #[serde(default)]
    pub message: Option<String>,
    /// Opaque payload or destination tag passed through to the chain adapter.
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Temporary,
    Pending,
    Accepted,
    Broadcast,
    Confirmed,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Confirmed | ProposalStatus::Rejected | ProposalStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Temporary => "temporary",
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Broadcast => "broadcast",
            ProposalStatus::Confirmed => "confirmed",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporary" => Ok(ProposalStatus::Temporary),
            "pending" => Ok(ProposalStatus::Pending),
            "accepted" => Ok(ProposalStatus::Accepted),
            "broadcast" => Ok(ProposalStatus::Broadcast),
            "confirmed" => Ok(ProposalStatus::Confirmed),
            "rejected" => Ok(ProposalStatus::Rejected),
            "expired" => Ok(ProposalStatus::Expired),
            other => Err(WalletError::invalid_request(format!(
                "Invalid proposal status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Accept,
    Reject,
}

impl FromStr for ActionType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(ActionType::Accept),
            "reject" => Ok(ActionType::Reject),
            other => Err(WalletError::invalid_request(format!("Invalid vote: {}", other))),
        }
    }
}

/// One copayer's vote on a proposal. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Action {
    pub copayer_id: CopayerId,
    pub action_type: ActionType,
    pub comment: Option<String>,
    /// Hex signatures, one per signing slot (accept only).
    pub signatures: Vec<String>,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxProposal {
    pub id: ProposalId,
    pub wallet_id: WalletId,
    pub chain: Chain,
    pub network: Network,
    pub creator_id: CopayerId,
    pub outputs: Vec<TxOutput>,
    /// Selected coins (UTXO chains).
    pub inputs: Vec<Coin>,
    pub change_address: Option<Address>,
    /// Sequence number and sending address (account chains).
    pub nonce: Option<u64>,
    pub from_address: Option<String>,
    pub fee: u64,
    pub fee_level: Option<FeeLevelName>,
    pub fee_per_kb: u64,
    pub status: ProposalStatus,
    pub created_on: DateTime<Utc>,
    pub actions: Vec<Action>,
    pub required_signatures: usize,
    pub wallet_n: usize,
    pub message: Option<String>,
    pub proposal_signature: Option<String>,
    pub txid: Option<String>,
    pub broadcast_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exclude_unconfirmed: bool,
}

impl TxProposal {
    pub fn total_amount(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn total_inputs(&self) -> u64 {
        self.inputs.iter().map(|c| c.amount).sum()
    }

    /// Change left after outputs and fee (UTXO chains).
    pub fn change_amount(&self) -> u64 {
        self.total_inputs()
            .saturating_sub(self.total_amount())
            .saturating_sub(self.fee)
    }

    pub fn has_voted(&self, copayer_id: &CopayerId) -> bool {
        self.actions.iter().any(|a| &a.copayer_id == copayer_id)
    }

    pub fn accept_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == ActionType::Accept)
            .count()
    }

    pub fn reject_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == ActionType::Reject)
            .count()
    }

    pub fn approvers(&self) -> Vec<&CopayerId> {
        self.actions
            .iter()
            .filter(|a| a.action_type == ActionType::Accept)
            .map(|a| &a.copayer_id)
            .collect()
    }

    /// Outstanding proposals reserve their coins and nonces.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            ProposalStatus::Pending | ProposalStatus::Accepted
        )
    }
}

/// Durable per-(wallet, copayer) rejection counter used by the backoff rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectionCounter {
    pub wallet_id: WalletId,
    pub copayer_id: CopayerId,
    pub count: u32,
    pub last_rejection_on: DateTime<Utc>,
}

// ============================================================================
// Fees
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum FeeLevelName {
    Urgent,
    Priority,
    Normal,
    Economy,
    SuperEconomy,
}

impl fmt::Display for FeeLevelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeeLevelName::Urgent => "urgent",
            FeeLevelName::Priority => "priority",
            FeeLevelName::Normal => "normal",
            FeeLevelName::Economy => "economy",
            FeeLevelName::SuperEconomy => "superEconomy",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for FeeLevelName {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(FeeLevelName::Urgent),
            "priority" => Ok(FeeLevelName::Priority),
            "normal" => Ok(FeeLevelName::Normal),
            "economy" => Ok(FeeLevelName::Economy),
            "superEconomy" => Ok(FeeLevelName::SuperEconomy),
            other => Err(WalletError::new(
                ErrorKind::InvalidRequest,
                format!(
                    "Invalid fee level {}. Valid values are urgent, priority, normal, economy, superEconomy",
                    other
                ),
            )),
        }
    }
}

/// A computed fee level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeLevel {
    pub level: FeeLevelName,
    pub fee_per_kb: u64,
    /// Confirmation target the estimate came from; `None` for default values.
    pub nb_blocks: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proposal() -> TxProposal {
        TxProposal {
            id: ProposalId::from("p1"),
            wallet_id: WalletId::from("w1"),
            chain: Chain::Btc,
            network: Network::Testnet,
            creator_id: CopayerId::from("c1"),
            outputs: vec![TxOutput {
                to_address: "addr".to_string(),
                amount: 1_000,
                message: None,
                data: None,
            }],
            inputs: vec![],
            change_address: None,
            nonce: None,
            from_address: None,
            fee: 100,
            fee_level: Some(FeeLevelName::Normal),
            fee_per_kb: 10_000,
            status: ProposalStatus::Pending,
            created_on: Utc::now(),
            actions: vec![],
            required_signatures: 2,
            wallet_n: 3,
            message: None,
            proposal_signature: None,
            txid: None,
            broadcast_on: None,
            exclude_unconfirmed: false,
        }
    }

    #[test]
    fn test_derivation_path_display_and_parse() {
        let path = DerivationPath::new(true, 7);
        assert_eq!(path.to_string(), "m/1/7");
        assert_eq!("m/1/7".parse::<DerivationPath>().unwrap(), path);
        assert!("m/2/7".parse::<DerivationPath>().is_err());
        assert!("x/0/1".parse::<DerivationPath>().is_err());
    }

    #[test]
    fn test_quorum_bounds() {
        assert!(Quorum::new(2, 3, 100).is_ok());
        assert!(Quorum::new(0, 3, 100).is_err());
        assert!(Quorum::new(4, 3, 100).is_err());
        assert!(Quorum::new(1, 101, 100).is_err());
    }

    #[test]
    fn test_proposal_vote_counts() {
        let mut txp = sample_proposal();
        txp.actions.push(Action {
            copayer_id: CopayerId::from("c1"),
            action_type: ActionType::Accept,
            comment: None,
            signatures: vec!["00".to_string()],
            created_on: Utc::now(),
        });
        txp.actions.push(Action {
            copayer_id: CopayerId::from("c2"),
            action_type: ActionType::Reject,
            comment: Some("no".to_string()),
            signatures: vec![],
            created_on: Utc::now(),
        });

        assert_eq!(txp.accept_count(), 1);
        assert_eq!(txp.reject_count(), 1);
        assert!(txp.has_voted(&CopayerId::from("c2")));
        assert!(!txp.has_voted(&CopayerId::from("c3")));
        assert_eq!(txp.approvers(), vec![&CopayerId::from("c1")]);
    }

    #[test]
    fn test_fee_level_names_round_trip_through_strings() {
        assert_eq!(FeeLevelName::SuperEconomy.to_string(), "superEconomy");
        assert_eq!(
            "superEconomy".parse::<FeeLevelName>().unwrap(),
            FeeLevelName::SuperEconomy
        );
        assert!("fast".parse::<FeeLevelName>().is_err());
    }

    #[test]
    fn test_status_terminality() {
        assert!(ProposalStatus::Rejected.is_terminal());
        assert!(ProposalStatus::Confirmed.is_terminal());
        assert!(!ProposalStatus::Accepted.is_terminal());
        assert_eq!("broadcast".parse::<ProposalStatus>().unwrap(), ProposalStatus::Broadcast);
    }
}
