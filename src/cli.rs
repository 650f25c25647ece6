use clap::{Args, Parser, Subcommand};
use quorum_types::{ActionType, Chain, FeeLevelName, Network, ProposalStatus};

#[derive(Parser)]
#[command(name = "quorum-wallet")]
#[command(version, about = "Multi-signature wallet coordination service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, join or inspect wallets
    #[command(subcommand)]
    Wallet(WalletCommand),

    /// Issue or list wallet addresses
    #[command(subcommand)]
    Address(AddressCommand),

    /// Drive transaction proposals
    #[command(subcommand)]
    Proposal(ProposalCommand),

    /// Show current fee levels for a chain
    Fees {
        #[arg(short, long, default_value = "btc")]
        chain: Chain,

        #[arg(short, long, default_value = "livenet")]
        network: Network,
    },

    /// Generate a request key pair, and optionally an extended key
    Keygen {
        #[arg(long, help = "Also generate an extended key for this network")]
        extended: Option<Network>,
    },

    /// Confirm broadcast proposals periodically
    Monitor {
        #[arg(short, long, help = "Poll interval in seconds (default from config)")]
        interval: Option<u64>,
    },
}

/// Identifies the acting copayer of a wallet.
#[derive(Args, Clone)]
pub struct Member {
    #[arg(short, long, help = "Wallet ID")]
    pub wallet_id: String,

    #[arg(short, long, help = "Acting copayer ID")]
    pub copayer_id: String,
}

#[derive(Subcommand)]
pub enum WalletCommand {
    /// Create an m-of-n wallet and join it as the first copayer
    Create {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "btc")]
        chain: Chain,

        #[arg(long, default_value = "livenet")]
        network: Network,

        #[arg(short, help = "Required signatures")]
        m: usize,

        #[arg(short, help = "Total copayers")]
        n: usize,

        #[arg(long, help = "Creator's display name")]
        copayer_name: String,

        #[arg(long, help = "Creator's extended public key")]
        xpub: String,

        #[arg(long, help = "Creator's request public key (hex)")]
        request_pub_key: String,
    },

    /// Join a wallet using the wallet secret shared by its creator
    Join {
        #[arg(short, long)]
        wallet_id: String,

        #[arg(long, env = "QW_WALLET_SECRET", help = "Wallet join key (hex)")]
        wallet_secret: String,

        #[arg(long)]
        copayer_name: String,

        #[arg(long)]
        xpub: String,

        #[arg(long)]
        request_pub_key: String,
    },

    /// Show a wallet and its copayers
    Show(Member),

    /// Show total, reserved and available funds
    Balance(Member),

    /// Show the largest amount a single payment can send
    SendMax {
        #[command(flatten)]
        member: Member,

        #[arg(long, conflicts_with = "fee_per_kb", help = "Fee level")]
        fee_level: Option<FeeLevelName>,

        #[arg(long, help = "Explicit fee per kb")]
        fee_per_kb: Option<u64>,

        #[arg(long, default_value = "false")]
        exclude_unconfirmed: bool,
    },
}

#[derive(Subcommand)]
pub enum AddressCommand {
    /// Issue the next receive address
    New {
        #[command(flatten)]
        member: Member,

        #[arg(long, default_value = "false", help = "Allow up to the scan gap of unused addresses")]
        ignore_max_gap: bool,
    },

    /// List issued addresses
    List(Member),
}

#[derive(Subcommand)]
pub enum ProposalCommand {
    /// Propose a payment
    Create {
        #[command(flatten)]
        member: Member,

        #[arg(long = "to", help = "Destination address (repeatable)", required = true)]
        to: Vec<String>,

        #[arg(long = "amount", help = "Amount per destination (repeatable)", required = true)]
        amount: Vec<u64>,

        #[arg(long, conflicts_with = "fee_per_kb", help = "Fee level")]
        fee_level: Option<FeeLevelName>,

        #[arg(long, help = "Explicit fee per kb")]
        fee_per_kb: Option<u64>,

        #[arg(long)]
        message: Option<String>,

        #[arg(long, default_value = "false", help = "Keep as a draft until published")]
        draft: bool,

        #[arg(long, default_value = "false", help = "Compute without saving")]
        dry_run: bool,

        #[arg(long, default_value = "false")]
        exclude_unconfirmed: bool,

        #[arg(long, help = "Existing wallet address to receive change")]
        change_address: Option<String>,
    },

    /// Publish a draft, signing it with the creator's request key
    Publish {
        #[command(flatten)]
        member: Member,

        #[arg(short, long)]
        proposal_id: String,

        #[arg(long, env = "QW_REQUEST_KEY", help = "Request private key (hex)")]
        request_key: String,
    },

    /// Accept (signing with an xpriv) or reject a proposal
    Vote {
        #[command(flatten)]
        member: Member,

        #[arg(short, long)]
        proposal_id: String,

        #[arg(long, help = "accept or reject")]
        action: ActionType,

        #[arg(long, env = "QW_XPRIV", help = "Extended private key used to sign an accept")]
        xpriv: Option<String>,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Broadcast an accepted proposal
    Broadcast {
        #[command(flatten)]
        member: Member,

        #[arg(short, long)]
        proposal_id: String,
    },

    /// Remove a pending proposal
    Remove {
        #[command(flatten)]
        member: Member,

        #[arg(short, long)]
        proposal_id: String,
    },

    /// List proposals
    List {
        #[command(flatten)]
        member: Member,

        #[arg(long)]
        status: Option<ProposalStatus>,
    },

    /// Show one proposal
    Show {
        #[command(flatten)]
        member: Member,

        #[arg(short, long)]
        proposal_id: String,
    },
}
