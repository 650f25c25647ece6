mod app;
mod cli;
mod config;

use app::QuorumWalletApp;
use clap::Parser;
use cli::{AddressCommand, Cli, Commands, Member, ProposalCommand, WalletCommand};
use config::AppConfig;
use quorum_crypto::{copayer_hash, KeyPair};
use quorum_engine::{CreateOptions, FeeSpec, NewCopayer, NewWallet, ProposalRequest, Vote};
use quorum_types::{
    ActionType, CopayerId, FeeLevelName, ProposalId, TxOutput, TxProposal, WalletId,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load()?;
    init_tracing(&config.service.log_level);

    if let Commands::Keygen { extended } = cli.command {
        return keygen(extended);
    }

    let app = QuorumWalletApp::new(config).await?;

    match cli.command {
        Commands::Wallet(command) => wallet(&app, command).await?,
        Commands::Address(command) => address(&app, command).await?,
        Commands::Proposal(command) => proposal(&app, command).await?,
        Commands::Fees { chain, network } => {
            let levels = app.service().get_fee_levels(chain, network).await?;
            println!("\nFee levels ({} {})", chain, network);
            println!("─────────────────────────────────────");
            for level in levels {
                let source = level
                    .nb_blocks
                    .map(|n| format!("{} blocks", n))
                    .unwrap_or_else(|| "default".to_string());
                println!(
                    "  {:<14} {:>10} per kb  ({})",
                    level.level.to_string(),
                    level.fee_per_kb,
                    source
                );
            }
        }
        Commands::Monitor { interval } => {
            info!("Starting confirmation monitor");
            app.run_monitor(interval).await?;
        }
        Commands::Keygen { .. } => {}
    }

    Ok(())
}

fn keygen(extended: Option<quorum_types::Network>) -> anyhow::Result<()> {
    let key = KeyPair::generate();
    println!("\nRequest key");
    println!("─────────────────────────────────────");
    println!("  Private: {}", key.private_key());
    println!("  Public:  {}", key.public_key());

    if let Some(network) = extended {
        let (xpriv, xpub) = app::generate_extended_key(network)?;
        println!("\nExtended key ({})", network);
        println!("─────────────────────────────────────");
        println!("  xpriv: {}", xpriv);
        println!("  xpub:  {}", xpub);
    }
    Ok(())
}

fn ids(member: &Member) -> (WalletId, CopayerId) {
    (
        WalletId::from(member.wallet_id.as_str()),
        CopayerId::from(member.copayer_id.as_str()),
    )
}

fn signed_copayer(
    wallet_key: &KeyPair,
    name: String,
    xpub: String,
    request_pub_key: String,
) -> NewCopayer {
    let copayer_signature =
        wallet_key.sign(copayer_hash(&name, &xpub, &request_pub_key).as_bytes());
    NewCopayer {
        name,
        xpub,
        request_pub_key,
        copayer_signature,
    }
}

async fn wallet(app: &QuorumWalletApp, command: WalletCommand) -> anyhow::Result<()> {
    match command {
        WalletCommand::Create {
            name,
            chain,
            network,
            m,
            n,
            copayer_name,
            xpub,
            request_pub_key,
        } => {
            let wallet_key = KeyPair::generate();
            let params = NewWallet {
                name,
                chain,
                network,
                m,
                n,
                pub_key: wallet_key.public_key(),
            };
            let creator = signed_copayer(&wallet_key, copayer_name, xpub, request_pub_key);
            let (wallet, copayer) = app.service().create_wallet(params, creator).await?;

            println!("\nWallet created");
            println!("─────────────────────────────────────");
            println!("  Wallet ID:     {}", wallet.id);
            println!("  Quorum:        {}-of-{}", wallet.m, wallet.n);
            println!("  Copayer ID:    {}", copayer.id);
            println!("  Wallet secret: {}", wallet_key.private_key());
            println!("\n  Share the wallet secret with the other copayers so they can join.");
        }
        WalletCommand::Join {
            wallet_id,
            wallet_secret,
            copayer_name,
            xpub,
            request_pub_key,
        } => {
            let wallet_key = KeyPair::from_hex(&wallet_secret)?;
            let request = signed_copayer(&wallet_key, copayer_name, xpub, request_pub_key);
            let (wallet, copayer) = app
                .service()
                .join_wallet(&WalletId::from(wallet_id.as_str()), request)
                .await?;

            println!("\nJoined wallet {}", wallet.id);
            println!("  Copayer ID: {}", copayer.id);
            println!("  Index:      {}", copayer.index);
            println!("  Copayers:   {}/{}", wallet.copayers.len(), wallet.n);
        }
        WalletCommand::Show(member) => {
            let (wallet_id, copayer_id) = ids(&member);
            let wallet = app.service().get_wallet(&wallet_id, &copayer_id).await?;

            println!("\nWallet {}", wallet.id);
            println!("─────────────────────────────────────");
            println!("  Name:     {}", wallet.name);
            println!("  Chain:    {} {}", wallet.chain, wallet.network);
            println!("  Quorum:   {}-of-{}", wallet.m, wallet.n);
            println!("  Status:   {:?}", wallet.status);
            println!("\n  Copayers:");
            for copayer in &wallet.copayers {
                println!("    [{}] {} {}", copayer.index, copayer.name, copayer.id);
            }
        }
        WalletCommand::Balance(member) => {
            let (wallet_id, copayer_id) = ids(&member);
            let balance = app.service().get_balance(&wallet_id, &copayer_id).await?;

            println!("\nBalance");
            println!("─────────────────────────────────────");
            println!(
                "  Total:      {} ({} confirmed)",
                balance.total_amount, balance.total_confirmed_amount
            );
            println!(
                "  Locked:     {} ({} confirmed)",
                balance.locked_amount, balance.locked_confirmed_amount
            );
            println!(
                "  Available:  {} ({} confirmed)",
                balance.available_amount, balance.available_confirmed_amount
            );
            for entry in &balance.by_address {
                let path = entry.path.map(|p| p.to_string()).unwrap_or_default();
                println!("    {:<8} {}  {}", path, entry.address, entry.amount);
            }
        }
        WalletCommand::SendMax {
            member,
            fee_level,
            fee_per_kb,
            exclude_unconfirmed,
        } => {
            let (wallet_id, copayer_id) = ids(&member);
            let info = app
                .service()
                .get_send_max_info(
                    &wallet_id,
                    &copayer_id,
                    fee_spec(fee_level, fee_per_kb),
                    exclude_unconfirmed,
                )
                .await?;

            println!("\nSend max");
            println!("─────────────────────────────────────");
            println!("  Amount:     {}", info.amount);
            println!("  Fee:        {} ({} per kb)", info.fee, info.fee_per_kb);
            println!("  Inputs:     {}", info.inputs.len());
            if info.utxos_below_fee > 0 {
                println!(
                    "  Below fee:  {} coins, {}",
                    info.utxos_below_fee, info.amount_below_fee
                );
            }
            if info.utxos_above_max_size > 0 {
                println!(
                    "  Over size:  {} coins, {}",
                    info.utxos_above_max_size, info.amount_above_max_size
                );
            }
        }
    }
    Ok(())
}

fn fee_spec(fee_level: Option<FeeLevelName>, fee_per_kb: Option<u64>) -> FeeSpec {
    match (fee_per_kb, fee_level) {
        (Some(per_kb), _) => FeeSpec::PerKb(per_kb),
        (None, Some(level)) => FeeSpec::Level(level),
        (None, None) => FeeSpec::default(),
    }
}

async fn address(app: &QuorumWalletApp, command: AddressCommand) -> anyhow::Result<()> {
    match command {
        AddressCommand::New {
            member,
            ignore_max_gap,
        } => {
            let (wallet_id, copayer_id) = ids(&member);
            let address = app
                .service()
                .derive_address(&wallet_id, &copayer_id, ignore_max_gap)
                .await?;
            println!("{}  ({})", address.address, address.path);
        }
        AddressCommand::List(member) => {
            let (wallet_id, copayer_id) = ids(&member);
            for address in app.service().get_addresses(&wallet_id, &copayer_id).await? {
                let used = if address.has_activity { "used" } else { "" };
                println!("  {:<8} {}  {}", address.path.to_string(), address.address, used);
            }
        }
    }
    Ok(())
}

fn print_proposal(proposal: &TxProposal) {
    println!("\nProposal {}", proposal.id);
    println!("─────────────────────────────────────");
    println!("  Status:   {}", proposal.status);
    println!("  Creator:  {}", proposal.creator_id);
    for output in &proposal.outputs {
        println!("  Output:   {} -> {}", output.amount, output.to_address);
    }
    println!("  Fee:      {}", proposal.fee);
    println!("  Inputs:   {}", proposal.inputs.len());
    if let Some(nonce) = proposal.nonce {
        println!("  Nonce:    {}", nonce);
    }
    println!(
        "  Votes:    {} accept / {} reject (needs {})",
        proposal.accept_count(),
        proposal.reject_count(),
        proposal.required_signatures
    );
    if let Some(txid) = &proposal.txid {
        println!("  Txid:     {}", txid);
    }
}

async fn proposal(app: &QuorumWalletApp, command: ProposalCommand) -> anyhow::Result<()> {
    let service = app.service();
    match command {
        ProposalCommand::Create {
            member,
            to,
            amount,
            fee_level,
            fee_per_kb,
            message,
            draft,
            dry_run,
            exclude_unconfirmed,
            change_address,
        } => {
            if to.len() != amount.len() {
                anyhow::bail!("every --to needs a matching --amount");
            }
            let (wallet_id, copayer_id) = ids(&member);
            let fee = fee_spec(fee_level, fee_per_kb);
            let request = ProposalRequest {
                outputs: to
                    .into_iter()
                    .zip(amount)
                    .map(|(to_address, amount)| TxOutput {
                        to_address,
                        amount,
                        message: None,
                        data: None,
                    })
                    .collect(),
                fee,
                options: CreateOptions {
                    draft,
                    dry_run,
                    exclude_unconfirmed,
                    message,
                    change_address,
                    proposal_id: None,
                },
            };
            let proposal = service
                .create_proposal(&wallet_id, &copayer_id, request)
                .await?;
            print_proposal(&proposal);
        }
        ProposalCommand::Publish {
            member,
            proposal_id,
            request_key,
        } => {
            let (wallet_id, copayer_id) = ids(&member);
            let proposal_id = ProposalId::from(proposal_id.as_str());
            let blob = service
                .get_signing_blob(&wallet_id, &copayer_id, &proposal_id)
                .await?;
            let signature = app::sign_proposal(&request_key, &blob)?;
            let proposal = service
                .publish_proposal(&wallet_id, &copayer_id, &proposal_id, &signature)
                .await?;
            print_proposal(&proposal);
        }
        ProposalCommand::Vote {
            member,
            proposal_id,
            action,
            xpriv,
            comment,
        } => {
            let (wallet_id, copayer_id) = ids(&member);
            let proposal_id = ProposalId::from(proposal_id.as_str());
            let signatures = match (action, xpriv) {
                (ActionType::Accept, Some(xpriv)) => {
                    let blob = service
                        .get_signing_blob(&wallet_id, &copayer_id, &proposal_id)
                        .await?;
                    app::sign_slots(&xpriv, &blob)?
                }
                (ActionType::Accept, None) => anyhow::bail!("accepting requires --xpriv"),
                (ActionType::Reject, _) => Vec::new(),
            };
            let vote = Vote {
                action,
                signatures,
                comment,
            };
            let proposal = service
                .vote_proposal(&wallet_id, &copayer_id, &proposal_id, vote)
                .await?;
            print_proposal(&proposal);
        }
        ProposalCommand::Broadcast {
            member,
            proposal_id,
        } => {
            let (wallet_id, copayer_id) = ids(&member);
            let proposal = service
                .broadcast_proposal(&wallet_id, &copayer_id, &ProposalId::from(proposal_id.as_str()))
                .await?;
            print_proposal(&proposal);
        }
        ProposalCommand::Remove {
            member,
            proposal_id,
        } => {
            let (wallet_id, copayer_id) = ids(&member);
            service
                .remove_proposal(&wallet_id, &copayer_id, &ProposalId::from(proposal_id.as_str()))
                .await?;
            println!("Removed proposal {}", proposal_id);
        }
        ProposalCommand::List { member, status } => {
            let (wallet_id, copayer_id) = ids(&member);
            if status.is_none() {
                for pending in service.get_pending_proposals(&wallet_id, &copayer_id).await? {
                    println!(
                        "  {}  {:<9} removable in {}s",
                        pending.proposal.id,
                        pending.proposal.status.to_string(),
                        pending.delete_lock_secs
                    );
                }
            }
            for proposal in service
                .get_proposals(&wallet_id, &copayer_id, status)
                .await?
                .iter()
                .filter(|p| status.is_some() || !p.is_outstanding())
            {
                println!(
                    "  {}  {:<9} {} out, fee {}",
                    proposal.id,
                    proposal.status.to_string(),
                    proposal.total_amount(),
                    proposal.fee
                );
            }
        }
        ProposalCommand::Show {
            member,
            proposal_id,
        } => {
            let (wallet_id, copayer_id) = ids(&member);
            let proposal = service
                .get_proposal(&wallet_id, &copayer_id, &ProposalId::from(proposal_id.as_str()))
                .await?;
            print_proposal(&proposal);
        }
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
