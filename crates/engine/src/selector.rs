//! Coin selection for UTXO chains.
//!
//! Candidates are tried in confirmation groups (6+, 1+, then unconfirmed) so
//! that well-confirmed coins are spent first. Within a group, small coins are
//! accumulated largest first; a single "big" coin (worth more than twice the
//! target) is only used when the small coins cannot reach the target, or when
//! accumulating them would waste too much on fees.
//!
//! Ties between equally good candidates resolve to fewer inputs, then lower
//! total value, then the oldest coin: candidates are pre-ordered oldest first
//! and every later sort is stable.

use quorum_chains::FeeModel;
use quorum_types::{Coin, ErrorKind, Result, SelectionConfig, WalletError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

const CONFIRMATION_GROUPS: [u32; 3] = [6, 1, 0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Coin>,
    pub fee: u64,
    pub change: u64,
}

/// What a single-output transaction sweeping every usable coin would send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMaxInfo {
    pub size: u64,
    pub amount: u64,
    pub fee: u64,
    pub fee_per_kb: u64,
    pub inputs: Vec<Coin>,
    /// Coins worth less than the fee of spending them.
    pub utxos_below_fee: usize,
    pub amount_below_fee: u64,
    /// Coins left out to stay under the size limit.
    pub utxos_above_max_size: usize,
    pub amount_above_max_size: u64,
}

pub struct UtxoSelector {
    config: SelectionConfig,
}

fn oldest_first(a: &Coin, b: &Coin) -> Ordering {
    match (a.mint_height, b.mint_height) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.txid.cmp(&b.txid))
    .then_with(|| a.vout.cmp(&b.vout))
}

fn insufficient_for_fee(model: &FeeModel) -> WalletError {
    WalletError::new(
        ErrorKind::InsufficientFundsForFee,
        format!(
            "Insufficient funds for fee (fee per kb: {})",
            model.fee_per_kb
        ),
    )
}

impl UtxoSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Selects inputs for `amount` from all of a wallet's coins.
    ///
    /// `locked` holds the `txid:vout` keys reserved by outstanding proposals.
    pub fn select_inputs(
        &self,
        coins: &[Coin],
        locked: &HashSet<String>,
        amount: u64,
        model: &FeeModel,
        exclude_unconfirmed: bool,
    ) -> Result<Selection> {
        if amount == 0 {
            return Err(WalletError::invalid_request("Amount must be positive"));
        }

        // Immature or otherwise unspendable coins count toward neither figure,
        // so a shortfall they cause reads as insufficient rather than locked.
        let counted = coins
            .iter()
            .filter(|c| c.spendable)
            .filter(|c| !exclude_unconfirmed || c.confirmations > 0);
        let (total, available) = counted.fold((0u64, 0u64), |(total, available), coin| {
            let free = !locked.contains(&coin.key());
            (
                total + coin.amount,
                available + if free { coin.amount } else { 0 },
            )
        });

        if total < amount {
            return Err(WalletError::new(
                ErrorKind::InsufficientFunds,
                format!("Insufficient funds: have {}, need {}", total, amount),
            ));
        }
        if available < amount {
            return Err(WalletError::new(
                ErrorKind::LockedFunds,
                format!(
                    "Funds are locked by pending transaction proposals: available {}, need {}",
                    available, amount
                ),
            ));
        }

        let fee_per_input = model.fee_per_input();
        let mut candidates: Vec<Coin> = coins
            .iter()
            .filter(|c| c.spendable)
            .filter(|c| !locked.contains(&c.key()))
            .filter(|c| c.amount as f64 > fee_per_input)
            .filter(|c| !exclude_unconfirmed || c.confirmations > 0)
            .cloned()
            .collect();
        candidates.sort_by(oldest_first);

        let mut last_error = None;
        let mut last_group_len = None;
        for min_confirmations in CONFIRMATION_GROUPS {
            if exclude_unconfirmed && min_confirmations == 0 {
                continue;
            }
            let group: Vec<Coin> = candidates
                .iter()
                .filter(|c| c.confirmations >= min_confirmations)
                .cloned()
                .collect();
            if last_group_len == Some(group.len()) {
                continue;
            }
            last_group_len = Some(group.len());

            match self.select(&group, amount, model) {
                Ok(selection) => {
                    debug!(
                        "Selected inputs group={} count={} fee={} change={}",
                        min_confirmations,
                        selection.inputs.len(),
                        selection.fee,
                        selection.change
                    );
                    return Ok(selection);
                }
                Err(e) => {
                    debug!("No inputs selected in group={}: {}", min_confirmations, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| insufficient_for_fee(model)))
    }

    /// Sweeps free coins, largest first, into one output with no change.
    ///
    /// The fee is rounded up so that creating a proposal for the returned
    /// amount selects the same inputs.
    pub fn send_max(
        &self,
        coins: &[Coin],
        locked: &HashSet<String>,
        model: &FeeModel,
        exclude_unconfirmed: bool,
    ) -> SendMaxInfo {
        let mut info = SendMaxInfo {
            fee_per_kb: model.fee_per_kb,
            ..Default::default()
        };

        let fee_per_input = model.fee_per_input();
        let mut usable: Vec<Coin> = coins
            .iter()
            .filter(|c| c.spendable)
            .filter(|c| !locked.contains(&c.key()))
            .filter(|c| !exclude_unconfirmed || c.confirmations > 0)
            .cloned()
            .collect();
        usable.sort_by(oldest_first);
        usable.sort_by(|a, b| b.amount.cmp(&a.amount));

        let (usable, below_fee): (Vec<Coin>, Vec<Coin>) = usable
            .into_iter()
            .partition(|c| c.amount as f64 > fee_per_input);
        info.utxos_below_fee = below_fee.len();
        info.amount_below_fee = below_fee.iter().map(|c| c.amount).sum();

        let mut inputs = Vec::new();
        for (i, coin) in usable.iter().enumerate() {
            if model.size_for(i + 1) > model.max_tx_size {
                let skipped = &usable[i..];
                info.utxos_above_max_size = skipped.len();
                info.amount_above_max_size = skipped.iter().map(|c| c.amount).sum();
                break;
            }
            inputs.push(coin.clone());
        }
        if inputs.is_empty() {
            return info;
        }

        let fee = (model.base_fee() + fee_per_input * inputs.len() as f64).ceil() as u64;
        let total: u64 = inputs.iter().map(|c| c.amount).sum();
        let amount = total.saturating_sub(fee);
        let dust = self.config.min_output_amount.max(model.dust_threshold);
        if amount < dust {
            return info;
        }

        info.size = model.size_for(inputs.len());
        info.fee = fee;
        info.amount = amount;
        info.inputs = inputs;
        info
    }

    /// Selects inputs for `amount` from one candidate group.
    pub fn select(&self, candidates: &[Coin], amount: u64, model: &FeeModel) -> Result<Selection> {
        let base_fee = model.base_fee();
        let fee_per_input = model.fee_per_input();
        let target = amount as f64;

        let total: u64 = candidates.iter().map(|c| c.amount).sum();
        if total < amount {
            return Err(WalletError::new(
                ErrorKind::InsufficientFunds,
                format!("Insufficient funds in candidates: have {}, need {}", total, amount),
            ));
        }
        let net_value = total as f64 - base_fee - candidates.len() as f64 * fee_per_input;
        if net_value < target {
            return Err(insufficient_for_fee(model));
        }

        let big_threshold = target * self.config.max_single_utxo_factor + base_fee + fee_per_input;
        let (mut big, mut small): (Vec<Coin>, Vec<Coin>) = candidates
            .iter()
            .cloned()
            .partition(|c| c.amount as f64 > big_threshold);
        big.sort_by_key(|c| c.amount);
        small.sort_by(|a, b| b.amount.cmp(&a.amount));

        let mut selected: Vec<Coin> = Vec::new();
        let mut selected_total = 0u64;
        let mut net_total = -base_fee;
        let mut fee = 0u64;
        let mut size_exceeded = false;

        for coin in small {
            let net_input = coin.amount as f64 - fee_per_input;
            selected_total += coin.amount;
            net_total += net_input;
            selected.push(coin);

            let size = model.size_for(selected.len());
            fee = model.fee_for(selected.len());

            if size > model.max_tx_size {
                debug!("Selection too big size={} max={}", size, model.max_tx_size);
                size_exceeded = true;
                break;
            }

            if !big.is_empty() {
                if net_input / target < self.config.min_tx_amount_vs_utxo_factor {
                    break;
                }
                if fee as f64 / target > self.config.max_fee_vs_tx_amount_factor {
                    let vs_single_input = fee as f64 / (base_fee + fee_per_input);
                    if vs_single_input > self.config.max_fee_vs_single_utxo_fee_factor {
                        break;
                    }
                }
            }

            if net_total >= target {
                break;
            }
        }

        if net_total < target || size_exceeded {
            selected.clear();
            if !big.is_empty() {
                let coin = big.remove(0);
                debug!("Using big input {} amount={}", coin.key(), coin.amount);
                selected_total = coin.amount;
                fee = model.fee_for(1);
                selected.push(coin);
            }
        }

        if selected.is_empty() {
            if size_exceeded {
                return Err(WalletError::new(
                    ErrorKind::TxMaxSizeExceeded,
                    "Transaction exceeds the maximum size",
                ));
            }
            return Err(insufficient_for_fee(model));
        }

        // Change too small to be worth an output goes to the miners.
        let mut change = selected_total - amount - fee;
        let dust = self.config.min_output_amount.max(model.dust_threshold);
        if change > 0 && change <= dust {
            fee += change;
            change = 0;
        }

        Ok(Selection {
            inputs: selected,
            fee,
            change,
        })
    }
}
