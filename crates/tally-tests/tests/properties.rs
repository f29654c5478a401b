//! Property tests over randomly generated chains.
//!
//! A chain is built from a small plan language while a reference model of
//! the unspent set is kept alongside, then applied to a fresh index.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use tally_core::types::{Block, OutPoint, Transaction, TxInput, TxOutput};
use tally_index::applier::{ApplyOutcome, BlockApplier};
use tally_index::storage::{IndexStore, UtxoEntry};
use tally_tests::helpers::*;

#[derive(Debug, Clone)]
enum TxPlan {
    /// New coins to one address.
    Mint { seed: u8, value: u64 },
    /// Spend one model output and split it between two addresses.
    Spend { pick: usize, seed: u8, percent: u64 },
    /// Coins to an unspendable OP_RETURN output.
    Burn { value: u64 },
}

fn tx_plan() -> impl Strategy<Value = TxPlan> {
    prop_oneof![
        (any::<u8>(), 1u64..1_000_000).prop_map(|(seed, value)| TxPlan::Mint { seed, value }),
        (any::<usize>(), any::<u8>(), 0u64..=100).prop_map(|(pick, seed, percent)| TxPlan::Spend {
            pick,
            seed,
            percent
        }),
        (1u64..10_000).prop_map(|value| TxPlan::Burn { value }),
    ]
}

fn chain_plan() -> impl Strategy<Value = Vec<Vec<TxPlan>>> {
    prop::collection::vec(prop::collection::vec(tx_plan(), 0..5), 1..8)
}

/// Built chain plus the expected balance of every address seed.
struct Chain {
    blocks: Vec<Block>,
    expected: BTreeMap<u8, u64>,
}

fn build_chain(plan: &[Vec<TxPlan>]) -> Chain {
    let mut unspent: Vec<(OutPoint, u8, u64)> = Vec::new();
    let mut next_id = 0u64;
    let mut blocks = Vec::new();

    for (height, txs) in plan.iter().enumerate() {
        let mut transactions = Vec::new();
        for step in txs {
            let id = next_id;
            next_id += 1;
            let tx = match *step {
                TxPlan::Spend { pick, seed, percent } if !unspent.is_empty() => {
                    let (prev, _, value) = unspent.remove(pick % unspent.len());
                    let first = value * percent / 100;
                    make_tx(id, &[prev], &[(seed, first), (seed.wrapping_add(1), value - first)])
                }
                TxPlan::Spend { seed, .. } => make_coinbase(id, &[(seed, 1)]),
                TxPlan::Mint { seed, value } => make_coinbase(id, &[(seed, value)]),
                TxPlan::Burn { value } => Transaction {
                    txid: txid(id),
                    inputs: vec![TxInput::coinbase()],
                    outputs: vec![TxOutput { index: 0, value, script_pubkey: op_return() }],
                },
            };
            if !matches!(step, TxPlan::Burn { .. }) {
                for (i, output) in tx.outputs.iter().enumerate() {
                    let seed = output.script_pubkey[2];
                    unspent.push((OutPoint::new(tx.txid, i as u32), seed, output.value));
                }
            }
            transactions.push(tx);
        }
        blocks.push(make_block(height as u64, transactions));
    }

    let mut expected = BTreeMap::new();
    for (_, seed, value) in &unspent {
        *expected.entry(*seed).or_insert(0) += value;
    }
    Chain { blocks, expected }
}

fn applier(store: &Arc<IndexStore>) -> BlockApplier {
    BlockApplier::new(Arc::clone(store), Arc::new(MockLedger::new()), params(), 3)
}

/// Non-zero balances and the unspent set. Zero rows are left out: an
/// address credited and debited in order keeps a zero row, one whose output
/// was spent before it was created never gets one.
fn snapshot(store: &IndexStore) -> (Vec<(String, u64)>, Vec<UtxoEntry>) {
    (store.balances(1).unwrap(), store.utxos().unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn balances_match_model_and_unspent_set(plan in chain_plan()) {
        let chain = build_chain(&plan);
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let applier = applier(&store);

        for block in &chain.blocks {
            prop_assert!(matches!(applier.apply_block(block), Ok(ApplyOutcome::Applied(_))));
        }

        prop_assert_eq!(total_balance(&store), total_unspent(&store));
        for (seed, value) in &chain.expected {
            prop_assert_eq!(store.balance(&address(*seed)).unwrap(), *value);
        }
        let last = chain.blocks.len() as u64 - 1;
        prop_assert_eq!(store.confirmed_tip().unwrap(), Some(last));
    }

    #[test]
    fn reapplying_changes_nothing(plan in chain_plan()) {
        let chain = build_chain(&plan);
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let applier = applier(&store);

        for block in &chain.blocks {
            applier.apply_block(block).unwrap();
        }
        let before = snapshot(&store);

        for block in &chain.blocks {
            prop_assert_eq!(applier.apply_block(block).unwrap(), ApplyOutcome::AlreadyDone);
        }
        prop_assert_eq!(snapshot(&store), before);
    }

    #[test]
    fn application_order_does_not_matter(plan in chain_plan(), rotate in any::<usize>()) {
        let chain = build_chain(&plan);

        let forward_dir = tempfile::tempdir().unwrap();
        let forward = open_store(&forward_dir);
        let forward_applier = applier(&forward);
        for block in &chain.blocks {
            forward_applier.apply_block(block).unwrap();
        }

        let mut shuffled = chain.blocks.clone();
        shuffled.reverse();
        let len = shuffled.len();
        shuffled.rotate_left(rotate % len);

        let shuffled_dir = tempfile::tempdir().unwrap();
        let other = open_store(&shuffled_dir);
        let other_applier = applier(&other);
        for block in &shuffled {
            other_applier.apply_block(block).unwrap();
        }

        prop_assert_eq!(snapshot(&other), snapshot(&forward));
        prop_assert_eq!(other.confirmed_tip().unwrap(), forward.confirmed_tip().unwrap());
    }
}
