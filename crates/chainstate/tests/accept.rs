//! End-to-end accept-block pipeline tests on an in-memory store.

use std::sync::Arc;

use tempfile::TempDir;
use umbra_chainstate::{AcceptOutcome, ChainState, ChainStateError};
use umbra_consensus::params::Checkpoint;
use umbra_consensus::{chain_params, ChainParams, Hash256, Network, COIN};
use umbra_pow::{check_proof_of_work, target_to_compact};
use umbra_primitives::block::{Block, BlockHeader};
use umbra_primitives::merkle::merkle_root_and_mutation;
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};
use umbra_storage::memory::MemoryStore;

const GENESIS_TIME: u32 = 1_600_000_000;
const SPACING: u32 = 150;

/// Regtest parameters re-anchored on a genesis block we can actually build.
fn test_params(genesis: &Block) -> ChainParams {
    let mut params = chain_params(Network::Regtest);
    params.genesis_hash = genesis.hash();
    params.genesis_time = genesis.header.time;
    params
}

fn coinbase(height: i32, time: u32, tag: u8) -> Transaction {
    let mut script_sig = umbra_chainstate::validation::encode_script_height(height);
    script_sig.push(tag);
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: vec![TxOut::new(50 * COIN, vec![0x51])],
        lock_time: 0,
    }
}

fn genesis_block() -> Block {
    let params = chain_params(Network::Regtest);
    let cb = coinbase(0, GENESIS_TIME, 0);
    let (root, _) = merkle_root_and_mutation(&[cb.txid()]);
    let header = BlockHeader {
        version: 1,
        prev_block: [0; 32],
        merkle_root: root,
        time: GENESIS_TIME,
        bits: target_to_compact(&params.pow_limit),
        nonce: 0,
    };
    Block::new(header, vec![cb])
}

/// Builds a proof-of-work block on `prev`, grinding the nonce until the
/// header hash meets the (very easy) regtest target.
fn build_on(params: &ChainParams, prev: &Block, height: i32, tag: u8, extra: Vec<Transaction>) -> Block {
    let time = prev.header.time + SPACING;
    let mut transactions = vec![coinbase(height, time, tag)];
    transactions.extend(extra);
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    let (root, _) = merkle_root_and_mutation(&txids);
    let bits = target_to_compact(&params.pow_limit);
    let mut header = BlockHeader {
        version: 1,
        prev_block: prev.hash(),
        merkle_root: root,
        time,
        bits,
        nonce: 0,
    };
    while check_proof_of_work(&header.hash(), bits, &params.pow_limit).is_err() {
        header.nonce += 1;
    }
    Block::new(header, transactions)
}

fn open_state(
    params: &ChainParams,
    store: &Arc<MemoryStore>,
    dir: &TempDir,
) -> ChainState<Arc<MemoryStore>> {
    ChainState::open(Arc::new(store.clone()), params.clone(), dir.path()).expect("open")
}

fn accept(
    state: &ChainState<Arc<MemoryStore>>,
    block: &Block,
) -> Result<AcceptOutcome, ChainStateError> {
    // Local clock just past the block's own stamp.
    state.accept_block(block, i64::from(block.header.time) + 10, None)
}

fn reason(err: ChainStateError) -> &'static str {
    match err {
        ChainStateError::Rejected(rejection) => rejection.reason,
        other => panic!("expected rejection, got {other}"),
    }
}

#[test]
fn linear_chain_extends_best() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    let b1 = build_on(&params, &genesis, 1, 1, Vec::new());
    let b2 = build_on(&params, &b1, 2, 2, Vec::new());

    for (block, height) in [(&b1, 1), (&b2, 2)] {
        let outcome = accept(&state, block).expect("accept");
        assert_eq!(
            outcome,
            AcceptOutcome::Accepted {
                hash: block.hash(),
                height,
                new_best: true,
                unorphaned: Vec::new(),
            }
        );
    }

    assert_eq!(state.best_height(), 2);
    assert_eq!(state.best_hash(), Some(b2.hash()));
    assert_eq!(state.main_chain_hash(1), Some(b1.hash()));
    let stored = state.read_block(&b1.hash()).expect("read").expect("present");
    assert_eq!(stored, b1);

    // The coinbase of a connected block lands in the tx index unspent.
    let cb1 = b1.transactions[0].txid();
    assert!(state.is_spendable(&cb1, 0).expect("lookup"));
    assert!(!state.is_spendable(&[0xaa; 32], 0).expect("lookup"));
}

#[test]
fn duplicate_block_is_already_known() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    let b1 = build_on(&params, &genesis, 1, 1, Vec::new());
    accept(&state, &b1).expect("first accept");
    assert_eq!(
        accept(&state, &b1).expect("second accept"),
        AcceptOutcome::AlreadyKnown { hash: b1.hash() }
    );
    assert_eq!(state.best_height(), 1);
}

#[test]
fn orphan_is_held_then_connected_by_its_parent() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    let b1 = build_on(&params, &genesis, 1, 1, Vec::new());
    let b2 = build_on(&params, &b1, 2, 2, Vec::new());
    let b3 = build_on(&params, &b2, 3, 3, Vec::new());

    // Children arrive before their parent.
    assert_eq!(
        accept(&state, &b3).expect("hold"),
        AcceptOutcome::Orphan {
            hash: b3.hash(),
            missing: b2.hash(),
        }
    );
    assert_eq!(
        accept(&state, &b2).expect("hold"),
        AcceptOutcome::Orphan {
            hash: b2.hash(),
            missing: b1.hash(),
        }
    );
    assert_eq!(state.orphan_count(), 2);
    assert_eq!(state.best_height(), 0);

    // The missing parent connects the whole pending line.
    let outcome = accept(&state, &b1).expect("accept");
    let AcceptOutcome::Accepted {
        height,
        new_best,
        unorphaned,
        ..
    } = outcome
    else {
        panic!("expected acceptance");
    };
    assert_eq!(height, 1);
    assert!(new_best);
    assert_eq!(unorphaned, vec![b2.hash(), b3.hash()]);
    assert_eq!(state.orphan_count(), 0);
    assert_eq!(state.best_height(), 3);
    assert_eq!(state.best_hash(), Some(b3.hash()));
}

#[test]
fn heavier_side_chain_triggers_a_reorg() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    let a1 = build_on(&params, &genesis, 1, 0x10, Vec::new());
    let a2 = build_on(&params, &a1, 2, 0x11, Vec::new());
    accept(&state, &a1).expect("a1");
    accept(&state, &a2).expect("a2");

    let b1 = build_on(&params, &genesis, 1, 0x20, Vec::new());
    let b2 = build_on(&params, &b1, 2, 0x21, Vec::new());
    let b3 = build_on(&params, &b2, 3, 0x22, Vec::new());

    // Equal-height side blocks do not displace the first-seen chain.
    let outcome = accept(&state, &b1).expect("side");
    assert!(matches!(
        outcome,
        AcceptOutcome::Accepted { new_best: false, .. }
    ));
    let outcome = accept(&state, &b2).expect("side");
    assert!(matches!(
        outcome,
        AcceptOutcome::Accepted { new_best: false, .. }
    ));
    assert_eq!(state.best_hash(), Some(a2.hash()));

    // One more block tips the trust balance.
    let outcome = accept(&state, &b3).expect("reorg");
    assert!(matches!(
        outcome,
        AcceptOutcome::Accepted { new_best: true, .. }
    ));
    assert_eq!(state.best_height(), 3);
    assert_eq!(state.main_chain_hash(1), Some(b1.hash()));
    assert_eq!(state.main_chain_hash(2), Some(b2.hash()));

    // The losing chain's coinbases leave the tx index; the winners stay.
    assert!(!state
        .is_spendable(&a1.transactions[0].txid(), 0)
        .expect("lookup"));
    assert!(state
        .is_spendable(&b1.transactions[0].txid(), 0)
        .expect("lookup"));
}

#[test]
fn spending_marks_the_funding_output() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    let b1 = build_on(&params, &genesis, 1, 1, Vec::new());
    accept(&state, &b1).expect("b1");
    let funding = b1.transactions[0].txid();

    let spend = Transaction {
        version: 1,
        time: b1.header.time + SPACING,
        vin: vec![TxIn::new(OutPoint::new(funding, 0), vec![0x01, 0x02])],
        vout: vec![TxOut::new(49 * COIN, vec![0x51])],
        lock_time: 0,
    };
    let b2 = build_on(&params, &b1, 2, 2, vec![spend.clone()]);
    accept(&state, &b2).expect("b2");

    assert!(!state.is_spendable(&funding, 0).expect("lookup"));
    assert!(state.is_spendable(&spend.txid(), 0).expect("lookup"));
    let output = state.output(&funding, 0).expect("lookup").expect("present");
    assert_eq!(output.value, 50 * COIN);
}

#[test]
fn future_timestamp_is_rejected() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    let b1 = build_on(&params, &genesis, 1, 1, Vec::new());
    // Local clock far behind the block's stamp.
    let now = i64::from(b1.header.time) - params.future_drift_secs - 1;
    let err = state.accept_block(&b1, now, None).expect_err("reject");
    assert_eq!(reason(err), "block timestamp too far in the future");
    assert_eq!(state.best_height(), 0);
}

#[test]
fn wrong_coinbase_height_is_rejected() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    // Coinbase claims height 5 for a block that lands at height 1.
    let time = genesis.header.time + SPACING;
    let cb = coinbase(5, time, 1);
    let (root, _) = merkle_root_and_mutation(&[cb.txid()]);
    let bits = target_to_compact(&params.pow_limit);
    let mut header = BlockHeader {
        version: 1,
        prev_block: genesis.hash(),
        merkle_root: root,
        time,
        bits,
        nonce: 0,
    };
    while check_proof_of_work(&header.hash(), bits, &params.pow_limit).is_err() {
        header.nonce += 1;
    }
    let block = Block::new(header, vec![cb]);

    let err = accept(&state, &block).expect_err("reject");
    assert_eq!(reason(err), "coinbase height mismatch");
}

#[test]
fn checkpoint_mismatch_is_rejected() {
    let genesis = genesis_block();
    let mut params = test_params(&genesis);
    params.checkpoints = vec![Checkpoint {
        height: 1,
        hash: [0xab; 32],
    }];
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    let b1 = build_on(&params, &genesis, 1, 1, Vec::new());
    let err = accept(&state, &b1).expect_err("reject");
    assert_eq!(reason(err), "checkpoint mismatch");
}

#[test]
fn restart_recovers_index_and_best_tip() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");

    let b1;
    let b2;
    {
        let state = open_state(&params, &store, &dir);
        state.install_genesis(&genesis).expect("genesis");
        b1 = build_on(&params, &genesis, 1, 1, Vec::new());
        b2 = build_on(&params, &b1, 2, 2, Vec::new());
        accept(&state, &b1).expect("b1");
        accept(&state, &b2).expect("b2");
    }

    let reopened = open_state(&params, &store, &dir);
    assert_eq!(reopened.best_height(), 2);
    assert_eq!(reopened.best_hash(), Some(b2.hash()));
    assert_eq!(reopened.main_chain_hash(1), Some(b1.hash()));
    let stored = reopened
        .read_block(&b2.hash())
        .expect("read")
        .expect("present");
    assert_eq!(stored, b2);

    // New blocks append after the recovered file cursor.
    let b3 = build_on(&params, &b2, 3, 3, Vec::new());
    accept(&reopened, &b3).expect("b3");
    assert_eq!(reopened.best_height(), 3);
}

#[test]
fn locator_answers_resume_from_the_fork() {
    let genesis = genesis_block();
    let params = test_params(&genesis);
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().expect("tempdir");
    let state = open_state(&params, &store, &dir);
    state.install_genesis(&genesis).expect("genesis");

    let mut prev = genesis.clone();
    let mut hashes = vec![genesis.hash()];
    for height in 1..=5 {
        let block = build_on(&params, &prev, height, height as u8, Vec::new());
        accept(&state, &block).expect("accept");
        hashes.push(block.hash());
        prev = block;
    }

    // A peer whose best is height 2 asks with that block in its locator.
    let inventory = state.blocks_after_locator(&[hashes[2]], &[0; 32]);
    assert_eq!(inventory, hashes[3..=5].to_vec());

    // An unknown locator falls back to everything after genesis.
    let inventory = state.blocks_after_locator(&[[0xcd; 32]], &[0; 32]);
    assert_eq!(inventory, hashes[1..=5].to_vec());
}
