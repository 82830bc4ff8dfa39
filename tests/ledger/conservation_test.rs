use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stakechain::identity::{Address, Keypair, SigningService};
use stakechain::ledger::Ledger;
use stakechain::tx::{Amount, Transaction, TxBuilder};

const NOW: u64 = 1_700_000_000;

/// Test: total supply only moves when value is minted, whatever sequence of
/// transfers is applied or reverted
#[test]
fn test_transfers_conserve_supply() {
    let mut rng = StdRng::seed_from_u64(7);
    let holders: Vec<Keypair> = (0..5).map(|_| Keypair::generate()).collect();
    let mut ledger = Ledger::new(Address::unspendable(), holders[0].address());

    for holder in &holders {
        ledger
            .apply(&Transaction::genesis(holder.address(), Amount::from_coins(100), None, 0))
            .unwrap();
    }
    let genesis = ledger.clone();
    let supply = ledger.total_supply();

    let mut applied = Vec::new();
    for nonce in 0..200u64 {
        let from = &holders[rng.gen_range(0..holders.len())];
        let to = &holders[rng.gen_range(0..holders.len())];
        if from.address() == to.address() {
            continue;
        }
        let tx = TxBuilder::new()
            .signer(from)
            .recipient(to.address())
            .amount(Amount::from_units(rng.gen_range(1..3_000_000_000)))
            .fee(Amount::from_units(rng.gen_range(0..100_000)))
            .timestamp(NOW)
            .nonce(nonce)
            .build()
            .unwrap();

        // Overdrafts are rejected and must not change anything
        if ledger.apply(&tx).is_ok() {
            applied.push(tx);
        }
        assert_eq!(ledger.total_supply(), supply);
    }

    assert!(!applied.is_empty());
    assert!(ledger.verify_integrity().is_ok());

    for tx in applied.iter().rev() {
        ledger.revert(tx).unwrap();
        assert_eq!(ledger.total_supply(), supply);
    }
    assert_eq!(ledger, genesis);
}

#[test]
fn test_mint_grows_supply_by_exact_amount() {
    let validator = Keypair::generate();
    let mut ledger = Ledger::new(Address::unspendable(), validator.address());
    ledger
        .apply(&Transaction::genesis(validator.address(), Amount::from_coins(150), None, 0))
        .unwrap();

    let reward = Transaction::mining_reward(validator.address(), Amount::from_coins(50), 1, NOW);
    ledger.apply(&reward).unwrap();

    assert_eq!(ledger.total_supply(), Amount::from_coins(200));
    assert_eq!(ledger.minted(), Amount::from_coins(200));
    assert!(ledger.verify_integrity().is_ok());

    ledger.revert(&reward).unwrap();
    assert_eq!(ledger.minted(), Amount::from_coins(150));
}

#[test]
fn test_staking_round_trip_conserves_supply() {
    let validator = Keypair::generate();
    let mut ledger = Ledger::new(Address::unspendable(), validator.address());
    ledger
        .apply(&Transaction::genesis(validator.address(), Amount::from_coins(150), None, 0))
        .unwrap();

    let stake = TxBuilder::new()
        .stake(&validator, Amount::from_coins(40))
        .timestamp(NOW)
        .nonce(1)
        .build()
        .unwrap();
    let unstake = TxBuilder::new()
        .unstake(&validator, Amount::from_coins(40))
        .timestamp(NOW)
        .nonce(2)
        .build()
        .unwrap();

    ledger.apply(&stake).unwrap();
    assert_eq!(ledger.get_balance(&Address::escrow()), stake.total_cost().unwrap());
    ledger.apply(&unstake).unwrap();

    let fees = stake.fee().checked_add(unstake.fee()).unwrap();
    assert_eq!(ledger.get_balance(&Address::escrow()), fees);
    assert_eq!(ledger.total_supply(), Amount::from_coins(150));
    assert!(ledger.verify_integrity().is_ok());
}
