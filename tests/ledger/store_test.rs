use stakechain::identity::{Address, Keypair, SigningService};
use stakechain::ledger::{Ledger, LedgerError, Movements};
use stakechain::tx::{Amount, Transaction, TxBuilder};

const NOW: u64 = 1_700_000_000;

fn fee() -> Amount {
    Amount::parse("0.0001").unwrap()
}

/// Ledger with the standard genesis allocations applied
fn genesis_ledger(staking: &Keypair) -> Ledger {
    let mut ledger = Ledger::new(Address::unspendable(), staking.address());
    ledger
        .apply(&Transaction::genesis(
            Address::unspendable(),
            Amount::from_coins(50),
            Some("bitcoin aged fine!".into()),
            0,
        ))
        .unwrap();
    ledger
        .apply(&Transaction::genesis(staking.address(), Amount::from_coins(150), None, 0))
        .unwrap();
    ledger
}

fn transfer(from: &Keypair, to: &Address, amount: Amount, nonce: u64) -> Transaction {
    TxBuilder::new()
        .signer(from)
        .recipient(to.clone())
        .amount(amount)
        .fee(fee())
        .timestamp(NOW)
        .nonce(nonce)
        .build()
        .unwrap()
}

// ============================================================================
// GENESIS AND BALANCES
// ============================================================================

#[test]
fn test_genesis_balances() {
    let staking = Keypair::generate();
    let ledger = genesis_ledger(&staking);

    assert_eq!(ledger.get_balance(&staking.address()), Amount::from_coins(150));
    assert_eq!(ledger.get_balance(&Address::unspendable()), Amount::from_coins(50));
    assert_eq!(ledger.total_supply(), Amount::from_coins(200));
    assert_eq!(ledger.circulating_supply(), Amount::from_coins(150));
    assert_eq!(ledger.minted(), Amount::from_coins(200));
    assert!(ledger.is_staking_address(&staking.address()));
    assert!(ledger.is_unspendable(&Address::unspendable()));
}

#[test]
fn test_unknown_address_has_zero_balance() {
    let ledger = genesis_ledger(&Keypair::generate());
    assert_eq!(ledger.get_balance(&Keypair::generate().address()), Amount::ZERO);
    assert!(ledger.account(&Keypair::generate().address()).is_none());
}

#[test]
fn test_basic_transfer() {
    let staking = Keypair::generate();
    let recipient = Keypair::generate().address();
    let mut ledger = genesis_ledger(&staking);

    ledger
        .apply(&transfer(&staking, &recipient, Amount::from_coins(10), 1))
        .unwrap();

    assert_eq!(ledger.get_balance(&staking.address()), Amount::parse("139.9999").unwrap());
    assert_eq!(ledger.get_balance(&recipient), Amount::from_coins(10));
    assert_eq!(ledger.get_balance(&Address::escrow()), fee());
    assert_eq!(ledger.total_supply(), Amount::from_coins(200));
    assert!(ledger.verify_integrity().is_ok());
}

// ============================================================================
// REJECTIONS
// ============================================================================

#[test]
fn test_insufficient_funds_rejected_without_effects() {
    let staking = Keypair::generate();
    let mut ledger = genesis_ledger(&staking);
    let before = ledger.clone();

    let result = ledger.apply(&transfer(&staking, &Keypair::generate().address(), Amount::from_coins(150), 1));

    assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
    assert_eq!(ledger, before);
}

#[test]
fn test_exact_balance_spend_allowed() {
    let staking = Keypair::generate();
    let mut ledger = genesis_ledger(&staking);

    let spend_all = Amount::from_coins(150).checked_sub(fee()).unwrap();
    ledger
        .apply(&transfer(&staking, &Keypair::generate().address(), spend_all, 1))
        .unwrap();

    assert_eq!(ledger.get_balance(&staking.address()), Amount::ZERO);
    assert!(ledger.account(&staking.address()).is_none());
}

#[test]
fn test_duplicate_application_rejected() {
    let staking = Keypair::generate();
    let mut ledger = genesis_ledger(&staking);
    let tx = transfer(&staking, &Keypair::generate().address(), Amount::from_coins(1), 1);

    ledger.apply(&tx).unwrap();

    assert_eq!(ledger.apply(&tx), Err(LedgerError::AlreadyApplied(tx.id())));
    assert_eq!(ledger.check(&tx), Err(LedgerError::AlreadyApplied(tx.id())));
}

#[test]
fn test_unspendable_address_cannot_send() {
    let ledger = genesis_ledger(&Keypair::generate());
    let tx = Transaction::new(
        Address::unspendable(),
        Keypair::generate().address(),
        Amount::from_coins(1),
        fee(),
        NOW,
        1,
        stakechain::tx::TxData::Transfer,
    );

    assert_eq!(ledger.check(&tx), Err(LedgerError::UnspendableSource(Address::unspendable())));
}

// ============================================================================
// REVERT
// ============================================================================

#[test]
fn test_revert_restores_exact_state() {
    let staking = Keypair::generate();
    let mut ledger = genesis_ledger(&staking);
    let before = ledger.clone();
    let tx = transfer(&staking, &Keypair::generate().address(), Amount::from_coins(10), 1);

    ledger.apply(&tx).unwrap();
    ledger.revert(&tx).unwrap();

    assert_eq!(ledger, before);
}

#[test]
fn test_revert_in_reverse_order() {
    let staking = Keypair::generate();
    let second = Keypair::generate();
    let mut ledger = genesis_ledger(&staking);
    let before = ledger.clone();

    let a = transfer(&staking, &second.address(), Amount::from_coins(20), 1);
    let b = transfer(&second, &Keypair::generate().address(), Amount::from_coins(5), 2);
    ledger.apply(&a).unwrap();
    ledger.apply(&b).unwrap();

    ledger.revert(&b).unwrap();
    ledger.revert(&a).unwrap();

    assert_eq!(ledger, before);
}

#[test]
fn test_revert_unknown_rejected() {
    let staking = Keypair::generate();
    let mut ledger = genesis_ledger(&staking);
    let tx = transfer(&staking, &Keypair::generate().address(), Amount::from_coins(1), 1);

    assert_eq!(ledger.revert(&tx), Err(LedgerError::NotApplied(tx.id())));
}

#[test]
fn test_forgotten_transaction_cannot_revert() {
    let staking = Keypair::generate();
    let mut ledger = genesis_ledger(&staking);
    let tx = transfer(&staking, &Keypair::generate().address(), Amount::from_coins(1), 1);
    ledger.apply(&tx).unwrap();

    assert_eq!(ledger.forget([tx.id()].iter()), 1);

    assert_eq!(ledger.revert(&tx), Err(LedgerError::NotApplied(tx.id())));
}

// ============================================================================
// ENTRIES
// ============================================================================

#[test]
fn test_spend_consumes_largest_entry_first() {
    let staking = Keypair::generate();
    let holder = Keypair::generate();
    let mut ledger = genesis_ledger(&staking);

    let small = transfer(&staking, &holder.address(), Amount::from_coins(5), 1);
    let large = transfer(&staking, &holder.address(), Amount::from_coins(30), 2);
    ledger.apply(&small).unwrap();
    ledger.apply(&large).unwrap();

    ledger
        .apply(&transfer(&holder, &Keypair::generate().address(), Amount::from_coins(10), 3))
        .unwrap();

    let entries = ledger.account(&holder.address()).unwrap().entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].source, large.id());
    assert_eq!(entries[0].amount, Amount::parse("19.9999").unwrap());
    assert_eq!(entries[1].source, small.id());
    assert_eq!(entries[1].amount, Amount::from_coins(5));
}

// ============================================================================
// MOVEMENTS AND OVERLAY
// ============================================================================

#[test]
fn test_unstake_debits_only_fee_from_sender() {
    let validator = Keypair::generate();
    let tx = TxBuilder::new()
        .unstake(&validator, Amount::from_coins(20))
        .fee(fee())
        .timestamp(NOW)
        .build()
        .unwrap();

    let movements = Movements::of(&tx).unwrap();

    assert!(movements.debits.contains(&(validator.address(), fee())));
    assert!(movements.debits.contains(&(Address::escrow(), Amount::from_coins(20))));
    assert!(movements.credits.contains(&(validator.address(), Amount::from_coins(20))));
    assert!(movements.minted.is_zero());
}

#[test]
fn test_overlay_does_not_touch_ledger() {
    let staking = Keypair::generate();
    let recipient = Keypair::generate().address();
    let ledger = genesis_ledger(&staking);

    let mut overlay = ledger.overlay();
    overlay
        .apply(&transfer(&staking, &recipient, Amount::from_coins(100), 1))
        .unwrap();
    let second = overlay.apply(&transfer(&staking, &recipient, Amount::from_coins(100), 2));

    assert!(matches!(second, Err(LedgerError::InsufficientFunds { .. })));
    assert_eq!(overlay.balance(&recipient), Amount::from_coins(100));
    assert_eq!(ledger.get_balance(&recipient), Amount::ZERO);
}
