use stakechain::identity::{Address, Ed25519Verifier, Keypair, SigningService};
use stakechain::tx::{Amount, Transaction, TxBuilder, TxData, TxKind, TxRules, TxValidator, ValidationError};

const NOW: u64 = 1_700_000_000;
const DAY: u64 = 86_400;

fn rules() -> TxRules {
    TxRules::default()
}

fn signed(sender: &Keypair, recipient: Address, amount: Amount, fee: Amount, data: TxData) -> Transaction {
    let mut tx = Transaction::new(sender.address(), recipient, amount, fee, NOW, 1, data);
    tx.sign_with(sender).unwrap();
    tx
}

fn transfer(sender: &Keypair) -> Transaction {
    TxBuilder::new()
        .signer(sender)
        .recipient(Keypair::generate().address())
        .amount(Amount::from_coins(10))
        .timestamp(NOW)
        .build()
        .unwrap()
}

// ============================================================================
// VALID TRANSACTIONS
// ============================================================================

#[test]
fn test_valid_transfer_passes() {
    let tx = transfer(&Keypair::generate());
    assert!(TxValidator::validate(&tx, &Ed25519Verifier, &rules(), NOW, Some(DAY)).is_ok());
}

#[test]
fn test_valid_staking_kinds_pass() {
    let validator = Keypair::generate();
    let delegator = Keypair::generate();
    let txs = vec![
        TxBuilder::new().stake(&validator, Amount::from_coins(100)).timestamp(NOW).build().unwrap(),
        TxBuilder::new().unstake(&validator, Amount::from_coins(1)).timestamp(NOW).build().unwrap(),
        TxBuilder::new()
            .delegate(&delegator, validator.address(), Amount::from_coins(10))
            .timestamp(NOW)
            .build()
            .unwrap(),
        TxBuilder::new()
            .undelegate(&delegator, validator.address(), Amount::from_coins(1))
            .timestamp(NOW)
            .build()
            .unwrap(),
        TxBuilder::new().claim_reward(&validator, Amount::from_coins(1)).timestamp(NOW).build().unwrap(),
    ];

    for tx in txs {
        assert!(
            TxValidator::validate(&tx, &Ed25519Verifier, &rules(), NOW, None).is_ok(),
            "{} should validate",
            tx.kind()
        );
    }
}

// ============================================================================
// SIGNATURES
// ============================================================================

#[test]
fn test_missing_signature_rejected() {
    let sender = Keypair::generate();
    let tx = Transaction::new(
        sender.address(),
        Keypair::generate().address(),
        Amount::from_coins(1),
        Amount::parse("0.0001").unwrap(),
        NOW,
        1,
        TxData::Transfer,
    );

    assert_eq!(
        TxValidator::verify_signature(&tx, &Ed25519Verifier),
        Err(ValidationError::MissingSignature(TxKind::Transfer))
    );
}

#[test]
fn test_foreign_signature_rejected() {
    let sender = Keypair::generate();
    let forger = Keypair::generate();
    let mut tx = Transaction::new(
        sender.address(),
        Keypair::generate().address(),
        Amount::from_coins(1),
        Amount::parse("0.0001").unwrap(),
        NOW,
        1,
        TxData::Transfer,
    );
    tx.set_signature(forger.sign(&tx.to_signing_bytes())).unwrap();

    assert_eq!(
        TxValidator::verify_signature(&tx, &Ed25519Verifier),
        Err(ValidationError::InvalidSignature)
    );
}

#[test]
fn test_system_transaction_rejected_outside_blocks() {
    let reward = Transaction::mining_reward(Keypair::generate().address(), Amount::from_coins(50), 1, NOW);

    assert_eq!(
        TxValidator::validate(&reward, &Ed25519Verifier, &rules(), NOW, None),
        Err(ValidationError::SystemTransaction(TxKind::MiningReward))
    );
    assert!(TxValidator::validate_structure(&reward, &rules()).is_ok());
    assert!(TxValidator::verify_signature(&reward, &Ed25519Verifier).is_ok());
}

#[test]
fn test_system_transaction_from_user_rejected() {
    let user = Keypair::generate();
    let fake = Transaction::new(
        user.address(),
        user.address(),
        Amount::from_coins(50),
        Amount::ZERO,
        NOW,
        1,
        TxData::MiningReward,
    );

    assert!(matches!(
        TxValidator::validate_structure(&fake, &rules()),
        Err(ValidationError::InvalidSender { .. })
    ));
}

// ============================================================================
// STRUCTURE
// ============================================================================

#[test]
fn test_fee_below_minimum_rejected() {
    let sender = Keypair::generate();
    let tx = signed(
        &sender,
        Keypair::generate().address(),
        Amount::from_coins(1),
        Amount::from_units(9_999),
        TxData::Transfer,
    );

    assert!(matches!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::FeeTooLow { .. })
    ));
}

#[test]
fn test_per_byte_fee_floor() {
    let sender = Keypair::generate();
    let tx = transfer(&sender);
    let strict = TxRules {
        min_fee_per_byte: 1_000,
        ..TxRules::default()
    };

    assert!(strict.required_fee(&tx) > tx.fee());
    assert!(matches!(
        TxValidator::validate_structure(&tx, &strict),
        Err(ValidationError::FeeTooLow { .. })
    ));
}

#[test]
fn test_zero_amount_rejected() {
    let sender = Keypair::generate();
    let tx = signed(
        &sender,
        Keypair::generate().address(),
        Amount::ZERO,
        Amount::parse("0.0001").unwrap(),
        TxData::Transfer,
    );

    assert!(matches!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::InvalidAmount(_))
    ));
}

#[test]
fn test_overflowing_amount_rejected() {
    let sender = Keypair::generate();
    let tx = signed(
        &sender,
        Keypair::generate().address(),
        Amount::MAX,
        Amount::parse("0.0001").unwrap(),
        TxData::Transfer,
    );

    assert!(matches!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::InvalidAmount(_))
    ));
}

#[test]
fn test_transfer_to_escrow_rejected() {
    let sender = Keypair::generate();
    let tx = signed(
        &sender,
        Address::escrow(),
        Amount::from_coins(1),
        Amount::parse("0.0001").unwrap(),
        TxData::Transfer,
    );

    assert!(matches!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::InvalidRecipient { .. })
    ));
}

#[test]
fn test_self_transfer_rejected() {
    let sender = Keypair::generate();
    let tx = signed(
        &sender,
        sender.address(),
        Amount::from_coins(1),
        Amount::parse("0.0001").unwrap(),
        TxData::Transfer,
    );

    assert_eq!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::SelfTransfer)
    );
}

#[test]
fn test_stake_for_someone_else_rejected() {
    let sender = Keypair::generate();
    let tx = signed(
        &sender,
        Address::escrow(),
        Amount::from_coins(100),
        Amount::parse("0.0001").unwrap(),
        TxData::Stake {
            validator: Keypair::generate().address(),
        },
    );

    assert!(matches!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::InvalidPayload(_))
    ));
}

#[test]
fn test_self_delegation_rejected() {
    let sender = Keypair::generate();
    let tx = signed(
        &sender,
        Address::escrow(),
        Amount::from_coins(10),
        Amount::parse("0.0001").unwrap(),
        TxData::Delegate {
            validator: sender.address(),
        },
    );

    assert!(matches!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::InvalidPayload(_))
    ));
}

#[test]
fn test_delegation_below_minimum_rejected() {
    let delegator = Keypair::generate();
    let tx = TxBuilder::new()
        .delegate(&delegator, Keypair::generate().address(), Amount::from_coins(9))
        .timestamp(NOW)
        .build()
        .unwrap();

    assert_eq!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::BelowMinimum {
            kind: TxKind::Delegate,
            minimum: Amount::from_coins(10),
            got: Amount::from_coins(9),
        })
    );
}

#[test]
fn test_reserved_sender_rejected() {
    let tx = Transaction::new(
        Address::escrow(),
        Keypair::generate().address(),
        Amount::from_coins(1),
        Amount::parse("0.0001").unwrap(),
        NOW,
        1,
        TxData::Transfer,
    );

    assert!(matches!(
        TxValidator::validate_structure(&tx, &rules()),
        Err(ValidationError::InvalidSender { .. })
    ));
}

// ============================================================================
// TIME
// ============================================================================

#[test]
fn test_future_timestamp_rejected() {
    let tx = transfer(&Keypair::generate());
    let now = NOW - rules().future_tolerance_secs - 1;

    assert!(matches!(
        TxValidator::validate_time(&tx, now, &rules(), None),
        Err(ValidationError::FutureTimestamp { .. })
    ));
    assert!(TxValidator::validate_time(&tx, now + 1, &rules(), None).is_ok());
}

#[test]
fn test_expired_transaction_rejected() {
    let tx = transfer(&Keypair::generate());

    assert!(TxValidator::validate_time(&tx, NOW + DAY, &rules(), Some(DAY)).is_ok());
    assert_eq!(
        TxValidator::validate_time(&tx, NOW + DAY + 1, &rules(), Some(DAY)),
        Err(ValidationError::Expired {
            timestamp: NOW,
            max_age: DAY,
        })
    );
    assert!(TxValidator::validate_time(&tx, NOW + 10 * DAY, &rules(), None).is_ok());
}
