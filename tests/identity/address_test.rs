use stakechain::identity::{Address, AddressError, Keypair, SigningService};

// ============================================================================
// DERIVATION
// ============================================================================

#[test]
fn test_address_derived_from_public_key() {
    let keypair = Keypair::generate();
    let address = Address::from_public_key(&keypair.public_key());

    assert_eq!(address, keypair.address());
    assert_eq!(address.public_key().unwrap(), keypair.public_key());
}

#[test]
fn test_same_seed_same_address() {
    let a = Keypair::from_seed([1u8; 32]).address();
    let b = Keypair::from_seed([1u8; 32]).address();
    let c = Keypair::from_seed([2u8; 32]).address();

    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_parse_roundtrip() {
    let address = Keypair::generate().address();
    let parsed = Address::parse(address.as_str()).unwrap();

    assert_eq!(parsed, address);
    assert_eq!(address.to_string().parse::<Address>().unwrap(), address);
}

// ============================================================================
// RESERVED ADDRESSES
// ============================================================================

#[test]
fn test_reserved_addresses_are_distinct() {
    let system = Address::system();
    let escrow = Address::escrow();
    let unspendable = Address::unspendable();

    assert!(system.is_system() && system.is_reserved());
    assert!(escrow.is_escrow() && escrow.is_reserved());
    assert!(unspendable.is_reserved());
    assert_ne!(system, escrow);
    assert_ne!(escrow, unspendable);
}

#[test]
fn test_reserved_addresses_have_no_key() {
    for address in [Address::system(), Address::escrow(), Address::unspendable()] {
        assert!(matches!(address.public_key(), Err(AddressError::Reserved(_))));
    }
}

#[test]
fn test_reserved_addresses_parse() {
    assert_eq!(Address::parse(Address::escrow().as_str()).unwrap(), Address::escrow());
    assert_eq!(Address::parse(Address::system().as_str()).unwrap(), Address::system());
}

#[test]
fn test_key_address_is_not_reserved() {
    assert!(!Keypair::generate().address().is_reserved());
}

// ============================================================================
// INVALID INPUT
// ============================================================================

#[test]
fn test_empty_address_rejected() {
    assert!(matches!(Address::parse(""), Err(AddressError::InvalidFormat(_))));
}

#[test]
fn test_non_base58_rejected() {
    assert!(matches!(Address::parse("0OIl!!"), Err(AddressError::InvalidBase58(_))));
}

#[test]
fn test_wrong_key_length_rejected() {
    let short = bs58::encode([1u8; 16]).into_string();
    assert!(matches!(Address::parse(&short), Err(AddressError::InvalidPublicKey(_))));
}

#[test]
fn test_serde_rejects_invalid_address() {
    let result: Result<Address, _> = serde_json::from_str("\"not-an-address!\"");
    assert!(result.is_err());

    let address = Keypair::generate().address();
    let json = serde_json::to_string(&address).unwrap();
    assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), address);
}

#[test]
fn test_short_form_prefix() {
    let address = Keypair::generate().address();
    assert!(address.as_str().starts_with(address.short()));
    assert!(address.short().len() <= 8);
}
