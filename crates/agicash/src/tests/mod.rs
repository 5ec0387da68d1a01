//! End-to-end scenarios against the in-memory store and in-process
//! mint/Spark fakes.

use std::sync::Arc;
use std::time::Duration;

use agicash_common::account::SparkNetwork;
use agicash_common::amount::CurrencyUnit;
use agicash_common::database::{Database, MemoryDatabase};
use agicash_common::outputs::PreMintSecrets;
use agicash_common::proof::ProofState;
use agicash_common::records::{
    CashuReceiveQuoteState, CashuSendQuoteState, CashuTokenSwapState, SparkReceiveQuoteState,
    SparkSendQuoteState, TransactionState,
};
use agicash_common::{Account, Amount, Currency, Error, MintUrl, Money, Token};
use anyhow::Result;

use crate::mint::MintRegistry;
use crate::processor::{BackgroundProcessor, Engines};
use crate::receive::{CashuReceiveService, SparkReceiveService};
use crate::send::{CashuSendService, SparkSendService};
use crate::spark::{SparkConnector, SparkRegistry};
use crate::swap::{SendSwapService, TokenSwapService};
use crate::testing::{fake_invoice, setup_tracing, FakeLightningNetwork, FakeMint, FakeSpark};
use crate::{ProofLedger, WalletKeys};

const USER: &str = "user-1";
const MINT_URL: &str = "https://mint.example.com";

struct TestWallet {
    db: Arc<MemoryDatabase>,
    mint: FakeMint,
    account: Account,
    ledger: ProofLedger,
    cashu_receive: CashuReceiveService,
    cashu_send: CashuSendService,
    token_swaps: TokenSwapService,
    send_swaps: SendSwapService,
}

fn registry_for(mints: Vec<(MintUrl, FakeMint)>) -> Arc<MintRegistry> {
    Arc::new(MintRegistry::new(Box::new(move |url| {
        mints
            .iter()
            .find(|(mint_url, _)| mint_url == url)
            .map(|(_, mint)| mint.connector())
            .expect("test registry knows the url")
    })))
}

fn spark_registry_for(spark: Arc<FakeSpark>) -> Arc<SparkRegistry> {
    Arc::new(SparkRegistry::new(Box::new(move |_network| {
        let spark = spark.clone();
        Box::pin(async move { Ok(spark as Arc<dyn SparkConnector>) })
    })))
}

async fn setup(fee_ppk: u64) -> Result<TestWallet> {
    setup_tracing();
    let db = Arc::new(MemoryDatabase::default());
    let mint = FakeMint::new(fee_ppk);
    let mint_url: MintUrl = MINT_URL.parse()?;
    let registry = registry_for(vec![(mint_url.clone(), mint.clone())]);
    let keys = WalletKeys::from_seed([11u8; 64]);

    let account = db
        .add_account(Account::new_cashu(USER, Currency::Btc, mint_url, false))
        .await?;

    Ok(TestWallet {
        cashu_receive: CashuReceiveService::new(db.clone(), registry.clone(), keys.clone()),
        cashu_send: CashuSendService::new(db.clone(), registry.clone(), keys.clone()),
        token_swaps: TokenSwapService::new(db.clone(), registry.clone(), keys.clone()),
        send_swaps: SendSwapService::new(db.clone(), registry, keys),
        ledger: ProofLedger::new(db.clone()),
        db,
        mint,
        account,
    })
}

/// Fund the wallet through a full receive flow
async fn fund(wallet: &TestWallet, amount: u64) -> Result<()> {
    let quote = wallet
        .cashu_receive
        .create_receive_quote(
            &wallet.account,
            Money::new(Amount::from(amount), Currency::Btc),
            None,
        )
        .await?;
    wallet.mint.pay_mint_quote(&quote.quote_id).await;
    let quote = wallet.cashu_receive.drive(quote).await?;
    assert_eq!(quote.state_tag(), "COMPLETED");
    Ok(())
}

#[tokio::test]
async fn same_mint_receive_credits_balance() -> Result<()> {
    let wallet = setup(0).await?;
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::ZERO
    );

    let quote = wallet
        .cashu_receive
        .create_receive_quote(
            &wallet.account,
            Money::new(Amount::from(1000), Currency::Btc),
            Some("coffee".to_string()),
        )
        .await?;
    assert_eq!(quote.state_tag(), "UNPAID");
    assert_eq!(quote.version, 0);

    // Nothing happens while the invoice is unpaid
    let quote = wallet.cashu_receive.drive(quote).await?;
    assert_eq!(quote.state_tag(), "UNPAID");

    wallet.mint.pay_mint_quote(&quote.quote_id).await;
    let quote = wallet.cashu_receive.drive(quote).await?;
    assert_eq!(quote.state_tag(), "COMPLETED");

    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(1000)
    );

    // One proof per power of two in the amount
    let proofs = wallet.db.get_proofs(wallet.account.id, None).await?;
    assert_eq!(proofs.len(), Amount::from(1000).split().len());

    // Re-invoking completion is a no-op
    let again = wallet.cashu_receive.complete_receive(quote.id).await?;
    assert_eq!(again.version, quote.version);
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(1000)
    );

    // The transaction projection settled
    let tx = wallet
        .db
        .get_transaction(quote.transaction_id)
        .await?
        .expect("projection exists");
    assert_eq!(tx.state, TransactionState::Completed);
    Ok(())
}

#[tokio::test]
async fn completed_receive_inserted_new_proof_identities() -> Result<()> {
    let wallet = setup(0).await?;
    fund(&wallet, 64).await?;

    let proofs = wallet.db.get_proofs(wallet.account.id, None).await?;
    let mut ys: Vec<_> = proofs.iter().map(|p| p.y).collect();
    ys.sort();
    ys.dedup();
    assert_eq!(ys.len(), proofs.len());
    Ok(())
}

#[tokio::test]
async fn cross_mint_bridge_receive() -> Result<()> {
    setup_tracing();
    let network = FakeLightningNetwork::new();
    let destination_mint = FakeMint::with_network(0, CurrencyUnit::Sat, network.clone());
    let source_mint = FakeMint::with_network(0, CurrencyUnit::Sat, network);
    let destination_url: MintUrl = "https://mint-a.example.com".parse()?;
    let source_url: MintUrl = "https://mint-b.example.com".parse()?;

    let db = Arc::new(MemoryDatabase::default());
    let registry = registry_for(vec![
        (destination_url.clone(), destination_mint),
        (source_url.clone(), source_mint.clone()),
    ]);
    let keys = WalletKeys::from_seed([3u8; 64]);
    let account = db
        .add_account(Account::new_cashu(
            USER,
            Currency::Btc,
            destination_url,
            false,
        ))
        .await?;
    let receive = CashuReceiveService::new(db.clone(), registry, keys);
    let ledger = ProofLedger::new(db.clone());

    // A token from the source mint, as presented by a sender
    let token_proofs = source_mint
        .issue_proofs(&[
            Amount::from(8192),
            Amount::from(1024),
            Amount::from(512),
            Amount::from(256),
            Amount::from(16),
        ])
        .await;
    let token = Token::new(source_url, CurrencyUnit::Sat, token_proofs, None);
    assert_eq!(token.value(), Amount::from(10_000));

    let quote = receive.create_token_receive_quote(&account, &token).await?;
    let data = quote.kind.token_receive_data().expect("cross-mint data");
    assert!(!data.melt_initiated);
    // Receive amount is the token minus fees and reserve
    assert!(quote.amount.amount < Amount::from(10_000));

    // First pass initiates the melt, which settles the invoice
    let quote = receive.drive(quote).await?;
    assert!(quote
        .kind
        .token_receive_data()
        .expect("cross-mint data")
        .melt_initiated);

    // Next pass observes the paid quote and completes the mint
    let quote = receive.drive(quote).await?;
    assert_eq!(quote.state_tag(), "COMPLETED");

    assert_eq!(ledger.balance(account.id).await?, quote.amount.amount);
    Ok(())
}

#[tokio::test]
async fn send_swap_with_change_and_claim() -> Result<()> {
    let wallet = setup(400).await?;
    // Proofs 64+32+8+1
    fund(&wallet, 105).await?;
    let initial = wallet.ledger.balance(wallet.account.id).await?;
    assert_eq!(initial, Amount::from(105));

    let (swap, token) = wallet
        .send_swaps
        .create_send_swap(&wallet.account, Amount::from(70))
        .await?;
    assert!(token.is_none());
    assert_eq!(swap.state_tag(), "DRAFT");
    assert_eq!(swap.amount_to_send, Amount::from(70));

    // Reserved inputs leave the balance immediately
    let reserved_balance = wallet.ledger.balance(wallet.account.id).await?;
    assert_eq!(reserved_balance, initial - swap.input_amount);

    let (swap, token) = wallet.send_swaps.swap_for_proofs_to_send(swap.id).await?;
    assert_eq!(swap.state_tag(), "PENDING");
    assert_eq!(token.value(), Amount::from(70));
    assert_eq!(Some(token.token_hash().as_str()), swap.token_hash());

    // Re-invocation returns the same token without a second swap
    let (_, token_again) = wallet.send_swaps.swap_for_proofs_to_send(swap.id).await?;
    assert_eq!(token_again.token_hash(), token.token_hash());

    // Change is back; the sent amount and the swap fee are gone
    let after_commit = wallet.ledger.balance(wallet.account.id).await?;
    assert_eq!(
        after_commit,
        initial - swap.amount_to_send - swap.cashu_send_fee
    );

    // The recipient claims the token on their own wallet at the same
    // mint
    let recipient_account = wallet
        .db
        .add_account(Account::new_cashu(
            "user-2",
            Currency::Btc,
            MINT_URL.parse()?,
            false,
        ))
        .await?;
    let recipient_swaps = TokenSwapService::new(
        wallet.db.clone(),
        registry_for(vec![(MINT_URL.parse()?, wallet.mint.clone())]),
        WalletKeys::from_seed([99u8; 64]),
    );
    let claim = recipient_swaps
        .claim_token(&recipient_account, &token)
        .await?;
    assert_eq!(claim.state_tag(), "COMPLETED");
    assert_eq!(claim.amount_received, claim.input_amount - claim.fee_amount);

    let recipient_ledger = ProofLedger::new(wallet.db.clone());
    assert_eq!(
        recipient_ledger.balance(recipient_account.id).await?,
        claim.amount_received
    );

    // The sender's swap observes the claim and completes
    let swap = wallet.send_swaps.check_claim(swap.id).await?;
    assert_eq!(swap.state_tag(), "COMPLETED");
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        after_commit
    );
    Ok(())
}

#[tokio::test]
async fn send_swap_exact_path_skips_the_mint() -> Result<()> {
    let wallet = setup(0).await?;
    fund(&wallet, 64).await?;

    let (swap, token) = wallet
        .send_swaps
        .create_send_swap(&wallet.account, Amount::from(64))
        .await?;
    let token = token.expect("exact path returns the token at creation");
    assert_eq!(swap.state_tag(), "PENDING");
    assert_eq!(swap.cashu_send_fee, Amount::ZERO);
    assert_eq!(token.value(), Amount::from(64));

    // Committed proofs are excluded from balance but still UNSPENT
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::ZERO
    );
    let proofs = wallet
        .db
        .get_proofs(wallet.account.id, Some(vec![ProofState::Unspent]))
        .await?;
    assert!(proofs
        .iter()
        .all(|p| p.spending_send_swap_id == Some(swap.id)));
    Ok(())
}

#[tokio::test]
async fn send_swap_reverse_returns_funds() -> Result<()> {
    let wallet = setup(0).await?;
    fund(&wallet, 105).await?;
    let initial = wallet.ledger.balance(wallet.account.id).await?;

    let (swap, _) = wallet
        .send_swaps
        .create_send_swap(&wallet.account, Amount::from(70))
        .await?;
    let (swap, _token) = wallet.send_swaps.swap_for_proofs_to_send(swap.id).await?;

    let swap = wallet.send_swaps.reverse(swap.id).await?;
    assert_eq!(swap.state_tag(), "REVERSED");

    // The reclaim went through a token swap of the same token
    let reclaim = wallet
        .db
        .get_cashu_token_swap_by_token_hash(USER, swap.token_hash().expect("hash"))
        .await?
        .expect("reclaim swap exists");
    assert_eq!(reclaim.state_tag(), "COMPLETED");

    // Everything except fees is back
    let final_balance = wallet.ledger.balance(wallet.account.id).await?;
    assert_eq!(
        final_balance,
        initial - swap.cashu_send_fee - reclaim.fee_amount
    );

    // No proof is left reserved
    let proofs = wallet.db.get_proofs(wallet.account.id, None).await?;
    assert!(proofs.iter().all(|p| p.state != ProofState::PendingSpend));
    Ok(())
}

#[tokio::test]
async fn crash_between_mint_and_insert_recovers_via_restore() -> Result<()> {
    let wallet = setup(0).await?;

    let quote = wallet
        .cashu_receive
        .create_receive_quote(
            &wallet.account,
            Money::new(Amount::from(1000), Currency::Btc),
            None,
        )
        .await?;
    wallet.mint.pay_mint_quote(&quote.quote_id).await;
    let quote = wallet.cashu_receive.process_payment(quote.id).await?;
    let outputs = quote.minted_outputs().expect("paid quote").clone();

    // Simulate the crashed client: the mint signs, the insert never
    // happens
    {
        use agicash_common::mint::MintRequest;
        use agicash_common::outputs::{derive_locking_key, sign_mint_request};
        use agicash_common::util::hex;

        let keys = WalletKeys::from_seed([11u8; 64]);
        let premints = PreMintSecrets::from_seed(
            keys.seed(),
            outputs.keyset_id,
            outputs.keyset_counter,
            &outputs.output_amounts,
        )?;
        let locking = derive_locking_key(keys.seed(), quote.locking_index)?;
        let signature = sign_mint_request(
            &locking.secret_key,
            &quote.quote_id,
            &premints.blinded_messages(),
        )?;
        wallet
            .mint
            .connector()
            .mint_proofs(MintRequest {
                quote: quote.quote_id.clone(),
                outputs: premints.blinded_messages(),
                signature: Some(hex::encode(signature.serialize())),
            })
            .await?;
    }

    // On restart the driver re-runs completion; the mint reports the
    // work as done and restore recovers the same proofs
    let quote = wallet.cashu_receive.complete_receive(quote.id).await?;
    assert_eq!(quote.state_tag(), "COMPLETED");
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(1000)
    );
    Ok(())
}

#[tokio::test]
async fn double_claim_of_a_token_fails() -> Result<()> {
    let wallet = setup(0).await?;

    let token_proofs = wallet.mint.issue_proofs(&[Amount::from(32)]).await;
    let token = Token::new(MINT_URL.parse()?, CurrencyUnit::Sat, token_proofs, None);

    let claim = wallet
        .token_swaps
        .claim_token(&wallet.account, &token)
        .await?;
    assert_eq!(claim.state_tag(), "COMPLETED");
    let balance = wallet.ledger.balance(wallet.account.id).await?;

    let second = wallet
        .token_swaps
        .create_token_swap(&wallet.account, &token)
        .await;
    assert!(matches!(second, Err(Error::TokenAlreadyClaimed)));
    assert_eq!(wallet.ledger.balance(wallet.account.id).await?, balance);
    Ok(())
}

#[tokio::test]
async fn expired_unpaid_send_releases_inputs() -> Result<()> {
    let wallet = setup(0).await?;
    fund(&wallet, 105).await?;

    let (invoice, _) = fake_invoice(70_000, String::new());
    let quote = wallet
        .cashu_send
        .create_send_quote(&wallet.account, &invoice)
        .await?;
    assert_eq!(quote.state_tag(), "UNPAID");

    // Inputs are reserved while the quote lives
    let reserved = wallet.ledger.balance(wallet.account.id).await?;
    assert_eq!(reserved, Amount::from(105) - quote.input_amount);

    let quote = wallet.cashu_send.expire(quote.id).await?;
    assert_eq!(quote.state_tag(), "EXPIRED");
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(105)
    );
    Ok(())
}

#[tokio::test]
async fn cashu_send_settles_and_returns_change() -> Result<()> {
    let wallet = setup(0).await?;
    fund(&wallet, 105).await?;

    let (invoice, payment_hash) = fake_invoice(70_000, String::new());
    let quote = wallet
        .cashu_send
        .create_send_quote(&wallet.account, &invoice)
        .await?;
    assert_eq!(quote.payment_hash, payment_hash);
    assert_eq!(quote.amount.amount, Amount::from(70));

    let quote = wallet.cashu_send.drive(quote).await?;
    assert_eq!(quote.state_tag(), "COMPLETED");
    let (fee, change) = match &quote.state {
        CashuSendQuoteState::Completed {
            fee,
            change_amount,
            payment_preimage,
        } => {
            assert!(payment_preimage.is_some());
            (*fee, *change_amount)
        }
        other => panic!("expected COMPLETED, got {other:?}"),
    };
    // Fake network charges no routing fee: the fee reserve and the
    // overselection both come back as change
    assert_eq!(fee, Amount::ZERO);
    assert_eq!(change, quote.input_amount - quote.amount.amount);

    // Invoice amount left the balance, everything else came back
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(105 - 70)
    );

    // Settled payment and consumed inputs are one transaction: no
    // input proof is still unspent
    let inputs = wallet.db.get_proofs_by_ys(&quote.input_proof_ys).await?;
    assert!(inputs.iter().all(|p| p.state == ProofState::Spent));

    // A second quote for the same invoice is rejected
    let again = wallet
        .cashu_send
        .create_send_quote(&wallet.account, &invoice)
        .await;
    assert!(matches!(again, Err(Error::DuplicatePaymentHash(_))));
    Ok(())
}

#[tokio::test]
async fn spark_receive_completes_directly() -> Result<()> {
    setup_tracing();
    let db = Arc::new(MemoryDatabase::default());
    let network = FakeLightningNetwork::new();
    let spark = Arc::new(FakeSpark::with_network(network.clone()));
    let identity = spark.identity_public_key();
    let sparks = spark_registry_for(spark);
    let account = db
        .add_account(Account::new_spark(
            USER,
            Currency::Btc,
            SparkNetwork::Regtest,
            identity,
        ))
        .await?;
    let receive = SparkReceiveService::new(db.clone(), sparks, registry_for(vec![]));

    let quote = receive
        .create_receive_quote(&account, Money::new(Amount::from(500), Currency::Btc), None)
        .await?;
    assert_eq!(quote.state_tag(), "UNPAID");

    network.settle(&quote.payment_hash);
    let quote = receive.drive(quote).await?;
    match &quote.state {
        SparkReceiveQuoteState::Completed {
            payment_preimage,
            spark_transfer_id,
        } => {
            assert_eq!(payment_preimage.len(), 64);
            assert!(!spark_transfer_id.is_empty());
        }
        other => panic!("expected COMPLETED, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn spark_send_completes_with_preimage() -> Result<()> {
    setup_tracing();
    let db = Arc::new(MemoryDatabase::default());
    let spark = Arc::new(FakeSpark::new());
    let identity = spark.identity_public_key();
    let sparks = spark_registry_for(spark);
    let account = db
        .add_account(Account::new_spark(
            USER,
            Currency::Btc,
            SparkNetwork::Regtest,
            identity,
        ))
        .await?;
    let send = SparkSendService::new(db.clone(), sparks);

    let (invoice, _) = fake_invoice(25_000, String::new());
    let quote = send.create_send_quote(&account, &invoice).await?;
    let quote = send.drive(quote).await?;
    match &quote.state {
        SparkSendQuoteState::Completed {
            payment_preimage, ..
        } => {
            assert_eq!(payment_preimage.len(), 64);
        }
        other => panic!("expected COMPLETED, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn stale_version_transition_is_rejected_then_retried() -> Result<()> {
    let wallet = setup(0).await?;
    let quote = wallet
        .cashu_receive
        .create_receive_quote(
            &wallet.account,
            Money::new(Amount::from(16), Currency::Btc),
            None,
        )
        .await?;
    wallet.mint.pay_mint_quote(&quote.quote_id).await;

    // A stale direct procedure call loses
    let stale = wallet
        .db
        .fail_cashu_receive_quote(quote.id, quote.version + 5, "stale".to_string())
        .await;
    assert!(matches!(stale, Err(Error::Concurrency { .. })));

    // The engine path re-reads and succeeds
    let quote = wallet.cashu_receive.process_payment(quote.id).await?;
    assert!(matches!(quote.state, CashuReceiveQuoteState::Paid(_)));
    assert_eq!(quote.version, 1);
    Ok(())
}

#[tokio::test]
async fn background_processor_drives_receive_to_completion() -> Result<()> {
    let wallet = setup(0).await?;

    let quote = wallet
        .cashu_receive
        .create_receive_quote(
            &wallet.account,
            Money::new(Amount::from(256), Currency::Btc),
            None,
        )
        .await?;
    wallet.mint.pay_mint_quote(&quote.quote_id).await;

    let sparks = spark_registry_for(Arc::new(FakeSpark::new()));
    let registry = registry_for(vec![(MINT_URL.parse()?, wallet.mint.clone())]);
    let keys = WalletKeys::from_seed([11u8; 64]);

    let processor = BackgroundProcessor::new(
        wallet.db.clone(),
        Engines {
            cashu_receive: CashuReceiveService::new(
                wallet.db.clone(),
                registry.clone(),
                keys.clone(),
            ),
            spark_receive: SparkReceiveService::new(
                wallet.db.clone(),
                sparks.clone(),
                registry.clone(),
            ),
            cashu_send: CashuSendService::new(wallet.db.clone(), registry.clone(), keys.clone()),
            spark_send: SparkSendService::new(wallet.db.clone(), sparks),
            token_swaps: TokenSwapService::new(wallet.db.clone(), registry.clone(), keys.clone()),
            send_swaps: SendSwapService::new(wallet.db.clone(), registry, keys),
        },
    );

    processor.drive_all(USER).await?;

    let quote = wallet
        .db
        .get_cashu_receive_quote(quote.id)
        .await?
        .expect("quote exists");
    assert_eq!(quote.state_tag(), "COMPLETED");
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(256)
    );

    // The processor cached the terminal record at its final version
    let cached = processor
        .caches()
        .cashu_receive
        .get(quote.id)
        .expect("cached");
    assert_eq!(cached.version, quote.version);

    // A second pass over the settled world is a no-op
    processor.drive_all(USER).await?;
    Ok(())
}

#[tokio::test]
async fn token_swap_restore_recovers_after_crash_mid_swap() -> Result<()> {
    let wallet = setup(0).await?;

    let token_proofs = wallet.mint.issue_proofs(&[Amount::from(64)]).await;
    let token = Token::new(MINT_URL.parse()?, CurrencyUnit::Sat, token_proofs, None);

    let swap = wallet
        .token_swaps
        .create_token_swap(&wallet.account, &token)
        .await?;
    assert_eq!(swap.state_tag(), "PENDING");

    // The crashed client swapped at the mint but never stored the
    // result
    {
        use agicash_common::mint::SwapRequest;

        let keys = WalletKeys::from_seed([11u8; 64]);
        let premints = PreMintSecrets::from_seed(
            keys.seed(),
            swap.keyset_id,
            swap.keyset_counter,
            &swap.output_amounts,
        )?;
        wallet
            .mint
            .connector()
            .swap(SwapRequest {
                inputs: swap.token_proofs.clone(),
                outputs: premints.blinded_messages(),
            })
            .await?;
    }

    let swap = wallet.token_swaps.complete_swap(swap.id).await?;
    assert!(matches!(swap.state, CashuTokenSwapState::Completed));
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(64)
    );
    Ok(())
}

#[tokio::test]
async fn draft_send_swap_failure_releases_inputs() -> Result<()> {
    let wallet = setup(0).await?;
    fund(&wallet, 105).await?;

    let (swap, _) = wallet
        .send_swaps
        .create_send_swap(&wallet.account, Amount::from(70))
        .await?;
    assert_eq!(swap.state_tag(), "DRAFT");

    let swap = wallet
        .send_swaps
        .fail(swap.id, "mint unreachable")
        .await?;
    assert_eq!(swap.state_tag(), "FAILED");
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(105)
    );
    Ok(())
}

#[tokio::test]
async fn pending_send_quote_failure_parks_inputs() -> Result<()> {
    let wallet = setup(0).await?;
    fund(&wallet, 105).await?;

    let (invoice, _) = fake_invoice(70_000, String::new());
    let quote = wallet
        .cashu_send
        .create_send_quote(&wallet.account, &invoice)
        .await?;
    let quote = wallet.cashu_send.mark_as_pending(quote.id).await?;
    assert_eq!(quote.state_tag(), "PENDING");

    let quote = wallet
        .cashu_send
        .fail_ambiguous(quote.id, "mint cannot report outcome")
        .await?;
    assert_eq!(quote.state_tag(), "FAILED");

    // Inputs are parked, not released: the balance stays short until
    // an operator resolves them
    let inputs = wallet.db.get_proofs_by_ys(&quote.input_proof_ys).await?;
    assert!(inputs.iter().all(|p| p.state == ProofState::PendingSpend));

    // Operator resolution: the payment turned out not to have
    // happened, release the inputs
    wallet.cashu_send.resolve_failed(quote.id, false).await?;
    assert_eq!(
        wallet.ledger.balance(wallet.account.id).await?,
        Amount::from(105)
    );
    Ok(())
}

#[tokio::test]
async fn interactive_spark_wait_obeys_its_budget() -> Result<()> {
    setup_tracing();
    let db = Arc::new(MemoryDatabase::default());
    let spark = Arc::new(FakeSpark::new());
    let identity = spark.identity_public_key();
    let sparks = spark_registry_for(spark);
    let account = db
        .add_account(Account::new_spark(
            USER,
            Currency::Btc,
            SparkNetwork::Regtest,
            identity,
        ))
        .await?;
    let receive = SparkReceiveService::new(db.clone(), sparks, registry_for(vec![]));

    let quote = receive
        .create_receive_quote(&account, Money::new(Amount::from(10), Currency::Btc), None)
        .await?;

    // Never paid: the wait returns the unpaid quote once the budget is
    // spent rather than hanging
    let started = std::time::Instant::now();
    let quote = receive
        .wait_for_payment(quote.id, Duration::from_millis(600))
        .await?;
    assert_eq!(quote.state_tag(), "UNPAID");
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}
