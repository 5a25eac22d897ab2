// End-to-end lifecycle tests: issuance and revocation against a real config
// document, the expiry sweep, payment reconciliation under concurrency, and
// referral bonuses.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tempfile::TempDir;

use subgress::error::Result;
use subgress::keys::X25519KeyDerivation;
use subgress::money;
use subgress::payments::{
    ConfirmationResult, Invoice, InvoiceStatus, PaymentProvider, PaymentReconciler,
};
use subgress::reaper::ExpiryReaper;
use subgress::referral::ReferralLedger;
use subgress::store::{EntitlementStore, PaymentStatus};
use subgress::subscription::SubscriptionManager;
use subgress::xray::XrayConfig;

const XRAY_FIXTURE: &str = r#"{
    "inbounds": [
        {
            "port": 443,
            "protocol": "vless",
            "settings": { "clients": [] },
            "streamSettings": {
                "network": "tcp",
                "security": "reality",
                "realitySettings": {
                    "serverNames": ["www.example.com"],
                    "shortIds": ["ab12cd34"],
                    "privateKey": "dwdtCnMYpX08FsFyUbJmRd9ML4frwJkqsXf7pR25LCo"
                }
            }
        }
    ]
}"#;

struct Harness {
    _dir: TempDir,
    config_path: std::path::PathBuf,
    store: EntitlementStore,
    subscriptions: Arc<SubscriptionManager>,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, XRAY_FIXTURE).unwrap();

    let store = EntitlementStore::connect("sqlite::memory:").await.unwrap();
    let xray = Arc::new(XrayConfig::new(
        &config_path,
        None,
        Arc::new(X25519KeyDerivation),
    ));
    let subscriptions = Arc::new(SubscriptionManager::new(store.clone(), xray));
    Harness {
        _dir: dir,
        config_path,
        store,
        subscriptions,
    }
}

impl Harness {
    fn client_ids(&self) -> Vec<String> {
        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&self.config_path).unwrap()).unwrap();
        doc["inbounds"][0]["settings"]["clients"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["id"].as_str().unwrap().to_string())
            .collect()
    }

    fn reconciler(&self, provider: Arc<MockProvider>, referral_rate_bp: u32) -> PaymentReconciler {
        let providers: Vec<Arc<dyn PaymentProvider>> = vec![provider];
        PaymentReconciler::new(
            self.store.clone(),
            self.subscriptions.clone(),
            ReferralLedger::new(self.store.clone(), referral_rate_bp),
            providers,
            10000,
            30,
        )
    }
}

/// Scripted provider: invoices are numbered locally, `paid` flips the
/// reported status, and the fee mirrors the percentage model.
struct MockProvider {
    paid: AtomicBool,
    counter: AtomicU64,
    fee_bp: u32,
}

impl MockProvider {
    fn new(paid: bool, fee_bp: u32) -> Arc<Self> {
        Arc::new(Self {
            paid: AtomicBool::new(paid),
            counter: AtomicU64::new(0),
            fee_bp,
        })
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn tag(&self) -> &'static str {
        "mock"
    }

    fn currency(&self) -> &str {
        "USDT"
    }

    fn net_amount(&self, gross: i64) -> i64 {
        money::net_after_fee_bp(gross, self.fee_bp)
    }

    async fn create_invoice(&self, _user_id: &str, _amount: i64, _currency: &str) -> Result<Invoice> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Invoice {
            external_id: format!("mock-{n}"),
            pay_url: format!("https://pay.example/mock-{n}"),
        })
    }

    async fn check_status(&self, _external_id: &str) -> Result<InvoiceStatus> {
        if self.paid.load(Ordering::SeqCst) {
            Ok(InvoiceStatus::Paid { amount: None })
        } else {
            Ok(InvoiceStatus::Unpaid)
        }
    }
}

#[tokio::test]
async fn test_issue_lookup_revoke_roundtrip() {
    let h = harness().await;
    h.store.ensure_account("alice", None).await.unwrap();

    let sub = h
        .subscriptions
        .issue("alice", Duration::days(30))
        .await
        .unwrap();
    assert_eq!(sub.token.len(), 32);

    let found = h.subscriptions.lookup(&sub.token).await.unwrap().unwrap();
    assert_eq!(found.user_id, "alice");
    assert_eq!(found.client_id, sub.client_id);
    assert!(h.client_ids().contains(&sub.client_id));

    h.subscriptions.revoke(&sub.token).await.unwrap();
    assert!(h.subscriptions.lookup(&sub.token).await.unwrap().is_none());
    assert!(!h.client_ids().contains(&sub.client_id));

    // revoking again is a no-op
    h.subscriptions.revoke(&sub.token).await.unwrap();
}

#[tokio::test]
async fn test_reaper_sweeps_expired_tokens() {
    let h = harness().await;
    h.store.ensure_account("alice", None).await.unwrap();

    let short = h
        .subscriptions
        .issue("alice", Duration::seconds(1))
        .await
        .unwrap();
    let long = h
        .subscriptions
        .issue("alice", Duration::days(30))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let reaper = ExpiryReaper::new(
        h.store.clone(),
        h.subscriptions.clone(),
        std::time::Duration::from_secs(60),
    );
    let revoked = reaper.tick().await.unwrap();
    assert_eq!(revoked, 1);

    assert!(h.subscriptions.lookup(&short.token).await.unwrap().is_none());
    assert!(!h.client_ids().contains(&short.client_id));

    // the live token survives the sweep
    assert!(h.subscriptions.lookup(&long.token).await.unwrap().is_some());
    assert!(h.client_ids().contains(&long.client_id));

    // a second tick finds nothing
    assert_eq!(reaper.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_confirm_while_unpaid_changes_nothing() {
    let h = harness().await;
    let reconciler = Arc::new(h.reconciler(MockProvider::new(false, 0), 0));

    let payment = reconciler.initiate_purchase("alice", "mock").await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    for _ in 0..3 {
        let outcome = reconciler.confirm(&payment.id).await.unwrap();
        assert_eq!(outcome, ConfirmationResult::StillPending);
    }

    let stored = h.store.payment(&payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
    assert_eq!(h.store.balance("alice").await.unwrap(), 0);
    assert!(h.client_ids().is_empty());
}

#[tokio::test]
async fn test_concurrent_confirms_credit_once() {
    let h = harness().await;
    let reconciler = Arc::new(h.reconciler(MockProvider::new(true, 0), 0));

    let payment = reconciler.initiate_purchase("alice", "mock").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let reconciler = reconciler.clone();
        let id = payment.id.clone();
        handles.push(tokio::spawn(async move { reconciler.confirm(&id).await }));
    }

    let mut credited = 0;
    let mut already = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ConfirmationResult::Credited { net, .. } => {
                assert_eq!(net, 10000);
                credited += 1;
            }
            ConfirmationResult::AlreadyCredited => already += 1,
            ConfirmationResult::StillPending => panic!("provider reported paid"),
        }
    }
    assert_eq!(credited, 1);
    assert_eq!(already, 5);

    // exactly one client credential exists, and the balance moved once
    assert_eq!(h.client_ids().len(), 1);
    assert_eq!(h.store.balance("alice").await.unwrap(), 10000);

    let stored = h.store.payment(&payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Credited);
    let token = stored.token.expect("winner recorded its token");
    assert!(h.subscriptions.lookup(&token).await.unwrap().is_some());

    // a later poll of the credited payment stays side-effect free
    let outcome = reconciler.confirm(&payment.id).await.unwrap();
    assert_eq!(outcome, ConfirmationResult::AlreadyCredited);
    assert_eq!(h.client_ids().len(), 1);
}

#[tokio::test]
async fn test_referral_bonus_from_net_amount() {
    let h = harness().await;
    // 5% provider fee, 20% referral rate
    let reconciler = Arc::new(h.reconciler(MockProvider::new(true, 500), 2000));

    h.store.ensure_account("alice", None).await.unwrap();
    h.store.ensure_account("bob", Some("alice")).await.unwrap();

    let payment = reconciler.initiate_purchase("bob", "mock").await.unwrap();
    let outcome = reconciler.confirm(&payment.id).await.unwrap();
    match outcome {
        ConfirmationResult::Credited { net, .. } => assert_eq!(net, 9500),
        other => panic!("expected credit, got {other:?}"),
    }

    // bob keeps the net, alice earns 20% of it
    assert_eq!(h.store.balance("bob").await.unwrap(), 9500);
    assert_eq!(h.store.balance("alice").await.unwrap(), 1900);

    let stats = h.store.referral_stats("alice").await.unwrap();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.total, 1900);
}

#[tokio::test]
async fn test_recovery_reissues_credited_payment() {
    let h = harness().await;
    let reconciler = h.reconciler(MockProvider::new(true, 0), 0);

    // simulate a crash after crediting but before issuing
    let payment = reconciler.initiate_purchase("alice", "mock").await.unwrap();
    h.store.confirm_payment(&payment.id).await.unwrap();
    h.store.credit_payment(&payment.id, 10000).await.unwrap();
    assert!(h.client_ids().is_empty());

    assert_eq!(reconciler.recover_unissued().await.unwrap(), 1);
    let stored = h.store.payment(&payment.id).await.unwrap().unwrap();
    let token = stored.token.expect("recovery recorded the token");
    assert!(h.subscriptions.lookup(&token).await.unwrap().is_some());
    assert_eq!(h.client_ids().len(), 1);

    // the pass converges: nothing left to recover
    assert_eq!(reconciler.recover_unissued().await.unwrap(), 0);
}

#[tokio::test]
async fn test_balance_purchase_debits_and_issues() {
    let h = harness().await;
    h.store.ensure_account("alice", None).await.unwrap();
    h.store.credit_balance("alice", 12000).await.unwrap();

    let sub = h
        .subscriptions
        .purchase_with_balance("alice", 10000, Duration::days(30))
        .await
        .unwrap();
    assert_eq!(h.store.balance("alice").await.unwrap(), 2000);
    assert!(h.client_ids().contains(&sub.client_id));

    // a second purchase cannot overdraw
    let err = h
        .subscriptions
        .purchase_with_balance("alice", 10000, Duration::days(30))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        subgress::Error::InsufficientFunds { balance: 2000, .. }
    ));
    assert_eq!(h.store.balance("alice").await.unwrap(), 2000);
}
