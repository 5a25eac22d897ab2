use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::init;

use subgress::config::ServiceConfig;
use subgress::keys::X25519KeyDerivation;
use subgress::payments::{CryptoPayProvider, PaymentProvider, PaymentReconciler, YooMoneyProvider};
use subgress::reaper::ExpiryReaper;
use subgress::referral::ReferralLedger;
use subgress::service::{self, AppState};
use subgress::store::EntitlementStore;
use subgress::subscription::SubscriptionManager;
use subgress::xray::XrayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init();

    let config = ServiceConfig::from_env();

    let store = EntitlementStore::connect(&config.database_url)
        .await
        .context("failed to open entitlement store")?;
    let xray = Arc::new(XrayConfig::new(
        &config.xray_config_path,
        config.xray_reload_cmd.clone(),
        Arc::new(X25519KeyDerivation),
    ));
    let subscriptions = Arc::new(SubscriptionManager::new(store.clone(), xray.clone()));
    let referrals = ReferralLedger::new(store.clone(), config.referral_rate_bp);

    let mut providers: Vec<Arc<dyn PaymentProvider>> = Vec::new();
    if let Some(token) = &config.cryptopay_token {
        providers.push(Arc::new(CryptoPayProvider::new(
            token.clone(),
            config.cryptopay_asset.clone(),
            config.cryptopay_fee_bp,
        )?));
    }
    if let (Some(token), Some(wallet)) = (&config.yoomoney_token, &config.yoomoney_wallet) {
        providers.push(Arc::new(YooMoneyProvider::new(
            token.clone(),
            wallet.clone(),
        )?));
    }
    if providers.is_empty() {
        warn!("no payment providers configured; only trial issuance will work");
    }

    let payments = Arc::new(PaymentReconciler::new(
        store.clone(),
        subscriptions.clone(),
        referrals.clone(),
        providers,
        config.plan_price,
        config.plan_days,
    ));

    // Resume any payment that was credited but never produced a token.
    match payments.recover_unissued().await {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "re-issued subscriptions for credited payments"),
        Err(e) => warn!("startup recovery pass failed: {e}"),
    }

    let cancel = CancellationToken::new();
    let reaper = ExpiryReaper::new(
        store.clone(),
        subscriptions.clone(),
        Duration::from_secs(config.reap_interval_secs),
    );
    tokio::spawn(reaper.run(cancel.child_token()));

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        xray,
        subscriptions,
        payments,
        referrals: Arc::new(referrals),
    };
    let app = service::router(state);

    info!(bind_addr = %config.bind_addr, "starting subgress service");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        })
        .await
        .context("service terminated")?;

    Ok(())
}
