// Payment reconciliation
//
// Providers sit behind one polling capability: create an invoice, ask for
// its status later. Confirmation is pull-based; nothing is committed while a
// poll reports unpaid, so polls are safe to abandon and retry. The credit is
// a storage-level compare-and-set, which makes mashing "check payment" (or
// N concurrent confirms) yield exactly one credit and one issued token.

pub mod cryptopay;
pub mod yoomoney;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::money::Amount;
use crate::referral::ReferralLedger;
use crate::store::{CreditOutcome, EntitlementStore, PaymentRequest, PaymentStatus};
use crate::subscription::SubscriptionManager;

pub use cryptopay::CryptoPayProvider;
pub use yoomoney::YooMoneyProvider;

/// A provider-side payment request.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub external_id: String,
    pub pay_url: String,
}

/// Authoritative provider-side status of an invoice. `amount` is the paid
/// amount where the provider reports one; otherwise the requested amount
/// stands.
#[derive(Debug, Clone, PartialEq)]
pub enum InvoiceStatus {
    Unpaid,
    Paid { amount: Option<Amount> },
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn tag(&self) -> &'static str;

    fn currency(&self) -> &str;

    async fn create_invoice(
        &self,
        user_id: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<Invoice>;

    async fn check_status(&self, external_id: &str) -> Result<InvoiceStatus>;

    /// Provider-specific fee model; the default passes the gross through.
    fn net_amount(&self, gross: Amount) -> Amount {
        gross
    }
}

/// Outcome of a confirmation poll. The first two are expected reconciliation
/// states, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationResult {
    /// The provider still reports unpaid; nothing changed. Retry later.
    StillPending,
    /// The payment was credited earlier; no side effects were applied.
    AlreadyCredited,
    /// This call won the credit race: balance credited, token issued.
    Credited { net: Amount, token: String },
}

pub struct PaymentReconciler {
    store: EntitlementStore,
    subscriptions: Arc<SubscriptionManager>,
    referrals: ReferralLedger,
    providers: Vec<Arc<dyn PaymentProvider>>,
    plan_price: Amount,
    plan_days: i64,
}

impl PaymentReconciler {
    pub fn new(
        store: EntitlementStore,
        subscriptions: Arc<SubscriptionManager>,
        referrals: ReferralLedger,
        providers: Vec<Arc<dyn PaymentProvider>>,
        plan_price: Amount,
        plan_days: i64,
    ) -> Self {
        Self {
            store,
            subscriptions,
            referrals,
            providers,
            plan_price,
            plan_days,
        }
    }

    pub fn provider_tags(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.tag()).collect()
    }

    fn provider(&self, tag: &str) -> Result<&Arc<dyn PaymentProvider>> {
        self.providers
            .iter()
            .find(|p| p.tag() == tag)
            .ok_or(Error::NotFound("payment provider"))
    }

    /// Open a provider invoice and record the pending payment request.
    pub async fn initiate_purchase(
        &self,
        user_id: &str,
        provider_tag: &str,
    ) -> Result<PaymentRequest> {
        let provider = self.provider(provider_tag)?;
        self.store.ensure_account(user_id, None).await?;
        let invoice = provider
            .create_invoice(user_id, self.plan_price, provider.currency())
            .await?;
        let request = PaymentRequest {
            id: invoice.external_id,
            user_id: user_id.to_string(),
            provider: provider.tag().to_string(),
            amount: self.plan_price,
            currency: provider.currency().to_string(),
            status: PaymentStatus::Pending,
            pay_url: invoice.pay_url,
            plan_days: self.plan_days,
            net_amount: None,
            token: None,
            created_at: Utc::now().timestamp(),
        };
        self.store.record_payment(&request).await?;
        info!(payment_id = %request.id, user_id = %user_id, provider = provider_tag, "purchase initiated");
        Ok(request)
    }

    /// Poll the provider and reconcile. The winner of the credit
    /// compare-and-set issues the token and pays the referral bonus; every
    /// other caller observes `AlreadyCredited` and applies nothing.
    pub async fn confirm(&self, payment_id: &str) -> Result<ConfirmationResult> {
        let payment = self
            .store
            .payment(payment_id)
            .await?
            .ok_or(Error::NotFound("payment"))?;
        if payment.status == PaymentStatus::Credited {
            return Ok(ConfirmationResult::AlreadyCredited);
        }

        let provider = self.provider(&payment.provider)?;
        let gross = match provider.check_status(payment_id).await? {
            InvoiceStatus::Unpaid => return Ok(ConfirmationResult::StillPending),
            InvoiceStatus::Paid { amount } => amount.unwrap_or(payment.amount),
        };
        let net = provider.net_amount(gross);

        self.store.confirm_payment(payment_id).await?;
        match self.store.credit_payment(payment_id, net).await? {
            CreditOutcome::AlreadyCredited => return Ok(ConfirmationResult::AlreadyCredited),
            CreditOutcome::Credited => {}
        }

        let sub = self
            .subscriptions
            .issue(&payment.user_id, Duration::days(payment.plan_days))
            .await?;
        self.store.mark_payment_issued(payment_id, &sub.token).await?;
        self.referrals.apply(&payment.user_id, net).await?;
        info!(
            payment_id = %payment_id,
            user_id = %payment.user_id,
            net,
            "payment credited and subscription issued"
        );
        Ok(ConfirmationResult::Credited {
            net,
            token: sub.token,
        })
    }

    /// Find credited payments that never produced a token (a crash between
    /// crediting and issuing) and re-run issuance for each. Failures are
    /// left for the next pass.
    pub async fn recover_unissued(&self) -> Result<usize> {
        let orphans = self.store.credited_without_token().await?;
        let mut recovered = 0;
        for payment in orphans {
            match self
                .subscriptions
                .issue(&payment.user_id, Duration::days(payment.plan_days))
                .await
            {
                Ok(sub) => {
                    self.store.mark_payment_issued(&payment.id, &sub.token).await?;
                    recovered += 1;
                }
                Err(e) => {
                    warn!(payment_id = %payment.id, "re-issuance failed, will retry: {e}");
                }
            }
        }
        Ok(recovered)
    }
}
