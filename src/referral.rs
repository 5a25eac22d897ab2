// Referral ledger
//
// A referral edge is bound once, at first contact. Whenever a referred
// account's payment is credited, the referrer earns a percentage of the net
// amount; each bonus is also recorded as an append-only earning row. Callers
// must invoke `apply` only from the single credit-winner path, which is what
// keeps the bonus at one per credited payment.

use chrono::Utc;
use tracing::info;

use crate::error::Result;
use crate::money::{self, Amount};
use crate::store::{EntitlementStore, ReferralStats};

#[derive(Clone)]
pub struct ReferralLedger {
    store: EntitlementStore,
    rate_bp: u32,
}

impl ReferralLedger {
    pub fn new(store: EntitlementStore, rate_bp: u32) -> Self {
        Self { store, rate_bp }
    }

    /// Credit the referrer's bonus for a newly credited payment. No-op when
    /// the account has no referrer or the bonus rounds to zero.
    pub async fn apply(&self, user_id: &str, net: Amount) -> Result<()> {
        let Some(referrer) = self.store.referrer(user_id).await? else {
            return Ok(());
        };
        let bonus = money::share_bp(net, self.rate_bp);
        if bonus <= 0 {
            return Ok(());
        }
        self.store.credit_balance(&referrer, bonus).await?;
        self.store
            .append_referral_earning(&referrer, user_id, bonus, Utc::now().timestamp())
            .await?;
        info!(referrer = %referrer, referred = %user_id, bonus, "referral bonus credited");
        Ok(())
    }

    pub async fn stats(&self, user_id: &str) -> Result<ReferralStats> {
        self.store.referral_stats(user_id).await
    }
}
