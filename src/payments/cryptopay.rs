// Crypto Pay provider
//
// Invoice-based flow against the Crypto Pay HTTP API: createInvoice returns
// an invoice id plus a pay URL, getInvoices is polled for status. The
// platform keeps a percentage fee, so the credited net sits below the
// invoice amount.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{Invoice, InvoiceStatus, PaymentProvider};
use crate::error::{Error, Result};
use crate::money::{self, Amount};

const API_BASE: &str = "https://pay.crypt.bot/api";
const TOKEN_HEADER: &str = "Crypto-Pay-API-Token";
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CryptoPayProvider {
    client: Client,
    base_url: String,
    token: String,
    asset: String,
    fee_bp: u32,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiInvoice {
    invoice_id: i64,
    status: String,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    bot_invoice_url: Option<String>,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    paid_amount: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceList {
    items: Vec<ApiInvoice>,
}

impl CryptoPayProvider {
    pub fn new(token: String, asset: String, fee_bp: u32) -> Result<Self> {
        let client = Client::builder().timeout(POLL_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: API_BASE.to_string(),
            token,
            asset,
            fee_bp,
        })
    }

    /// Point the provider at a non-default gateway (testnet, self-hosted).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn unwrap_result<T>(body: ApiResponse<T>, call: &str) -> Result<T> {
        if !body.ok {
            return Err(Error::ProviderUnavailable(format!(
                "{call} rejected: {}",
                body.error.unwrap_or_default()
            )));
        }
        body.result
            .ok_or_else(|| Error::ProviderUnavailable(format!("{call} returned no result")))
    }
}

#[async_trait]
impl PaymentProvider for CryptoPayProvider {
    fn tag(&self) -> &'static str {
        "cryptopay"
    }

    fn currency(&self) -> &str {
        &self.asset
    }

    fn net_amount(&self, gross: Amount) -> Amount {
        money::net_after_fee_bp(gross, self.fee_bp)
    }

    async fn create_invoice(
        &self,
        user_id: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<Invoice> {
        let response = self
            .client
            .post(format!("{}/createInvoice", self.base_url))
            .header(TOKEN_HEADER, &self.token)
            .json(&serde_json::json!({
                "asset": currency,
                "amount": money::format_major(amount),
                "description": format!("Subscription top-up for {user_id}"),
            }))
            .send()
            .await?
            .error_for_status()?;
        let body: ApiResponse<ApiInvoice> = response.json().await?;
        let invoice = Self::unwrap_result(body, "createInvoice")?;
        let pay_url = invoice
            .bot_invoice_url
            .or(invoice.pay_url)
            .unwrap_or_default();
        Ok(Invoice {
            external_id: invoice.invoice_id.to_string(),
            pay_url,
        })
    }

    async fn check_status(&self, external_id: &str) -> Result<InvoiceStatus> {
        let response = self
            .client
            .get(format!("{}/getInvoices", self.base_url))
            .header(TOKEN_HEADER, &self.token)
            .query(&[("invoice_ids", external_id)])
            .send()
            .await?
            .error_for_status()?;
        let body: ApiResponse<InvoiceList> = response.json().await?;
        let list = Self::unwrap_result(body, "getInvoices")?;
        let Some(invoice) = list.items.into_iter().next() else {
            return Err(Error::NotFound("payment"));
        };
        if invoice.status == "paid" {
            let amount = invoice
                .paid_amount
                .or(invoice.amount)
                .and_then(|a| money::parse_major(&a));
            Ok(InvoiceStatus::Paid { amount })
        } else {
            Ok(InvoiceStatus::Unpaid)
        }
    }
}
