// Service configuration
//
// Every knob comes from the environment with a workable default, assembled
// once at startup and passed by reference. Trial duration is an ordinary
// field handed to issuance as a parameter, never a shared override.

use std::env;

use crate::money::{self, Amount};

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub xray_config_path: String,
    /// Command run after every config mutation, e.g. "systemctl reload xray".
    /// Unset means mutations are persisted without signalling.
    pub xray_reload_cmd: Option<String>,
    pub public_host: String,
    pub public_base: String,
    pub plan_price: Amount,
    pub plan_days: i64,
    pub trial_days: i64,
    pub referral_rate_bp: u32,
    pub cryptopay_token: Option<String>,
    pub cryptopay_asset: String,
    pub cryptopay_fee_bp: u32,
    pub yoomoney_token: Option<String>,
    pub yoomoney_wallet: Option<String>,
    pub reap_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            database_url: "sqlite://subgress.db?mode=rwc".to_string(),
            xray_config_path: "/usr/local/etc/xray/config.json".to_string(),
            xray_reload_cmd: Some("systemctl reload xray".to_string()),
            public_host: "127.0.0.1".to_string(),
            public_base: "https://127.0.0.1".to_string(),
            plan_price: 10000,
            plan_days: 30,
            trial_days: 1,
            referral_rate_bp: 2000,
            cryptopay_token: None,
            cryptopay_asset: "USDT".to_string(),
            cryptopay_fee_bp: 500,
            yoomoney_token: None,
            yoomoney_wallet: None,
            reap_interval_secs: 60,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let public_host =
            env::var("PUBLIC_HOST").unwrap_or_else(|_| defaults.public_host.clone());
        let public_base =
            env::var("PUBLIC_BASE").unwrap_or_else(|_| format!("https://{}", public_host));
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            xray_config_path: env::var("XRAY_CONFIG").unwrap_or(defaults.xray_config_path),
            xray_reload_cmd: env::var("XRAY_RELOAD_CMD")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .or(defaults.xray_reload_cmd),
            public_host,
            public_base,
            plan_price: env::var("PRICE_VPN")
                .ok()
                .and_then(|s| money::parse_major(&s))
                .unwrap_or(defaults.plan_price),
            plan_days: env::var("DAYS_VPN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.plan_days),
            trial_days: env::var("TRIAL_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.trial_days),
            referral_rate_bp: env::var("REFERRAL_RATE_BP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.referral_rate_bp),
            cryptopay_token: env::var("CRYPTOBOT_TOKEN").ok().filter(|s| !s.is_empty()),
            cryptopay_asset: env::var("CRYPTOBOT_ASSET").unwrap_or(defaults.cryptopay_asset),
            cryptopay_fee_bp: env::var("CRYPTOBOT_FEE_BP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cryptopay_fee_bp),
            yoomoney_token: env::var("YOOMONEY_TOKEN").ok().filter(|s| !s.is_empty()),
            yoomoney_wallet: env::var("YOOMONEY_WALLET").ok().filter(|s| !s.is_empty()),
            reap_interval_secs: env::var("REAP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.reap_interval_secs),
        }
    }
}
