// Subscription issuance and revocation
//
// A subscription token is the user-facing credential; the proxy-side client
// UUID is a separate identity whose lifetime mirrors the token 1:1. Issuance
// allocates both, mutates the proxy config, and persists the pair; a persist
// failure rolls the client entry back so no orphaned credential survives.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::money::Amount;
use crate::store::{EntitlementStore, Subscription};
use crate::xray::{TransportParams, XrayConfig};

const TOKEN_LEN: usize = 32;
const TOKEN_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Generate an opaque URL-safe subscription token.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..TOKEN_CHARSET.len());
            TOKEN_CHARSET[idx] as char
        })
        .collect()
}

pub struct SubscriptionManager {
    store: EntitlementStore,
    xray: Arc<XrayConfig>,
}

impl SubscriptionManager {
    pub fn new(store: EntitlementStore, xray: Arc<XrayConfig>) -> Self {
        Self { store, xray }
    }

    /// Issue a fresh token valid for `duration`.
    ///
    /// The client credential is added to the proxy config before the token
    /// row is persisted; if persistence fails, the credential is removed
    /// again before the error surfaces. A reload failure after a durable
    /// config write does not abort issuance; the next successful mutation
    /// re-signals the proxy.
    pub async fn issue(&self, user_id: &str, duration: Duration) -> Result<Subscription> {
        let token = generate_token();
        let client_id = Uuid::new_v4().to_string();
        let expires_at = (Utc::now() + duration).timestamp();

        match self.xray.add_client(&client_id).await {
            Ok(()) => {}
            Err(Error::ReloadFailed(e)) => {
                warn!(client_id = %client_id, "client persisted but proxy reload failed: {e}");
            }
            Err(e) => return Err(e),
        }

        let sub = Subscription {
            token,
            user_id: user_id.to_string(),
            client_id,
            expires_at,
        };
        if let Err(e) = self.store.insert_subscription(&sub).await {
            if let Err(rollback) = self.xray.remove_client(&sub.client_id).await {
                error!(client_id = %sub.client_id, "rollback of orphaned client failed: {rollback}");
            }
            return Err(e);
        }
        info!(user_id = %user_id, client_id = %sub.client_id, expires_at = sub.expires_at, "issued subscription");
        Ok(sub)
    }

    /// Revoke a token: drop its proxy client, then delete the row. Revoking
    /// an unknown or already-revoked token is a no-op. A config persist
    /// failure keeps the row so the next sweep retries.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let Some(sub) = self.store.subscription(token).await? else {
            return Ok(());
        };
        match self.xray.remove_client(&sub.client_id).await {
            Ok(()) => {}
            Err(Error::ReloadFailed(e)) => {
                warn!(client_id = %sub.client_id, "client removed but proxy reload failed: {e}");
            }
            Err(e) => return Err(e),
        }
        self.store.delete_subscription(token).await?;
        info!(user_id = %sub.user_id, client_id = %sub.client_id, "revoked subscription");
        Ok(())
    }

    /// Look up a token. Expired-but-unswept rows are still returned; the
    /// caller compares `expires_at` against its own clock.
    pub async fn lookup(&self, token: &str) -> Result<Option<Subscription>> {
        self.store.subscription(token).await
    }

    /// Balance-funded purchase: strict debit, then issue. An issuance
    /// failure refunds the debit.
    pub async fn purchase_with_balance(
        &self,
        user_id: &str,
        price: Amount,
        duration: Duration,
    ) -> Result<Subscription> {
        self.store.debit_balance(user_id, price).await?;
        match self.issue(user_id, duration).await {
            Ok(sub) => Ok(sub),
            Err(e) => {
                if let Err(refund) = self.store.credit_balance(user_id, price).await {
                    error!(user_id = %user_id, "refund after failed issuance also failed: {refund}");
                }
                Err(e)
            }
        }
    }
}

/// Render one VLESS Reality URI for the given client identity.
pub fn build_vless_uri(
    host: &str,
    client_id: &str,
    params: &TransportParams,
    flow: bool,
    name: &str,
) -> String {
    let mut uri = format!(
        "vless://{}@{}:{}?type={}&security=reality&fp=chrome&alpn=h2,http/1.1",
        client_id, host, params.port, params.network
    );
    if !params.public_key.is_empty() {
        uri.push_str(&format!("&pbk={}", params.public_key));
    }
    if !params.server_name.is_empty() {
        uri.push_str(&format!("&sni={}", params.server_name));
    }
    if !params.short_id.is_empty() {
        uri.push_str(&format!("&sid={}", params.short_id));
    }
    if flow {
        uri.push_str("&flow=xtls-rprx-vision");
    }
    format!("{uri}#{name}")
}

/// Two-line connection descriptor: NoFlow variant first, Vision second.
pub fn connection_text(
    host: &str,
    user_id: &str,
    client_id: &str,
    params: &TransportParams,
) -> String {
    let no_flow = build_vless_uri(host, client_id, params, false, &format!("user{user_id}-NoFlow"));
    let vision = build_vless_uri(host, client_id, params, true, &format!("user{user_id}-Vision"));
    format!("{no_flow}\n{vision}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TransportParams {
        TransportParams {
            port: 443,
            network: "tcp".to_string(),
            server_name: "www.example.com".to_string(),
            short_id: "ab12cd34".to_string(),
            public_key: "pbk123".to_string(),
        }
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_build_vless_uri() {
        let uri = build_vless_uri("1.2.3.4", "uuid-1", &params(), false, "user7-NoFlow");
        assert_eq!(
            uri,
            "vless://uuid-1@1.2.3.4:443?type=tcp&security=reality&fp=chrome&alpn=h2,http/1.1&pbk=pbk123&sni=www.example.com&sid=ab12cd34#user7-NoFlow"
        );
    }

    #[test]
    fn test_vision_variant_carries_flow() {
        let uri = build_vless_uri("1.2.3.4", "uuid-1", &params(), true, "v");
        assert!(uri.contains("&flow=xtls-rprx-vision"));
    }

    #[test]
    fn test_empty_params_are_omitted() {
        let bare = TransportParams {
            port: 443,
            network: "tcp".to_string(),
            server_name: String::new(),
            short_id: String::new(),
            public_key: String::new(),
        };
        let uri = build_vless_uri("1.2.3.4", "uuid-1", &bare, false, "n");
        assert!(!uri.contains("pbk="));
        assert!(!uri.contains("sni="));
        assert!(!uri.contains("sid="));
    }

    #[test]
    fn test_connection_text_ordering() {
        let text = connection_text("1.2.3.4", "7", "uuid-1", &params());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("#user7-NoFlow"));
        assert!(!lines[0].contains("flow=xtls-rprx-vision"));
        assert!(lines[1].ends_with("#user7-Vision"));
        assert!(lines[1].contains("flow=xtls-rprx-vision"));
    }
}
