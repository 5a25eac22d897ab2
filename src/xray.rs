// Xray configuration document
//
// The proxy reads its client list from a single declarative JSON file. Every
// mutation here is load -> modify -> atomic replace -> reload signal,
// serialized under one lock so issuance and the expiry sweep never interleave
// their reads of the shared document. The replace goes through a temp file
// and rename; the proxy never observes a half-written document.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::keys::KeyDerivation;

const RELOAD_ATTEMPTS: u32 = 2;

/// Transport parameters of the Reality inbound, as clients need them.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub port: u16,
    pub network: String,
    pub server_name: String,
    pub short_id: String,
    pub public_key: String,
}

pub struct XrayConfig {
    path: PathBuf,
    reload_cmd: Option<String>,
    keys: Arc<dyn KeyDerivation>,
    lock: Mutex<()>,
}

impl XrayConfig {
    pub fn new(
        path: impl Into<PathBuf>,
        reload_cmd: Option<String>,
        keys: Arc<dyn KeyDerivation>,
    ) -> Self {
        Self {
            path: path.into(),
            reload_cmd,
            keys,
            lock: Mutex::new(()),
        }
    }

    /// Add a client credential to the Reality inbound. Re-adding an existing
    /// credential changes nothing and skips the write and the reload.
    pub async fn add_client(&self, client_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let inbound = reality_inbound_mut(&mut doc)?;
        let clients = clients_mut(inbound)?;
        if clients
            .iter()
            .any(|c| c.get("id").and_then(Value::as_str) == Some(client_id))
        {
            return Ok(());
        }
        let label = client_id.get(..8).unwrap_or(client_id);
        clients.push(json!({ "id": client_id, "email": format!("sub-{label}") }));
        self.persist(&doc).await?;
        info!(client_id = %client_id, "added proxy client");
        self.signal_reload().await
    }

    /// Remove a client credential. Removing an absent credential is a no-op
    /// that leaves the document untouched.
    pub async fn remove_client(&self, client_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let inbound = reality_inbound_mut(&mut doc)?;
        let clients = clients_mut(inbound)?;
        let before = clients.len();
        clients.retain(|c| c.get("id").and_then(Value::as_str) != Some(client_id));
        if clients.len() == before {
            return Ok(());
        }
        self.persist(&doc).await?;
        info!(client_id = %client_id, "removed proxy client");
        self.signal_reload().await
    }

    /// Read the Reality transport parameters, deriving the public key from
    /// the inbound's private key.
    pub async fn transport_parameters(&self) -> Result<TransportParams> {
        let _guard = self.lock.lock().await;
        let doc = self.load().await?;
        let inbound = reality_inbound(&doc)?;
        let port = inbound
            .get("port")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::ConfigInvalid("reality inbound has no port".to_string()))?
            as u16;
        let stream = inbound.get("streamSettings");
        let network = stream
            .and_then(|s| s.get("network"))
            .and_then(Value::as_str)
            .unwrap_or("tcp")
            .to_string();
        let reality = stream.and_then(|s| s.get("realitySettings"));
        let server_name = first_string(reality, "serverNames");
        let short_id = first_string(reality, "shortIds");
        let private_key = reality
            .and_then(|r| r.get("privateKey"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let public_key = if private_key.is_empty() {
            String::new()
        } else {
            self.keys.derive_public_key(private_key)?
        };
        Ok(TransportParams {
            port,
            network,
            server_name,
            short_id,
            public_key,
        })
    }

    async fn load(&self) -> Result<Value> {
        let raw = tokio::fs::read(&self.path).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("malformed config document: {e}")))
    }

    async fn persist(&self, doc: &Value) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_vec_pretty(doc).map_err(|e| Error::PersistFailed(e.to_string()))?;
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn signal_reload(&self) -> Result<()> {
        let Some(cmd) = &self.reload_cmd else {
            return Ok(());
        };
        let mut parts = cmd.split_whitespace();
        let Some(program) = parts.next() else {
            return Ok(());
        };
        let args: Vec<&str> = parts.collect();
        let mut last_err = String::new();
        for attempt in 1..=RELOAD_ATTEMPTS {
            match Command::new(program).args(&args).status().await {
                Ok(status) if status.success() => return Ok(()),
                Ok(status) => last_err = format!("reload command exited with {status}"),
                Err(e) => last_err = e.to_string(),
            }
            warn!(attempt, cmd = %cmd, "proxy reload attempt failed: {last_err}");
        }
        Err(Error::ReloadFailed(last_err))
    }
}

fn is_reality_inbound(inbound: &Value) -> bool {
    let stream = inbound.get("streamSettings");
    stream
        .and_then(|s| s.get("security"))
        .and_then(Value::as_str)
        == Some("reality")
        || stream.map(|s| s.get("realitySettings").is_some()).unwrap_or(false)
}

fn reality_inbound(doc: &Value) -> Result<&Value> {
    doc.get("inbounds")
        .and_then(Value::as_array)
        .and_then(|inbounds| inbounds.iter().find(|ib| is_reality_inbound(ib)))
        .ok_or_else(|| Error::ConfigInvalid("no reality inbound in config document".to_string()))
}

fn reality_inbound_mut(doc: &mut Value) -> Result<&mut Value> {
    let inbounds = doc
        .get_mut("inbounds")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::ConfigInvalid("no inbounds in config document".to_string()))?;
    inbounds
        .iter_mut()
        .find(|ib| is_reality_inbound(ib))
        .ok_or_else(|| Error::ConfigInvalid("no reality inbound in config document".to_string()))
}

fn clients_mut(inbound: &mut Value) -> Result<&mut Vec<Value>> {
    let settings = inbound
        .as_object_mut()
        .ok_or_else(|| Error::ConfigInvalid("reality inbound is not an object".to_string()))?
        .entry("settings")
        .or_insert_with(|| json!({}));
    settings
        .as_object_mut()
        .ok_or_else(|| Error::ConfigInvalid("inbound settings is not an object".to_string()))?
        .entry("clients")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| Error::ConfigInvalid("inbound clients is not an array".to_string()))
}

fn first_string(reality: Option<&Value>, key: &str) -> String {
    reality
        .and_then(|r| r.get(key))
        .and_then(Value::as_array)
        .and_then(|values| values.first())
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}
