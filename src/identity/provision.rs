//! API Key Provisioning
//!
//! Exchanges a wallet signature for a control-plane API key via
//! Sign-In With Ethereum: fetch a nonce, sign the challenge, trade the
//! signature for a short-lived JWT, then mint the key with it. The key
//! is persisted to `~/.automaton/config.json` (0600) where the runtime
//! finds it on the next boot.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use alloy::primitives::Address;
use alloy::signers::Signer;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::wallet::get_wallet;
use crate::config::get_automaton_dir;

const DEFAULT_API_URL: &str = "https://api.conway.tech";
const SIWE_DOMAIN: &str = "conway.tech";
const BASE_CHAIN_ID: u64 = 8453;

/// Outcome of a successful provisioning run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResult {
    pub api_key: String,
    pub wallet_address: String,
    pub key_prefix: String,
}

/// On-disk shape of `~/.automaton/config.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    api_key: String,
    wallet_address: String,
    provisioned_at: String,
}

/// Read the API key saved by an earlier `--provision` run, if any.
pub fn load_api_key_from_config() -> Option<String> {
    let raw = fs::read_to_string(get_automaton_dir().join("config.json")).ok()?;
    let stored: StoredKey = serde_json::from_str(&raw).ok()?;
    (!stored.api_key.is_empty()).then_some(stored.api_key)
}

fn persist_key(api_key: &str, wallet_address: &str) -> Result<()> {
    let dir = get_automaton_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let path = dir.join("config.json");
    let stored = StoredKey {
        api_key: api_key.to_string(),
        wallet_address: wallet_address.to_string(),
        provisioned_at: Utc::now().to_rfc3339(),
    };

    fs::write(&path, serde_json::to_string_pretty(&stored)?)
        .with_context(|| format!("cannot write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
        .context("cannot restrict config.json to 0600")?;
    Ok(())
}

/// Thin client for the three auth endpoints.
struct AuthClient {
    base: String,
    http: reqwest::Client,
}

impl AuthClient {
    fn new(base: String) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn verify_uri(&self) -> String {
        format!("{}/v1/auth/verify", self.base)
    }

    async fn post(&self, path: &str, body: Option<Value>, bearer: Option<&str>) -> Result<Value> {
        let mut builder = self.http.post(format!("{}{}", self.base, path));
        if let Some(b) = body {
            builder = builder.json(&b);
        }
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }

        let resp = builder
            .send()
            .await
            .with_context(|| format!("auth request failed: POST {path}"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("auth endpoint {path} answered {}: {text}", status.as_u16());
        }

        resp.json()
            .await
            .with_context(|| format!("auth endpoint {path} returned non-JSON"))
    }

    async fn nonce(&self) -> Result<String> {
        let body = self.post("/v1/auth/nonce", None, None).await?;
        body["nonce"]
            .as_str()
            .map(|s| s.to_string())
            .context("nonce response carried no nonce")
    }

    async fn verify(&self, message: &str, signature_hex: &str) -> Result<String> {
        let body = self
            .post(
                "/v1/auth/verify",
                Some(serde_json::json!({
                    "message": message,
                    "signature": signature_hex,
                })),
                None,
            )
            .await?;
        body["access_token"]
            .as_str()
            .map(|s| s.to_string())
            .context("verify response carried no access token")
    }

    async fn mint_key(&self, jwt: &str) -> Result<(String, String)> {
        let body = self
            .post(
                "/v1/auth/api-keys",
                Some(serde_json::json!({ "name": "automatond" })),
                Some(jwt),
            )
            .await?;
        let key = body["key"]
            .as_str()
            .context("api-key response carried no key")?;
        let prefix = body["key_prefix"].as_str().unwrap_or_default();
        Ok((key.to_string(), prefix.to_string()))
    }
}

/// Render the EIP-4361 challenge the wallet signs. The field order and
/// labels are fixed by the standard.
fn siwe_challenge(address: &Address, uri: &str, nonce: &str, issued_at: &str) -> String {
    [
        format!("{SIWE_DOMAIN} wants you to sign in with your Ethereum account:"),
        address.to_checksum(None),
        String::new(),
        "Provision a control-plane API key for this automaton.".to_string(),
        String::new(),
        format!("URI: {uri}"),
        "Version: 1".to_string(),
        format!("Chain ID: {BASE_CHAIN_ID}"),
        format!("Nonce: {nonce}"),
        format!("Issued At: {issued_at}"),
    ]
    .join("\n")
}

/// Run the provisioning exchange end to end and persist the key.
pub async fn provision(api_url: Option<&str>) -> Result<ProvisionResult> {
    let base = api_url
        .map(|s| s.to_string())
        .or_else(|| std::env::var("AUTOMATON_API_URL").ok())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let client = AuthClient::new(base);

    let (signer, _is_new) = get_wallet().context("no wallet available to sign with")?;

    let nonce = client.nonce().await?;
    let message = siwe_challenge(
        &signer.address(),
        &client.verify_uri(),
        &nonce,
        &Utc::now().to_rfc3339(),
    );

    let signature = signer
        .sign_message(message.as_bytes())
        .await
        .context("wallet refused to sign the SIWE challenge")?;
    let signature_hex = format!("0x{}", hex::encode(signature.as_bytes()));

    let jwt = client.verify(&message, &signature_hex).await?;
    let (api_key, key_prefix) = client.mint_key(&jwt).await?;

    let wallet_address = signer.address().to_checksum(None);
    persist_key(&api_key, &wallet_address)?;

    Ok(ProvisionResult {
        api_key,
        wallet_address,
        key_prefix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_follows_the_eip4361_layout() {
        let address: Address = "0x0000000000000000000000000000000000000001"
            .parse()
            .unwrap();
        let message = siwe_challenge(
            &address,
            "https://api.conway.tech/v1/auth/verify",
            "nonce-1",
            "2026-01-01T00:00:00+00:00",
        );

        let lines: Vec<&str> = message.lines().collect();
        assert!(lines[0].ends_with("sign in with your Ethereum account:"));
        assert_eq!(lines[1], address.to_checksum(None));
        assert!(message.contains("Chain ID: 8453"));
        assert!(message.contains("Nonce: nonce-1"));
        assert!(message.contains("Issued At: 2026-01-01T00:00:00+00:00"));
    }
}
