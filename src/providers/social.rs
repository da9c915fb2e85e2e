//! Social Relay Client
//!
//! Authenticated messaging client that signs outbound messages with the
//! automaton's private key and communicates through a relay server.
//! Content is hashed with keccak256 for integrity verification.

use alloy::primitives::keccak256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{InboxMessage, PollResponse, SendReceipt, SocialProvider};

/// Wire shape of a relayed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayMessage {
    id: String,
    from: String,
    to: String,
    content: String,
    content_hash: String,
    signature: String,
    signed_at: String,
    #[serde(default)]
    received_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayPollResponse {
    messages: Vec<RelayMessage>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Authenticated social client for agent-to-agent messaging.
pub struct RelaySocialProvider {
    relay_url: String,
    signer: PrivateKeySigner,
    http: reqwest::Client,
}

impl RelaySocialProvider {
    pub fn new(relay_url: String, signer: PrivateKeySigner) -> Self {
        Self {
            relay_url,
            signer,
            http: reqwest::Client::new(),
        }
    }

    /// The checksummed address derived from the signer's key.
    fn address(&self) -> String {
        self.signer.address().to_checksum(None)
    }
}

#[async_trait]
impl SocialProvider for RelaySocialProvider {
    async fn poll(&self, cursor: Option<&str>) -> Result<PollResponse> {
        let mut url = format!("{}/messages?to={}", self.relay_url, self.address());
        if let Some(c) = cursor {
            url.push_str(&format!("&cursor={}", urlencoding::encode(c)));
        }

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to poll relay")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("relay poll error {}: {text}", status.as_u16());
        }

        let body: RelayPollResponse = resp
            .json()
            .await
            .context("Failed to parse relay poll response")?;

        let messages = body
            .messages
            .into_iter()
            .map(|m| InboxMessage {
                id: m.id,
                from: m.from,
                to: m.to,
                content: m.content,
                signed_at: m.signed_at,
                received_at: if m.received_at.is_empty() {
                    Utc::now().to_rfc3339()
                } else {
                    m.received_at
                },
                processed: false,
            })
            .collect();

        Ok(PollResponse {
            messages,
            next_cursor: body.next_cursor,
        })
    }

    async fn send(&self, to: &str, content: &str) -> Result<SendReceipt> {
        let message_id = Uuid::new_v4().to_string();
        let signed_at = Utc::now().to_rfc3339();

        let content_hash = hex::encode(keccak256(content.as_bytes()));
        let signature = self
            .signer
            .sign_message(content_hash.as_bytes())
            .await
            .context("Failed to sign message content")?;

        let message = RelayMessage {
            id: message_id.clone(),
            from: self.address(),
            to: to.to_string(),
            content: content.to_string(),
            content_hash,
            signature: hex::encode(signature.as_bytes()),
            signed_at,
            received_at: String::new(),
        };

        let url = format!("{}/messages", self.relay_url);
        let resp = self
            .http
            .post(&url)
            .json(&message)
            .send()
            .await
            .context("Failed to send message to relay")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("relay send error {}: {text}", status.as_u16());
        }

        Ok(SendReceipt { id: message_id })
    }
}
