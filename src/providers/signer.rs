//! Wallet Signer Provider
//!
//! EIP-712 typed-data signing backed by the automaton's local private
//! key. The key stays inside this module; callers only ever see
//! signatures and the address.

use alloy::dyn_abi::TypedData;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::types::WalletSigner;

pub struct LocalWalletSigner {
    signer: PrivateKeySigner,
}

impl LocalWalletSigner {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl WalletSigner for LocalWalletSigner {
    async fn sign_typed_data(
        &self,
        domain: serde_json::Value,
        types: serde_json::Value,
        message: serde_json::Value,
    ) -> Result<String> {
        // The primary type is the declared type that is not the domain.
        let primary_type = types
            .as_object()
            .and_then(|o| o.keys().find(|k| k.as_str() != "EIP712Domain"))
            .cloned()
            .context("typed data declares no primary type")?;

        let payload = serde_json::json!({
            "types": types,
            "domain": domain,
            "primaryType": primary_type,
            "message": message,
        });

        let typed: TypedData =
            serde_json::from_value(payload).context("invalid EIP-712 payload")?;

        let signature = self
            .signer
            .sign_dynamic_typed_data(&typed)
            .await
            .context("typed-data signing failed")?;

        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    fn address(&self) -> String {
        self.signer.address().to_checksum(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signs_typed_data_and_reports_address() {
        let signer = LocalWalletSigner::new(PrivateKeySigner::random());
        let address = signer.address();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);

        let sig = signer
            .sign_typed_data(
                serde_json::json!({ "name": "automaton", "version": "1", "chainId": 8453 }),
                serde_json::json!({
                    "EIP712Domain": [
                        { "name": "name", "type": "string" },
                        { "name": "version", "type": "string" },
                        { "name": "chainId", "type": "uint256" }
                    ],
                    "Transfer": [
                        { "name": "to", "type": "address" },
                        { "name": "amount", "type": "uint256" }
                    ]
                }),
                serde_json::json!({
                    "to": "0x0000000000000000000000000000000000000001",
                    "amount": "1000"
                }),
            )
            .await
            .unwrap();

        assert!(sig.starts_with("0x"));
        // 65-byte signature, hex encoded.
        assert_eq!(sig.len(), 2 + 130);
    }
}
