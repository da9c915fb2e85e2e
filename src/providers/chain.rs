//! Chain RPC Provider
//!
//! Read-only chain access over JSON-RPC. The only on-chain dependency the
//! core has is reading the stablecoin balance that backs the liquid figure.

use anyhow::{Context, Result};
use async_trait::async_trait;

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::types::{ChainProvider, HundredthCents};

sol! {
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
    }
}

/// JSON-RPC backed chain reader.
pub struct RpcChainProvider {
    rpc_url: String,
}

impl RpcChainProvider {
    pub fn new(rpc_url: String) -> Self {
        Self { rpc_url }
    }
}

#[async_trait]
impl ChainProvider for RpcChainProvider {
    async fn read_contract(&self, address: &str, calldata: Vec<u8>) -> Result<Vec<u8>> {
        let provider = ProviderBuilder::new()
            .connect_http(self.rpc_url.parse().context("Invalid RPC URL")?);

        let to: Address = address.parse().context("Invalid contract address")?;
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(Bytes::from(calldata));

        let output = provider.call(tx).await.context("eth_call failed")?;
        Ok(output.to_vec())
    }
}

/// ABI-encoded calldata for `balanceOf(owner)`.
pub fn balance_of_calldata(owner: Address) -> Vec<u8> {
    IERC20::balanceOfCall { owner }.abi_encode()
}

/// Read an ERC-20 stablecoin balance and convert it to hundredth-cents.
///
/// USDC carries 6 decimals: 1 raw unit = $0.000001, so one
/// hundredth-cent ($0.0001) is 100 raw units.
pub async fn usdc_balance_hundredth_cents(
    chain: &dyn ChainProvider,
    token_address: &str,
    owner_address: &str,
) -> Result<HundredthCents> {
    let owner: Address = owner_address.parse().context("Invalid owner address")?;
    let calldata = balance_of_calldata(owner);

    let raw = chain.read_contract(token_address, calldata).await?;
    if raw.len() < 32 {
        anyhow::bail!("short return data from balanceOf: {} bytes", raw.len());
    }

    let value = U256::from_be_slice(&raw[..32]);
    let hundredth_cents = value / U256::from(100u64);
    Ok(hundredth_cents.try_into().unwrap_or(HundredthCents::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedChain {
        balance_raw: U256,
    }

    #[async_trait]
    impl ChainProvider for FixedChain {
        async fn read_contract(&self, _address: &str, _calldata: Vec<u8>) -> Result<Vec<u8>> {
            Ok(self.balance_raw.to_be_bytes::<32>().to_vec())
        }
    }

    #[test]
    fn balance_of_calldata_has_selector_and_padding() {
        let owner: Address = "0x0000000000000000000000000000000000000001"
            .parse()
            .unwrap();
        let data = balance_of_calldata(owner);
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(data[35], 1);
    }

    #[tokio::test]
    async fn usdc_conversion_to_hundredth_cents() {
        // 2.5 USDC = 2,500,000 raw units = 25,000 hundredth-cents.
        let chain = FixedChain {
            balance_raw: U256::from(2_500_000u64),
        };
        let hc = usdc_balance_hundredth_cents(
            &chain,
            "0x0000000000000000000000000000000000000002",
            "0x0000000000000000000000000000000000000001",
        )
        .await
        .unwrap();
        assert_eq!(hc, 25_000);
    }
}
