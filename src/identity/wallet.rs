//! Wallet Storage
//!
//! The automaton's secp256k1 key lives at `~/.automaton/wallet.json`.
//! Everything the agent owns hangs off this key, so the file is written
//! 0600 and its contents never enter a prompt.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::get_automaton_dir;
use crate::types::WalletData;

const WALLET_FILENAME: &str = "wallet.json";

/// Full path of the wallet file: `~/.automaton/wallet.json`.
pub fn get_wallet_path() -> PathBuf {
    get_automaton_dir().join(WALLET_FILENAME)
}

/// Load the wallet, generating one on first use.
///
/// Returns the signer plus whether the key was freshly generated.
pub fn get_wallet() -> Result<(PrivateKeySigner, bool)> {
    ensure_automaton_dir()?;

    let path = get_wallet_path();
    if path.exists() {
        Ok((read_wallet(&path)?, false))
    } else {
        Ok((generate_wallet(&path)?, true))
    }
}

fn ensure_automaton_dir() -> Result<()> {
    let dir = get_automaton_dir();
    if dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
        .context("cannot restrict automaton dir to 0700")?;
    Ok(())
}

fn read_wallet(path: &Path) -> Result<PrivateKeySigner> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let data: WalletData =
        serde_json::from_str(&raw).context("wallet.json is not valid wallet JSON")?;
    data.private_key
        .parse()
        .context("wallet.json holds an unparseable private key")
}

fn generate_wallet(path: &Path) -> Result<PrivateKeySigner> {
    let signer = PrivateKeySigner::random();

    let data = WalletData {
        private_key: format!("0x{}", hex::encode(signer.credential().to_bytes())),
        created_at: Utc::now().to_rfc3339(),
    };

    let json = serde_json::to_string_pretty(&data)?;
    fs::write(path, &json).with_context(|| format!("cannot write {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .context("cannot restrict wallet file to 0600")?;

    Ok(signer)
}

/// The checksummed address, without keeping the signer around.
/// `None` if no wallet has been created yet or the file is unreadable.
pub fn get_wallet_address() -> Option<String> {
    let path = get_wallet_path();
    if !path.exists() {
        return None;
    }
    read_wallet(&path)
        .ok()
        .map(|signer| signer.address().to_checksum(None))
}

/// Whether a wallet file exists on disk.
pub fn wallet_exists() -> bool {
    get_wallet_path().exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_path_sits_in_the_automaton_dir() {
        let path = get_wallet_path();
        assert!(path.ends_with("wallet.json"));
        assert!(path.starts_with(get_automaton_dir()));
    }

    #[test]
    fn generated_wallet_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        let created = generate_wallet(&path).unwrap();
        let loaded = read_wallet(&path).unwrap();
        assert_eq!(created.address(), loaded.address());
    }
}
