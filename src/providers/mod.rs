//! Provider Implementations
//!
//! Concrete HTTP/RPC clients behind the narrow capability traits in
//! `types`. The core never depends on these shapes directly.

pub mod chain;
pub mod inference;
pub mod sandbox;
pub mod signer;
pub mod social;

pub use chain::RpcChainProvider;
pub use inference::HttpInferenceProvider;
pub use sandbox::HttpSandboxProvider;
pub use signer::LocalWalletSigner;
pub use social::RelaySocialProvider;
