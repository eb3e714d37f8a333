//! Chain registry: internal chain ids, network names, EVM chain-id mapping,
//! and statically known stablecoin deployments.
//!
//! The core identifies chains by a small internal numeric id. 402 challenges
//! carry network *names* (`"base-mainnet"`) or raw EVM chain ids; both are
//! normalized to the internal id here. The EIP-712 domain needs the real EVM
//! chain id, obtained through [`evm_chain_id`]; internal ids without a known
//! mapping pass through unchanged.

use alloy::primitives::{Address, address};
use once_cell::sync::Lazy;

/// Internal chain ids for well-known networks.
pub mod chains {
    pub const ETHEREUM: u64 = 1;
    pub const ETHEREUM_SEPOLIA: u64 = 2;
    pub const POLYGON: u64 = 10;
    pub const ARBITRUM: u64 = 20;
    pub const BASE: u64 = 30;
    pub const BASE_SEPOLIA: u64 = 31;
    pub const OPTIMISM: u64 = 40;
    pub const SOLANA: u64 = 50;
}

/// `(names, internal id, EVM chain id)` — the first name is canonical.
/// Solana has no EVM id.
static NETWORKS: &[(&[&str], u64, Option<u64>)] = &[
    (&["ethereum-mainnet", "ethereum"], chains::ETHEREUM, Some(1)),
    (
        &["ethereum-sepolia"],
        chains::ETHEREUM_SEPOLIA,
        Some(11155111),
    ),
    (&["polygon-mainnet", "polygon"], chains::POLYGON, Some(137)),
    (
        &["arbitrum-mainnet", "arbitrum"],
        chains::ARBITRUM,
        Some(42161),
    ),
    (&["base-mainnet", "base"], chains::BASE, Some(8453)),
    (&["base-sepolia"], chains::BASE_SEPOLIA, Some(84532)),
    (&["optimism-mainnet", "optimism"], chains::OPTIMISM, Some(10)),
    (&["solana-mainnet", "solana"], chains::SOLANA, None),
];

/// Resolve a network name to its internal chain id.
pub fn chain_id_by_network_name(name: &str) -> Option<u64> {
    let name = name.to_ascii_lowercase();
    NETWORKS
        .iter()
        .find(|(names, _, _)| names.contains(&name.as_str()))
        .map(|(_, id, _)| *id)
}

/// Canonical network name for an internal chain id, if known.
pub fn network_name_by_chain_id(chain_id: u64) -> Option<&'static str> {
    NETWORKS
        .iter()
        .find(|(_, id, _)| *id == chain_id)
        .map(|(names, _, _)| names[0])
}

/// Map an internal chain id to the EVM chain id used in EIP-712 domains.
///
/// Unknown internal ids pass through unchanged.
pub fn evm_chain_id(internal: u64) -> u64 {
    NETWORKS
        .iter()
        .find(|(_, id, _)| *id == internal)
        .and_then(|(_, _, evm)| *evm)
        .unwrap_or(internal)
}

/// Map a raw EVM chain id back to an internal id, where a mapping exists.
pub fn chain_id_from_evm(evm: u64) -> Option<u64> {
    NETWORKS
        .iter()
        .find(|(_, _, e)| *e == Some(evm))
        .map(|(_, id, _)| *id)
}

/// EIP-712 domain metadata carried by a token contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEip712 {
    pub name: &'static str,
    pub version: &'static str,
}

/// A known token deployment on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDeployment {
    pub symbol: &'static str,
    pub chain_id: u64,
    pub address: Address,
    pub decimals: u8,
    pub eip712: TokenEip712,
}

/// Statically known dollar-pegged stablecoin deployments.
///
/// These drive symbol → address resolution, EIP-712 domain metadata, token
/// decimals and the USD fast path that skips the price oracle.
static STABLECOINS: Lazy<Vec<TokenDeployment>> = Lazy::new(|| {
    vec![
        TokenDeployment {
            symbol: "USDC",
            chain_id: chains::ETHEREUM,
            address: address!("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
            decimals: 6,
            eip712: TokenEip712 {
                name: "USD Coin",
                version: "2",
            },
        },
        TokenDeployment {
            symbol: "USDT",
            chain_id: chains::ETHEREUM,
            address: address!("0xdAC17F958D2ee523a2206206994597C13D831ec7"),
            decimals: 6,
            eip712: TokenEip712 {
                name: "Tether USD",
                version: "1",
            },
        },
        TokenDeployment {
            symbol: "USDC",
            chain_id: chains::POLYGON,
            address: address!("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359"),
            decimals: 6,
            eip712: TokenEip712 {
                name: "USD Coin",
                version: "2",
            },
        },
        TokenDeployment {
            symbol: "USDC",
            chain_id: chains::ARBITRUM,
            address: address!("0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
            decimals: 6,
            eip712: TokenEip712 {
                name: "USD Coin",
                version: "2",
            },
        },
        TokenDeployment {
            symbol: "USDC",
            chain_id: chains::BASE,
            address: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            decimals: 6,
            eip712: TokenEip712 {
                name: "USD Coin",
                version: "2",
            },
        },
        TokenDeployment {
            symbol: "USDC",
            chain_id: chains::BASE_SEPOLIA,
            address: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
            decimals: 6,
            eip712: TokenEip712 {
                name: "USDC",
                version: "2",
            },
        },
        TokenDeployment {
            symbol: "USDC",
            chain_id: chains::OPTIMISM,
            address: address!("0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85"),
            decimals: 6,
            eip712: TokenEip712 {
                name: "USD Coin",
                version: "2",
            },
        },
    ]
});

/// Fallback decimals for tokens not present in the deployment table.
pub const STABLECOIN_DEFAULT_DECIMALS: u8 = 6;

/// Look up a stablecoin deployment by symbol on a chain.
pub fn stablecoin_by_symbol(symbol: &str, chain_id: u64) -> Option<&'static TokenDeployment> {
    let symbol = symbol.to_ascii_uppercase();
    STABLECOINS
        .iter()
        .find(|d| d.symbol == symbol && d.chain_id == chain_id)
}

/// Look up a stablecoin deployment by contract address (any chain).
pub fn stablecoin_by_address(address: &Address) -> Option<&'static TokenDeployment> {
    STABLECOINS.iter().find(|d| &d.address == address)
}

/// The default settlement asset: USDC on Base.
///
/// Unresolved token symbols fall back to this deployment.
pub fn default_usdc() -> &'static TokenDeployment {
    STABLECOINS
        .iter()
        .find(|d| d.symbol == "USDC" && d.chain_id == chains::BASE)
        .expect("Base USDC is always present in the registry")
}

/// EIP-712 `(name, version)` for a verifying contract, with the scheme-wide
/// default for unknown contracts.
pub fn eip712_metadata(verifying_contract: &Address) -> (&'static str, &'static str) {
    match stablecoin_by_address(verifying_contract) {
        Some(d) => (d.eip712.name, d.eip712.version),
        None => ("x402", "1"),
    }
}

/// Decimals for a token contract, with the stablecoin fallback.
pub fn token_decimals(address: &Address) -> u8 {
    stablecoin_by_address(address)
        .map(|d| d.decimals)
        .unwrap_or(STABLECOIN_DEFAULT_DECIMALS)
}
