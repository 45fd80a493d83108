use anyhow::{Context, Result, anyhow};
use std::env;

/// Runtime configuration, loaded once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub database_path: String,
    pub letta_base_url: String,
    pub letta_token: Option<String>,
    /// Optional AES-256 master key override for the secrets vault,
    /// supplied as a 64-character hex string. When absent the key is
    /// derived from machine identity instead.
    pub vault_master_key: Option<[u8; 32]>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_host = env::var("PERCH_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let api_port = match env::var("PERCH_API_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PERCH_API_PORT is not a valid port: {raw}"))?,
            Err(_) => 8484,
        };
        let database_path =
            env::var("PERCH_DATABASE_PATH").unwrap_or_else(|_| "perch.db".to_string());
        let letta_base_url =
            env::var("LETTA_BASE_URL").unwrap_or_else(|_| "http://localhost:8283".to_string());
        let letta_token = env::var("LETTA_API_KEY").ok().filter(|t| !t.trim().is_empty());

        let vault_master_key = match env::var("PERCH_MASTER_KEY") {
            Ok(raw) => Some(parse_master_key(&raw)?),
            Err(_) => None,
        };

        Ok(Self {
            api_host,
            api_port,
            database_path,
            letta_base_url,
            letta_token,
            vault_master_key,
        })
    }
}

fn parse_master_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw.trim())
        .map_err(|_| anyhow!("PERCH_MASTER_KEY must be a 64-character hex string"))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("PERCH_MASTER_KEY must decode to exactly 32 bytes"))?;
    Ok(key)
}
