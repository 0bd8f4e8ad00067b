//! WireGuard `.conf` parsing.
//!
//! Parses the wg-quick `[Interface]` / `[Peer]` format far enough to bring
//! up a userspace tunnel: interface private key and addresses, peer public
//! key, endpoint and allowed IPs. Unknown keys are ignored.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::GateError;

/// How directory loading reacts to files that fail to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WgParseMode {
    /// Collect failures and report them alongside the configs that parsed.
    Report,
    /// Abort on the first failure.
    Stop,
    /// Drop failing files silently.
    Ignore,
}

impl WgParseMode {
    pub fn from_u8(raw: u8) -> WgParseMode {
        match raw {
            1 => WgParseMode::Stop,
            2 => WgParseMode::Ignore,
            _ => WgParseMode::Report,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    pub iface: WgIface,
    pub peer: WgPeer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgIface {
    pub private_key: String,
    pub address: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeer {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: Vec<String>,
}

/// A file that failed to parse during directory loading.
#[derive(Debug)]
pub struct WgParseFailure {
    pub file: String,
    pub error: GateError,
}

/// The result of loading a directory of configs. `failures` is only
/// populated in [`WgParseMode::Report`].
#[derive(Debug, Default)]
pub struct WgLoadOutcome {
    pub configs: Vec<WgConfig>,
    pub failures: Vec<WgParseFailure>,
}

/// Load every regular file in `dir` as a WireGuard config, handling parse
/// failures according to `mode`. I/O errors abort regardless of mode.
pub fn load_wg_configs(mode: WgParseMode, dir: &Path) -> Result<WgLoadOutcome, GateError> {
    let mut out = WgLoadOutcome::default();

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let data = std::fs::read_to_string(entry.path())?;

        match parse_wg_config(&data) {
            Ok(cfg) => out.configs.push(cfg),
            Err(err) => match mode {
                WgParseMode::Ignore => continue,
                WgParseMode::Report => out.failures.push(WgParseFailure { file: name, error: err }),
                WgParseMode::Stop => return Err(err),
            },
        }
    }

    Ok(out)
}

/// Parse a single config. Each required field has its own error kind so
/// operators can tell broken files apart from the logs.
pub fn parse_wg_config(input: &str) -> Result<WgConfig, GateError> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Interface,
        Peer,
    }

    let mut section = Section::None;
    let mut seen_iface = false;
    let mut seen_peer = false;

    let mut private_key = String::new();
    let mut address: Vec<String> = Vec::new();
    let mut public_key = String::new();
    let mut endpoint = String::new();
    let mut allowed_ips: Vec<String> = Vec::new();

    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.eq_ignore_ascii_case("[interface]") {
            section = Section::Interface;
            seen_iface = true;
            continue;
        }

        if line.eq_ignore_ascii_case("[peer]") {
            section = Section::Peer;
            seen_peer = true;
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match section {
            Section::Interface => match key.to_ascii_lowercase().as_str() {
                "privatekey" => private_key = value.to_string(),
                "address" => address.extend(split_trim(value)),
                _ => {}
            },
            Section::Peer => match key.to_ascii_lowercase().as_str() {
                "publickey" => public_key = value.to_string(),
                "endpoint" => endpoint = value.to_string(),
                "allowedips" => allowed_ips.extend(split_trim(value)),
                _ => {}
            },
            Section::None => {}
        }
    }

    if !seen_iface || !seen_peer {
        return Err(GateError::InvalidWgConfig);
    }

    if private_key.is_empty() {
        return Err(GateError::InvalidWgIfacePrivateKey);
    }

    if address.is_empty() {
        return Err(GateError::InvalidWgIfaceAddress);
    }

    if public_key.is_empty() {
        return Err(GateError::InvalidWgPeerPublicKey);
    }

    if endpoint.is_empty() {
        return Err(GateError::InvalidWgPeerEndpoint);
    }

    if allowed_ips.is_empty() {
        return Err(GateError::InvalidWgPeerAllowedIp);
    }

    Ok(WgConfig {
        iface: WgIface {
            private_key,
            address,
        },
        peer: WgPeer {
            public_key,
            endpoint,
            allowed_ips,
        },
    })
}

/// Decode a base64 WireGuard key into its raw 32 bytes.
pub fn decode_wg_key(raw: &str) -> Result<[u8; 32], GateError> {
    let bytes = BASE64.decode(raw).map_err(|_| GateError::InvalidWgKey)?;

    bytes.try_into().map_err(|_| GateError::InvalidWgKey)
}

fn split_trim(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
