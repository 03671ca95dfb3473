//! Pull command - upload device memory over CCP

use std::path::Path;

use anyhow::{Context, Result};
use epc_bus::{create_bus, BusConfig};
use epc_ccp::{CcpClient, CcpConfig, UploadProgress};
use epc_nv::DeviceManifest;
use indicatif::{ProgressBar, ProgressStyle};

use crate::output::OutputContext;

pub struct PullArgs<'a> {
    pub manifest: &'a Path,
    pub interface: &'a str,
    pub extension: u8,
    /// Start address in addressable units
    pub address: u32,
    /// Length in octets
    pub length: usize,
    pub file: &'a Path,
    /// Write a hex dump instead of raw bytes
    pub hex: bool,
}

/// Parse `0x1000` or `4096`
pub fn parse_address(text: &str) -> Result<u32, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address {}: {}", text, e))
}

pub async fn pull(args: PullArgs<'_>, ctx: &OutputContext) -> Result<()> {
    let manifest = DeviceManifest::from_file(args.manifest)
        .with_context(|| format!("Failed to load manifest: {}", args.manifest.display()))?;
    let ccp = manifest
        .ccp
        .as_ref()
        .context("Manifest has no CCP section")?;
    let config = CcpConfig::new(ccp.command_id, ccp.response_id, ccp.extended)
        .with_station_address(ccp.station_address)
        .with_bits_per_byte(manifest.bits_per_byte.unwrap_or(8));
    let per_unit = config.octets_per_unit()?;

    let bus = create_bus(&BusConfig::SocketCan {
        interface: args.interface.to_string(),
    })
    .with_context(|| format!("Failed to open CAN interface {}", args.interface))?;
    let mut client = CcpClient::new(bus, config);

    ctx.info(&format!(
        "Uploading {} bytes from {:#010x}...",
        args.length, args.address
    ));
    let pb = if ctx.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(args.length as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );

    let progress = |p: &UploadProgress| {
        pb.set_position(p.uploaded as u64);
        if let Some(eta) = p.eta {
            pb.set_message(format!("eta {}s", eta.as_secs()));
        }
    };
    let bytes = match client
        .upload_block(args.extension, args.address, args.length, Some(progress))
        .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            pb.abandon_with_message("Upload failed");
            return Err(e).context("CCP upload failed");
        }
    };
    pb.finish_with_message("Complete");

    let content = if args.hex {
        let mut dump = String::new();
        for (i, line) in bytes.chunks(16).enumerate() {
            let offset = args.address as usize * per_unit + i * 16;
            dump.push_str(&format!("{:08x}  {}\n", offset, hex::encode(line)));
        }
        dump.into_bytes()
    } else {
        bytes
    };
    std::fs::write(args.file, &content)
        .with_context(|| format!("Failed to write {}", args.file.display()))?;
    ctx.success(&format!("Memory written to {}", args.file.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x1000"), Ok(0x1000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("0xZZ").is_err());
    }
}
