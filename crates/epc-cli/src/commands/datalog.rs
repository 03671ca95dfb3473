//! Datalog command - decode a pulled datalog into CSV

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use epc_ccp::{DatalogParser, ParseSummary, VariableSet};

use crate::output::OutputContext;

pub struct DatalogArgs<'a> {
    pub log: &'a Path,
    pub variables: &'a Path,
    pub csv: Option<&'a Path>,
    pub bits_per_byte: u32,
    pub expected_hash: Option<String>,
}

/// Output path when none is given: the log with a `.csv` extension
pub fn default_csv_path(log: &Path) -> PathBuf {
    log.with_extension("csv")
}

pub fn datalog(args: DatalogArgs<'_>, ctx: &OutputContext) -> Result<ParseSummary> {
    let variables = VariableSet::load(args.variables).with_context(|| {
        format!("Failed to load variables: {}", args.variables.display())
    })?;
    let csv = args
        .csv
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_csv_path(args.log));

    let parser = DatalogParser::new(variables)
        .with_expected_hash(args.expected_hash)
        .with_bits_per_byte(args.bits_per_byte);
    let summary = parser
        .convert_file(args.log, &csv)
        .with_context(|| format!("Failed to decode {}", args.log.display()))?;

    if summary.truncated {
        ctx.warn("Log ended inside a record; the partial record was dropped");
    }
    ctx.success(&format!(
        "{} rows from {} blocks written to {}",
        summary.rows,
        summary.blocks,
        csv.display()
    ));
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use epc_ccp::datalog::{BlockHeader, LogChunk, END_OF_BLOCK};
    use epc_ccp::DatalogError;

    fn write_log(path: &Path, hash: u32) {
        let mut bytes = BlockHeader {
            software_hash: hash,
            sample_period_us: 500_000,
            chunks: vec![LogChunk {
                address: 0x10,
                bytes: 2,
            }],
        }
        .encode();
        for (index, value) in [(0u32, 1u16), (1, 2)] {
            bytes.extend_from_slice(&index.to_le_bytes());
            let flags = if index == 1 { END_OF_BLOCK } else { 0 };
            bytes.extend_from_slice(&flags.to_le_bytes());
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn write_variables(path: &Path) {
        std::fs::write(
            path,
            "variables:\n  - path: Counter\n    address: 16\n    signal: { name: Counter, start_bit: 0, length: 16 }\n",
        )
        .unwrap();
    }

    #[test]
    fn test_default_output_next_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("pull.bin");
        let vars = dir.path().join("vars.yaml");
        write_log(&log, 0xabcdef0);
        write_variables(&vars);

        let ctx = OutputContext::new(OutputFormat::Table, true, true);
        let summary = datalog(
            DatalogArgs {
                log: &log,
                variables: &vars,
                csv: None,
                bits_per_byte: 8,
                expected_hash: Some("abcd".to_string()),
            },
            &ctx,
        )
        .unwrap();

        assert_eq!(summary.rows, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("pull.csv")).unwrap(),
            ".time,Counter\n0,1\n0.5,2\n"
        );
    }

    #[test]
    fn test_hash_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("pull.bin");
        let vars = dir.path().join("vars.yaml");
        write_log(&log, 0x1234567);
        write_variables(&vars);

        let ctx = OutputContext::new(OutputFormat::Table, true, true);
        let err = datalog(
            DatalogArgs {
                log: &log,
                variables: &vars,
                csv: None,
                bits_per_byte: 8,
                expected_hash: Some("abcdef0".to_string()),
            },
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatalogError>(),
            Some(DatalogError::HashMismatch { .. })
        ));
    }
}
