//! Datalog decoding
//!
//! A pulled log is a sequence of blocks. Each block starts with a fixed
//! little-endian header:
//!
//! | offset     | field                                  |
//! |------------|----------------------------------------|
//! | 0          | `softwareHash` (u32)                   |
//! | 4          | `samplePeriod_us` (u32)                |
//! | 8          | number of chunks in use (u32, ≤ 8)     |
//! | 12 + 8·i   | `chunks[i].address` (u32)              |
//! | 16 + 8·i   | `chunks[i].bytes` (u32)                |
//!
//! followed by records. A record is `sample index` (u32) and `flags` (u32)
//! and then the sampled bytes of every chunk in header order. Flag bit 0
//! marks the last record of a block. Chunk addresses and sizes count
//! addressable units of `bits_per_byte` bits.
//!
//! Decoded values land in a [`MemoryCache`]; subscriptions for each
//! variable turn cache updates into CSV cells.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use epc_conv::precision::precision_from_factor;
use epc_conv::{Decimal, Signal};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};

use crate::cache::{Chunk, MemoryCache};
use crate::error::{DatalogError, DatalogResult};

pub const MAX_CHUNKS: usize = 8;
pub const HEADER_LEN: usize = 12 + 8 * MAX_CHUNKS;
pub const RECORD_HEADER_LEN: usize = 8;
/// Upper bound on the sampled bytes of one record
pub const MAX_RECORD_BYTES: u64 = 1 << 20;
/// Record flag: last record of the block
pub const END_OF_BLOCK: u32 = 0x1;

/// Name of the time column
pub const TIME_COLUMN: &str = ".time";

const HEADER_REFERENCE: &str = "header";

// =============================================================================
// Header
// =============================================================================

/// One logged memory range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogChunk {
    pub address: u32,
    /// Size in addressable units
    pub bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub software_hash: u32,
    pub sample_period_us: u32,
    pub chunks: Vec<LogChunk>,
}

impl BlockHeader {
    /// Decode a header from its raw bytes
    ///
    /// The fields are read through a throwaway cache with one subscription
    /// per named field, the same path variable values take.
    pub fn decode(raw: &[u8]) -> DatalogResult<Self> {
        if raw.len() < HEADER_LEN {
            return Err(DatalogError::InvalidHeader(format!(
                "{} of {} header bytes",
                raw.len(),
                HEADER_LEN
            )));
        }

        let fields: Arc<Mutex<BTreeMap<String, u32>>> = Arc::default();
        let mut cache = MemoryCache::new();
        let mut watch = |name: String, offset: u64| {
            let chunk = cache.new_chunk(offset, 4, Some(HEADER_REFERENCE));
            let sink = fields.clone();
            cache.subscribe(&chunk, None, move |view| {
                if let [a, b, c, d] = view.bytes.as_slice() {
                    sink.lock().insert(name.clone(), u32::from_le_bytes([*a, *b, *c, *d]));
                }
            });
        };
        watch("softwareHash".to_string(), 0);
        watch("samplePeriod_us".to_string(), 4);
        watch("chunkCount".to_string(), 8);
        for i in 0..MAX_CHUNKS {
            let base = 12 + 8 * i as u64;
            watch(format!("chunks[{}].address", i), base);
            watch(format!("chunks[{}].bytes", i), base + 4);
        }
        cache.update(&Chunk::with_bytes(0, raw[..HEADER_LEN].to_vec()));

        let fields = fields.lock();
        let field = |name: &str| {
            fields
                .get(name)
                .copied()
                .ok_or_else(|| DatalogError::InvalidHeader(format!("missing field {}", name)))
        };

        let count = field("chunkCount")? as usize;
        if count > MAX_CHUNKS {
            return Err(DatalogError::InvalidHeader(format!(
                "{} chunks, at most {} supported",
                count, MAX_CHUNKS
            )));
        }
        let chunks = (0..count)
            .map(|i| {
                Ok(LogChunk {
                    address: field(&format!("chunks[{}].address", i))?,
                    bytes: field(&format!("chunks[{}].bytes", i))?,
                })
            })
            .collect::<DatalogResult<Vec<_>>>()?;

        Ok(Self {
            software_hash: field("softwareHash")?,
            sample_period_us: field("samplePeriod_us")?,
            chunks,
        })
    }

    /// Encode in the on-wire layout
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&self.software_hash.to_le_bytes());
        out.extend_from_slice(&self.sample_period_us.to_le_bytes());
        out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.address.to_le_bytes());
            out.extend_from_slice(&chunk.bytes.to_le_bytes());
        }
        out.resize(HEADER_LEN, 0);
        out
    }
}

/// Short-hash comparison: either side may be a prefix of the other
pub fn hash_matches(found: u32, expected: &str) -> bool {
    let expected = normalize_hash(expected);
    if expected.is_empty() {
        return true;
    }
    let found = format!("{:07x}", found);
    found.starts_with(&expected) || expected.starts_with(&found)
}

fn normalize_hash(hash: &str) -> String {
    let hash = hash.trim();
    hash.strip_prefix("0x")
        .or_else(|| hash.strip_prefix("0X"))
        .unwrap_or(hash)
        .to_ascii_lowercase()
}

// =============================================================================
// Variables
// =============================================================================

/// A logged variable: where it lives and how to decode it
#[derive(Debug, Clone, Deserialize)]
pub struct LogVariable {
    /// Qualified name, used as the CSV column
    pub path: String,
    /// Address in addressable units
    #[serde(deserialize_with = "deserialize_address")]
    pub address: u32,
    /// Bit layout relative to `address`, scaling and enumeration
    pub signal: Signal,
}

impl LogVariable {
    pub fn new(path: impl Into<String>, address: u32, signal: Signal) -> Self {
        Self {
            path: path.into(),
            address,
            signal,
        }
    }

    /// Octets covered by the signal
    pub fn octets(&self) -> usize {
        self.signal.required_bytes()
    }
}

/// Variables file (YAML or JSON)
///
/// ```yaml
/// expected_hash: "1234567"
/// variables:
///   - path: Motor.Speed
///     address: "0x2000"
///     signal: { name: Speed, start_bit: 0, length: 16, factor: 0.1 }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableSet {
    #[serde(default)]
    pub expected_hash: Option<String>,
    #[serde(default)]
    pub variables: Vec<LogVariable>,
}

impl VariableSet {
    pub fn load(path: impl AsRef<Path>) -> DatalogResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DatalogError::File {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn from_yaml(yaml: &str) -> DatalogResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> DatalogResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn deserialize_address<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AddressRepr {
        Number(u32),
        Text(String),
    }

    match AddressRepr::deserialize(deserializer)? {
        AddressRepr::Number(address) => Ok(address),
        AddressRepr::Text(text) => {
            let text = text.trim();
            let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => text.parse(),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("invalid address {}: {}", text, e)))
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

/// One decoded sample
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub block: usize,
    pub index: u32,
    /// Seconds since the start of the block
    pub time: Decimal,
    /// Formatted value per variable path; variables outside the block's
    /// chunks are absent
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub blocks: usize,
    pub rows: usize,
    /// The stream ended inside a header or record
    pub truncated: bool,
}

/// Outcome of filling a buffer from the stream
enum Fill {
    Full,
    /// End of stream after this many bytes
    Eof(usize),
}

pub struct DatalogParser {
    variables: Vec<LogVariable>,
    expected_hash: Option<String>,
    bits_per_byte: u32,
}

impl DatalogParser {
    pub fn new(variables: VariableSet) -> Self {
        Self {
            variables: variables.variables,
            expected_hash: variables.expected_hash,
            bits_per_byte: 8,
        }
    }

    /// Override the hash expected in every block header
    pub fn with_expected_hash(mut self, hash: Option<String>) -> Self {
        if hash.is_some() {
            self.expected_hash = hash;
        }
        self
    }

    pub fn with_bits_per_byte(mut self, bits_per_byte: u32) -> Self {
        self.bits_per_byte = bits_per_byte;
        self
    }

    /// Column names in output order
    pub fn columns(&self) -> Vec<String> {
        std::iter::once(TIME_COLUMN.to_string())
            .chain(self.variables.iter().map(|v| v.path.clone()))
            .collect()
    }

    fn octets_per_unit(&self) -> DatalogResult<u64> {
        if self.bits_per_byte == 0 || self.bits_per_byte % 8 != 0 {
            return Err(DatalogError::InvalidHeader(format!(
                "bits_per_byte must be a non-zero multiple of 8, got {}",
                self.bits_per_byte
            )));
        }
        Ok(self.bits_per_byte as u64 / 8)
    }

    /// Decode `reader`, handing every complete row to `on_row`
    pub fn parse<R, F>(&self, mut reader: R, mut on_row: F) -> DatalogResult<ParseSummary>
    where
        R: Read,
        F: FnMut(LogRow) -> DatalogResult<()>,
    {
        let per_unit = self.octets_per_unit()?;
        let mut summary = ParseSummary::default();

        loop {
            let mut raw = vec![0u8; HEADER_LEN];
            match fill(&mut reader, &mut raw, summary.blocks, 0, false)? {
                Fill::Full => {}
                Fill::Eof(0) => break,
                Fill::Eof(n) => {
                    warn!(block = summary.blocks, read = n, "Log ends inside a block header");
                    summary.truncated = true;
                    break;
                }
            }

            let header = BlockHeader::decode(&raw)?;
            if let Some(expected) = &self.expected_hash {
                if !hash_matches(header.software_hash, expected) {
                    return Err(DatalogError::HashMismatch {
                        found: format!("{:07x}", header.software_hash),
                        expected: normalize_hash(expected),
                    });
                }
            }
            debug!(
                block = summary.blocks,
                period_us = header.sample_period_us,
                chunks = header.chunks.len(),
                "Datalog block"
            );

            let ended = self.parse_block(&mut reader, &header, per_unit, &mut summary, &mut on_row)?;
            summary.blocks += 1;
            if !ended {
                break;
            }
        }

        info!(
            blocks = summary.blocks,
            rows = summary.rows,
            truncated = summary.truncated,
            "Datalog parsed"
        );
        Ok(summary)
    }

    /// Decode the records of one block; `false` once the stream is exhausted
    fn parse_block<R, F>(
        &self,
        reader: &mut R,
        header: &BlockHeader,
        per_unit: u64,
        summary: &mut ParseSummary,
        on_row: &mut F,
    ) -> DatalogResult<bool>
    where
        R: Read,
        F: FnMut(LogRow) -> DatalogResult<()>,
    {
        let block = summary.blocks;
        let total: u64 = header.chunks.iter().map(|c| c.bytes as u64 * per_unit).sum();
        if total > MAX_RECORD_BYTES {
            return Err(DatalogError::InvalidHeader(format!(
                "block {} samples {} bytes per record, limit is {}",
                block, total, MAX_RECORD_BYTES
            )));
        }
        let mut chunks: Vec<Chunk> = header
            .chunks
            .iter()
            .map(|c| Chunk::new(c.address as u64 * per_unit, (c.bytes as u64 * per_unit) as usize, None))
            .collect();

        let mut cache = MemoryCache::new();
        for chunk in &chunks {
            cache.add(chunk);
        }

        let row: Arc<Mutex<BTreeMap<String, String>>> = Arc::default();
        for variable in &self.variables {
            let address = variable.address as u64 * per_unit;
            let len = variable.octets();
            if !chunks.iter().any(|c| c.contains(address, len)) {
                debug!(block, variable = %variable.path, "Variable not logged in this block");
                continue;
            }
            let watched = cache.new_chunk(address, len, Some(&variable.path));
            let sink = row.clone();
            let path = variable.path.clone();
            let signal = variable.signal.clone();
            cache.subscribe(&watched, None, move |view| {
                if let Some(raw) = signal.extract(&view.bytes) {
                    sink.lock().insert(path.clone(), cell(&signal, raw));
                }
            });
        }

        let period = Decimal::from(header.sample_period_us);
        let mut record = [0u8; RECORD_HEADER_LEN];
        loop {
            let index = match fill(reader, &mut record, block, 0, false)? {
                Fill::Full => u32::from_le_bytes([record[0], record[1], record[2], record[3]]),
                Fill::Eof(0) => return Ok(false),
                Fill::Eof(n) => {
                    warn!(block, read = n, "Log ends inside a record header");
                    summary.truncated = true;
                    return Ok(false);
                }
            };
            let flags = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);

            for chunk in &mut chunks {
                if let Fill::Eof(n) = fill(reader, &mut chunk.bytes, block, index, true)? {
                    warn!(block, index, read = n, "Log ends inside a record; dropping it");
                    summary.truncated = true;
                    return Ok(false);
                }
            }
            for chunk in &chunks {
                cache.update(chunk);
            }

            let values = std::mem::take(&mut *row.lock());
            let time = (Decimal::from(index) * period / Decimal::from(1_000_000)).normalize();
            on_row(LogRow {
                block,
                index,
                time,
                values,
            })?;
            summary.rows += 1;

            if flags & END_OF_BLOCK != 0 {
                return Ok(true);
            }
        }
    }

    /// Decode `reader` into CSV on `writer`
    pub fn write_csv<R, W>(&self, reader: R, writer: W) -> DatalogResult<ParseSummary>
    where
        R: Read,
        W: Write,
    {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(self.columns())?;
        let summary = self.parse(reader, |row| {
            let mut record = Vec::with_capacity(self.variables.len() + 1);
            record.push(row.time.to_string());
            for variable in &self.variables {
                record.push(row.values.get(&variable.path).cloned().unwrap_or_default());
            }
            csv.write_record(&record)?;
            Ok(())
        })?;
        csv.flush()?;
        Ok(summary)
    }

    /// Decode a log file into a CSV file
    pub fn convert_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> DatalogResult<ParseSummary> {
        let (input, output) = (input.as_ref(), output.as_ref());
        let reader = std::fs::File::open(input).map_err(|source| DatalogError::File {
            path: input.to_path_buf(),
            source,
        })?;
        let writer = std::fs::File::create(output).map_err(|source| DatalogError::File {
            path: output.to_path_buf(),
            source,
        })?;
        self.write_csv(std::io::BufReader::new(reader), std::io::BufWriter::new(writer))
    }
}

/// CSV text for a raw value: enumeration label or scaled number, no unit
fn cell(signal: &Signal, raw: i64) -> String {
    match signal.label(raw) {
        Some(label) => label.to_string(),
        None => signal
            .to_physical(raw)
            .round_dp(precision_from_factor(signal.factor))
            .to_string(),
    }
}

/// Fill `buf`, tolerating end of stream but not read errors.
///
/// A read error once any byte of a record has been consumed is a
/// truncated record; `in_record` says the record header is already in.
fn fill<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    block: usize,
    index: u32,
    in_record: bool,
) -> DatalogResult<Fill> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => return Ok(Fill::Eof(read)),
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if in_record || read > 0 => {
                return Err(DatalogError::TruncatedRecord {
                    block,
                    index,
                    reason: format!("read failed after {} of {} bytes: {}", read, buf.len(), e),
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Fill::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn variables() -> VariableSet {
        VariableSet::from_yaml(
            r#"
expected_hash: "1234567"
variables:
  - path: Motor.Speed
    address: "0x2000"
    signal: { name: Speed, start_bit: 0, length: 16, factor: 0.1 }
  - path: Motor.Temperature
    address: 8194
    signal: { name: Temperature, start_bit: 0, length: 8, signed: true }
  - path: Motor.State
    address: "0x3000"
    signal:
      name: State
      start_bit: 0
      length: 8
      enum: { 0: Idle, 1: Run }
  - path: Elsewhere
    address: "0x9000"
    signal: { name: Elsewhere, start_bit: 0, length: 8 }
"#,
        )
        .unwrap()
    }

    fn header(hash: u32) -> BlockHeader {
        BlockHeader {
            software_hash: hash,
            sample_period_us: 2500,
            chunks: vec![
                LogChunk {
                    address: 0x2000,
                    bytes: 3,
                },
                LogChunk {
                    address: 0x3000,
                    bytes: 1,
                },
            ],
        }
    }

    fn record(index: u32, flags: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = index.to_le_bytes().to_vec();
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn log(records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = header(0x1234567).encode();
        for r in records {
            out.extend_from_slice(r);
        }
        out
    }

    fn csv(parser: &DatalogParser, input: &[u8]) -> (String, ParseSummary) {
        let mut out = Vec::new();
        let summary = parser.write_csv(input, &mut out).unwrap();
        (String::from_utf8(out).unwrap(), summary)
    }

    #[test]
    fn test_header_decode() {
        let raw = header(0x1234567).encode();
        assert_eq!(raw.len(), HEADER_LEN);
        assert_eq!(BlockHeader::decode(&raw).unwrap(), header(0x1234567));

        let mut bad = raw.clone();
        bad[8] = 9;
        assert!(matches!(
            BlockHeader::decode(&bad),
            Err(DatalogError::InvalidHeader(_))
        ));
        assert!(BlockHeader::decode(&raw[..20]).is_err());
    }

    #[test]
    fn test_hash_prefix_match() {
        assert!(hash_matches(0x1234567, "1234567"));
        assert!(hash_matches(0x1234567, "0x1234"));
        assert!(hash_matches(0x1234567, "1234567abc"));
        assert!(hash_matches(0x00abcde, "00ABC"));
        assert!(!hash_matches(0x1234567, "abcdef0"));
        assert!(hash_matches(0x1234567, ""));
    }

    #[test]
    fn test_rows_to_csv() {
        let parser = DatalogParser::new(variables());
        let input = log(&[
            record(0, 0, &[0x58, 0x02, 0xFE, 1]),
            record(1, 0, &[0x5A, 0x02, 0x03, 0]),
        ]);
        let (text, summary) = csv(&parser, &input);
        assert_eq!(
            text,
            ".time,Motor.Speed,Motor.Temperature,Motor.State,Elsewhere\n\
             0,60.0,-2,Run,\n\
             0.0025,60.2,3,Idle,\n"
        );
        assert_eq!(
            summary,
            ParseSummary {
                blocks: 1,
                rows: 2,
                truncated: false
            }
        );
    }

    #[test]
    fn test_hash_mismatch_emits_nothing() {
        let parser = DatalogParser::new(variables()).with_expected_hash(Some("0xABCDEF0".into()));
        let input = log(&[record(0, 0, &[0, 0, 0, 0])]);
        let mut rows = 0;
        let err = parser
            .parse(&input[..], |_| {
                rows += 1;
                Ok(())
            })
            .unwrap_err();
        match err {
            DatalogError::HashMismatch { found, expected } => {
                assert_eq!(found, "1234567");
                assert_eq!(expected, "abcdef0");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_eof_mid_record_keeps_earlier_rows() {
        let parser = DatalogParser::new(variables());
        let mut input = log(&[record(0, 0, &[1, 0, 0, 0])]);
        input.extend_from_slice(&record(1, 0, &[2, 0]));
        let (text, summary) = csv(&parser, &input);
        assert_eq!(text.lines().count(), 2);
        assert!(summary.truncated);
        assert_eq!(summary.rows, 1);
    }

    #[test]
    fn test_blocks_follow_end_flag() {
        let parser = DatalogParser::new(variables());
        let mut input = log(&[record(0, END_OF_BLOCK, &[1, 0, 0, 0])]);
        let mut second = header(0x1234567);
        second.sample_period_us = 1_000_000;
        second.chunks.truncate(1);
        input.extend_from_slice(&second.encode());
        input.extend_from_slice(&record(3, END_OF_BLOCK, &[10, 0, 5]));

        let mut rows = Vec::new();
        let summary = parser
            .parse(&input[..], |row| {
                rows.push(row);
                Ok(())
            })
            .unwrap();
        assert_eq!(summary.blocks, 2);
        assert_eq!(rows[1].block, 1);
        assert_eq!(rows[1].time, Decimal::from(3));
        assert_eq!(rows[1].values.get("Motor.Speed").map(String::as_str), Some("1.0"));
        assert_eq!(rows[1].values.get("Motor.State"), None);
    }

    struct FailingReader {
        data: Vec<u8>,
        pos: usize,
        fail_at: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.fail_at {
                return Err(std::io::Error::new(ErrorKind::Other, "link reset"));
            }
            let n = buf.len().min(self.fail_at - self.pos).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_error_mid_chunk_is_truncated_record() {
        let parser = DatalogParser::new(variables());
        let data = log(&[record(7, 0, &[1, 0, 0, 0])]);
        let reader = FailingReader {
            fail_at: HEADER_LEN + RECORD_HEADER_LEN + 1,
            data,
            pos: 0,
        };
        let err = parser.parse(reader, |_| Ok(())).unwrap_err();
        assert!(matches!(
            err,
            DatalogError::TruncatedRecord {
                block: 0,
                index: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_read_error_at_chunk_start_is_truncated_record() {
        let parser = DatalogParser::new(variables());
        for fail_at in [HEADER_LEN + RECORD_HEADER_LEN, HEADER_LEN + RECORD_HEADER_LEN + 3] {
            let reader = FailingReader {
                data: log(&[record(7, 0, &[1, 0, 0, 0])]),
                pos: 0,
                fail_at,
            };
            let err = parser.parse(reader, |_| Ok(())).unwrap_err();
            assert!(
                matches!(err, DatalogError::TruncatedRecord { block: 0, index: 7, .. }),
                "fail_at {fail_at}: {err}"
            );
        }
    }

    #[test]
    fn test_read_error_between_records_is_io() {
        let parser = DatalogParser::new(variables());
        let reader = FailingReader {
            data: log(&[record(7, 0, &[1, 0, 0, 0])]),
            pos: 0,
            fail_at: HEADER_LEN + RECORD_HEADER_LEN + 4,
        };
        let err = parser.parse(reader, |_| Ok(())).unwrap_err();
        assert!(matches!(err, DatalogError::Io(_)));
    }

    #[test]
    fn test_oversized_chunk_header_is_rejected() {
        let parser = DatalogParser::new(variables());
        let mut huge = header(0x1234567);
        huge.chunks[0].bytes = u32::MAX;
        let mut input = huge.encode();
        input.extend_from_slice(&record(0, 0, &[0; 16]));
        let mut rows = 0;
        let err = parser
            .parse(&input[..], |_| {
                rows += 1;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, DatalogError::InvalidHeader(_)));
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_word_addressed_chunks() {
        let vars = VariableSet::from_yaml(
            r#"
variables:
  - path: Word
    address: "0x1001"
    signal: { name: Word, start_bit: 0, length: 16 }
"#,
        )
        .unwrap();
        let parser = DatalogParser::new(vars).with_bits_per_byte(16);
        let mut input = BlockHeader {
            software_hash: 1,
            sample_period_us: 1000,
            chunks: vec![LogChunk {
                address: 0x1000,
                bytes: 2,
            }],
        }
        .encode();
        input.extend_from_slice(&record(0, END_OF_BLOCK, &[0xAA, 0xAA, 0x34, 0x12]));
        let (text, _) = csv(&parser, &input);
        assert_eq!(text, ".time,Word\n0,4660\n");
    }

    #[test]
    fn test_convert_file_with_variables_file() {
        let dir = tempfile::tempdir().unwrap();
        let vars = dir.path().join("vars.json");
        std::fs::write(
            &vars,
            r#"{"expected_hash": "1234",
                "variables": [{"path": "Motor.Speed", "address": 8192,
                               "signal": {"name": "Speed", "start_bit": 0, "length": 16}}]}"#,
        )
        .unwrap();
        let input = dir.path().join("pull.bin");
        std::fs::write(&input, log(&[record(0, END_OF_BLOCK, &[7, 0, 0, 0])])).unwrap();
        let output = dir.path().join("pull.csv");

        let parser = DatalogParser::new(VariableSet::load(&vars).unwrap());
        let summary = parser.convert_file(&input, &output).unwrap();
        assert_eq!(summary.rows, 1);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            ".time,Motor.Speed\n0,7\n"
        );
    }
}
