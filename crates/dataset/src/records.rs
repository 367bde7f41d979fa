//! Record readers for the two supported corpus formats.
//!
//! Format A is line-delimited JSON with an `"encoded"` field holding the
//! token ids. Format B is a framed binary record file: each record is a
//! little-endian u64 payload length, a masked CRC32 of the length bytes, the
//! protobuf payload, and a masked CRC32 of the payload. Parse failures stop
//! the pipeline; records are never silently skipped.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use prost::Message;
use serde::Deserialize;

use crate::errors::{DatasetError, Result};
use crate::pipeline::SequenceSource;

#[derive(Debug, Deserialize)]
struct EncodedRecord {
    encoded: Vec<i64>,
}

/// Format A: one JSON object per line.
#[derive(Clone, Debug)]
pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SequenceSource for JsonlSource {
    type Stream = JsonlStream;

    fn stream(&self) -> Result<Self::Stream> {
        let file = File::open(&self.path)?;
        Ok(JsonlStream {
            lines: BufReader::new(file).lines(),
            line_number: 0,
        })
    }
}

pub struct JsonlStream {
    lines: io::Lines<BufReader<File>>,
    line_number: usize,
}

impl Iterator for JsonlStream {
    type Item = Result<Vec<i64>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str::<EncodedRecord>(&line)
                    .map(|record| record.encoded)
                    .map_err(|source| DatasetError::Json {
                        line: self.line_number,
                        source,
                    }),
            );
        }
    }
}

#[derive(Clone, PartialEq, Message)]
struct TokenRecord {
    #[prost(int64, repeated, tag = "1")]
    text: Vec<i64>,
}

/// Format B: framed binary records.
#[derive(Clone, Debug)]
pub struct RecordFileSource {
    path: PathBuf,
}

impl RecordFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SequenceSource for RecordFileSource {
    type Stream = RecordFileStream;

    fn stream(&self) -> Result<Self::Stream> {
        let file = File::open(&self.path)?;
        Ok(RecordFileStream {
            reader: BufReader::new(file),
            record_number: 0,
        })
    }
}

pub struct RecordFileStream {
    reader: BufReader<File>,
    record_number: usize,
}

impl RecordFileStream {
    fn read_record(&mut self) -> Result<Option<Vec<i64>>> {
        let mut len_bytes = [0u8; 8];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        self.record_number += 1;

        let len_crc = self.read_u32()?;
        if masked_crc32(&len_bytes) != len_crc {
            return Err(self.corrupt("length checksum mismatch"));
        }

        let len = u64::from_le_bytes(len_bytes);
        let len = usize::try_from(len)
            .map_err(|_| self.corrupt("record length exceeds addressable memory"))?;

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|_| self.corrupt("truncated payload"))?;

        let payload_crc = self.read_u32()?;
        if masked_crc32(&payload) != payload_crc {
            return Err(self.corrupt("payload checksum mismatch"));
        }

        let record = TokenRecord::decode(payload.as_slice())
            .map_err(|err| self.corrupt(&format!("protobuf decode failed: {err}")))?;
        Ok(Some(record.text))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.reader
            .read_exact(&mut bytes)
            .map_err(|_| self.corrupt("truncated frame"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn corrupt(&self, detail: &str) -> DatasetError {
        DatasetError::Record(format!("record {}: {}", self.record_number, detail))
    }
}

impl Iterator for RecordFileStream {
    type Item = Result<Vec<i64>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

/// Writer counterpart for format B, used by preprocessing and tests.
pub struct RecordFileWriter {
    writer: io::BufWriter<File>,
}

impl RecordFileWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            writer: io::BufWriter::new(file),
        })
    }

    pub fn write(&mut self, ids: &[i64]) -> Result<()> {
        let record = TokenRecord { text: ids.to_vec() };
        let mut payload = BytesMut::with_capacity(record.encoded_len());
        record
            .encode(&mut payload)
            .map_err(|err| DatasetError::Record(format!("protobuf encode failed: {err}")))?;

        let len_bytes = (payload.len() as u64).to_le_bytes();
        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.write_all(&masked_crc32(&payload).to_le_bytes())?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn jsonl_reads_encoded_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"encoded": [5, 6, 7]}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"encoded": [8]}}"#).unwrap();

        let seqs: Vec<_> = JsonlSource::new(&path)
            .stream()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(seqs, vec![vec![5, 6, 7], vec![8]]);
    }

    #[test]
    fn jsonl_malformed_line_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"encoded": [5]}}"#).unwrap();
        writeln!(file, r#"{{"text": "missing field"}}"#).unwrap();

        let mut stream = JsonlSource::new(&path).stream().unwrap();
        assert!(stream.next().unwrap().is_ok());
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err, DatasetError::Json { line: 2, .. }));
    }

    #[test]
    fn record_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.records");

        let mut writer = RecordFileWriter::create(&path).unwrap();
        writer.write(&[1, 2, 3]).unwrap();
        writer.write(&[4]).unwrap();
        writer.finish().unwrap();

        let seqs: Vec<_> = RecordFileSource::new(&path)
            .stream()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(seqs, vec![vec![1, 2, 3], vec![4]]);
    }

    #[test]
    fn record_file_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.records");

        let mut writer = RecordFileWriter::create(&path).unwrap();
        writer.write(&[1, 2, 3]).unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut stream = RecordFileSource::new(&path).stream().unwrap();
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err, DatasetError::Record(_)));
    }
}
