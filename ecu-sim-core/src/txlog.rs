//! CSV traffic logs
//!
//! TX log: `ts,id,dlc,data_hex,used_json`, one line per frame sent.
//! RX log: `ts,arbitration_id,data_hex,decoded`, one line per frame received.
//! A header is written when the file is new or empty.

use crate::codec::SignalValues;
use crate::types::CanFrame;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const TX_HEADER: &str = "ts,id,dlc,data_hex,used_json";
const RX_HEADER: &str = "ts,arbitration_id,data_hex,decoded";

/// Quote a CSV field if it contains separators or quotes
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Append-mode CSV file with a header line
#[derive(Debug)]
struct CsvFile {
    path: PathBuf,
    file: File,
}

impl CsvFile {
    fn open(path: &Path, header: &str) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let is_new = std::fs::metadata(path).map_or(true, |m| m.len() == 0);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if is_new {
            writeln!(file, "{}", header)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn write_row(&mut self, fields: &[String]) {
        let line = fields
            .iter()
            .map(|f| csv_field(f))
            .collect::<Vec<_>>()
            .join(",");
        if let Err(e) = writeln!(self.file, "{}", line).and_then(|_| self.file.flush()) {
            log::debug!("CSV write to {:?} failed: {}", self.path, e);
        }
    }
}

/// Log of transmitted frames with the physical values they carried
#[derive(Debug)]
pub struct TxLog {
    csv: CsvFile,
}

impl TxLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            csv: CsvFile::open(path, TX_HEADER)?,
        })
    }

    pub fn write(&mut self, ts: f64, frame: &CanFrame, used: &SignalValues) {
        let used_json = serde_json::to_string(used).unwrap_or_else(|_| "{}".to_string());
        self.csv.write_row(&[
            format!("{:.3}", ts),
            format!("0x{:x}", frame.can_id),
            frame.dlc().to_string(),
            frame.data_hex(),
            used_json,
        ]);
    }
}

/// Log of received frames, optionally with decoded values
#[derive(Debug)]
pub struct RxLog {
    csv: CsvFile,
}

impl RxLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            csv: CsvFile::open(path, RX_HEADER)?,
        })
    }

    pub fn write(&mut self, ts: f64, frame: &CanFrame, decoded: Option<&SignalValues>) {
        let decoded = decoded
            .and_then(|values| serde_json::to_string(values).ok())
            .unwrap_or_default();
        self.csv.write_row(&[
            format!("{:.3}", ts),
            format!("0x{:x}", frame.can_id),
            frame.data_hex(),
            decoded,
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("abc"), "abc");
        assert_eq!(csv_field(r#"{"a":1,"b":2}"#), r#""{""a"":1,""b"":2}""#);
    }

    #[test]
    fn test_tx_log_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.csv");
        {
            let mut log = TxLog::open(&path).unwrap();
            let mut used = SignalValues::new();
            used.insert("rpm".to_string(), 4660.0);
            log.write(
                1.5,
                &CanFrame::new(0x5E8, vec![0, 0, 0x12, 0x34, 0, 0, 0, 0], false),
                &used,
            );
        }
        // Reopening an existing file does not repeat the header
        TxLog::open(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], TX_HEADER);
        assert_eq!(lines[1], r#"1.500,0x5e8,8,0000123400000000,"{""rpm"":4660.0}""#);
    }

    #[test]
    fn test_rx_log_without_decode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("rx.csv");
        let mut log = RxLog::open(&path).unwrap();
        log.write(2.0, &CanFrame::new(0x100, vec![0xAB], false), None);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{}\n2.000,0x100,ab,\n", RX_HEADER));
    }
}
