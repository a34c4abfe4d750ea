//! Append-only attendance CSV with one row per identity per day.
//!
//! Every `log` runs its check-then-append under an exclusive `flock`, so
//! concurrent processes sharing the file cannot double-mark. Keys already
//! seen are cached together with the byte offset they were read up to; each
//! call only parses rows appended since.

use crate::types::{DedupKey, Identity};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use thiserror::Error;

pub const HEADER: [&str; 6] = ["Name", "Class", "Roll No", "Section", "Date", "Time"];

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("{path} does not start with the attendance header (found: {found})")]
    Header { path: PathBuf, found: String },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceEntry {
    #[serde(flatten)]
    pub identity: Identity,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl AttendanceEntry {
    pub fn key(&self) -> DedupKey {
        DedupKey {
            identity: self.identity.clone(),
            date: self.date,
        }
    }

    fn to_record(&self) -> [String; 6] {
        [
            self.identity.name.clone(),
            self.identity.class.clone(),
            self.identity.roll_no.clone(),
            self.identity.section.clone(),
            self.date.format(DATE_FORMAT).to_string(),
            self.time.format(TIME_FORMAT).to_string(),
        ]
    }

    fn from_record(record: &csv::StringRecord) -> Option<Self> {
        if record.len() != HEADER.len() {
            return None;
        }
        let date = NaiveDate::parse_from_str(record.get(4)?.trim(), DATE_FORMAT).ok()?;
        let time = NaiveTime::parse_from_str(record.get(5)?.trim(), TIME_FORMAT).ok()?;
        Some(Self {
            identity: Identity {
                name: record.get(0)?.to_string(),
                class: record.get(1)?.to_string(),
                roll_no: record.get(2)?.to_string(),
                section: record.get(3)?.to_string(),
            },
            date,
            time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    Marked(AttendanceEntry),
    AlreadyPresent(DedupKey),
}

pub struct AttendanceLedger {
    path: PathBuf,
    seen: HashSet<DedupKey>,
    scanned_to: u64,
    has_header: bool,
}

impl AttendanceLedger {
    /// Nothing is read or created until the first [`log`](Self::log).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen: HashSet::new(),
            scanned_to: 0,
            has_header: false,
        }
    }

    /// Mark `identity` present now (local time).
    pub fn log(&mut self, identity: &Identity) -> Result<LogOutcome, LedgerError> {
        self.log_at(identity, Local::now().naive_local())
    }

    pub fn log_at(
        &mut self,
        identity: &Identity,
        at: NaiveDateTime,
    ) -> Result<LogOutcome, LedgerError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|source| self.io_err(source))?;
        let mut file = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, source)| {
            LedgerError::Lock {
                path: self.path.clone(),
                source,
            }
        })?;

        let len = self.file_len(&file)?;
        if len < self.scanned_to {
            tracing::info!(path = %self.path.display(), "ledger shrank, rebuilding index");
        }
        // Headerless ledgers are always rescanned; another process may have
        // written the header since.
        if len < self.scanned_to || !self.has_header {
            self.seen.clear();
            self.scanned_to = 0;
            self.has_header = false;
        }
        self.scan(&mut file, len)?;

        let entry = AttendanceEntry {
            identity: identity.clone(),
            date: at.date(),
            time: at.time().with_nanosecond(0).unwrap_or(at.time()),
        };
        let key = entry.key();
        if self.seen.contains(&key) {
            tracing::info!(identity = %identity, date = %key.date, "already marked present");
            return Ok(LogOutcome::AlreadyPresent(key));
        }

        if !ends_with_newline(&mut file, len).map_err(|source| self.io_err(source))? {
            file.write_all(b"\n").map_err(|source| self.io_err(source))?;
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&mut *file);
        if !self.has_header {
            writer.write_record(HEADER)?;
            tracing::info!(path = %self.path.display(), "wrote attendance header");
        }
        writer.write_record(entry.to_record())?;
        writer.flush().map_err(|source| self.io_err(source))?;
        drop(writer);

        self.has_header = true;
        self.scanned_to = self.file_len(&file)?;
        self.seen.insert(key);
        tracing::info!(
            identity = %identity,
            date = %entry.date,
            time = %entry.time,
            "attendance marked"
        );
        Ok(LogOutcome::Marked(entry))
    }

    /// All parseable rows, in file order. A missing ledger has no rows.
    pub fn entries(&self) -> Result<Vec<AttendanceEntry>, LedgerError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_err(source)),
        };
        let mut file = Flock::lock(file, FlockArg::LockShared).map_err(|(_, source)| {
            LedgerError::Lock {
                path: self.path.clone(),
                source,
            }
        })?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|source| self.io_err(source))?;

        let Some(records) = self.records(&bytes, true)? else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .filter_map(|record| {
                let entry = AttendanceEntry::from_record(record);
                if entry.is_none() {
                    self.warn_malformed(record);
                }
                entry
            })
            .collect())
    }

    pub fn entries_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEntry>, LedgerError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.date == date)
            .collect())
    }

    /// Index rows between `scanned_to` and `len`.
    ///
    /// Only the identity and date take part in deduplication, so a row whose
    /// time column was mangled (say by a spreadsheet) still counts.
    fn scan(&mut self, file: &mut File, len: u64) -> Result<(), LedgerError> {
        if len == self.scanned_to {
            return Ok(());
        }
        let from_start = self.scanned_to == 0;
        let mut bytes = Vec::with_capacity((len - self.scanned_to) as usize);
        file.seek(SeekFrom::Start(self.scanned_to))
            .map_err(|source| self.io_err(source))?;
        (&mut *file)
            .take(len - self.scanned_to)
            .read_to_end(&mut bytes)
            .map_err(|source| self.io_err(source))?;

        let records = match self.records(&bytes, from_start)? {
            Some(records) => {
                self.has_header = true;
                records
            }
            None => Vec::new(),
        };
        let before = self.seen.len();
        for record in &records {
            match dedup_key(record) {
                Some(key) => {
                    self.seen.insert(key);
                }
                None => self.warn_malformed(record),
            }
        }
        tracing::debug!(
            path = %self.path.display(),
            from = self.scanned_to,
            to = len,
            rows = records.len(),
            new_keys = self.seen.len() - before,
            "scanned ledger"
        );
        self.scanned_to = len;
        Ok(())
    }

    /// Read CSV records from `bytes`. With `with_header`, the first record
    /// must be [`HEADER`]; `None` means there was no record at all.
    fn records(
        &self,
        bytes: &[u8],
        with_header: bool,
    ) -> Result<Option<Vec<csv::StringRecord>>, LedgerError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);
        let mut records = reader.records();

        if with_header {
            match records.next() {
                Some(Ok(header)) if header_matches(&header) => {}
                Some(Ok(header)) => {
                    return Err(LedgerError::Header {
                        path: self.path.clone(),
                        found: header.iter().collect::<Vec<_>>().join(","),
                    })
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }

        let mut rows = Vec::new();
        for record in records {
            match record {
                Ok(record) => rows.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "skipping unreadable attendance row"
                ),
            }
        }
        Ok(Some(rows))
    }

    fn warn_malformed(&self, record: &csv::StringRecord) {
        tracing::warn!(
            path = %self.path.display(),
            line = ?record.position().map(|p| p.line()),
            "skipping malformed attendance row"
        );
    }

    fn file_len(&self, file: &File) -> Result<u64, LedgerError> {
        file.metadata()
            .map(|m| m.len())
            .map_err(|source| self.io_err(source))
    }

    fn io_err(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Identity and date of a row; extra or unparseable trailing columns are ignored.
fn dedup_key(record: &csv::StringRecord) -> Option<DedupKey> {
    if record.len() < 5 {
        return None;
    }
    Some(DedupKey {
        identity: Identity {
            name: record.get(0)?.to_string(),
            class: record.get(1)?.to_string(),
            roll_no: record.get(2)?.to_string(),
            section: record.get(3)?.to_string(),
        },
        date: NaiveDate::parse_from_str(record.get(4)?.trim(), DATE_FORMAT).ok()?,
    })
}

fn header_matches(record: &csv::StringRecord) -> bool {
    record.len() == HEADER.len()
        && record
            .iter()
            .zip(HEADER)
            .all(|(found, expected)| found.trim_start_matches('\u{feff}').trim() == expected)
}

fn ends_with_newline(file: &mut File, len: u64) -> io::Result<bool> {
    if len == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::Barrier;
    use std::thread;

    fn id(name: &str, class: &str, roll: &str, section: &str) -> Identity {
        Identity {
            name: name.into(),
            class: class.into(),
            roll_no: roll.into(),
            section: section.into(),
        }
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDate::parse_from_str(date, DATE_FORMAT)
            .unwrap()
            .and_time(NaiveTime::parse_from_str(time, TIME_FORMAT).unwrap())
    }

    fn data_rows(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .skip(1)
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_open_is_lazy() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let ledger = AttendanceLedger::open(&path);
        assert!(!path.exists());
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn test_new_file_gets_header_and_one_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let mut ledger = AttendanceLedger::open(&path);

        let outcome = ledger
            .log_at(&id("Bob", "6B", "7", "C"), at("2024-03-04", "08:30:15"))
            .unwrap();
        assert!(matches!(outcome, LogOutcome::Marked(_)));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Name,Class,Roll No,Section,Date,Time\nBob,6B,7,C,2024-03-04,08:30:15\n"
        );
    }

    #[test]
    fn test_existing_row_is_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let original = "Name,Class,Roll No,Section,Date,Time\nAlice,5A,12,B,2024-01-01,09:00:00\n";
        fs::write(&path, original).unwrap();

        let alice = id("Alice", "5A", "12", "B");
        let mut ledger = AttendanceLedger::open(&path);
        let outcome = ledger.log_at(&alice, at("2024-01-01", "14:00:00")).unwrap();

        assert_eq!(
            outcome,
            LogOutcome::AlreadyPresent(DedupKey {
                identity: alice,
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            })
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_twice_same_day_gives_one_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let mut ledger = AttendanceLedger::open(&path);
        let dana = id("Dana", "7", "1", "A");

        ledger.log_at(&dana, at("2024-05-05", "08:00:00")).unwrap();
        let second = ledger.log_at(&dana, at("2024-05-05", "16:00:00")).unwrap();
        assert!(matches!(second, LogOutcome::AlreadyPresent(_)));
        assert_eq!(data_rows(&path).len(), 1);
    }

    #[test]
    fn test_new_day_is_new_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let mut ledger = AttendanceLedger::open(&path);
        let dana = id("Dana", "7", "1", "A");

        ledger.log_at(&dana, at("2024-05-05", "08:00:00")).unwrap();
        let next = ledger.log_at(&dana, at("2024-05-06", "08:00:00")).unwrap();
        assert!(matches!(next, LogOutcome::Marked(_)));
        assert_eq!(data_rows(&path).len(), 2);
    }

    #[test]
    fn test_any_field_difference_is_new_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let mut ledger = AttendanceLedger::open(&path);
        let when = at("2024-05-05", "08:00:00");

        ledger.log_at(&id("Dana", "7", "1", "A"), when).unwrap();
        let other = ledger.log_at(&id("Dana", "7", "1", "B"), when).unwrap();
        assert!(matches!(other, LogOutcome::Marked(_)));
    }

    #[test]
    fn test_second_handle_sees_first_handles_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let mut a = AttendanceLedger::open(&path);
        let mut b = AttendanceLedger::open(&path);
        let when = at("2024-02-02", "10:00:00");

        assert!(matches!(
            a.log_at(&id("Eve", "8", "3", "D"), when).unwrap(),
            LogOutcome::Marked(_)
        ));
        assert!(matches!(
            b.log_at(&id("Eve", "8", "3", "D"), when).unwrap(),
            LogOutcome::AlreadyPresent(_)
        ));

        // `a` has already indexed the file; it must pick up what `b` appends.
        b.log_at(&id("Finn", "8", "4", "D"), when).unwrap();
        assert!(matches!(
            a.log_at(&id("Finn", "8", "4", "D"), when).unwrap(),
            LogOutcome::AlreadyPresent(_)
        ));
        assert_eq!(data_rows(&path).len(), 2);
    }

    #[test]
    fn test_truncated_file_rebuilds_index() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let mut ledger = AttendanceLedger::open(&path);
        let gus = id("Gus", "9", "2", "E");
        let when = at("2024-02-02", "10:00:00");

        ledger.log_at(&gus, when).unwrap();
        fs::write(&path, "").unwrap();
        let again = ledger.log_at(&gus, when).unwrap();
        assert!(matches!(again, LogOutcome::Marked(_)));
        assert_eq!(data_rows(&path).len(), 1);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        fs::write(
            &path,
            "Name,Class,Roll No,Section,Date,Time\n\
             garbage\n\
             Carl,1,2,3,not-a-date,10:00:00\n\
             Alice,5A,12,B,2024-01-01,09:00:00\n",
        )
        .unwrap();

        let mut ledger = AttendanceLedger::open(&path);
        let entries = ledger.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity.name, "Alice");

        let outcome = ledger
            .log_at(&id("Carl", "1", "2", "3"), at("2024-01-01", "11:00:00"))
            .unwrap();
        assert!(matches!(outcome, LogOutcome::Marked(_)));
    }

    #[test]
    fn test_reformatted_time_still_counts_as_present() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let original = "Name,Class,Roll No,Section,Date,Time\nAlice,5A,12,B,2024-01-01,9:00\n";
        fs::write(&path, original).unwrap();

        let mut ledger = AttendanceLedger::open(&path);
        let outcome = ledger
            .log_at(&id("Alice", "5A", "12", "B"), at("2024-01-01", "14:00:00"))
            .unwrap();
        assert!(matches!(outcome, LogOutcome::AlreadyPresent(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
        // Reports still only show rows they can fully read.
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn test_blank_file_gets_header_before_first_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        fs::write(&path, "\n").unwrap();

        let bob = id("Bob", "6B", "7", "C");
        let when = at("2024-01-01", "09:00:00");
        let first = AttendanceLedger::open(&path).log_at(&bob, when).unwrap();
        assert!(matches!(first, LogOutcome::Marked(_)));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "\nName,Class,Roll No,Section,Date,Time\nBob,6B,7,C,2024-01-01,09:00:00\n"
        );

        let mut fresh = AttendanceLedger::open(&path);
        assert!(matches!(
            fresh.log_at(&bob, when).unwrap(),
            LogOutcome::AlreadyPresent(_)
        ));
        assert_eq!(fresh.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_handles_mark_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let ivy = id("Ivy", "4", "9", "G");
        let when = at("2024-06-01", "08:00:00");
        let workers = 8;
        let barrier = Barrier::new(workers);

        let outcomes: Vec<LogOutcome> = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(|| {
                        let mut ledger = AttendanceLedger::open(&path);
                        barrier.wait();
                        ledger.log_at(&ivy, when).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let marked = outcomes
            .iter()
            .filter(|o| matches!(o, LogOutcome::Marked(_)))
            .count();
        assert_eq!(marked, 1);
        assert_eq!(data_rows(&path).len(), 1);
    }

    #[test]
    fn test_missing_trailing_newline_is_repaired() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        fs::write(
            &path,
            "Name,Class,Roll No,Section,Date,Time\nAlice,5A,12,B,2024-01-01,09:00:00",
        )
        .unwrap();

        let mut ledger = AttendanceLedger::open(&path);
        ledger
            .log_at(&id("Bob", "6B", "7", "C"), at("2024-01-01", "09:05:00"))
            .unwrap();
        assert_eq!(
            data_rows(&path),
            vec![
                "Alice,5A,12,B,2024-01-01,09:00:00".to_string(),
                "Bob,6B,7,C,2024-01-01,09:05:00".to_string(),
            ]
        );
    }

    #[test]
    fn test_header_mismatch_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        fs::write(&path, "id,when\n1,2\n").unwrap();

        let mut ledger = AttendanceLedger::open(&path);
        let err = ledger
            .log_at(&id("Bob", "6B", "7", "C"), at("2024-01-01", "09:05:00"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Header { .. }));
        assert!(matches!(ledger.entries(), Err(LedgerError::Header { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "id,when\n1,2\n");
    }

    #[test]
    fn test_fields_with_commas_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let mut ledger = AttendanceLedger::open(&path);
        let pat = id("O'Brien, Pat", "6B", "7", "C");
        let when = at("2024-01-01", "09:05:00");

        ledger.log_at(&pat, when).unwrap();
        assert!(matches!(
            AttendanceLedger::open(&path).log_at(&pat, when).unwrap(),
            LogOutcome::AlreadyPresent(_)
        ));
        assert_eq!(ledger.entries().unwrap()[0].identity, pat);
    }

    #[test]
    fn test_entries_on_filters_by_date() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let mut ledger = AttendanceLedger::open(&path);
        ledger
            .log_at(&id("A", "1", "1", "A"), at("2024-01-01", "09:00:00"))
            .unwrap();
        ledger
            .log_at(&id("B", "1", "2", "A"), at("2024-01-02", "09:00:00"))
            .unwrap();
        ledger
            .log_at(&id("C", "1", "3", "A"), at("2024-01-02", "09:30:00"))
            .unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let names: Vec<_> = ledger
            .entries_on(day)
            .unwrap()
            .into_iter()
            .map(|e| e.identity.name)
            .collect();
        assert_eq!(names, vec!["B", "C"]);
    }

    #[test]
    fn test_log_uses_whole_seconds() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = AttendanceLedger::open(tmp.path().join("attendance.csv"));
        match ledger.log(&id("Hal", "2", "5", "F")).unwrap() {
            LogOutcome::Marked(entry) => assert_eq!(entry.time.nanosecond(), 0),
            other => panic!("expected Marked, got {other:?}"),
        }
    }
}
