// src/ledger.rs
// Persistent record of when each episode was last listened to and where to resume it

use crate::error::AppError;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const LEDGER_FILENAME: &str = "cache.db";
pub const LEDGER_HEADER: &str = "# This is the podbit cache.db file
# It contains the last consumption time for the listed media to allow for cache cleanouts
# Do not modify by hand";

/// Timestamp stored for tombstoned entries
const PRUNED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct LedgerEntry {
    /// Unix time the episode was last played or finished, negative once pruned
    finished: i64,
    /// Seconds into the media to resume from, zero to start over
    resume: u64,
}

impl LedgerEntry {
    fn is_pruned(&self) -> bool {
        self.finished < 0
    }
}

/// The ResumeLedger (cache.db) maps episode paths to the time they were last
/// listened to plus a resume offset. It drives cache cleanouts and lets
/// playback continue where the listener left off.
///
/// The file is owned by podbit: it is read once at startup and written back
/// at exit. Each data line is `<path> <unix-timestamp>[ <resume-seconds>]`;
/// `#` lines are comments. Pruned entries are kept in memory with a negative
/// timestamp and are never written out.
#[derive(Debug)]
pub struct ResumeLedger {
    path: PathBuf,
    db: RwLock<BTreeMap<PathBuf, LedgerEntry>>,
}

impl ResumeLedger {
    /// Load the ledger at `path`, creating an empty one if it does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let ledger = Self {
            path: path.clone(),
            db: RwLock::new(BTreeMap::new()),
        };

        if !path.exists() {
            debug!("Creating new ledger at {}", path.display());
            fs::write(&path, format!("{}\n", LEDGER_HEADER))?;
            return Ok(ledger);
        }

        let content = fs::read_to_string(&path)?;
        {
            let mut db = ledger.db.write();
            for (idx, line) in content.lines().enumerate() {
                let line = line.trim_end();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                let (key, entry) = parse_line(line, idx + 1)?;

                // Duplicates keep the later stamp
                if let Some(existing) = db.get(&key) {
                    if existing.finished >= entry.finished {
                        continue;
                    }
                }
                db.insert(key, entry);
            }
            debug!("Loaded {} ledger entries from {}", db.len(), path.display());
        }

        Ok(ledger)
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries, pruned ones included
    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.read().is_empty()
    }

    /// Rewrite the backing file from memory, skipping pruned entries
    pub fn save(&self) -> Result<(), AppError> {
        let mut out = String::from(LEDGER_HEADER);
        out.push_str("\n\n");

        {
            let db = self.db.read();
            for (path, entry) in db.iter().filter(|(_, e)| !e.is_pruned()) {
                // Always three fields, see parse_line
                out.push_str(&format!(
                    "{} {} {}\n",
                    path.display(),
                    entry.finished,
                    entry.resume
                ));
            }
        }

        fs::write(&self.path, out)?;
        debug!("Ledger saved to {}", self.path.display());
        Ok(())
    }

    /// Record now as the last listen time and reset the resume offset.
    /// Refuses paths which do not exist on disk.
    pub fn touch<P: AsRef<Path>>(&self, path: P) -> Result<(), AppError> {
        let path = path.as_ref();
        fs::metadata(path)?;

        self.db.write().insert(
            path.to_path_buf(),
            LedgerEntry {
                finished: Utc::now().timestamp(),
                resume: 0,
            },
        );
        Ok(())
    }

    /// Set the resume offset, keeping the recorded timestamp. A later
    /// [`touch`](Self::touch) resets the offset again.
    pub fn resume<P: AsRef<Path>>(&self, path: P, seconds: u64) -> Result<(), AppError> {
        let path = path.as_ref();
        fs::metadata(path)?;

        let mut db = self.db.write();
        let entry = db.entry(path.to_path_buf()).or_default();
        entry.resume = seconds;
        Ok(())
    }

    /// Insert a fresh entry with the given timestamp
    pub fn insert<P: AsRef<Path>>(&self, path: P, stamp: i64) -> Result<(), AppError> {
        if stamp < 0 {
            return Err(AppError::InvalidTimestamp(stamp));
        }

        let mut db = self.db.write();
        let path = path.as_ref();
        if db.contains_key(path) {
            return Err(AppError::EntryExists);
        }

        db.insert(
            path.to_path_buf(),
            LedgerEntry {
                finished: stamp,
                resume: 0,
            },
        );
        Ok(())
    }

    /// Tombstone an entry so it is excluded from the next save.
    /// Pruning twice is an error.
    pub fn prune<P: AsRef<Path>>(&self, path: P) -> Result<(), AppError> {
        let mut db = self.db.write();
        let entry = db.get_mut(path.as_ref()).ok_or(AppError::NoEntry)?;

        if entry.is_pruned() {
            return Err(AppError::Pruned);
        }

        *entry = LedgerEntry {
            finished: PRUNED,
            resume: 0,
        };
        Ok(())
    }

    /// Raw unix timestamp and resume offset of an entry
    pub fn raw_stat<P: AsRef<Path>>(&self, path: P) -> Result<(i64, u64), AppError> {
        let db = self.db.read();
        let entry = db.get(path.as_ref()).ok_or(AppError::NoEntry)?;

        if entry.is_pruned() {
            return Err(AppError::Pruned);
        }
        Ok((entry.finished, entry.resume))
    }

    /// Like [`raw_stat`](Self::raw_stat) with the timestamp as a date
    pub fn stat<P: AsRef<Path>>(&self, path: P) -> Result<(DateTime<Utc>, u64), AppError> {
        let (stamp, resume) = self.raw_stat(path)?;
        let when = Utc
            .timestamp_opt(stamp, 0)
            .single()
            .ok_or_else(|| AppError::General(format!("timestamp {} out of range", stamp)))?;
        Ok((when, resume))
    }

    /// Every live entry as `(path, finished stamp, resume offset)`, sorted by path
    pub fn entries(&self) -> Vec<(PathBuf, i64, u64)> {
        self.db
            .read()
            .iter()
            .filter(|(_, e)| !e.is_pruned())
            .map(|(p, e)| (p.clone(), e.finished, e.resume))
            .collect()
    }
}

/// Parse one data line. The path may contain spaces, so the numeric fields
/// are taken from the right.
///
/// [`ResumeLedger::save`] always writes both numbers. Older two-field lines
/// whose path ends in a number are ambiguous; they are read as two-field
/// lines only when that reading names a file on disk and the three-field
/// reading does not.
fn parse_line(line: &str, number: usize) -> Result<(PathBuf, LedgerEntry), AppError> {
    let syntax = |comment: String| AppError::LedgerSyntax {
        line: number,
        comment,
    };

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(syntax("insufficient fields (expect 2/3)".to_string()));
    }

    let n = fields.len();
    let short = fields[n - 1]
        .parse::<i64>()
        .map(|finished| {
            let path = PathBuf::from(rest_of_line(line, &fields[..n - 1]));
            (path, LedgerEntry { finished, resume: 0 })
        })
        .map_err(|e| syntax(format!("parsing timestamp: {}", e)));

    if n >= 3 {
        let numbers = (fields[n - 2].parse::<i64>(), fields[n - 1].parse::<u64>());
        if let (Ok(finished), Ok(resume)) = numbers {
            let path = PathBuf::from(rest_of_line(line, &fields[..n - 2]));
            match short {
                Ok(short) if !path.exists() && short.0.exists() => return Ok(short),
                _ => return Ok((path, LedgerEntry { finished, resume })),
            }
        }
    }

    short
}

/// The original text spanned by the leading `fields`
fn rest_of_line<'a>(line: &'a str, fields: &[&str]) -> &'a str {
    match fields.last() {
        Some(last) => {
            let end = last.as_ptr() as usize - line.as_ptr() as usize + last.len();
            line[..end].trim_start()
        }
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn media(dir: &TempDir, name: &str) -> PathBuf {
        let p = dir.path().join(name);
        fs::write(&p, b"audio").unwrap();
        p
    }

    #[test]
    fn test_open_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join(LEDGER_FILENAME);

        let ledger = ResumeLedger::open(&db).unwrap();
        assert!(ledger.is_empty());
        assert!(fs::read_to_string(&db).unwrap().starts_with("# This is the podbit"));
    }

    #[test]
    fn test_open_parses_entries_and_keeps_later_duplicate() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join(LEDGER_FILENAME);
        fs::write(
            &db,
            "# comment\n\n/a.mp3 100\n/b c.mp3 200 42\n/a.mp3 300\n/a.mp3 50\n",
        )
        .unwrap();

        let ledger = ResumeLedger::open(&db).unwrap();
        assert_eq!(ledger.raw_stat("/a.mp3").unwrap(), (300, 0));
        assert_eq!(ledger.raw_stat("/b c.mp3").unwrap(), (200, 42));
    }

    #[test]
    fn test_open_reports_line_of_syntax_error() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join(LEDGER_FILENAME);
        fs::write(&db, "# header\n/a.mp3 100\n/b.mp3 notanumber\n").unwrap();

        match ResumeLedger::open(&db) {
            Err(AppError::LedgerSyntax { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_resume_preserves_timestamp() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::open(dir.path().join(LEDGER_FILENAME)).unwrap();
        let ep = media(&dir, "ep.mp3");

        ledger.insert(&ep, 1_600_000_000).unwrap();
        for offset in [0u64, 1, 3599, u64::MAX] {
            ledger.resume(&ep, offset).unwrap();
            assert_eq!(ledger.raw_stat(&ep).unwrap(), (1_600_000_000, offset));
        }
    }

    #[test]
    fn test_touch_resets_offset_and_rejects_missing_files() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::open(dir.path().join(LEDGER_FILENAME)).unwrap();
        let ep = media(&dir, "ep.mp3");

        ledger.resume(&ep, 90).unwrap();
        ledger.touch(&ep).unwrap();
        let (stamp, resume) = ledger.raw_stat(&ep).unwrap();
        assert!(stamp > 0);
        assert_eq!(resume, 0);

        assert!(ledger.touch(dir.path().join("missing.mp3")).is_err());
        assert!(ledger.resume(dir.path().join("missing.mp3"), 5).is_err());
    }

    #[test]
    fn test_prune_is_exactly_once() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::open(dir.path().join(LEDGER_FILENAME)).unwrap();

        ledger.insert("/ep.mp3", 1000).unwrap();
        assert!(ledger.prune("/ep.mp3").is_ok());
        assert!(matches!(ledger.prune("/ep.mp3"), Err(AppError::Pruned)));
        assert!(matches!(ledger.raw_stat("/ep.mp3"), Err(AppError::Pruned)));
        assert!(matches!(ledger.stat("/ep.mp3"), Err(AppError::Pruned)));
        assert!(matches!(ledger.prune("/other.mp3"), Err(AppError::NoEntry)));
        assert!(matches!(ledger.raw_stat("/other.mp3"), Err(AppError::NoEntry)));
    }

    #[test]
    fn test_insert_rejects_negative_and_existing() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::open(dir.path().join(LEDGER_FILENAME)).unwrap();

        assert!(matches!(
            ledger.insert("/ep.mp3", -5),
            Err(AppError::InvalidTimestamp(-5))
        ));
        ledger.insert("/ep.mp3", 10).unwrap();
        assert!(matches!(ledger.insert("/ep.mp3", 20), Err(AppError::EntryExists)));
        assert_eq!(ledger.raw_stat("/ep.mp3").unwrap(), (10, 0));
    }

    #[test]
    fn test_save_skips_pruned_and_reloads() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join(LEDGER_FILENAME);
        let ledger = ResumeLedger::open(&db).unwrap();
        let kept = media(&dir, "kept.mp3");

        ledger.insert(&kept, 500).unwrap();
        ledger.resume(&kept, 77).unwrap();
        ledger.insert("/gone.mp3", 600).unwrap();
        ledger.prune("/gone.mp3").unwrap();
        ledger.save().unwrap();

        let text = fs::read_to_string(&db).unwrap();
        assert!(!text.contains("gone.mp3"));
        assert!(!text.contains(" -1"));

        let reloaded = ResumeLedger::open(&db).unwrap();
        assert_eq!(reloaded.raw_stat(&kept).unwrap(), (500, 77));
        assert!(matches!(reloaded.raw_stat("/gone.mp3"), Err(AppError::NoEntry)));
    }

    #[test]
    fn test_paths_ending_in_numbers_survive_a_save() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join(LEDGER_FILENAME);
        let ledger = ResumeLedger::open(&db).unwrap();
        let show = dir.path().join("Show 2024");

        ledger.insert(&show, 1_700_000_000).unwrap();
        ledger.save().unwrap();

        let reloaded = ResumeLedger::open(&db).unwrap();
        assert_eq!(reloaded.raw_stat(&show).unwrap(), (1_700_000_000, 0));
        assert!(matches!(reloaded.raw_stat(dir.path().join("Show")), Err(AppError::NoEntry)));
    }

    #[test]
    fn test_short_line_for_existing_numbered_file() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join(LEDGER_FILENAME);
        let show = media(&dir, "Show 2024");
        fs::write(&db, format!("# old file\n{} 1700000000\n", show.display())).unwrap();

        let ledger = ResumeLedger::open(&db).unwrap();
        assert_eq!(ledger.raw_stat(&show).unwrap(), (1_700_000_000, 0));
    }
}
