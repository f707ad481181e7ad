use crate::output::csv_row;
use csv_core::ReadFieldResult;
use jiff::Zoned;
use jiff::civil::Date;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One sample: field name to its value, if there is one.
pub type Record = BTreeMap<String, Option<String>>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not create the data directory at {1:?}")]
    CreateDirectory(#[source] std::io::Error, PathBuf),
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("could not read the header of {1:?}")]
    ReadHeader(#[source] std::io::Error, PathBuf),
    #[error("could not write to {1:?}")]
    Write(#[source] std::io::Error, PathBuf),
}

pub trait Storage: Send {
    /// Persist one sample. An error means this sample is lost, later ones may still succeed.
    fn store(&mut self, record: &Record) -> Result<(), Error>;
}

/// Appends samples to one CSV file per calendar day, `<directory>/YYYY-MM-DD.csv`.
///
/// The column order is fixed by the first record stored, or by the header of a file that
/// already exists for the day. Fields missing from a record are left empty; fields not in the
/// header are not stored.
pub struct CsvStorage {
    directory: PathBuf,
    fields: Option<Vec<String>>,
}

impl CsvStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, Error> {
        let directory = directory.into();
        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| Error::CreateDirectory(e, directory.clone()))?;
            info!(?directory, "created the data directory");
        }
        if !directory.is_dir() {
            return Err(Error::NotADirectory(directory));
        }
        Ok(Self { directory, fields: None })
    }

    pub fn path_for(&self, date: Date) -> PathBuf {
        self.directory.join(format!("{date}.csv"))
    }

    pub fn store_on(&mut self, date: Date, record: &Record) -> Result<(), Error> {
        let path = self.path_for(date);
        let needs_header = match std::fs::metadata(&path) {
            Ok(metadata) => metadata.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(Error::ReadHeader(e, path)),
        };
        if self.fields.is_none() && !needs_header {
            let contents = std::fs::read(&path).map_err(|e| Error::ReadHeader(e, path.clone()))?;
            self.fields = Some(parse_header(&contents)).filter(|header| !header.is_empty());
        }
        let fields = &*self.fields.get_or_insert_with(|| record.keys().cloned().collect());
        let mut data = Vec::new();
        if needs_header {
            data.extend(csv_row(fields));
        }
        let row = fields
            .iter()
            .map(|f| record.get(f).cloned().flatten().unwrap_or_default())
            .collect::<Vec<_>>();
        data.extend(csv_row(&row));
        if let Some(extra) = record.keys().find(|k| !fields.contains(k)) {
            debug!(field = extra, ?path, "record has fields the file has no column for");
        }
        append(&path, &data)
    }
}

impl Storage for CsvStorage {
    fn store(&mut self, record: &Record) -> Result<(), Error> {
        self.store_on(Zoned::now().date(), record)
    }
}

fn append(path: &Path, data: &[u8]) -> Result<(), Error> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Write(e, path.into()))?;
    file.write_all(data).map_err(|e| Error::Write(e, path.into()))
}

/// Fields of the first CSV record in `data`.
fn parse_header(data: &[u8]) -> Vec<String> {
    let mut reader = csv_core::Reader::new();
    let mut input = data;
    let mut output = [0; 1024];
    let mut field = Vec::new();
    let mut fields = Vec::new();
    loop {
        let (result, read, written) = reader.read_field(input, &mut output);
        input = &input[read..];
        field.extend_from_slice(&output[..written]);
        match result {
            ReadFieldResult::InputEmpty | ReadFieldResult::OutputFull => {}
            ReadFieldResult::Field { record_end } => {
                fields.push(String::from_utf8_lossy(&field).into_owned());
                field.clear();
                if record_end {
                    return fields;
                }
            }
            ReadFieldResult::End => return fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[(&str, Option<&str>)]) -> Record {
        fields.iter().map(|(k, v)| (k.to_string(), v.map(str::to_string))).collect()
    }

    fn day(d: i8) -> Date {
        jiff::civil::date(2024, 2, d)
    }

    #[test]
    fn creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data").join("nested");
        CsvStorage::new(&dir).unwrap();
        assert!(dir.is_dir());

        let file = tmp.path().join("file");
        std::fs::write(&file, "").unwrap();
        assert!(matches!(CsvStorage::new(&file), Err(Error::NotADirectory(_))));
    }

    #[test]
    fn header_once_per_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut storage = CsvStorage::new(tmp.path()).unwrap();
        storage.store_on(day(1), &record(&[("b", Some("1")), ("a", Some("x,y"))])).unwrap();
        storage.store_on(day(1), &record(&[("a", Some("2")), ("b", None)])).unwrap();
        storage.store_on(day(2), &record(&[("a", Some("3")), ("b", Some("4"))])).unwrap();

        let first = std::fs::read_to_string(tmp.path().join("2024-02-01.csv")).unwrap();
        assert_eq!(first, "a,b\n\"x,y\",1\n2,\n");
        let second = std::fs::read_to_string(tmp.path().join("2024-02-02.csv")).unwrap();
        assert_eq!(second, "a,b\n3,4\n");
    }

    #[test]
    fn existing_header_decides_the_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("2024-02-01.csv"), "b,a\n1,2\n").unwrap();
        let mut storage = CsvStorage::new(tmp.path()).unwrap();
        storage.store_on(day(1), &record(&[("a", Some("3")), ("b", Some("4")), ("c", Some("5"))])).unwrap();
        let contents = std::fs::read_to_string(tmp.path().join("2024-02-01.csv")).unwrap();
        assert_eq!(contents, "b,a\n1,2\n4,3\n");
    }

    #[test]
    fn empty_existing_file_gets_a_header() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("2024-02-01.csv"), "").unwrap();
        let mut storage = CsvStorage::new(tmp.path()).unwrap();
        storage.store_on(day(1), &record(&[("a", Some("1"))])).unwrap();
        let contents = std::fs::read_to_string(tmp.path().join("2024-02-01.csv")).unwrap();
        assert_eq!(contents, "a\n1\n");
    }

    #[test]
    fn parses_quoted_header() {
        assert_eq!(parse_header(b"\"a,b\",c\r\n1,2\r\n"), ["a,b", "c"]);
        assert_eq!(parse_header(b"only"), ["only"]);
        assert!(parse_header(b"").is_empty());
    }
}
