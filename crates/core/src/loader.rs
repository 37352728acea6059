use crate::error::LoadError;
use crate::models::{keys, FileDescriptor, Metadata, MetadataValue, Record, UnitKind};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Cell spellings treated as "no value", matched after trimming.
const MISSING_MARKERS: [&str; 15] = [
    "", "NA", "N/A", "n/a", "NaN", "nan", "-NaN", "-nan", "null", "NULL", "None", "#N/A", "#NA",
    "<NA>", "#N/A N/A",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Tabular { delimiter: u8 },
    Text,
}

impl FileKind {
    /// Recognized extensions, matched case-insensitively. Anything else is ignored.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "csv" => Some(FileKind::Tabular { delimiter: b',' }),
            "tsv" => Some(FileKind::Tabular { delimiter: b'\t' }),
            "txt" | "md" => Some(FileKind::Text),
            _ => None,
        }
    }

    pub fn is_tabular(self) -> bool {
        matches!(self, FileKind::Tabular { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub stem: String,
    pub file_type: String,
    pub kind: FileKind,
}

impl SourceFile {
    pub fn from_path(path: &Path) -> Result<Option<Self>, LoadError> {
        let Some(kind) = FileKind::from_path(path) else {
            return Ok(None);
        };
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| LoadError::MissingFileName(path.display().to_string()))?
            .to_string();
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&file_name)
            .to_string();
        let file_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        Ok(Some(Self {
            path: path.to_path_buf(),
            file_name,
            stem,
            file_type,
            kind,
        }))
    }

    fn base_metadata(&self, descriptor: &FileDescriptor, unit_kind: UnitKind) -> Metadata {
        let name_key = match unit_kind {
            UnitKind::Row => keys::TABLE_NAME,
            UnitKind::Chunk => keys::DOCUMENT_NAME,
        };
        let mut metadata = Metadata::new();
        metadata.insert(keys::SOURCE.to_string(), self.path.display().to_string().into());
        metadata.insert(keys::FILE_NAME.to_string(), self.file_name.clone().into());
        metadata.insert(keys::FILE_TYPE.to_string(), self.file_type.clone().into());
        metadata.insert(name_key.to_string(), descriptor.name.clone().into());
        metadata.insert(keys::DESCRIPTION.to_string(), descriptor.description.clone().into());
        metadata.insert(keys::UNIT_KIND.to_string(), unit_kind.as_str().into());
        metadata
    }
}

fn read_utf8(path: &Path) -> Result<String, LoadError> {
    let bytes = fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8(bytes).map_err(|_| LoadError::Encoding {
        path: path.to_path_buf(),
    })?;
    Ok(match text.strip_prefix('\u{feff}') {
        Some(stripped) => stripped.to_string(),
        None => text,
    })
}

/// Full decoded contents of a free-text file.
pub fn load_text(path: &Path) -> Result<String, LoadError> {
    read_utf8(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Float,
    Text,
}

#[derive(Debug)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    kinds: Vec<ColumnKind>,
}

impl Table {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// `"column: value"` lines for the present cells of row `index`.
    pub fn render_row(&self, index: usize) -> String {
        let Some(row) = self.rows.get(index) else {
            return String::new();
        };
        self.headers
            .iter()
            .zip(row)
            .zip(&self.kinds)
            .filter_map(|((header, cell), kind)| {
                cell.as_deref()
                    .map(|value| format!("{header}: {}", render_value(value, *kind)))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn is_missing(raw: &str) -> bool {
    MISSING_MARKERS.contains(&raw.trim())
}

fn infer_kind<'a>(values: impl Iterator<Item = &'a str>) -> ColumnKind {
    let mut kind = ColumnKind::Integer;
    for value in values {
        let value = value.trim();
        if kind == ColumnKind::Integer && value.parse::<i64>().is_ok() {
            continue;
        }
        if value.parse::<f64>().is_ok_and(f64::is_finite) {
            kind = ColumnKind::Float;
            continue;
        }
        return ColumnKind::Text;
    }
    kind
}

fn render_value(raw: &str, kind: ColumnKind) -> String {
    match kind {
        ColumnKind::Integer => raw
            .trim()
            .parse::<i64>()
            .map(|value| value.to_string())
            .unwrap_or_else(|_| raw.to_string()),
        ColumnKind::Float => match raw.trim().parse::<f64>() {
            Ok(value) if value.fract() == 0.0 && value.abs() < 1e15 => format!("{value:.1}"),
            Ok(value) => value.to_string(),
            Err(_) => raw.to_string(),
        },
        ColumnKind::Text => raw.to_string(),
    }
}

pub fn load_table(path: &Path, delimiter: u8) -> Result<Table, LoadError> {
    let text = read_utf8(path)?;
    let table_error = |details: String| LoadError::Table {
        path: path.to_path_buf(),
        details,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|error| table_error(error.to_string()))?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();
    if headers.iter().all(String::is_empty) {
        return Err(table_error("no columns to parse".to_string()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|error| table_error(error.to_string()))?;
        // Short rows leave their trailing cells missing; long rows are malformed.
        if record.len() > headers.len() {
            let line = record.position().map_or(0, |position| position.line());
            return Err(table_error(format!(
                "line {line} has {} fields, header has {}",
                record.len(),
                headers.len()
            )));
        }
        rows.push(
            record
                .iter()
                .map(|cell| (!is_missing(cell)).then(|| cell.to_string()))
                .collect::<Vec<_>>(),
        );
    }

    let kinds = (0..headers.len())
        .map(|column| {
            infer_kind(
                rows.iter()
                    .filter_map(|row: &Vec<Option<String>>| row.get(column)?.as_deref()),
            )
        })
        .collect();

    Ok(Table {
        headers,
        rows,
        kinds,
    })
}

/// One record per table row, in file order.
pub fn tabular_records(
    source: &SourceFile,
    descriptor: &FileDescriptor,
    delimiter: u8,
) -> Result<Vec<Record>, LoadError> {
    let table = load_table(&source.path, delimiter)?;
    let total_rows = table.row_count();

    Ok((0..total_rows)
        .map(|row_index| {
            let content = table.render_row(row_index);
            let mut metadata = source.base_metadata(descriptor, UnitKind::Row);
            metadata.insert(keys::ROW_INDEX.to_string(), MetadataValue::from(row_index));
            metadata.insert(keys::TOTAL_ROWS.to_string(), MetadataValue::from(total_rows));
            Record {
                id: make_record_id(&source.file_name, UnitKind::Row, row_index, &content),
                content,
                metadata,
            }
        })
        .collect())
}

/// One record per chunk, in chunk order.
pub fn chunk_records(
    source: &SourceFile,
    descriptor: &FileDescriptor,
    chunks: Vec<String>,
) -> Vec<Record> {
    let total_chunks = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(chunk_index, content)| {
            let mut metadata = source.base_metadata(descriptor, UnitKind::Chunk);
            metadata.insert(keys::CHUNK_INDEX.to_string(), MetadataValue::from(chunk_index));
            metadata.insert(keys::TOTAL_CHUNKS.to_string(), MetadataValue::from(total_chunks));
            Record {
                id: make_record_id(&source.file_name, UnitKind::Chunk, chunk_index, &content),
                content,
                metadata,
            }
        })
        .collect()
}

fn make_record_id(file_name: &str, kind: UnitKind, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn descriptor() -> FileDescriptor {
        FileDescriptor {
            name: "People".to_string(),
            description: "Staff list".to_string(),
        }
    }

    fn source(path: &Path) -> SourceFile {
        SourceFile::from_path(path)
            .expect("named file")
            .expect("recognized kind")
    }

    #[test]
    fn kinds_are_recognized_by_extension() {
        assert_eq!(
            FileKind::from_path(Path::new("a.CSV")),
            Some(FileKind::Tabular { delimiter: b',' })
        );
        assert_eq!(
            FileKind::from_path(Path::new("a.tsv")),
            Some(FileKind::Tabular { delimiter: b'\t' })
        );
        assert_eq!(FileKind::from_path(Path::new("notes.txt")), Some(FileKind::Text));
        assert_eq!(FileKind::from_path(Path::new("image.png")), None);
        assert_eq!(FileKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn rows_render_present_fields_only() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("people.csv");
        fs::write(&path, "name,city,age\nA,Moscow,30\nB,,NaN\n")?;

        let records = tabular_records(&source(&path), &descriptor(), b',')?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "name: A\ncity: Moscow\nage: 30");
        assert_eq!(records[1].content, "name: B");
        assert_eq!(records[1].meta_int(keys::ROW_INDEX), Some(1));
        assert_eq!(records[1].meta_int(keys::TOTAL_ROWS), Some(2));
        assert_eq!(records[0].unit_kind(), Some(UnitKind::Row));
        assert_eq!(records[0].meta_str(keys::TABLE_NAME), Some("People"));
        assert_eq!(records[0].meta_str(keys::FILE_TYPE), Some("csv"));
        Ok(())
    }

    #[test]
    fn float_columns_keep_a_fractional_part() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("prices.csv");
        fs::write(&path, "service,price\ncut,1500\ncolour,2499.5\n")?;

        let records = tabular_records(&source(&path), &descriptor(), b',')?;
        assert_eq!(records[0].content, "service: cut\nprice: 1500.0");
        assert_eq!(records[1].content, "service: colour\nprice: 2499.5");
        Ok(())
    }

    #[test]
    fn tab_separated_files_are_supported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("studios.tsv");
        fs::write(&path, "studio\tmetro\nArbat\tSmolenskaya\n")?;

        let records = tabular_records(&source(&path), &descriptor(), b'\t')?;
        assert_eq!(records[0].content, "studio: Arbat\nmetro: Smolenskaya");
        Ok(())
    }

    #[test]
    fn short_rows_leave_trailing_fields_missing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("contacts.csv");
        fs::write(&path, "name,city,phone\nA,Moscow,123\nB,SPB\n")?;

        let records = tabular_records(&source(&path), &descriptor(), b',')?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "name: A\ncity: Moscow\nphone: 123");
        assert_eq!(records[1].content, "name: B\ncity: SPB");
        Ok(())
    }

    #[test]
    fn rows_longer_than_the_header_are_a_load_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.csv");
        fs::write(&path, "a,b\n1,2,3\n")?;

        let result = tabular_records(&source(&path), &descriptor(), b',');
        assert!(matches!(result, Err(LoadError::Table { .. })));
        Ok(())
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("latin.txt");
        fs::write(&path, [0x66u8, 0x6f, 0xff, 0xfe])?;

        assert!(matches!(load_text(&path), Err(LoadError::Encoding { .. })));
        Ok(())
    }

    #[test]
    fn empty_table_file_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.csv");
        fs::write(&path, "")?;

        assert!(tabular_records(&source(&path), &descriptor(), b',').is_err());
        Ok(())
    }

    #[test]
    fn byte_order_mark_is_stripped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("bom.csv");
        fs::write(&path, "\u{feff}name\nA\n")?;

        let records = tabular_records(&source(&path), &descriptor(), b',')?;
        assert_eq!(records[0].content, "name: A");
        Ok(())
    }

    #[test]
    fn chunk_records_carry_position_metadata() {
        let source = source(Path::new("/kb/faq.txt"));
        let records = chunk_records(
            &source,
            &descriptor(),
            vec!["first".to_string(), "second".to_string()],
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].meta_int(keys::CHUNK_INDEX), Some(1));
        assert_eq!(records[1].meta_int(keys::TOTAL_CHUNKS), Some(2));
        assert_eq!(records[0].meta_str(keys::DOCUMENT_NAME), Some("People"));
        assert_eq!(records[0].unit_kind(), Some(UnitKind::Chunk));
        assert_ne!(records[0].id, records[1].id);
    }

    #[test]
    fn record_ids_are_stable() {
        let first = make_record_id("a.csv", UnitKind::Row, 3, "name: A");
        let second = make_record_id("a.csv", UnitKind::Row, 3, "name: A");
        assert_eq!(first, second);
        assert_ne!(first, make_record_id("a.csv", UnitKind::Row, 4, "name: A"));
    }
}
