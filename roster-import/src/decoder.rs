//! Tabular decoder
//!
//! Turns raw spreadsheet bytes into [`CandidateRecord`]s using a
//! header-driven column map.
//!
//! Accepted inputs:
//! - Workbooks (XLSX, XLS, XLSB, ODS), first worksheet only, read with calamine
//! - Delimited text (comma, semicolon, tab or pipe, sniffed from the first lines)
//!
//! The first row is the header row, even in a workbook whose first row is
//! blank. Header cells are trimmed and matched case-insensitively against
//! each [`ColumnSpec::label`]. Rows with an empty required cell are skipped
//! and counted; they never fail the batch.
//!
//! Decoding is pure: the same bytes always produce the same [`DecodedBatch`].

use crate::error::ImportError;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use roster_common::config::ColumnLabels;
use serde::Serialize;
use std::io::Cursor;
use tracing::debug;

/// Logical field of a candidate record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    NationalId,
    LocalId,
    GroupName,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::NationalId => "national_id",
            Field::LocalId => "local_id",
            Field::GroupName => "group_name",
        }
    }
}

/// One entry of a schema descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub field: Field,
    /// Header text this column is recognized by
    pub label: String,
    pub required: bool,
}

impl ColumnSpec {
    pub fn required(field: Field, label: impl Into<String>) -> Self {
        Self {
            field,
            label: label.into(),
            required: true,
        }
    }

    pub fn optional(field: Field, label: impl Into<String>) -> Self {
        Self {
            field,
            label: label.into(),
            required: false,
        }
    }
}

/// Ordered schema descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    /// Student import: all four columns required
    pub fn students(labels: &ColumnLabels) -> Self {
        Self::new(vec![
            ColumnSpec::required(Field::Name, &labels.name),
            ColumnSpec::required(Field::NationalId, &labels.national_id),
            ColumnSpec::required(Field::LocalId, &labels.local_id),
            ColumnSpec::required(Field::GroupName, &labels.group_name),
        ])
    }

    /// Class-list import: a single class-name column
    pub fn classes(label: &str) -> Self {
        Self::new(vec![ColumnSpec::required(Field::GroupName, label)])
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }
}

/// A decoded row; exists only between decoding and planning
///
/// Fields not present in the schema stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandidateRecord {
    pub name: String,
    pub national_id: String,
    pub local_id: String,
    pub group_name: String,
}

impl CandidateRecord {
    pub fn new(
        name: impl Into<String>,
        national_id: impl Into<String>,
        local_id: impl Into<String>,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            national_id: national_id.into(),
            local_id: local_id.into(),
            group_name: group_name.into(),
        }
    }

    fn set(&mut self, field: Field, value: String) {
        match field {
            Field::Name => self.name = value,
            Field::NationalId => self.national_id = value,
            Field::LocalId => self.local_id = value,
            Field::GroupName => self.group_name = value,
        }
    }
}

/// Decoder output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    /// Complete records in row order
    pub records: Vec<CandidateRecord>,
    /// Rows dropped because a required cell was empty
    pub skipped_rows: usize,
}

type RowResult = Result<Vec<String>, ImportError>;

/// Decode a spreadsheet buffer against a schema
pub fn decode(bytes: &[u8], schema: &TableSchema) -> Result<DecodedBatch, ImportError> {
    if is_workbook(bytes) {
        decode_rows(read_workbook(bytes)?.into_iter().map(Ok), schema)
    } else {
        decode_rows(read_delimited(bytes), schema)
    }
}

fn decode_rows<I>(mut rows: I, schema: &TableSchema) -> Result<DecodedBatch, ImportError>
where
    I: Iterator<Item = RowResult>,
{
    let header = rows.next().transpose()?.unwrap_or_default();
    let column_map = map_columns(&header, schema)?;

    let mut records = Vec::new();
    let mut skipped_rows = 0;

    for (offset, row) in rows.enumerate() {
        let row = row?;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }

        match build_record(&row, &column_map) {
            Ok(record) => records.push(record),
            Err(missing) => {
                // Header is row 1
                debug!(
                    row = offset + 2,
                    field = missing.as_str(),
                    "Skipping row with empty required field"
                );
                skipped_rows += 1;
            }
        }
    }

    if records.is_empty() {
        return Err(ImportError::EmptyBatch);
    }

    Ok(DecodedBatch {
        records,
        skipped_rows,
    })
}

/// Resolve each schema column to a header position
///
/// Fails before any data row is looked at when a required label is absent.
fn map_columns<'s>(
    header: &[String],
    schema: &'s TableSchema,
) -> Result<Vec<(&'s ColumnSpec, Option<usize>)>, ImportError> {
    let normalized: Vec<String> = header
        .iter()
        .map(|cell| cell.trim().to_lowercase())
        .collect();

    let mut mapping = Vec::with_capacity(schema.columns().len());
    let mut missing = Vec::new();

    for spec in schema.columns() {
        let wanted = spec.label.trim().to_lowercase();
        let position = normalized.iter().position(|cell| *cell == wanted);
        if position.is_none() && spec.required {
            missing.push(spec.label.clone());
        }
        mapping.push((spec, position));
    }

    if !missing.is_empty() {
        return Err(ImportError::SchemaMismatch { missing });
    }

    Ok(mapping)
}

/// Fill a record from one row, or name the first required field left empty
fn build_record(
    row: &[String],
    column_map: &[(&ColumnSpec, Option<usize>)],
) -> Result<CandidateRecord, Field> {
    let mut record = CandidateRecord::default();
    for (spec, position) in column_map {
        let value = position
            .and_then(|i| row.get(i))
            .map(|cell| cell.trim())
            .unwrap_or("");
        if spec.required && value.is_empty() {
            return Err(spec.field);
        }
        record.set(spec.field, value.to_string());
    }
    Ok(record)
}

/// ZIP (xlsx, ods, xlsb) or OLE2 (xls) container signature
fn is_workbook(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0])
}

fn read_workbook(bytes: &[u8]) -> Result<Vec<Vec<String>>, ImportError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| ImportError::Unreadable(format!("Failed to open workbook: {}", e)))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ImportError::Unreadable("Worksheet not found in workbook".to_string()))?
        .map_err(|e| ImportError::Unreadable(format!("Failed to read worksheet: {}", e)))?;

    // calamine trims leading empty rows and columns; put them back so the
    // header is always the sheet's first row
    let (first_row, first_col) = range.start().unwrap_or((0, 0));
    let padding = first_col as usize;

    let mut rows: Vec<Vec<String>> = vec![Vec::new(); first_row as usize];
    rows.extend(range.rows().map(|row| {
        std::iter::repeat(String::new())
            .take(padding)
            .chain(row.iter().map(cell_text))
            .collect()
    }));
    Ok(rows)
}

/// Render a workbook cell the way a user typed it
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        // Identifier columns are often stored as numbers: 111.0 must read as "111"
        Data::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Data::Float(n) => n.to_string(),
        Data::Int(n) => n.to_string(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
    }
}

fn read_delimited(bytes: &[u8]) -> impl Iterator<Item = RowResult> {
    let text = text_from_bytes(bytes);
    let delimiter = sniff_delimiter(&text);

    let reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(text.into_bytes()));

    reader.into_records().map(|record| {
        record
            .map(|r| r.iter().map(|field| field.trim().to_string()).collect())
            .map_err(|e| ImportError::Unreadable(format!("Malformed delimited text: {}", e)))
    })
}

/// UTF-8 (BOM stripped) with a Windows-1252 fallback for legacy Excel exports
fn text_from_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Pick the delimiter giving the most consistent field count over the first lines
fn sniff_delimiter(text: &str) -> u8 {
    const CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];

    let sample: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(10)
        .collect();

    let mut best = b',';
    let mut best_score = 0usize;

    for delimiter in CANDIDATES {
        let counts: Vec<usize> = sample
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delimiter)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        let Some(&first) = counts.first() else {
            break;
        };
        if first <= 1 {
            continue;
        }

        let consistent = counts.iter().filter(|&&c| c == first).count();
        let score = consistent * first;
        if score > best_score {
            best_score = score;
            best = delimiter;
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student_schema() -> TableSchema {
        TableSchema::students(&ColumnLabels::default())
    }

    fn xlsx(rows: &[&[&str]]) -> Vec<u8> {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                sheet.write_string(r as u32, c as u16, *value).unwrap();
            }
        }
        workbook.save_to_buffer().unwrap()
    }

    #[test]
    fn test_decode_csv_in_row_order() {
        let input = b"Name,NationalId,LocalId,GroupName\nAna,111,S1,10A\nBudi,222,S2,10B\n";
        let batch = decode(input, &student_schema()).unwrap();

        assert_eq!(
            batch.records,
            vec![
                CandidateRecord::new("Ana", "111", "S1", "10A"),
                CandidateRecord::new("Budi", "222", "S2", "10B"),
            ]
        );
        assert_eq!(batch.skipped_rows, 0);
    }

    #[test]
    fn test_header_match_is_trimmed_and_case_insensitive() {
        let input = b"  group name , NATIONALID,localid ,name\n10A,111,S1,Ana\n";
        let schema = TableSchema::new(vec![
            ColumnSpec::required(Field::Name, "Name"),
            ColumnSpec::required(Field::NationalId, "NationalId"),
            ColumnSpec::required(Field::LocalId, "LocalId"),
            ColumnSpec::required(Field::GroupName, "Group Name"),
        ]);

        let batch = decode(input, &schema).unwrap();
        assert_eq!(batch.records, vec![CandidateRecord::new("Ana", "111", "S1", "10A")]);
    }

    #[test]
    fn test_missing_required_header_fails_before_rows() {
        let input = b"Name,NationalId,GroupName\nAna,111,10A\n";
        match decode(input, &student_schema()) {
            Err(ImportError::SchemaMismatch { missing }) => {
                assert_eq!(missing, vec!["LocalId".to_string()]);
            }
            other => panic!("Expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_input_is_schema_mismatch() {
        let result = decode(b"", &student_schema());
        assert!(matches!(result, Err(ImportError::SchemaMismatch { missing }) if missing.len() == 4));
    }

    #[test]
    fn test_incomplete_rows_are_skipped() {
        let input = b"Name,NationalId,LocalId,GroupName\nAna,111,S1,10A\nBudi,,S2,10B\n,,,\nCici,333,S3,  \n";
        let batch = decode(input, &student_schema()).unwrap();

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].national_id, "111");
        // The fully blank row is ignored, not counted
        assert_eq!(batch.skipped_rows, 2);
    }

    #[test]
    fn test_all_rows_incomplete_is_empty_batch() {
        let input = b"Name,NationalId,LocalId,GroupName\nAna,,S1,10A\n,222,S2,10B\n";
        assert!(matches!(decode(input, &student_schema()), Err(ImportError::EmptyBatch)));

        let header_only = b"Name,NationalId,LocalId,GroupName\n";
        assert!(matches!(decode(header_only, &student_schema()), Err(ImportError::EmptyBatch)));
    }

    #[test]
    fn test_optional_column_may_be_absent() {
        let schema = TableSchema::new(vec![
            ColumnSpec::required(Field::GroupName, "GroupName"),
            ColumnSpec::optional(Field::Name, "Homeroom"),
        ]);
        let batch = decode(b"GroupName\n10A\n10B\n", &schema).unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[1].group_name, "10B");
        assert_eq!(batch.records[1].name, "");
    }

    #[test]
    fn test_delimiter_sniffing() {
        let semicolon = b"Name;NationalId;LocalId;GroupName\nAna;111;S1;10A\n";
        let tab = b"Name\tNationalId\tLocalId\tGroupName\nAna\t111\tS1\t10A\n";
        let pipe = b"Name|NationalId|LocalId|GroupName\nAna|111|S1|10A\n";

        for input in [&semicolon[..], &tab[..], &pipe[..]] {
            let batch = decode(input, &student_schema()).unwrap();
            assert_eq!(batch.records, vec![CandidateRecord::new("Ana", "111", "S1", "10A")]);
        }
    }

    #[test]
    fn test_quoted_fields_keep_embedded_delimiters() {
        let input = b"Name,NationalId,LocalId,GroupName\n\"Putri, Ayu\",111,S1,10A\n";
        let batch = decode(input, &student_schema()).unwrap();
        assert_eq!(batch.records[0].name, "Putri, Ayu");
    }

    #[test]
    fn test_bom_and_windows_1252_text() {
        let mut with_bom = b"\xEF\xBB\xBFName,NationalId,LocalId,GroupName\n".to_vec();
        with_bom.extend_from_slice(b"Ana,111,S1,10A\n");
        assert_eq!(decode(&with_bom, &student_schema()).unwrap().records.len(), 1);

        // "José" encoded as Windows-1252
        let legacy = b"Name,NationalId,LocalId,GroupName\nJos\xE9,111,S1,10A\n";
        let batch = decode(legacy, &student_schema()).unwrap();
        assert_eq!(batch.records[0].name, "José");
    }

    #[test]
    fn test_decode_xlsx() {
        let bytes = xlsx(&[
            &["Name", "NationalId", "LocalId", "GroupName"],
            &["Ana", "111", "S1", "10A"],
            &["Budi", "", "S2", "10A"],
        ]);

        let batch = decode(&bytes, &student_schema()).unwrap();
        assert_eq!(batch.records, vec![CandidateRecord::new("Ana", "111", "S1", "10A")]);
        assert_eq!(batch.skipped_rows, 1);
    }

    #[test]
    fn test_xlsx_numeric_identifiers_render_as_integers() {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        for (c, label) in ["Name", "NationalId", "LocalId", "GroupName"].iter().enumerate() {
            sheet.write_string(0, c as u16, *label).unwrap();
        }
        sheet.write_string(1, 0, "Ana").unwrap();
        sheet.write_number(1, 1, 1234567890.0).unwrap();
        sheet.write_number(1, 2, 42.0).unwrap();
        sheet.write_string(1, 3, "10A").unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        let batch = decode(&bytes, &student_schema()).unwrap();
        assert_eq!(batch.records[0].national_id, "1234567890");
        assert_eq!(batch.records[0].local_id, "42");
    }

    #[test]
    fn test_xlsx_header_must_be_first_row() {
        let bytes = xlsx(&[
            &[],
            &["Name", "NationalId", "LocalId", "GroupName"],
            &["Ana", "111", "S1", "10A"],
        ]);

        match decode(&bytes, &student_schema()) {
            Err(ImportError::SchemaMismatch { missing }) => assert_eq!(missing.len(), 4),
            other => panic!("Expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_xlsx_leading_blank_column_keeps_positions() {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        for (c, value) in ["Name", "NationalId", "LocalId", "GroupName"].iter().enumerate() {
            sheet.write_string(0, c as u16 + 1, *value).unwrap();
        }
        for (c, value) in ["Ana", "111", "S1", "10A"].iter().enumerate() {
            sheet.write_string(1, c as u16 + 1, *value).unwrap();
        }
        let bytes = workbook.save_to_buffer().unwrap();

        let rows = read_workbook(&bytes).unwrap();
        assert_eq!(rows[0][0], "");
        assert_eq!(rows[0][1], "Name");

        let batch = decode(&bytes, &student_schema()).unwrap();
        assert_eq!(batch.records, vec![CandidateRecord::new("Ana", "111", "S1", "10A")]);
    }

    #[test]
    fn test_build_record_names_missing_field() {
        let schema = student_schema();
        let header: Vec<String> = ["Name", "NationalId", "LocalId", "GroupName"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let column_map = map_columns(&header, &schema).unwrap();

        let row: Vec<String> = ["Ana", "111", " ", "10A"].iter().map(|s| s.to_string()).collect();
        assert_eq!(build_record(&row, &column_map), Err(Field::LocalId));

        // Short rows read missing cells as empty
        let short: Vec<String> = vec!["Ana".to_string(), "111".to_string()];
        assert_eq!(build_record(&short, &column_map), Err(Field::LocalId));

        let full: Vec<String> = ["Ana", "111", "S1", "10A"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            build_record(&full, &column_map),
            Ok(CandidateRecord::new("Ana", "111", "S1", "10A"))
        );
    }

    #[test]
    fn test_corrupt_workbook_is_unreadable() {
        let result = decode(b"PK\x03\x04not really a zip", &student_schema());
        assert!(matches!(result, Err(ImportError::Unreadable(_))));
    }

    #[test]
    fn test_decoding_is_repeatable() {
        let bytes = xlsx(&[
            &["Name", "NationalId", "LocalId", "GroupName"],
            &["Ana", "111", "S1", "10A"],
            &["Ana", "111", "S2", "10A"],
        ]);
        let schema = student_schema();

        assert_eq!(decode(&bytes, &schema).unwrap(), decode(&bytes, &schema).unwrap());
    }
}
