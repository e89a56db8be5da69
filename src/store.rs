//! Business records and the ordered record store
//!
//! The store is the one object both stages touch. Records are addressed by
//! their position, which never changes after harvest; discovery results are
//! merged back by that position, so export order is harvest order whatever
//! order the discovery tasks finished in.

use crate::{ExtractionQuality, HarvestError};
use std::path::Path;

/// Placeholder written for a listing field that was not found.
pub const NOT_AVAILABLE: &str = "N/A";

/// Prefix of an email cell recording a failed discovery task.
pub const ERROR_PREFIX: &str = "ERROR: ";

pub const COLUMNS: [&str; 7] = [
    "Business Name",
    "Address",
    "Stars",
    "Number of Reviews",
    "Phone Number",
    "Website",
    "Email",
];

/// Discovery state of a record's email
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EmailStatus {
    #[default]
    Unset,
    Found(String),
    NotFound,
    Error(String),
}

impl EmailStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EmailStatus::Unset)
    }

    pub fn to_cell(&self) -> String {
        match self {
            EmailStatus::Unset | EmailStatus::NotFound => String::new(),
            EmailStatus::Found(email) => email.clone(),
            EmailStatus::Error(message) => format!("{ERROR_PREFIX}{message}"),
        }
    }

    pub fn from_cell(cell: &str) -> Self {
        let cell = cell.trim();
        if cell.is_empty() || cell == NOT_AVAILABLE {
            EmailStatus::Unset
        } else if let Some(message) = cell.strip_prefix(ERROR_PREFIX.trim_end()) {
            EmailStatus::Error(message.trim().to_string())
        } else {
            EmailStatus::Found(cell.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusinessRecord {
    pub name: String,
    pub address: String,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub phone: Option<String>,
    pub website_url: Option<String>,
    pub email: EmailStatus,
    /// Present for freshly harvested records only.
    pub quality: Option<ExtractionQuality>,
    /// Passthrough columns, aligned with `RecordStore::extra_columns`.
    pub extra: Vec<String>,
}

impl BusinessRecord {
    pub fn with_website(website: Option<&str>) -> Self {
        Self {
            name: NOT_AVAILABLE.to_string(),
            address: NOT_AVAILABLE.to_string(),
            website_url: website.map(str::to_string),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Vec<BusinessRecord>,
    extra_columns: Vec<String>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<BusinessRecord>) -> Self {
        Self {
            records,
            extra_columns: Vec::new(),
        }
    }

    /// Append a record; returns its index.
    pub fn push(&mut self, mut record: BusinessRecord) -> usize {
        record.extra.resize(self.extra_columns.len(), String::new());
        self.records.push(record);
        self.records.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&BusinessRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BusinessRecord)> {
        self.records.iter().enumerate()
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    /// Move a record's email from `Unset` to a terminal state.
    ///
    /// Each index may be resolved once; a second write is refused.
    pub fn resolve_email(&mut self, index: usize, status: EmailStatus) -> Result<(), HarvestError> {
        if !status.is_terminal() {
            return Err(HarvestError::TableError(format!(
                "record {index}: email can only move to a terminal state"
            )));
        }
        let record = self.records.get_mut(index).ok_or_else(|| {
            HarvestError::TableError(format!("record {index} does not exist"))
        })?;
        if record.email.is_terminal() {
            return Err(HarvestError::TableError(format!(
                "record {index} already resolved as {:?}",
                record.email
            )));
        }
        record.email = status;
        Ok(())
    }

    pub fn count_where(&self, predicate: impl Fn(&EmailStatus) -> bool) -> usize {
        self.records.iter().filter(|r| predicate(&r.email)).count()
    }

    /// Read a table. Canonical columns are matched by header name; any other
    /// column is carried through unchanged.
    pub fn read_csv(path: &Path) -> Result<Self, HarvestError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)?;

        let headers = reader.headers()?.clone();
        let position = |column: &str| headers.iter().position(|h| h == column);
        if position("Website").is_none() {
            return Err(HarvestError::TableError(format!(
                "{} has no Website column",
                path.display()
            )));
        }

        let extra_positions: Vec<usize> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !COLUMNS.contains(h))
            .map(|(i, _)| i)
            .collect();
        let extra_columns = extra_positions
            .iter()
            .map(|i| headers[*i].to_string())
            .collect();

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let cell = |column: &str| {
                position(column)
                    .and_then(|i| row.get(i))
                    .map(str::to_string)
            };
            let optional = |column: &str| {
                cell(column).filter(|value| !value.is_empty() && value != NOT_AVAILABLE)
            };

            records.push(BusinessRecord {
                name: cell("Business Name").unwrap_or_else(|| NOT_AVAILABLE.to_string()),
                address: cell("Address").unwrap_or_else(|| NOT_AVAILABLE.to_string()),
                rating: optional("Stars"),
                review_count: optional("Number of Reviews"),
                phone: optional("Phone Number"),
                website_url: optional("Website"),
                email: cell("Email")
                    .map(|value| EmailStatus::from_cell(&value))
                    .unwrap_or_default(),
                quality: None,
                extra: extra_positions
                    .iter()
                    .map(|i| row.get(*i).unwrap_or_default().to_string())
                    .collect(),
            });
        }

        Ok(Self {
            records,
            extra_columns,
        })
    }

    /// Write every record in store order.
    pub fn write_csv(&self, path: &Path) -> Result<(), HarvestError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = csv::Writer::from_path(path)?;
        let header: Vec<&str> = COLUMNS
            .iter()
            .copied()
            .chain(self.extra_columns.iter().map(String::as_str))
            .collect();
        writer.write_record(&header)?;

        for record in &self.records {
            let or_na = |value: &Option<String>| {
                value.clone().unwrap_or_else(|| NOT_AVAILABLE.to_string())
            };
            let mut row = vec![
                record.name.clone(),
                record.address.clone(),
                or_na(&record.rating),
                or_na(&record.review_count),
                or_na(&record.phone),
                or_na(&record.website_url),
                record.email.to_cell(),
            ];
            row.extend(record.extra.iter().cloned());
            writer.write_record(&row)?;
        }

        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_resolves_once() {
        let mut store = RecordStore::new();
        let index = store.push(BusinessRecord::with_website(Some("example.com")));

        store
            .resolve_email(index, EmailStatus::Found("a@b.co".to_string()))
            .unwrap();
        let second = store.resolve_email(index, EmailStatus::NotFound);

        assert!(second.is_err());
        assert_eq!(
            store.get(index).unwrap().email,
            EmailStatus::Found("a@b.co".to_string())
        );
    }

    #[test]
    fn unset_is_not_a_valid_resolution() {
        let mut store = RecordStore::new();
        store.push(BusinessRecord::default());
        assert!(store.resolve_email(0, EmailStatus::Unset).is_err());
        assert!(store.resolve_email(7, EmailStatus::NotFound).is_err());
    }

    #[test]
    fn email_cells() {
        assert_eq!(EmailStatus::Found("x@y.io".into()).to_cell(), "x@y.io");
        assert_eq!(EmailStatus::NotFound.to_cell(), "");
        assert_eq!(EmailStatus::Error("boom".into()).to_cell(), "ERROR: boom");
        assert_eq!(EmailStatus::from_cell("ERROR: boom"), EmailStatus::Error("boom".into()));
        assert_eq!(EmailStatus::from_cell(" "), EmailStatus::Unset);
    }

    #[test]
    fn csv_keeps_order_and_passthrough_columns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("phuket_spa.csv");
        std::fs::write(
            &input,
            "Business Name,Website,Notes,Email\n\
             Alpha,alpha.example,first,\n\
             Beta,N/A,second,\n\
             Gamma,gamma.example,third,ERROR: timed out\n",
        )
        .unwrap();

        let mut store = RecordStore::read_csv(&input).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.extra_columns(), ["Notes".to_string()]);
        assert!(store.get(1).unwrap().website_url.is_none());
        assert_eq!(
            store.get(2).unwrap().email,
            EmailStatus::Error("timed out".into())
        );

        store
            .resolve_email(0, EmailStatus::Found("hi@alpha.example".into()))
            .unwrap();
        let output = dir.path().join("out").join("phuket_spa_updated.csv");
        store.write_csv(&output).unwrap();

        let written = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(
            lines[0],
            "Business Name,Address,Stars,Number of Reviews,Phone Number,Website,Email,Notes"
        );
        assert_eq!(lines[1], "Alpha,N/A,N/A,N/A,N/A,alpha.example,hi@alpha.example,first");
        assert_eq!(lines[2], "Beta,N/A,N/A,N/A,N/A,N/A,,second");
        assert_eq!(lines[3], "Gamma,N/A,N/A,N/A,N/A,gamma.example,ERROR: timed out,third");
    }

    #[test]
    fn table_without_website_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.csv");
        std::fs::write(&input, "Business Name\nAlpha\n").unwrap();
        assert!(matches!(
            RecordStore::read_csv(&input),
            Err(HarvestError::TableError(_))
        ));
    }
}
