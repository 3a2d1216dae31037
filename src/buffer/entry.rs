use csv::ByteRecord;

use crate::error::ParseError;
use crate::fix::Fix;

/// One stored row, kept as raw text.
///
/// Rows are only parsed when drained, so a row that no longer parses is
/// carried through `read_all`/`replace_with` unchanged instead of being lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    fields: Vec<String>,
}

impl BufferEntry {
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Decode the row into a fix.
    pub fn to_fix(&self) -> Result<Fix, ParseError> {
        Fix::from_record(&self.fields)
    }
}

impl From<&Fix> for BufferEntry {
    fn from(fix: &Fix) -> Self {
        Self {
            fields: fix.to_record().into(),
        }
    }
}

impl From<ByteRecord> for BufferEntry {
    fn from(record: ByteRecord) -> Self {
        Self {
            fields: record
                .iter()
                .map(|field| String::from_utf8_lossy(field).into_owned())
                .collect(),
        }
    }
}

impl std::fmt::Display for BufferEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fields.join(","))
    }
}
