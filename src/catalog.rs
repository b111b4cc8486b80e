//! Table and index metadata, fixed at table creation.

use crate::errors::{DbError, Result};
use crate::types::ColType;
use serde::{Deserialize, Serialize};

/// Metadata of one column: where it lives in the record and how wide it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColMeta {
    pub tab_name: String,
    pub name: String,
    pub ty: ColType,
    /// Byte offset within the record.
    pub offset: usize,
    /// Byte length within the record.
    pub len: usize,
}

/// Metadata of one index: the ordered columns forming the composite key.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub tab_name: String,
    pub cols: Vec<ColMeta>,
    /// Precomputed total key width in bytes.
    pub col_tot_len: usize,
}

impl IndexMeta {
    pub fn new(tab_name: String, cols: Vec<ColMeta>) -> Self {
        let col_tot_len = cols.iter().map(|c| c.len).sum();
        IndexMeta {
            tab_name,
            cols,
            col_tot_len,
        }
    }

    /// Extracts this index's composite key from raw record bytes by
    /// concatenating the key columns in index order.
    pub fn key_from_record(&self, record: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.col_tot_len);
        for col in &self.cols {
            key.extend_from_slice(&record[col.offset..col.offset + col.len]);
        }
        key
    }

    pub fn col_types(&self) -> Vec<ColType> {
        self.cols.iter().map(|c| c.ty).collect()
    }

    pub fn col_lens(&self) -> Vec<usize> {
        self.cols.iter().map(|c| c.len).collect()
    }

    /// File name of the index, derived from the table and key columns.
    pub fn index_name(&self) -> String {
        let mut name = self.tab_name.clone();
        for col in &self.cols {
            name.push('_');
            name.push_str(&col.name);
        }
        name.push_str(".idx");
        name
    }
}

/// Metadata of one table: name, ordered column list, and its indexes.
#[derive(Debug, Clone)]
pub struct TabMeta {
    pub name: String,
    pub cols: Vec<ColMeta>,
    pub indexes: Vec<IndexMeta>,
}

impl TabMeta {
    pub fn get_col(&self, name: &str) -> Result<&ColMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string()))
    }

    /// Fixed record size: offset plus length of the last column.
    pub fn record_size(&self) -> usize {
        self.cols.last().map(|c| c.offset + c.len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> TabMeta {
        let cols = vec![
            ColMeta {
                tab_name: "t".into(),
                name: "id".into(),
                ty: ColType::Int,
                offset: 0,
                len: 4,
            },
            ColMeta {
                tab_name: "t".into(),
                name: "name".into(),
                ty: ColType::Str,
                offset: 4,
                len: 8,
            },
        ];
        TabMeta {
            name: "t".into(),
            cols,
            indexes: vec![],
        }
    }

    #[test]
    fn record_size_spans_all_columns() {
        assert_eq!(sample_table().record_size(), 12);
    }

    #[test]
    fn missing_column_is_reported() {
        let tab = sample_table();
        assert!(matches!(
            tab.get_col("nope"),
            Err(DbError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn key_extraction_concatenates_index_columns() {
        let tab = sample_table();
        let index = IndexMeta::new("t".into(), vec![tab.cols[1].clone(), tab.cols[0].clone()]);
        assert_eq!(index.col_tot_len, 12);

        let mut record = vec![0u8; 12];
        record[0..4].copy_from_slice(&7i32.to_le_bytes());
        record[4..8].copy_from_slice(b"abcd");

        let key = index.key_from_record(&record);
        assert_eq!(&key[0..8], b"abcd\0\0\0\0");
        assert_eq!(&key[8..12], &7i32.to_le_bytes());
    }

    #[test]
    fn index_name_lists_key_columns() {
        let tab = sample_table();
        let index = IndexMeta::new("t".into(), vec![tab.cols[0].clone()]);
        assert_eq!(index.index_name(), "t_id.idx");
    }
}
