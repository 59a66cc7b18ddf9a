//! Blocks: a set of named columns plus row-major data.
//!
//! Blocks are the unit that moves between the distributed table, local
//! storage, remote shards and the spool.
//!
//! # Encoding
//!
//! ```text
//! +-----------+----------------------------+----------+------------------+
//! | ncols u32 | (len u32, name bytes) * n  | nrows u32| values row-major |
//! +-----------+----------------------------+----------+------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, CoreResult};
use crate::limits::{BLOCK_COLUMNS_COUNT_MAX, BLOCK_ROWS_COUNT_MAX, IDENTIFIER_LENGTH_MAX};
use crate::value::{Row, Value};

/// A block of rows sharing one column layout.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Block {
    /// Creates a block, checking that every row has one value per column.
    ///
    /// # Errors
    /// Returns `InvalidArgument` on a row width mismatch and
    /// `LimitExceeded` when the block is larger than the configured bounds.
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> CoreResult<Self> {
        if columns.len() > BLOCK_COLUMNS_COUNT_MAX as usize {
            return Err(CoreError::LimitExceeded {
                limit: "block_columns",
                max: u64::from(BLOCK_COLUMNS_COUNT_MAX),
                actual: columns.len() as u64,
            });
        }
        if rows.len() > BLOCK_ROWS_COUNT_MAX as usize {
            return Err(CoreError::LimitExceeded {
                limit: "block_rows",
                max: u64::from(BLOCK_ROWS_COUNT_MAX),
                actual: rows.len() as u64,
            });
        }
        if let Some(bad) = rows.iter().position(|row| row.len() != columns.len()) {
            return Err(CoreError::InvalidArgument {
                name: "rows",
                reason: format!(
                    "row {bad} has {} values, block has {} columns",
                    rows[bad].len(),
                    columns.len()
                ),
            });
        }
        Ok(Self { columns, rows })
    }

    /// Creates an empty block with the given columns.
    #[must_use]
    pub const fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Returns the column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the rows.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consumes the block and returns its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the block has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Appends a row.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the row width does not match.
    pub fn push_row(&mut self, row: Row) -> CoreResult<()> {
        if row.len() != self.columns.len() {
            return Err(CoreError::InvalidArgument {
                name: "row",
                reason: format!(
                    "row has {} values, block has {} columns",
                    row.len(),
                    self.columns.len()
                ),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Appends all rows of `other`, which must have the same columns.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the column layouts differ.
    pub fn append(&mut self, other: Self) -> CoreResult<()> {
        if other.columns != self.columns {
            return Err(CoreError::InvalidArgument {
                name: "block",
                reason: "column layouts differ".to_string(),
            });
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Returns a block keeping only the listed columns, in the listed order.
    ///
    /// # Errors
    /// Returns `ColumnNotFound` for an unknown column.
    pub fn project(&self, columns: &[String]) -> CoreResult<Self> {
        let indices = columns
            .iter()
            .map(|name| {
                self.column_index(name)
                    .ok_or_else(|| CoreError::column_not_found(name.clone()))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Self {
            columns: columns.to_vec(),
            rows,
        })
    }

    /// Encodes the block to bytes.
    #[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.columns.len() as u32);
        for name in &self.columns {
            buf.put_u32_le(name.len() as u32);
            buf.put_slice(name.as_bytes());
        }
        buf.put_u32_le(self.rows.len() as u32);
        for row in &self.rows {
            for value in row {
                value.encode(buf);
            }
        }
    }

    /// Encodes the block into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a block from bytes.
    ///
    /// # Errors
    /// Returns `Decode` if the buffer is truncated or exceeds limits.
    pub fn decode(buf: &mut impl Buf) -> CoreResult<Self> {
        if buf.remaining() < 4 {
            return Err(CoreError::Decode {
                reason: "buffer too small for column count",
            });
        }
        let ncols = buf.get_u32_le();
        if ncols > BLOCK_COLUMNS_COUNT_MAX {
            return Err(CoreError::Decode {
                reason: "column count exceeds maximum",
            });
        }
        let mut columns = Vec::with_capacity(ncols as usize);
        for _ in 0..ncols {
            if buf.remaining() < 4 {
                return Err(CoreError::Decode {
                    reason: "buffer too small for column name length",
                });
            }
            let len = buf.get_u32_le() as usize;
            if len > IDENTIFIER_LENGTH_MAX || buf.remaining() < len {
                return Err(CoreError::Decode {
                    reason: "invalid column name length",
                });
            }
            let name = String::from_utf8(buf.copy_to_bytes(len).to_vec()).map_err(|_| {
                CoreError::Decode {
                    reason: "column name is not valid UTF-8",
                }
            })?;
            columns.push(name);
        }

        if buf.remaining() < 4 {
            return Err(CoreError::Decode {
                reason: "buffer too small for row count",
            });
        }
        let nrows = buf.get_u32_le();
        if nrows > BLOCK_ROWS_COUNT_MAX {
            return Err(CoreError::Decode {
                reason: "row count exceeds maximum",
            });
        }
        let mut rows = Vec::with_capacity(nrows.min(1024) as usize);
        for _ in 0..nrows {
            let row = (0..ncols)
                .map(|_| Value::decode(buf))
                .collect::<CoreResult<Row>>()?;
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }
}
