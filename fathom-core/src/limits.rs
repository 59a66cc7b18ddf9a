//! Limits for values, blocks and queries.
//!
//! Following `TigerStyle`: put limits on everything. A spooled batch that
//! decodes into a block larger than these bounds is treated as corrupt.

/// Maximum number of columns in one block.
pub const BLOCK_COLUMNS_COUNT_MAX: u32 = 4096;

/// Maximum number of rows in one block.
pub const BLOCK_ROWS_COUNT_MAX: u32 = 4 * 1024 * 1024;

/// Maximum size of a single string value in bytes (16 MB).
pub const STRING_SIZE_BYTES_MAX: u32 = 16 * 1024 * 1024;

/// Maximum length of a table, database or column identifier.
pub const IDENTIFIER_LENGTH_MAX: usize = 255;
