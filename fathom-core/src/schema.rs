//! Table schemas and schema changes.

use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::query::AlterCommand;
use crate::value::Value;

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    UInt64,
    /// 64-bit float.
    Float64,
    /// UTF-8 string.
    String,
}

impl DataType {
    /// Type name as written in DDL.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int64 => "Int64",
            Self::UInt64 => "UInt64",
            Self::Float64 => "Float64",
            Self::String => "String",
        }
    }

    /// Returns true if `value` can be stored in a column of this type.
    /// `Null` fits every type.
    #[must_use]
    pub const fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Int64, Value::Int(_))
                | (Self::UInt64, Value::UInt(_))
                | (Self::Float64, Value::Float(_))
                | (Self::String, Value::String(_))
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub data_type: DataType,
    /// Free-form comment.
    pub comment: String,
}

impl ColumnDef {
    /// Creates a column without a comment.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            comment: String::new(),
        }
    }
}

/// Ordered list of table columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    columns: Vec<ColumnDef>,
}

impl Schema {
    /// Creates a schema from columns.
    ///
    /// # Errors
    /// Returns `ColumnExists` if two columns share a name.
    pub fn new(columns: Vec<ColumnDef>) -> CoreResult<Self> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(CoreError::ColumnExists {
                    name: column.name.clone(),
                });
            }
        }
        Ok(Self { columns })
    }

    /// Returns the columns in order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Returns the column names in order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn position(&self, name: &str) -> CoreResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| CoreError::column_not_found(name))
    }

    /// Applies one schema change in place.
    ///
    /// Commands that do not change columns are rejected; callers decide how
    /// to handle them before reaching the schema.
    ///
    /// # Errors
    /// Returns `ColumnNotFound` / `ColumnExists` for bad references and
    /// `InvalidArgument` for commands that are not column changes or would
    /// leave the table without columns.
    pub fn apply(&mut self, command: &AlterCommand) -> CoreResult<()> {
        match command {
            AlterCommand::AddColumn { column, after } => {
                if self.column(&column.name).is_some() {
                    return Err(CoreError::ColumnExists {
                        name: column.name.clone(),
                    });
                }
                let at = match after {
                    Some(name) => self.position(name)? + 1,
                    None => self.columns.len(),
                };
                self.columns.insert(at, column.clone());
            }
            AlterCommand::DropColumn { name } => {
                let at = self.position(name)?;
                if self.columns.len() == 1 {
                    return Err(CoreError::InvalidArgument {
                        name: "drop column",
                        reason: format!("cannot drop '{name}', the only column"),
                    });
                }
                self.columns.remove(at);
            }
            AlterCommand::ModifyColumn { name, data_type } => {
                let at = self.position(name)?;
                self.columns[at].data_type = *data_type;
            }
            AlterCommand::CommentColumn { name, comment } => {
                let at = self.position(name)?;
                self.columns[at].comment.clone_from(comment);
            }
            AlterCommand::ModifyPrimaryKey { .. } | AlterCommand::ReshardPartition(_) => {
                return Err(CoreError::InvalidArgument {
                    name: "command",
                    reason: format!("'{command}' is not a column change"),
                });
            }
        }
        Ok(())
    }
}
