//! Immutable query representation.
//!
//! The distributed table never edits a query in place. Every per-shard
//! variant is produced by [`Query::with_target`], a pure function that
//! returns a fresh value pointing at the shard's backing table, so shards
//! never share mutable query state.
//!
//! `Display` renders queries as text. The rendered text is what gets
//! registered against a resharding coordinator and what shows up in logs.

use std::fmt;

use crate::schema::{ColumnDef, DataType};
use crate::value::{Row, Value};

/// A fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    /// Database name.
    pub database: String,
    /// Table name.
    pub table: String,
}

impl TableRef {
    /// Creates a table reference.
    #[must_use]
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

// -----------------------------------------------------------------------------
// SELECT
// -----------------------------------------------------------------------------

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        })
    }
}

/// A `column <op> literal` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Column being compared.
    pub column: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Literal operand.
    pub value: Value,
}

impl Filter {
    /// Evaluates the filter against a row laid out as `columns`.
    ///
    /// Unknown columns and unordered comparisons (`NULL`, string vs
    /// number) evaluate to false.
    #[must_use]
    pub fn matches(&self, columns: &[String], row: &Row) -> bool {
        use std::cmp::Ordering;

        let Some(idx) = columns.iter().position(|c| *c == self.column) else {
            return false;
        };
        let Some(ordering) = row[idx].compare(&self.value) else {
            return false;
        };
        match self.op {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.op, self.value)
    }
}

/// Aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    /// Number of rows (or non-null values when a column is given).
    Count,
    /// Sum of a numeric column.
    Sum,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
        })
    }
}

/// An aggregate expression in a select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    /// Function.
    pub function: AggregateFunction,
    /// Argument column; `None` means `count()`.
    pub column: Option<String>,
}

impl Aggregate {
    /// `count()`.
    #[must_use]
    pub const fn count() -> Self {
        Self {
            function: AggregateFunction::Count,
            column: None,
        }
    }

    /// Aggregate over a column.
    #[must_use]
    pub fn of(function: AggregateFunction, column: impl Into<String>) -> Self {
        Self {
            function,
            column: Some(column.into()),
        }
    }

    /// Name of the result column, e.g. `sum(price)`.
    #[must_use]
    pub fn output_name(&self) -> String {
        format!("{}({})", self.function, self.column.as_deref().unwrap_or(""))
    }
}

/// A SELECT query.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    /// Table read from.
    pub target: TableRef,
    /// Plain columns in the select list.
    pub columns: Vec<String>,
    /// Optional WHERE predicate.
    pub filter: Option<Filter>,
    /// GROUP BY columns.
    pub group_by: Vec<String>,
    /// Aggregates in the select list.
    pub aggregates: Vec<Aggregate>,
}

impl SelectQuery {
    /// Selects plain columns from a table.
    #[must_use]
    pub fn new(target: TableRef, columns: Vec<String>) -> Self {
        Self {
            target,
            columns,
            filter: None,
            group_by: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    /// Adds a WHERE predicate.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the GROUP BY columns.
    #[must_use]
    pub fn with_group_by(mut self, columns: Vec<String>) -> Self {
        self.group_by = columns;
        self
    }

    /// Adds an aggregate.
    #[must_use]
    pub fn with_aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    /// Returns true if the query aggregates.
    #[must_use]
    pub fn is_aggregating(&self) -> bool {
        !self.aggregates.is_empty() || !self.group_by.is_empty()
    }

    /// Names of the result columns.
    ///
    /// Aggregating queries return the group-by columns followed by one
    /// column per aggregate.
    #[must_use]
    pub fn output_columns(&self) -> Vec<String> {
        if self.is_aggregating() {
            self.group_by
                .iter()
                .cloned()
                .chain(self.aggregates.iter().map(Aggregate::output_name))
                .collect()
        } else {
            self.columns.clone()
        }
    }
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<String> = if self.is_aggregating() {
            self.output_columns()
        } else {
            self.columns.clone()
        };
        write!(f, "SELECT {} FROM {}", list.join(", "), self.target)?;
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {filter}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", self.group_by.join(", "))?;
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// INSERT, DESCRIBE
// -----------------------------------------------------------------------------

/// An INSERT query. Rows travel separately as blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    /// Table written to.
    pub target: TableRef,
    /// Inserted columns, in block order.
    pub columns: Vec<String>,
    /// `INSERT ... SELECT` source, if any.
    pub select: Option<Box<SelectQuery>>,
}

impl InsertQuery {
    /// Creates an `INSERT ... VALUES` query.
    #[must_use]
    pub fn new(target: TableRef, columns: Vec<String>) -> Self {
        Self {
            target,
            columns,
            select: None,
        }
    }
}

impl fmt::Display for InsertQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO {} ({})", self.target, self.columns.join(", "))?;
        match &self.select {
            Some(select) => write!(f, " {select}"),
            None => write!(f, " VALUES"),
        }
    }
}

/// A DESCRIBE query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeQuery {
    /// Described table.
    pub target: TableRef,
}

impl fmt::Display for DescribeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DESCRIBE TABLE {}", self.target)
    }
}

// -----------------------------------------------------------------------------
// ALTER
// -----------------------------------------------------------------------------

/// A target path with its share of resharded data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedPath {
    /// Registry path of the destination shard's table.
    pub path: String,
    /// Relative weight.
    pub weight: u64,
}

impl WeightedPath {
    /// Creates a weighted path.
    #[must_use]
    pub fn new(path: impl Into<String>, weight: u64) -> Self {
        Self {
            path: path.into(),
            weight,
        }
    }
}

/// Parameters of a `RESHARD PARTITION` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ReshardCommand {
    /// First partition to reshard; `None` means unbounded.
    pub first_partition: Option<Value>,
    /// Last partition to reshard; `None` means unbounded.
    pub last_partition: Option<Value>,
    /// Destination paths with weights.
    pub weighted_paths: Vec<WeightedPath>,
    /// Text of the new sharding expression.
    pub sharding_key: String,
    /// Copy instead of move.
    pub do_copy: bool,
    /// Coordinator this command reports to.
    pub coordinator: Option<String>,
}

impl fmt::Display for ReshardCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RESHARD")?;
        if self.do_copy {
            f.write_str(" COPY")?;
        }
        if let Some(first) = &self.first_partition {
            write!(f, " PARTITION {first}")?;
            if let Some(last) = &self.last_partition {
                write!(f, " TO {last}")?;
            }
        } else if let Some(last) = &self.last_partition {
            write!(f, " PARTITION TO {last}")?;
        }
        let paths: Vec<String> = self
            .weighted_paths
            .iter()
            .map(|p| format!("'{}' WEIGHT {}", p.path, p.weight))
            .collect();
        write!(f, " TO {} USING {}", paths.join(", "), self.sharding_key)?;
        if let Some(coordinator) = &self.coordinator {
            write!(f, " COORDINATE WITH '{coordinator}'")?;
        }
        Ok(())
    }
}

/// One ALTER command.
#[derive(Debug, Clone, PartialEq)]
pub enum AlterCommand {
    /// Add a column, optionally after an existing one.
    AddColumn {
        /// New column.
        column: ColumnDef,
        /// Insert after this column; `None` appends.
        after: Option<String>,
    },
    /// Drop a column.
    DropColumn {
        /// Column name.
        name: String,
    },
    /// Change a column's type.
    ModifyColumn {
        /// Column name.
        name: String,
        /// New type.
        data_type: DataType,
    },
    /// Set a column comment.
    CommentColumn {
        /// Column name.
        name: String,
        /// New comment.
        comment: String,
    },
    /// Change the primary key.
    ModifyPrimaryKey {
        /// New key columns.
        columns: Vec<String>,
    },
    /// Redistribute partitions across shards.
    ReshardPartition(ReshardCommand),
}

impl fmt::Display for AlterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddColumn { column, after } => {
                write!(f, "ADD COLUMN {} {}", column.name, column.data_type)?;
                if let Some(after) = after {
                    write!(f, " AFTER {after}")?;
                }
                Ok(())
            }
            Self::DropColumn { name } => write!(f, "DROP COLUMN {name}"),
            Self::ModifyColumn { name, data_type } => {
                write!(f, "MODIFY COLUMN {name} {data_type}")
            }
            Self::CommentColumn { name, comment } => {
                write!(f, "COMMENT COLUMN {name} {}", Value::from(comment.as_str()))
            }
            Self::ModifyPrimaryKey { columns } => {
                write!(f, "MODIFY PRIMARY KEY ({})", columns.join(", "))
            }
            Self::ReshardPartition(reshard) => write!(f, "{reshard}"),
        }
    }
}

/// An ALTER TABLE query.
#[derive(Debug, Clone, PartialEq)]
pub struct AlterQuery {
    /// Altered table.
    pub target: TableRef,
    /// Commands, applied in order.
    pub commands: Vec<AlterCommand>,
}

impl fmt::Display for AlterQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let commands: Vec<String> = self.commands.iter().map(ToString::to_string).collect();
        write!(f, "ALTER TABLE {} {}", self.target, commands.join(", "))
    }
}

// -----------------------------------------------------------------------------
// Query
// -----------------------------------------------------------------------------

/// Any query the distributed table sends to shards.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// SELECT.
    Select(SelectQuery),
    /// INSERT.
    Insert(InsertQuery),
    /// DESCRIBE.
    Describe(DescribeQuery),
    /// ALTER.
    Alter(AlterQuery),
}

impl Query {
    /// Returns the table the query addresses.
    #[must_use]
    pub const fn target(&self) -> &TableRef {
        match self {
            Self::Select(q) => &q.target,
            Self::Insert(q) => &q.target,
            Self::Describe(q) => &q.target,
            Self::Alter(q) => &q.target,
        }
    }

    /// Returns a copy of the query addressed to `database.table`.
    ///
    /// The receiver is left untouched. For inserts the `INSERT ... SELECT`
    /// source is dropped: the rows are already materialized into blocks by
    /// the time an insert reaches a shard.
    #[must_use]
    pub fn with_target(&self, database: &str, table: &str) -> Self {
        let target = TableRef::new(database, table);
        match self {
            Self::Select(q) => Self::Select(SelectQuery {
                target,
                ..q.clone()
            }),
            Self::Insert(q) => Self::Insert(InsertQuery {
                target,
                columns: q.columns.clone(),
                select: None,
            }),
            Self::Describe(_) => Self::Describe(DescribeQuery { target }),
            Self::Alter(q) => Self::Alter(AlterQuery {
                target,
                commands: q.commands.clone(),
            }),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select(q) => write!(f, "{q}"),
            Self::Insert(q) => write!(f, "{q}"),
            Self::Describe(q) => write!(f, "{q}"),
            Self::Alter(q) => write!(f, "{q}"),
        }
    }
}
