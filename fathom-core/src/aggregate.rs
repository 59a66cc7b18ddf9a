//! Select execution and partial-aggregate merging.
//!
//! A shard asked for a partially aggregated result returns one row per
//! group: the group-by values followed by one partial state per aggregate.
//! For `count`, `sum`, `min` and `max` the partial state has the same shape
//! as the final value, so the initiator finishes aggregation by folding the
//! partial rows with the combining operator of each function (partial
//! counts are summed).

use std::collections::HashMap;

use bytes::BytesMut;

use crate::block::Block;
use crate::error::{CoreError, CoreResult};
use crate::query::{AggregateFunction, SelectQuery};
use crate::value::{Row, Value};

/// Runs a select against one block of table data.
///
/// Applies the filter, then either aggregates (one row per group) or
/// projects the selected columns.
///
/// # Errors
/// Returns `ColumnNotFound` for unknown columns and `TypeMismatch` when an
/// aggregate cannot combine the column's values.
pub fn aggregate_block(query: &SelectQuery, block: &Block) -> CoreResult<Block> {
    let rows: Vec<&Row> = block
        .rows()
        .iter()
        .filter(|row| {
            query
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(block.columns(), row))
        })
        .collect();

    if !query.is_aggregating() {
        let filtered = Block::new(
            block.columns().to_vec(),
            rows.into_iter().cloned().collect(),
        )?;
        return filtered.project(&query.columns);
    }

    let group_idx = resolve(block, &query.group_by)?;
    let arg_idx = query
        .aggregates
        .iter()
        .map(|agg| match &agg.column {
            Some(name) => block
                .column_index(name)
                .map(Some)
                .ok_or_else(|| CoreError::column_not_found(name.clone())),
            None => Ok(None),
        })
        .collect::<CoreResult<Vec<_>>>()?;

    let mut groups = Groups::new(query);
    for row in rows {
        let key: Row = group_idx.iter().map(|&i| row[i].clone()).collect();
        let states = groups.entry(key);
        for (i, agg) in query.aggregates.iter().enumerate() {
            let input = arg_idx[i].map(|c| &row[c]);
            let name = agg.output_name();
            states[i] = match agg.function {
                AggregateFunction::Count => {
                    if input.map_or(true, |v| !v.is_null()) {
                        add(&name, &states[i], &Value::UInt(1))?
                    } else {
                        states[i].clone()
                    }
                }
                function => combine(function, &name, &states[i], input.unwrap_or(&Value::Null))?,
            };
        }
    }
    groups.finish()
}

/// Merges partially aggregated blocks returned by shards into final rows.
///
/// Every block must have the query's output layout: group-by columns
/// followed by aggregate columns.
///
/// # Errors
/// Returns `InvalidArgument` for blocks with a different layout and
/// `TypeMismatch` when partial states cannot be combined.
pub fn merge_partial_blocks(query: &SelectQuery, blocks: Vec<Block>) -> CoreResult<Block> {
    let expected = query.output_columns();
    let group_len = query.group_by.len();
    let mut groups = Groups::new(query);

    for block in blocks {
        if block.columns() != expected.as_slice() {
            return Err(CoreError::InvalidArgument {
                name: "partial block",
                reason: format!(
                    "expected columns [{}], got [{}]",
                    expected.join(", "),
                    block.columns().join(", ")
                ),
            });
        }
        for row in block.into_rows() {
            let (key, partials) = row.split_at(group_len);
            let states = groups.entry(key.to_vec());
            for (i, agg) in query.aggregates.iter().enumerate() {
                let function = match agg.function {
                    AggregateFunction::Count => AggregateFunction::Sum,
                    f => f,
                };
                states[i] = combine(function, &agg.output_name(), &states[i], &partials[i])?;
            }
        }
    }
    groups.finish()
}

fn resolve(block: &Block, names: &[String]) -> CoreResult<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            block
                .column_index(name)
                .ok_or_else(|| CoreError::column_not_found(name.clone()))
        })
        .collect()
}

/// Groups in first-seen order.
struct Groups<'q> {
    query: &'q SelectQuery,
    index: HashMap<Vec<u8>, usize>,
    entries: Vec<(Row, Vec<Value>)>,
}

impl<'q> Groups<'q> {
    fn new(query: &'q SelectQuery) -> Self {
        Self {
            query,
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn entry(&mut self, key: Row) -> &mut Vec<Value> {
        let mut encoded = BytesMut::new();
        for value in &key {
            value.encode(&mut encoded);
        }
        let slot = match self.index.get(&encoded[..]) {
            Some(&slot) => slot,
            None => {
                let states = self.query.aggregates.iter().map(|_| Value::Null).collect();
                self.entries.push((key, states));
                self.index.insert(encoded.to_vec(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        &mut self.entries[slot].1
    }

    fn finish(mut self) -> CoreResult<Block> {
        // Without GROUP BY an aggregate query always yields one row.
        if self.entries.is_empty() && self.query.group_by.is_empty() {
            let _ = self.entry(Vec::new());
        }
        let rows = self
            .entries
            .into_iter()
            .map(|(mut key, states)| {
                for (agg, state) in self.query.aggregates.iter().zip(states) {
                    let value = match (agg.function, state) {
                        (AggregateFunction::Count, Value::Null) => Value::UInt(0),
                        (AggregateFunction::Sum, Value::Null) => Value::Int(0),
                        (_, state) => state,
                    };
                    key.push(value);
                }
                key
            })
            .collect();
        Block::new(self.query.output_columns(), rows)
    }
}

fn combine(function: AggregateFunction, name: &str, state: &Value, input: &Value) -> CoreResult<Value> {
    if input.is_null() {
        return Ok(state.clone());
    }
    if state.is_null() {
        if function == AggregateFunction::Sum && input.as_f64().is_none() {
            return Err(mismatch(name, input));
        }
        return Ok(input.clone());
    }
    match function {
        AggregateFunction::Count | AggregateFunction::Sum => add(name, state, input),
        AggregateFunction::Min | AggregateFunction::Max => {
            let ordering = state.compare(input).ok_or_else(|| mismatch(name, input))?;
            let keep_state = if function == AggregateFunction::Min {
                ordering.is_le()
            } else {
                ordering.is_ge()
            };
            Ok(if keep_state { state.clone() } else { input.clone() })
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn add(name: &str, a: &Value, b: &Value) -> CoreResult<Value> {
    Ok(match (a, b) {
        (Value::Null, v) | (v, Value::Null) => v.clone(),
        (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(*y)),
        (Value::UInt(x), Value::UInt(y)) => Value::UInt(x.wrapping_add(*y)),
        (Value::Int(x), Value::UInt(y)) | (Value::UInt(y), Value::Int(x)) => {
            Value::Int((i128::from(*x) + i128::from(*y)) as i64)
        }
        (x, y) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Value::Float(x + y),
            (None, _) => return Err(mismatch(name, x)),
            (_, None) => return Err(mismatch(name, y)),
        },
    })
}

fn mismatch(name: &str, value: &Value) -> CoreError {
    CoreError::TypeMismatch {
        column: name.to_string(),
        expected: "number",
        actual: value.type_name(),
    }
}
