//! Conversions between txguard values and rusqlite values

use rusqlite::Statement;
use rusqlite::types::ValueRef;
use txguard_core::{ParameterRow, Result, TxGuardError, Value};

/// Bind named parameters (`:name`, `@name` or `$name`) from `params`
pub(crate) fn bind_parameters(stmt: &mut Statement<'_>, params: &ParameterRow) -> Result<()> {
    for idx in 1..=stmt.parameter_count() {
        let key = match stmt.parameter_name(idx) {
            Some(name) => name.trim_start_matches([':', '@', '$']).to_string(),
            None => {
                return Err(TxGuardError::Statement(
                    "positional parameters are not supported, use :name".into(),
                ));
            }
        };

        let value = params
            .get(&key)
            .ok_or_else(|| TxGuardError::Statement(format!("missing parameter '{}'", key)))?;

        stmt.raw_bind_parameter(idx, value_to_rusqlite(value))
            .map_err(|e| TxGuardError::Statement(format!("failed to bind '{}': {}", key, e)))?;
    }
    Ok(())
}

pub(crate) fn value_to_rusqlite(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(if *b { 1 } else { 0 }),
        Value::Int64(i) => rusqlite::types::Value::Integer(*i),
        Value::Float64(f) => rusqlite::types::Value::Real(*f),
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bytes(b) => rusqlite::types::Value::Blob(b.clone()),
        Value::Array(_) | Value::Map(_) => rusqlite::types::Value::Text(value.to_json().to_string()),
    }
}

/// Convert a rusqlite row value to our Value type
pub(crate) fn rusqlite_to_value(row: &rusqlite::Row<'_>, idx: usize) -> Result<Value> {
    let value_ref = row
        .get_ref(idx)
        .map_err(|e| TxGuardError::Statement(e.to_string()))?;

    let value = match value_ref {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).to_string()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    };

    Ok(value)
}
