//! The statement shared by every partition of a call

use txguard_core::{ParameterRow, Value};

/// Statement text plus the parameters common to every row of the batch.
///
/// Built once per call and shared read-only between workers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    statement: String,
    parameters: ParameterRow,
}

impl WorkItem {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            parameters: ParameterRow::new(),
        }
    }

    /// Attach parameters passed unchanged to every execution
    pub fn with_parameters(mut self, parameters: ParameterRow) -> Self {
        self.parameters = parameters;
        self
    }

    /// Add one shared parameter
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn parameters(&self) -> &ParameterRow {
        &self.parameters
    }

    /// Parameters for executing the statement against one batch row.
    ///
    /// Row entries override shared ones of the same name.
    pub fn bind(&self, row: &ParameterRow) -> ParameterRow {
        let mut bound = self.parameters.clone();
        bound.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
        bound
    }

    /// First 100 characters of the statement, for logs
    pub fn preview(&self) -> String {
        self.statement.chars().take(100).collect()
    }
}
