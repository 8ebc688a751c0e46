//! Row and summary rendering

use std::io::Write;

use comfy_table::{Table, presets::UTF8_FULL};
use txguard_core::Row;
use txguard_executor::{ExecutionResult, ExecutionSummary};

/// Write each row as one JSON object per line
pub fn write_rows(out: &mut impl Write, rows: &[Row]) -> anyhow::Result<()> {
    for row in rows {
        serde_json::to_writer(&mut *out, &row.to_map())?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Per-partition table followed by the totals
pub fn render_summary(results: &[ExecutionResult], summary: &ExecutionSummary) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["partition", "transaction", "rows", "elapsed", "outcome"]);

    for result in results {
        let transaction = result
            .transaction_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let (rows, outcome) = match &result.outcome {
            Ok(rows) => (rows.len().to_string(), "committed".to_string()),
            Err(e) => ("-".to_string(), format!("{}: {}", e.kind(), e)),
        };
        table.add_row(vec![
            result.partition_index.to_string(),
            transaction,
            rows,
            format!("{:?}", result.elapsed),
            outcome,
        ]);
    }

    format!(
        "{}\n{} partition(s), {} row(s) in, {} row(s) out, {} succeeded, {} failed, {} cancelled in {}ms",
        table,
        summary.partitions,
        summary.rows_in,
        summary.rows_out,
        summary.succeeded,
        summary.failed,
        summary.cancelled,
        summary.elapsed_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use txguard_core::{TxGuardError, Value};

    #[test]
    fn test_rows_are_json_lines() {
        let rows = vec![
            Row::new(vec!["id".into()], vec![Value::Int64(1)]),
            Row::new(vec!["id".into()], vec![Value::String("two".into())]),
        ];
        let mut out = Vec::new();
        write_rows(&mut out, &rows).expect("write");

        assert_eq!(String::from_utf8(out).expect("utf8"), "{\"id\":1}\n{\"id\":\"two\"}\n");
    }

    #[test]
    fn test_summary_lists_failures() {
        let results = vec![ExecutionResult::failed(
            0,
            None,
            TxGuardError::DeadlineExceeded("slow".into()),
            Duration::from_millis(3),
        )];
        let summary = ExecutionSummary::from_results(&results, 4, Duration::from_millis(5));

        let rendered = render_summary(&results, &summary);
        assert!(rendered.contains("deadline_exceeded"));
        assert!(rendered.contains("1 failed"));
    }
}
