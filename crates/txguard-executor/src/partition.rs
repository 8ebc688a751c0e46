//! Splitting a batch of parameter rows into partitions

use txguard_core::{ParameterRow, Result, TxGuardError};

use crate::config::PartitionStrategy;

/// A slice of the batch handled by exactly one worker inside one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Position of this partition, `0..partition_count`
    pub index: usize,
    /// Rows in batch order (contiguous) or strided order (round-robin)
    pub rows: Vec<ParameterRow>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Split `batch` into `min(parallelism, batch.len())` non-empty partitions.
///
/// Every row lands in exactly one partition. With
/// [`PartitionStrategy::Contiguous`] the concatenation of all partitions in
/// index order reproduces the batch, and partition sizes differ by at most
/// one (the first `n mod p` partitions carry the extra row). An empty batch
/// yields no partitions.
pub fn partition(
    batch: Vec<ParameterRow>,
    parallelism: usize,
    strategy: PartitionStrategy,
) -> Result<Vec<Partition>> {
    if parallelism == 0 {
        return Err(TxGuardError::InvalidArgument(
            "parallelism must be at least 1".into(),
        ));
    }

    let total = batch.len();
    let count = parallelism.min(total);
    if count == 0 {
        return Ok(Vec::new());
    }

    let partitions = match strategy {
        PartitionStrategy::Contiguous => {
            let base = total / count;
            let extra = total % count;
            let mut rows = batch.into_iter();
            (0..count)
                .map(|index| {
                    let size = base + usize::from(index < extra);
                    Partition {
                        index,
                        rows: rows.by_ref().take(size).collect(),
                    }
                })
                .collect()
        }
        PartitionStrategy::RoundRobin => {
            let mut partitions: Vec<Partition> = (0..count)
                .map(|index| Partition {
                    index,
                    rows: Vec::with_capacity(total / count + 1),
                })
                .collect();
            for (position, row) in batch.into_iter().enumerate() {
                partitions[position % count].rows.push(row);
            }
            partitions
        }
    };

    tracing::trace!(rows = total, partitions = count, ?strategy, "batch partitioned");
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use txguard_core::Value;

    fn batch(n: i64) -> Vec<ParameterRow> {
        (0..n)
            .map(|i| ParameterRow::from([("i".to_string(), Value::Int64(i))]))
            .collect()
    }

    fn ids(partition: &Partition) -> Vec<i64> {
        partition
            .rows
            .iter()
            .filter_map(|row| row.get("i").and_then(Value::as_i64))
            .collect()
    }

    #[rstest]
    #[case(10, 3, vec![4, 3, 3])]
    #[case(10, 5, vec![2, 2, 2, 2, 2])]
    #[case(3, 8, vec![1, 1, 1])]
    #[case(7, 1, vec![7])]
    #[case(1, 1, vec![1])]
    fn test_contiguous_sizes(#[case] rows: i64, #[case] parallelism: usize, #[case] sizes: Vec<usize>) {
        let partitions = partition(batch(rows), parallelism, PartitionStrategy::Contiguous).expect("partition");
        let actual: Vec<usize> = partitions.iter().map(Partition::len).collect();
        assert_eq!(actual, sizes);
    }

    #[test]
    fn test_contiguous_preserves_order() {
        let partitions = partition(batch(10), 3, PartitionStrategy::Contiguous).expect("partition");
        assert_eq!(ids(&partitions[0]), vec![0, 1, 2, 3]);
        assert_eq!(ids(&partitions[1]), vec![4, 5, 6]);
        assert_eq!(ids(&partitions[2]), vec![7, 8, 9]);
        assert_eq!(
            partitions.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_round_robin_strides() {
        let partitions = partition(batch(7), 3, PartitionStrategy::RoundRobin).expect("partition");
        assert_eq!(ids(&partitions[0]), vec![0, 3, 6]);
        assert_eq!(ids(&partitions[1]), vec![1, 4]);
        assert_eq!(ids(&partitions[2]), vec![2, 5]);
    }

    #[rstest]
    #[case(PartitionStrategy::Contiguous)]
    #[case(PartitionStrategy::RoundRobin)]
    fn test_empty_batch_has_no_partitions(#[case] strategy: PartitionStrategy) {
        let partitions = partition(Vec::new(), 4, strategy).expect("partition");
        assert!(partitions.is_empty());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let err = partition(batch(3), 0, PartitionStrategy::Contiguous).unwrap_err();
        assert!(matches!(err, TxGuardError::InvalidArgument(_)));
    }
}
