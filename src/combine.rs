//! Combine engine: merges the files of one input into one value
//!
//! Batch strategies:
//! - `concat`: identical ordered columns required, rows stacked in file order
//! - `union_by_name`: columns unioned in first-seen order, missing cells null
//! - `validate_schema`: like concat, and every file's dtypes must match the first
//!
//! Stream mode only supports concat; files are opened one after another as
//! the stream is pulled.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::artifact::{ArtifactSpec, CombineStrategy};
use crate::error::TraktError;
use crate::table::{DataType, Table};
use crate::value::ChunkStream;

fn mismatch(artifact: &str, file: &Path, details: String) -> TraktError {
    TraktError::SchemaMismatch {
        artifact: artifact.to_string(),
        file: file.display().to_string(),
        details,
    }
}

/// Load every file and merge with the artifact's strategy
pub fn load_batch(
    adapter: &dyn Adapter,
    paths: &[PathBuf],
    artifact: &ArtifactSpec,
) -> Result<Table, TraktError> {
    let mut tables = Vec::with_capacity(paths.len());
    for path in paths {
        tables.push((path.as_path(), adapter.load(path, artifact)?));
    }
    combine_tables(tables, artifact.combine_strategy, &artifact.name)
}

/// Merge already-loaded tables, each tagged with its source file
pub fn combine_tables(
    tables: Vec<(&Path, Table)>,
    strategy: CombineStrategy,
    artifact: &str,
) -> Result<Table, TraktError> {
    match strategy {
        CombineStrategy::Concat => concat(tables, artifact),
        CombineStrategy::ValidateSchema => {
            check_dtypes(&tables, artifact)?;
            concat(tables, artifact)
        }
        CombineStrategy::UnionByName => union_by_name(tables),
    }
}

fn concat(tables: Vec<(&Path, Table)>, artifact: &str) -> Result<Table, TraktError> {
    let mut iter = tables.into_iter();
    let Some((first_path, mut merged)) = iter.next() else {
        return Ok(Table::default());
    };
    for (path, table) in iter {
        if table.columns() != merged.columns() {
            return Err(mismatch(
                artifact,
                path,
                format!(
                    "columns {:?} differ from {:?} in {}",
                    table.columns(),
                    merged.columns(),
                    first_path.display()
                ),
            ));
        }
        merged.append(table)?;
    }
    Ok(merged)
}

fn check_dtypes(tables: &[(&Path, Table)], artifact: &str) -> Result<(), TraktError> {
    let Some((first_path, first)) = tables.first() else {
        return Ok(());
    };
    let reference = first.dtypes();
    for (path, table) in &tables[1..] {
        if table.columns() != first.columns() {
            return Err(mismatch(
                artifact,
                path,
                format!(
                    "columns {:?} differ from {:?} in {}",
                    table.columns(),
                    first.columns(),
                    first_path.display()
                ),
            ));
        }
        for ((column, expected), (_, actual)) in reference.iter().zip(table.dtypes()) {
            let comparable = *expected != DataType::Null && actual != DataType::Null;
            if comparable && *expected != actual {
                return Err(mismatch(
                    artifact,
                    path,
                    format!(
                        "column '{column}' has dtype {actual}, expected {expected} (from {})",
                        first_path.display()
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn union_by_name(tables: Vec<(&Path, Table)>) -> Result<Table, TraktError> {
    let mut columns: Vec<String> = Vec::new();
    for (_, table) in &tables {
        for column in table.columns() {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
    }
    let mut rows = Vec::new();
    for (_, table) in tables {
        rows.extend(table.reindex(&columns).into_rows());
    }
    Table::from_rows(columns, rows)
}

// ============================================================================
// STREAM
// ============================================================================

/// Lazily concatenate the chunk streams of every file. Headers are checked
/// up front so a column mismatch fails before any chunk is produced.
pub fn load_stream(
    adapter: Arc<dyn Adapter>,
    paths: Vec<PathBuf>,
    artifact: &ArtifactSpec,
    chunk_size: usize,
) -> Result<ChunkStream, TraktError> {
    if artifact.combine_strategy != CombineStrategy::Concat {
        return Err(TraktError::contract(format!(
            "input '{}' uses combine_strategy='{}'; stream mode requires combine_strategy='concat'",
            artifact.name, artifact.combine_strategy
        )));
    }

    let mut expected: Option<(Vec<String>, &Path)> = None;
    for path in &paths {
        let columns = adapter.read_columns(path, artifact)?;
        if let Some((first, first_path)) = &expected {
            if *first != columns {
                return Err(mismatch(
                    &artifact.name,
                    path,
                    format!(
                        "columns {columns:?} differ from {first:?} in {}",
                        first_path.display()
                    ),
                ));
            }
            continue;
        }
        expected = Some((columns, path.as_path()));
    }

    Ok(ChunkStream::new(ConcatChunks {
        adapter,
        artifact: artifact.clone(),
        pending: paths.into(),
        current: None,
        chunk_size,
        failed: false,
    }))
}

struct ConcatChunks {
    adapter: Arc<dyn Adapter>,
    artifact: ArtifactSpec,
    pending: VecDeque<PathBuf>,
    current: Option<ChunkStream>,
    chunk_size: usize,
    failed: bool,
}

impl Iterator for ConcatChunks {
    type Item = Result<Table, TraktError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(chunk)) => return Some(Ok(chunk)),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            let path = self.pending.pop_front()?;
            tracing::debug!(artifact = %self.artifact.name, path = %path.display(), "streaming file");
            match self
                .adapter
                .load_stream(&path, &self.artifact, self.chunk_size)
            {
                Ok(stream) => self.current = Some(stream),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::CsvAdapter;
    use crate::table::Cell;
    use tempfile::TempDir;

    fn table(columns: &[&str], rows: Vec<Vec<Cell>>) -> Table {
        Table::from_rows(columns.iter().copied(), rows).unwrap()
    }

    #[test]
    fn test_concat_sums_rows_in_order() {
        let a = table(&["id"], vec![vec![Cell::Int(1)], vec![Cell::Int(2)]]);
        let b = table(&["id"], vec![vec![Cell::Int(3)]]);
        let merged = combine_tables(
            vec![(Path::new("a.csv"), a), (Path::new("b.csv"), b)],
            CombineStrategy::Concat,
            "orders",
        )
        .unwrap();
        assert_eq!(merged.num_rows(), 3);
        assert_eq!(merged.rows()[2][0], Cell::Int(3));
    }

    #[test]
    fn test_concat_names_divergent_file() {
        let a = table(&["id", "amount"], vec![]);
        let b = table(&["amount", "id"], vec![]);
        let err = combine_tables(
            vec![(Path::new("a.csv"), a), (Path::new("b.csv"), b)],
            CombineStrategy::Concat,
            "orders",
        )
        .unwrap_err();
        assert!(matches!(err, TraktError::SchemaMismatch { ref file, .. } if file == "b.csv"));
    }

    #[test]
    fn test_union_by_name_fills_nulls() {
        let a = table(&["id", "amount"], vec![vec![Cell::Int(1), Cell::Int(10)]]);
        let b = table(&["id", "country"], vec![vec![Cell::Int(2), Cell::from("FR")]]);
        let merged = combine_tables(
            vec![(Path::new("a.csv"), a), (Path::new("b.csv"), b)],
            CombineStrategy::UnionByName,
            "orders",
        )
        .unwrap();
        assert_eq!(merged.columns(), &["id", "amount", "country"]);
        assert_eq!(merged.rows()[0][2], Cell::Null);
        assert_eq!(merged.rows()[1][1], Cell::Null);
    }

    #[test]
    fn test_validate_schema_rejects_dtype_drift() {
        let a = table(&["id"], vec![vec![Cell::Int(1)]]);
        let b = table(&["id"], vec![vec![Cell::from("x")]]);
        let err = combine_tables(
            vec![(Path::new("a.csv"), a), (Path::new("b.csv"), b)],
            CombineStrategy::ValidateSchema,
            "orders",
        )
        .unwrap_err();
        assert!(err.to_string().contains("dtype"));

        let a = table(&["id"], vec![vec![Cell::Int(1)]]);
        let nulls = table(&["id"], vec![vec![Cell::Null]]);
        assert!(combine_tables(
            vec![(Path::new("a.csv"), a), (Path::new("b.csv"), nulls)],
            CombineStrategy::ValidateSchema,
            "orders",
        )
        .is_ok());
    }

    #[test]
    fn test_stream_concat_checks_headers_before_reading() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, "id\n1\n2\n").unwrap();
        std::fs::write(&b, "key\n3\n").unwrap();
        let spec = ArtifactSpec::new("orders", "*.csv");
        let err = load_stream(Arc::new(CsvAdapter), vec![a.clone(), b], &spec, 1).unwrap_err();
        assert!(matches!(err, TraktError::SchemaMismatch { .. }));

        std::fs::write(dir.path().join("c.csv"), "id\n3\n").unwrap();
        let stream = load_stream(
            Arc::new(CsvAdapter),
            vec![a, dir.path().join("c.csv")],
            &spec,
            1,
        )
        .unwrap();
        let ids: Vec<Cell> = stream
            .map(|chunk| chunk.unwrap().rows()[0][0].clone())
            .collect();
        assert_eq!(ids, vec![Cell::Int(1), Cell::Int(2), Cell::Int(3)]);
    }

    #[test]
    fn test_stream_rejects_non_concat() {
        let spec = ArtifactSpec::new("orders", "*.csv").combine(CombineStrategy::UnionByName);
        let err = load_stream(Arc::new(CsvAdapter), vec![], &spec, 10).unwrap_err();
        assert!(err.to_string().contains("combine_strategy='concat'"));
    }
}
