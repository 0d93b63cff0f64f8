use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use crate::core::cancel::CancelToken;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Etag, FieldValue, Row};
use crate::index::table::{IndexShared, IndexState, ReducedRow};
use crate::query::types::{FilterOp, IndexQuery, QueryResults, RowFilter, SortKey, SortOrder, WaitMode};

/// Stateless query execution over an index's reduced rows.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    pub default_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        QueryExecutor { default_timeout }
    }

    /// Run `query`, first waiting for non-stale results if it asks to.
    ///
    /// `store_etag` is sampled once at the start. The wait ends once the
    /// index is idle at or past that etag, or when it becomes corrupted. A
    /// timeout or `cancel` firing first turns into an error.
    pub async fn execute(
        &self,
        index: &IndexShared,
        store_etag: impl Fn() -> Etag,
        query: &IndexQuery,
        cancel: &CancelToken,
    ) -> Result<QueryResults> {
        let started = Instant::now();
        if let WaitMode::NonStale { timeout } = query.wait {
            let target = store_etag();
            self.wait_for(index, target, timeout.unwrap_or(self.default_timeout), cancel).await?;
        }
        self.run(index, store_etag(), query, started)
    }

    pub async fn wait_for(&self, index: &IndexShared, target: Etag, timeout: Duration, cancel: &CancelToken) -> Result<()> {
        let mut progress = index.watch_progress();
        let caught_up = async {
            progress
                .wait_for(|p| match p.state {
                    IndexState::Corrupted => true,
                    IndexState::Building => false,
                    IndexState::Idle | IndexState::Stale => p.checkpoint >= target,
                })
                .await
                .map(|_| ())
        };

        tokio::select! {
            waited = tokio::time::timeout(timeout, caught_up) => match waited {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::new(
                    ErrorKind::InvalidState,
                    format!("index '{}' stopped publishing progress", index.name),
                )),
                Err(_) => Err(Error::new(
                    ErrorKind::Timeout,
                    format!(
                        "index '{}' did not reach etag {} within {:?} (at {})",
                        index.name,
                        target,
                        timeout,
                        index.progress().checkpoint
                    ),
                )),
            },
            _ = cancel.cancelled() => Err(Error::new(
                ErrorKind::Cancelled,
                format!("wait on index '{}' cancelled", index.name),
            )),
        }
    }

    /// Evaluate `query` against the rows the index holds right now.
    pub fn run(&self, index: &IndexShared, store_etag: Etag, query: &IndexQuery, started: Instant) -> Result<QueryResults> {
        let (mut rows, index_etag, building) = {
            let table = index.read();
            if table.state == IndexState::Corrupted {
                return Err(Error::new(
                    ErrorKind::CorruptedIndex,
                    format!(
                        "index '{}' is corrupted: {}",
                        index.name,
                        table.error.as_deref().unwrap_or("unknown error")
                    ),
                ));
            }
            let rows: Vec<ReducedRow> = table
                .rows
                .iter()
                .filter(|(_, value)| query.filters.iter().all(|f| matches(f, value)))
                .map(|(key, value)| ReducedRow { key: key.clone(), value: value.clone() })
                .collect();
            (rows, table.checkpoint, table.state == IndexState::Building)
        };

        sort_rows(&mut rows, &query.sort, query.order);

        let total_rows = rows.len();
        let rows: Vec<ReducedRow> = rows
            .into_iter()
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(QueryResults {
            rows,
            total_rows,
            is_stale: building || index_etag < store_etag,
            index_etag,
            took_ms: started.elapsed().as_millis() as u64,
            includes: BTreeMap::new(),
        })
    }
}

fn matches(filter: &RowFilter, row: &Row) -> bool {
    let Some(value) = row.get(&filter.field) else {
        return false;
    };
    let ord = value.sort_cmp(&filter.value);
    match filter.op {
        FilterOp::Eq => ord == Ordering::Equal,
        FilterOp::Ne => ord != Ordering::Equal,
        FilterOp::Gt => ord == Ordering::Greater,
        FilterOp::Gte => ord != Ordering::Less,
        FilterOp::Lt => ord == Ordering::Less,
        FilterOp::Lte => ord != Ordering::Greater,
    }
}

/// Sort by the requested key; ties resolve by group key ascending so the
/// order is total.
pub fn sort_rows(rows: &mut [ReducedRow], sort: &SortKey, order: SortOrder) {
    static MISSING: FieldValue = FieldValue::Null;
    rows.sort_by(|a, b| {
        let primary = match sort {
            SortKey::GroupKey => a.key.cmp(&b.key),
            SortKey::Field(field) => {
                let left = a.value.get(field).unwrap_or(&MISSING);
                let right = b.value.get(field).unwrap_or(&MISSING);
                left.sort_cmp(right)
            }
        };
        let primary = match order {
            SortOrder::Asc => primary,
            SortOrder::Desc => primary.reverse(),
        };
        primary.then_with(|| a.key.cmp(&b.key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decimal::Decimal;

    fn row(key: &str, total: i32) -> ReducedRow {
        let mut value = Row::new();
        value.insert("Total".to_string(), FieldValue::Decimal(Decimal::from(total)));
        ReducedRow { key: key.to_string(), value }
    }

    fn keys(rows: &[ReducedRow]) -> Vec<&str> {
        rows.iter().map(|r| r.key.as_str()).collect()
    }

    #[test]
    fn descending_ties_break_by_ascending_key() {
        let mut rows = vec![row("c", 5), row("b", 9), row("a", 5), row("d", 9)];
        sort_rows(&mut rows, &SortKey::Field("Total".to_string()), SortOrder::Desc);
        assert_eq!(keys(&rows), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn missing_fields_sort_first_ascending() {
        let mut rows = vec![row("a", 1), ReducedRow { key: "z".to_string(), value: Row::new() }];
        sort_rows(&mut rows, &SortKey::Field("Total".to_string()), SortOrder::Asc);
        assert_eq!(keys(&rows), vec!["z", "a"]);
    }

    #[test]
    fn filters_compare_numerically() {
        let r = row("a", 10);
        assert!(matches(&RowFilter::new("Total", FilterOp::Gt, Decimal::from(9)), &r.value));
        assert!(matches(&RowFilter::new("Total", FilterOp::Lte, FieldValue::Integer(10)), &r.value));
        assert!(!matches(&RowFilter::new("Total", FilterOp::Ne, FieldValue::Number(10.0)), &r.value));
        assert!(!matches(&RowFilter::new("Missing", FilterOp::Ne, 1i64), &r.value));
    }

    #[tokio::test]
    async fn wait_needs_an_idle_index_at_the_target() {
        let index = std::sync::Arc::new(IndexShared::new("t"));
        let executor = QueryExecutor::new(Duration::from_secs(5));

        // Checkpoint reached but still building: not good enough.
        index.commit(|t| t.checkpoint = Etag(3));
        let err = executor
            .wait_for(&index, Etag(3), Duration::from_millis(20), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);

        let writer = index.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.commit(|t| t.state = IndexState::Idle);
        });
        executor
            .wait_for(&index, Etag(3), Duration::from_secs(5), &CancelToken::new())
            .await
            .unwrap();
    }
}
