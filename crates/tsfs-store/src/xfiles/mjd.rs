//! MJD-indexed time series: sparse samples keyed by a floating point date.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::series::{MjdPoint, MjdTimeSeries};
use crate::store::FileStore;
use crate::transaction::Xid;

use super::{ReadResult, Shape, StoredValue};

/// Content of an MJD series file: samples in strictly ascending `mjd` order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MjdContent {
    points: Vec<MjdPoint>,
}

impl MjdContent {
    /// An empty series.
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored samples.
    pub fn points(&self) -> &[MjdPoint] {
        &self.points
    }

    /// Returns true if no sample is stored.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Samples with `start <= mjd <= end`.
    pub fn read(&self, start: f64, end: f64) -> Vec<MjdPoint> {
        let lo = self.points.partition_point(|p| p.mjd < start);
        let hi = self.points.partition_point(|p| p.mjd <= end);
        if lo >= hi {
            return Vec::new();
        }
        self.points[lo..hi].to_vec()
    }

    /// Merges `series` into the content. With `overwrite`, every stored
    /// sample inside the series' range is dropped first; otherwise samples
    /// at equal dates are replaced and the rest are kept.
    pub fn write(&mut self, series: &MjdTimeSeries, overwrite: bool) {
        if overwrite {
            self.remove_range(series.start_mjd, series.end_mjd);
        }
        for point in &series.points {
            match self
                .points
                .binary_search_by(|p| p.mjd.total_cmp(&point.mjd))
            {
                Ok(i) => self.points[i] = *point,
                Err(i) => self.points.insert(i, *point),
            }
        }
    }

    /// Drops samples with `start <= mjd <= end`.
    pub fn remove_range(&mut self, start: f64, end: f64) {
        self.points.retain(|p| p.mjd < start || p.mjd > end);
    }
}

/// An MJD series file bound to a transaction.
pub struct TransactionalMjdFile<'a> {
    store: &'a FileStore,
    xid: Xid,
    id: FsId,
}

impl<'a> TransactionalMjdFile<'a> {
    pub(crate) fn new(store: &'a FileStore, xid: Xid, id: FsId) -> Self {
        Self { store, xid, id }
    }

    /// The series id.
    pub fn id(&self) -> &FsId {
        &self.id
    }

    /// Reads samples in `[start, end]` as seen by the transaction.
    pub fn read(&self, start: f64, end: f64) -> StoreResult<ReadResult<MjdTimeSeries>> {
        match self.store.load(Some(&self.xid), Shape::Mjd, &self.id)? {
            Some(StoredValue::Mjd(content)) => Ok(ReadResult::Found(MjdTimeSeries::new(
                self.id.clone(),
                start,
                end,
                content.read(start, end),
            )?)),
            Some(other) => Err(StoreError::ShapeMismatch {
                id: self.id.clone(),
                expected: Shape::Mjd.tree_name(),
                actual: other.shape().tree_name(),
            }),
            None => Ok(ReadResult::NotFound),
        }
    }

    /// Stages a write of `series`, which must carry this file's id.
    pub fn write(&self, series: &MjdTimeSeries, overwrite: bool) -> StoreResult<()> {
        if series.id != self.id {
            return Err(StoreError::InvalidArgument(format!(
                "series {} written through file {}",
                series.id, self.id
            )));
        }
        self.store.modify(&self.xid, Shape::Mjd, &self.id, |current| {
            let mut content = match current {
                Some(StoredValue::Mjd(c)) => c,
                _ => MjdContent::new(),
            };
            content.write(series, overwrite);
            Ok(Some(StoredValue::Mjd(content)))
        })
    }

    /// Stages removal of the whole series.
    pub fn delete(&self) -> StoreResult<()> {
        self.store
            .modify(&self.xid, Shape::Mjd, &self.id, |_| Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(mjd: f64, value: f32, origin: u64) -> MjdPoint {
        MjdPoint { mjd, value, origin }
    }

    fn series(start: f64, end: f64, points: Vec<MjdPoint>) -> MjdTimeSeries {
        MjdTimeSeries::new(FsId::parse("/dr/mjd/1").unwrap(), start, end, points).unwrap()
    }

    #[test]
    fn test_read_is_inclusive() {
        let mut c = MjdContent::new();
        c.write(
            &series(0.0, 10.0, vec![p(1.0, 1.0, 1), p(2.5, 2.0, 1), p(4.0, 3.0, 1)]),
            true,
        );
        assert_eq!(c.read(2.5, 4.0).len(), 2);
        assert_eq!(c.read(1.1, 2.4).len(), 0);
        assert_eq!(c.read(5.0, 3.0).len(), 0);
    }

    #[test]
    fn test_merge_replaces_equal_dates() {
        let mut c = MjdContent::new();
        c.write(&series(0.0, 10.0, vec![p(1.0, 1.0, 1), p(3.0, 3.0, 1)]), true);
        c.write(&series(0.0, 10.0, vec![p(2.0, 2.0, 2), p(3.0, 9.0, 2)]), false);
        let mjds: Vec<f64> = c.points().iter().map(|x| x.mjd).collect();
        assert_eq!(mjds, vec![1.0, 2.0, 3.0]);
        assert_eq!(c.points()[2].value, 9.0);
        assert_eq!(c.points()[0].origin, 1);
    }

    #[test]
    fn test_overwrite_clears_range_only() {
        let mut c = MjdContent::new();
        c.write(
            &series(0.0, 10.0, vec![p(1.0, 1.0, 1), p(5.0, 5.0, 1), p(9.0, 9.0, 1)]),
            true,
        );
        c.write(&series(4.0, 6.0, vec![]), true);
        let mjds: Vec<f64> = c.points().iter().map(|x| x.mjd).collect();
        assert_eq!(mjds, vec![1.0, 9.0]);
    }
}
