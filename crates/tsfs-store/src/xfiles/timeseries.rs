//! Cadence time series stored in random-access files.
//!
//! Cadence `c` occupies bytes `[c * 4, c * 4 + 3]`. Gaps are holes in the
//! valid set and producers are origin intervals, both kept in byte units
//! by the underlying file and converted at this boundary.

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::intervals::{SimpleInterval, TaggedInterval};
use crate::series::{DataType, Sample, TimeSeries, SAMPLE_BYTES};
use crate::store::FileStore;
use crate::transaction::Xid;

use super::random_access::RandomAccessContent;
use super::{ReadResult, Shape, StoredValue};

fn byte_span(start_cadence: u64, end_cadence: u64) -> (u64, u64) {
    (
        start_cadence * SAMPLE_BYTES,
        end_cadence * SAMPLE_BYTES + SAMPLE_BYTES - 1,
    )
}

fn check_type<T: Sample>(id: &FsId, content: &RandomAccessContent) -> StoreResult<()> {
    let stored = content.data_type();
    if !content.is_empty() && stored != DataType::Bytes && stored != T::DATA_TYPE {
        return Err(StoreError::ShapeMismatch {
            id: id.clone(),
            expected: T::DATA_TYPE.describe(),
            actual: stored.describe(),
        });
    }
    Ok(())
}

/// Valid and origin intervals of one cadence series, in cadence units.
#[derive(Debug, Clone, PartialEq)]
pub struct CadenceIntervals {
    /// The series.
    pub id: FsId,
    /// Cadences holding samples.
    pub valid: Vec<SimpleInterval>,
    /// Producers of each cadence range.
    pub origins: Vec<TaggedInterval>,
    /// Sample type recorded for the series.
    pub data_type: DataType,
}

/// Converts the byte-level intervals of `content` to cadences.
pub fn cadence_intervals(id: &FsId, content: &RandomAccessContent) -> CadenceIntervals {
    CadenceIntervals {
        id: id.clone(),
        valid: content
            .valid()
            .intervals()
            .iter()
            .map(|v| SimpleInterval::new(v.start / SAMPLE_BYTES, v.end / SAMPLE_BYTES))
            .collect(),
        origins: content
            .origins()
            .intervals()
            .iter()
            .map(|o| TaggedInterval::new(o.start / SAMPLE_BYTES, o.end / SAMPLE_BYTES, o.tag))
            .collect(),
        data_type: content.data_type(),
    }
}

/// Extracts cadences `[start, end]` of the series stored in `content`.
pub fn read_series<T: Sample>(
    id: &FsId,
    content: &RandomAccessContent,
    start: u64,
    end: u64,
) -> StoreResult<TimeSeries<T>> {
    if start > end {
        return Err(StoreError::InvalidArgument(format!(
            "cadence range [{}, {}] is empty",
            start, end
        )));
    }
    check_type::<T>(id, content)?;
    let (lo, hi) = byte_span(start, end);
    let bytes = content.read(lo, (hi - lo + 1) as usize);
    let n = (end - start + 1) as usize;
    let mut values = Vec::with_capacity(n);
    let mut gaps = Vec::with_capacity(n);
    for (i, chunk) in bytes.chunks_exact(SAMPLE_BYTES as usize).enumerate() {
        let cadence = start + i as u64;
        let valid = content.valid().contains(cadence * SAMPLE_BYTES);
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        values.push(if valid { T::from_bytes(word) } else { T::default() });
        gaps.push(!valid);
    }
    let origins = content
        .origins()
        .spanned(lo, hi)
        .into_iter()
        .map(|o| TaggedInterval::new(o.start / SAMPLE_BYTES, o.end / SAMPLE_BYTES, o.tag))
        .collect();
    Ok(TimeSeries {
        id: id.clone(),
        start_cadence: start,
        end_cadence: end,
        values,
        gaps,
        origins,
        exists: true,
    })
}

/// Writes `series` into `content`. With `overwrite`, the series' whole
/// cadence range is cleared first, so its gaps become holes; otherwise only
/// the series' valid cadences change. Origins are recorded over valid
/// cadences only, replacing earlier producers there.
pub fn write_series<T: Sample>(
    content: &mut RandomAccessContent,
    series: &TimeSeries<T>,
    overwrite: bool,
) -> StoreResult<()> {
    if overwrite {
        let (lo, hi) = byte_span(series.start_cadence, series.end_cadence);
        content.delete_interval(lo, hi);
    }
    check_type::<T>(&series.id, content)?;

    let runs = series.valid_cadences();
    for run in &runs {
        let first = (run.start - series.start_cadence) as usize;
        let last = (run.end - series.start_cadence) as usize;
        let bytes: Vec<u8> = series.values[first..=last]
            .iter()
            .flat_map(|v| v.to_bytes())
            .collect();
        let (lo, hi) = byte_span(run.start, run.end);
        content.write_with_intervals(lo, &bytes, &[SimpleInterval::new(lo, hi)], &[])?;
    }
    for origin in &series.origins {
        for run in &runs {
            let s = origin.start.max(run.start);
            let e = origin.end.min(run.end);
            if s <= e {
                let (lo, hi) = byte_span(s, e);
                content.record_origin(TaggedInterval::new(lo, hi, origin.tag));
            }
        }
    }
    content.set_data_type(T::DATA_TYPE);
    Ok(())
}

/// A cadence time series file bound to a transaction.
pub struct TransactionalTimeSeriesFile<'a> {
    store: &'a FileStore,
    xid: Xid,
    id: FsId,
}

impl<'a> TransactionalTimeSeriesFile<'a> {
    pub(crate) fn new(store: &'a FileStore, xid: Xid, id: FsId) -> Self {
        Self { store, xid, id }
    }

    /// The series id.
    pub fn id(&self) -> &FsId {
        &self.id
    }

    /// Reads cadences `[start, end]` as seen by the transaction.
    pub fn read_series<T: Sample>(&self, start: u64, end: u64) -> StoreResult<ReadResult<TimeSeries<T>>> {
        match self
            .store
            .load(Some(&self.xid), Shape::RandomAccess, &self.id)?
        {
            Some(StoredValue::RandomAccess(content)) => {
                Ok(ReadResult::Found(read_series(&self.id, &content, start, end)?))
            }
            Some(other) => Err(StoreError::ShapeMismatch {
                id: self.id.clone(),
                expected: Shape::RandomAccess.tree_name(),
                actual: other.shape().tree_name(),
            }),
            None => Ok(ReadResult::NotFound),
        }
    }

    /// Stages a write of `series`, which must carry this file's id.
    pub fn write_series<T: Sample>(&self, series: &TimeSeries<T>, overwrite: bool) -> StoreResult<()> {
        if series.id != self.id {
            return Err(StoreError::InvalidArgument(format!(
                "series {} written through file {}",
                series.id, self.id
            )));
        }
        self.store
            .modify(&self.xid, Shape::RandomAccess, &self.id, |current| {
                let mut content = match current {
                    Some(StoredValue::RandomAccess(c)) => c,
                    _ => RandomAccessContent::new(),
                };
                write_series(&mut content, series, overwrite)?;
                Ok(Some(StoredValue::RandomAccess(content)))
            })
    }

    /// Stages removal of cadences `[start, end]`.
    pub fn delete_interval(&self, start: u64, end: u64) -> StoreResult<()> {
        let (lo, hi) = byte_span(start, end);
        self.store
            .modify(&self.xid, Shape::RandomAccess, &self.id, |current| {
                Ok(match current {
                    Some(StoredValue::RandomAccess(mut c)) => {
                        c.delete_interval(lo, hi);
                        Some(StoredValue::RandomAccess(c))
                    }
                    other => other,
                })
            })
    }

    /// Stages removal of the whole series.
    pub fn delete(&self) -> StoreResult<()> {
        self.store
            .modify(&self.xid, Shape::RandomAccess, &self.id, |_| Ok(None))
    }
}
