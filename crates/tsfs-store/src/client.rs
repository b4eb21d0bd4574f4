//! Session-level client over a [`StoreBackend`].
//!
//! A client holds at most one open transaction. Writes require it; reads use
//! it when present and otherwise see the last committed state. Dropping a
//! client with an open transaction rolls the transaction back.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::series::{BlobResult, FloatTimeSeries, IntTimeSeries, MjdTimeSeries, Sample, TimeSeries};
use crate::store::StoreBackend;
use crate::transaction::{TransactionContext, Xid};
use crate::xfiles::{CadenceIntervals, ReadResult, Shape};

/// Sample types the backend can store as cadence series.
pub trait SeriesSample: Sample {
    /// Stages writes of `series` in `xid`.
    fn write_batch(
        backend: &dyn StoreBackend,
        xid: &Xid,
        series: &[TimeSeries<Self>],
        overwrite: bool,
    ) -> StoreResult<()>;

    /// Reads cadences `[start, end]` of `ids`.
    fn read_batch(
        backend: &dyn StoreBackend,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<ReadResult<TimeSeries<Self>>>>;
}

impl SeriesSample for f32 {
    fn write_batch(
        backend: &dyn StoreBackend,
        xid: &Xid,
        series: &[FloatTimeSeries],
        overwrite: bool,
    ) -> StoreResult<()> {
        backend.write_time_series_float(xid, series, overwrite)
    }

    fn read_batch(
        backend: &dyn StoreBackend,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<ReadResult<FloatTimeSeries>>> {
        backend.read_time_series_float(xid, ids, start, end)
    }
}

impl SeriesSample for i32 {
    fn write_batch(
        backend: &dyn StoreBackend,
        xid: &Xid,
        series: &[IntTimeSeries],
        overwrite: bool,
    ) -> StoreResult<()> {
        backend.write_time_series_int(xid, series, overwrite)
    }

    fn read_batch(
        backend: &dyn StoreBackend,
        xid: Option<&Xid>,
        ids: &[FsId],
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<ReadResult<IntTimeSeries>>> {
        backend.read_time_series_int(xid, ids, start, end)
    }
}

/// A client session.
pub struct FileStoreClient {
    backend: Arc<dyn StoreBackend>,
    context: TransactionContext,
    xid: Option<Xid>,
}

impl FileStoreClient {
    /// Creates a session for `host`.
    pub fn new(backend: Arc<dyn StoreBackend>, host: impl Into<String>) -> Self {
        Self {
            backend,
            context: TransactionContext::new(host),
            xid: None,
        }
    }

    /// Tags transactions begun by this session with a pipeline task.
    pub fn with_pipeline_task(mut self, pipeline_task_id: u64) -> Self {
        self.context.pipeline_task_id = Some(pipeline_task_id);
        self
    }

    /// The open transaction, if any.
    pub fn current_transaction(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    fn require_xid(&self) -> StoreResult<&Xid> {
        self.xid.as_ref().ok_or(StoreError::NoTransaction)
    }

    /// Opens a transaction on this session.
    pub fn begin_transaction(&mut self) -> StoreResult<Xid> {
        if let Some(xid) = &self.xid {
            return Err(StoreError::TransactionAlreadyOpen { xid: xid.clone() });
        }
        let xid = self.backend.begin(self.context.clone())?;
        self.xid = Some(xid.clone());
        Ok(xid)
    }

    /// Commits the open transaction. The session has no transaction
    /// afterwards, whether or not the commit succeeded.
    pub fn commit(&mut self) -> StoreResult<()> {
        let xid = self.xid.take().ok_or(StoreError::NoTransaction)?;
        self.backend.commit(&xid)
    }

    /// Rolls back the open transaction.
    pub fn rollback(&mut self) -> StoreResult<()> {
        let xid = self.xid.take().ok_or(StoreError::NoTransaction)?;
        self.backend.rollback(&xid)
    }

    /// Keeps the open transaction from expiring.
    pub fn heartbeat(&self) -> StoreResult<()> {
        self.backend.heartbeat(self.require_xid()?)
    }

    /// Writes blob `id`.
    pub fn write_blob(&self, id: &FsId, origin: u64, bytes: &[u8]) -> StoreResult<()> {
        self.backend.write_blob(self.require_xid()?, id, origin, bytes)
    }

    /// Reads blob `id`.
    pub fn read_blob(&self, id: &FsId) -> StoreResult<ReadResult<BlobResult>> {
        self.backend.read_blob(self.xid.as_ref(), id)
    }

    /// Returns true if blob `id` exists.
    pub fn blob_exists(&self, id: &FsId) -> StoreResult<bool> {
        self.backend.blob_exists(self.xid.as_ref(), id)
    }

    /// Deletes blob `id`.
    pub fn delete_blob(&self, id: &FsId) -> StoreResult<()> {
        self.backend.delete_blob(self.require_xid()?, id)
    }

    /// Writes cadence series. Without `overwrite` only the series' valid
    /// cadences replace stored data.
    pub fn write_time_series<T: SeriesSample>(
        &self,
        series: &[TimeSeries<T>],
        overwrite: bool,
    ) -> StoreResult<()> {
        T::write_batch(&*self.backend, self.require_xid()?, series, overwrite)
    }

    fn read_all_series<T: SeriesSample>(
        &self,
        ids: &[FsId],
        start: u64,
        end: u64,
        existence_required: bool,
    ) -> StoreResult<Vec<TimeSeries<T>>> {
        if start > end {
            return Err(StoreError::InvalidArgument(format!(
                "cadence range [{}, {}] is empty",
                start, end
            )));
        }
        let results = T::read_batch(&*self.backend, self.xid.as_ref(), ids, start, end)?;
        ids.iter()
            .zip(results)
            .map(|(id, result)| match result {
                ReadResult::Found(series) => Ok(series),
                ReadResult::NotFound if existence_required => {
                    Err(StoreError::IdNotFound { id: id.clone() })
                }
                ReadResult::NotFound => Ok(TimeSeries::empty(id.clone(), start, end)),
            })
            .collect()
    }

    /// Valid and origin cadence intervals of each id, in request order.
    /// Missing ids yield [`ReadResult::NotFound`].
    pub fn cadence_intervals_for_ids(
        &self,
        ids: &[FsId],
    ) -> StoreResult<Vec<ReadResult<CadenceIntervals>>> {
        self.backend.cadence_intervals_for_ids(self.xid.as_ref(), ids)
    }

    /// Reads cadences `[start, end]` of one float series.
    pub fn read_time_series_as_float(
        &self,
        id: &FsId,
        start: u64,
        end: u64,
        existence_required: bool,
    ) -> StoreResult<FloatTimeSeries> {
        let mut all = self.read_all_series(std::slice::from_ref(id), start, end, existence_required)?;
        all.pop()
            .ok_or_else(|| StoreError::corruption("batch read returned no result"))
    }

    /// Reads cadences `[start, end]` of float series in request order. A
    /// missing id is an error when `existence_required`, otherwise an empty
    /// series with `exists == false`.
    pub fn read_all_time_series_as_float(
        &self,
        ids: &[FsId],
        start: u64,
        end: u64,
        existence_required: bool,
    ) -> StoreResult<Vec<FloatTimeSeries>> {
        self.read_all_series(ids, start, end, existence_required)
    }

    /// Int form of [`read_all_time_series_as_float`](Self::read_all_time_series_as_float).
    pub fn read_all_time_series_as_int(
        &self,
        ids: &[FsId],
        start: u64,
        end: u64,
        existence_required: bool,
    ) -> StoreResult<Vec<IntTimeSeries>> {
        self.read_all_series(ids, start, end, existence_required)
    }

    /// Deletes cadence series.
    pub fn delete_time_series(&self, ids: &[FsId]) -> StoreResult<()> {
        self.backend.delete_time_series(self.require_xid()?, ids)
    }

    /// Writes MJD series.
    pub fn write_mjd_time_series(&self, series: &[MjdTimeSeries], overwrite: bool) -> StoreResult<()> {
        self.backend
            .write_mjd_time_series(self.require_xid()?, series, overwrite)
    }

    /// Reads samples in `[start, end]` of MJD series in request order.
    pub fn read_mjd_time_series(
        &self,
        ids: &[FsId],
        start: f64,
        end: f64,
        existence_required: bool,
    ) -> StoreResult<Vec<MjdTimeSeries>> {
        if start.is_nan() || end.is_nan() || start > end {
            return Err(StoreError::InvalidArgument(format!(
                "mjd range [{}, {}] is empty",
                start, end
            )));
        }
        let results = self
            .backend
            .read_mjd_time_series(self.xid.as_ref(), ids, start, end)?;
        ids.iter()
            .zip(results)
            .map(|(id, result)| match result {
                ReadResult::Found(series) => Ok(series),
                ReadResult::NotFound if existence_required => {
                    Err(StoreError::IdNotFound { id: id.clone() })
                }
                ReadResult::NotFound => Ok(MjdTimeSeries::empty(id.clone(), start, end)),
            })
            .collect()
    }

    /// Deletes MJD series.
    pub fn delete_mjd_time_series(&self, ids: &[FsId]) -> StoreResult<()> {
        self.backend
            .delete_mjd_time_series(self.require_xid()?, ids)
    }

    /// Committed ids of `shape` under `path`.
    pub fn list_ids(&self, shape: Shape, path: &str) -> StoreResult<Vec<FsId>> {
        self.backend.list_ids(shape, path)
    }
}

impl Drop for FileStoreClient {
    fn drop(&mut self) {
        if let Some(xid) = self.xid.take() {
            debug!(xid = %xid, "client dropped with open transaction");
            if let Err(e) = self.backend.rollback(&xid) {
                warn!(xid = %xid, error = %e, "implicit rollback failed");
            }
        }
    }
}
