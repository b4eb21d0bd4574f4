//! Client-facing series and blob value types.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::intervals::{SimpleInterval, TaggedInterval};

/// Bytes per cadence sample in a random-access time series file.
pub const SAMPLE_BYTES: u64 = 4;

/// Element type recorded on a random-access file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DataType {
    /// Untyped bytes.
    #[default]
    Bytes,
    /// 32-bit IEEE floats.
    Float,
    /// 32-bit signed integers.
    Int,
}

impl DataType {
    /// Human readable name used in errors.
    pub fn describe(self) -> &'static str {
        match self {
            DataType::Bytes => "untyped bytes",
            DataType::Float => "float time series",
            DataType::Int => "int time series",
        }
    }
}

/// A 4-byte sample type of a cadence time series.
pub trait Sample: Copy + Default + PartialEq + std::fmt::Debug {
    /// Type tag stored with the file.
    const DATA_TYPE: DataType;
    /// Little-endian encoding.
    fn to_bytes(self) -> [u8; 4];
    /// Decodes a little-endian sample.
    fn from_bytes(bytes: [u8; 4]) -> Self;
}

impl Sample for f32 {
    const DATA_TYPE: DataType = DataType::Float;
    fn to_bytes(self) -> [u8; 4] {
        self.to_le_bytes()
    }
    fn from_bytes(bytes: [u8; 4]) -> Self {
        f32::from_le_bytes(bytes)
    }
}

impl Sample for i32 {
    const DATA_TYPE: DataType = DataType::Int;
    fn to_bytes(self) -> [u8; 4] {
        self.to_le_bytes()
    }
    fn from_bytes(bytes: [u8; 4]) -> Self {
        i32::from_le_bytes(bytes)
    }
}

/// A cadence-indexed series covering `[start_cadence, end_cadence]`.
///
/// `gaps[i]` marks cadence `start_cadence + i` as missing; its value is
/// meaningless. `origins` records which producer wrote which cadences.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries<T> {
    /// Series id.
    pub id: FsId,
    /// First cadence.
    pub start_cadence: u64,
    /// Last cadence (inclusive).
    pub end_cadence: u64,
    /// One sample per cadence.
    pub values: Vec<T>,
    /// One gap flag per cadence.
    pub gaps: Vec<bool>,
    /// Producer ranges in cadence units.
    pub origins: Vec<TaggedInterval>,
    /// False for the placeholder returned for a missing series.
    pub exists: bool,
}

/// Float samples.
pub type FloatTimeSeries = TimeSeries<f32>;
/// Int samples.
pub type IntTimeSeries = TimeSeries<i32>;

impl<T: Sample> TimeSeries<T> {
    /// Creates a series starting at `start_cadence` whose non-gap cadences
    /// were all produced by `origin`.
    pub fn new(
        id: FsId,
        start_cadence: u64,
        values: Vec<T>,
        gaps: Vec<bool>,
        origin: u64,
    ) -> StoreResult<Self> {
        if values.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "time series {} has no samples",
                id
            )));
        }
        let end_cadence = start_cadence + values.len() as u64 - 1;
        let mut series = Self {
            id,
            start_cadence,
            end_cadence,
            values,
            gaps,
            origins: Vec::new(),
            exists: true,
        };
        series.origins = series
            .valid_cadences()
            .into_iter()
            .map(|v| TaggedInterval::new(v.start, v.end, origin))
            .collect();
        series.validate()?;
        Ok(series)
    }

    /// Creates a series with explicit producer ranges.
    pub fn with_origins(
        id: FsId,
        start_cadence: u64,
        values: Vec<T>,
        gaps: Vec<bool>,
        origins: Vec<TaggedInterval>,
    ) -> StoreResult<Self> {
        let end_cadence = (start_cadence + values.len() as u64).saturating_sub(1);
        let series = Self {
            id,
            start_cadence,
            end_cadence,
            values,
            gaps,
            origins,
            exists: true,
        };
        series.validate()?;
        Ok(series)
    }

    /// Placeholder for a series that does not exist: every cadence is a gap.
    pub fn empty(id: FsId, start_cadence: u64, end_cadence: u64) -> Self {
        let n = (end_cadence - start_cadence + 1) as usize;
        Self {
            id,
            start_cadence,
            end_cadence,
            values: vec![T::default(); n],
            gaps: vec![true; n],
            origins: Vec::new(),
            exists: false,
        }
    }

    /// Number of cadences covered.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the series covers no cadences.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Runs of non-gap cadences.
    pub fn valid_cadences(&self) -> Vec<SimpleInterval> {
        let mut runs = Vec::new();
        let mut run_start: Option<u64> = None;
        for (i, gap) in self.gaps.iter().enumerate() {
            let cadence = self.start_cadence + i as u64;
            match (run_start, *gap) {
                (None, false) => run_start = Some(cadence),
                (Some(s), true) => {
                    runs.push(SimpleInterval::new(s, cadence - 1));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            runs.push(SimpleInterval::new(s, self.end_cadence));
        }
        runs
    }

    fn validate(&self) -> StoreResult<()> {
        if self.values.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "time series {} has no samples",
                self.id
            )));
        }
        if self.gaps.len() != self.values.len() {
            return Err(StoreError::InvalidArgument(format!(
                "time series {} has {} values but {} gap flags",
                self.id,
                self.values.len(),
                self.gaps.len()
            )));
        }
        if let Some(bad) = self
            .origins
            .iter()
            .find(|o| o.start > o.end || o.start < self.start_cadence || o.end > self.end_cadence)
        {
            return Err(StoreError::InvalidArgument(format!(
                "origin [{}, {}] outside of time series {} [{}, {}]",
                bad.start, bad.end, self.id, self.start_cadence, self.end_cadence
            )));
        }
        Ok(())
    }
}

/// One sample of an MJD-indexed series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MjdPoint {
    /// Modified Julian Date of the sample.
    pub mjd: f64,
    /// Sample value.
    pub value: f32,
    /// Producer of this sample.
    pub origin: u64,
}

/// A sparse series of time-tagged samples within `[start_mjd, end_mjd]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MjdTimeSeries {
    /// Series id.
    pub id: FsId,
    /// Start of the covered time range.
    pub start_mjd: f64,
    /// End of the covered time range (inclusive).
    pub end_mjd: f64,
    /// Samples in ascending `mjd` order.
    pub points: Vec<MjdPoint>,
    /// False for the placeholder returned for a missing series.
    pub exists: bool,
}

impl MjdTimeSeries {
    /// Creates a series, checking that all points fall in range and are
    /// strictly ascending.
    pub fn new(id: FsId, start_mjd: f64, end_mjd: f64, points: Vec<MjdPoint>) -> StoreResult<Self> {
        if start_mjd.is_nan() || end_mjd.is_nan() || start_mjd > end_mjd {
            return Err(StoreError::InvalidArgument(format!(
                "mjd range [{}, {}] of {} is empty",
                start_mjd, end_mjd, id
            )));
        }
        if points.iter().any(|p| p.mjd < start_mjd || p.mjd > end_mjd) {
            return Err(StoreError::InvalidArgument(format!(
                "mjd series {} has samples outside [{}, {}]",
                id, start_mjd, end_mjd
            )));
        }
        if points.windows(2).any(|w| w[0].mjd >= w[1].mjd) {
            return Err(StoreError::InvalidArgument(format!(
                "mjd series {} is not strictly ascending",
                id
            )));
        }
        Ok(Self {
            id,
            start_mjd,
            end_mjd,
            points,
            exists: true,
        })
    }

    /// Placeholder for a series that does not exist.
    pub fn empty(id: FsId, start_mjd: f64, end_mjd: f64) -> Self {
        Self {
            id,
            start_mjd,
            end_mjd,
            points: Vec::new(),
            exists: false,
        }
    }
}

/// An opaque payload with its producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobResult {
    /// Producer of the payload.
    pub origin: u64,
    /// The payload.
    pub data: Vec<u8>,
}
