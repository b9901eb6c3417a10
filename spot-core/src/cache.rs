//! Spot state cache: last known status of every tracked space and congestion of every lot.
//! Replaced wholesale on refresh; readers hold an immutable snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::{Coordinate, LotId, LotSnapshot, SpotId, SpotStatus};

/// Congestion above this fraction renders as congested (yellow).
pub const CONGESTED_THRESHOLD: f64 = 0.85;

/// Fraction of a lot's capacity in use. `Unknown` is never treated as zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Congestion {
    Known(f64),
    Unknown,
}

impl Congestion {
    pub fn fraction(self) -> Option<f64> {
        match self {
            Congestion::Known(f) => Some(f),
            Congestion::Unknown => None,
        }
    }

    pub fn level(self) -> CongestionLevel {
        match self {
            Congestion::Unknown => CongestionLevel::Unknown,
            Congestion::Known(f) if f > CONGESTED_THRESHOLD => CongestionLevel::Congested,
            Congestion::Known(_) => CongestionLevel::Open,
        }
    }
}

/// Display bucket: gray / green / yellow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionLevel {
    Unknown,
    Open,
    Congested,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotRecord {
    pub id: SpotId,
    pub lot_id: LotId,
    /// Polygon boundary; opaque except for navigation.
    pub geometry: Vec<Coordinate>,
    pub status: SpotStatus,
    pub block: Option<u32>,
}

impl SpotRecord {
    /// Average of the polygon vertices, ignoring a closing vertex that repeats the first.
    pub fn centroid(&self) -> Option<Coordinate> {
        let mut points: &[Coordinate] = &self.geometry;
        if points.len() > 1 && points.first() == points.last() {
            points = &points[..points.len() - 1];
        }
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;
        let (lat, lon) = points
            .iter()
            .fold((0.0, 0.0), |(a, b), c| (a + c.latitude, b + c.longitude));
        Some(Coordinate {
            latitude: lat / n,
            longitude: lon / n,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LotRecord {
    pub lot_id: LotId,
    pub name: String,
    pub congestion: Congestion,
    pub spot_count: usize,
}

/// One consistent view of the cache. Spots and lots always come from the same refresh.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    version: u64,
    spots: HashMap<SpotId, SpotRecord>,
    lots: BTreeMap<LotId, LotRecord>,
}

impl CacheSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, spot_id: SpotId) -> Option<&SpotRecord> {
        self.spots.get(&spot_id)
    }

    /// Congestion of a lot; `Unknown` for lots absent from this snapshot.
    pub fn lot_congestion(&self, lot_id: &str) -> Congestion {
        self.lots
            .get(lot_id)
            .map(|l| l.congestion)
            .unwrap_or(Congestion::Unknown)
    }

    pub fn lot(&self, lot_id: &str) -> Option<&LotRecord> {
        self.lots.get(lot_id)
    }

    /// Lots ordered by id.
    pub fn lots(&self) -> impl Iterator<Item = &LotRecord> {
        self.lots.values()
    }

    /// Spots of one lot ordered by id.
    pub fn spots_in_lot(&self, lot_id: &str) -> Vec<&SpotRecord> {
        let mut out: Vec<&SpotRecord> = self
            .spots
            .values()
            .filter(|s| s.lot_id == lot_id)
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn spot_count(&self) -> usize {
        self.spots.len()
    }
}

/// What changed in a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub version: u64,
    pub spots: usize,
    pub lots: usize,
    pub added: usize,
    pub dropped: usize,
}

pub struct SpotCache {
    current: Arc<CacheSnapshot>,
}

impl SpotCache {
    pub fn new() -> Self {
        Self {
            current: Arc::new(CacheSnapshot::default()),
        }
    }

    /// Replace every spot and lot with the contents of `lots`. The new snapshot becomes
    /// visible in a single pointer swap; previously handed-out snapshots are untouched.
    pub fn refresh(&mut self, lots: Vec<LotSnapshot>) -> RefreshSummary {
        let mut spots: HashMap<SpotId, SpotRecord> = HashMap::new();
        let mut lot_records: BTreeMap<LotId, LotRecord> = BTreeMap::new();

        for lot in lots {
            let mut count = 0usize;
            let mut busy = 0usize;
            for space in lot.spaces {
                if spots.contains_key(&space.id) {
                    warn!(spot_id = space.id, lot_id = %lot.lot_id, "duplicate spot id in refresh; keeping first");
                    continue;
                }
                let status = SpotStatus::from_code(space.status).unwrap_or_else(|| {
                    warn!(spot_id = space.id, code = space.status, "unknown spot status code; treating as occupied");
                    SpotStatus::Occupied
                });
                if status != SpotStatus::Available {
                    busy += 1;
                }
                count += 1;
                spots.insert(
                    space.id,
                    SpotRecord {
                        id: space.id,
                        lot_id: lot.lot_id.clone(),
                        geometry: space.coordinates,
                        status,
                        block: space.block,
                    },
                );
            }
            let congestion = match lot.congestion_percent {
                Some(p) if p.is_finite() => Congestion::Known(p.clamp(0.0, 1.0)),
                _ if count > 0 => Congestion::Known(busy as f64 / count as f64),
                _ => Congestion::Unknown,
            };
            let name = lot.name.unwrap_or_else(|| lot.lot_id.clone());
            lot_records.insert(
                lot.lot_id.clone(),
                LotRecord {
                    lot_id: lot.lot_id,
                    name,
                    congestion,
                    spot_count: count,
                },
            );
        }

        let previous = &self.current;
        let added = spots.keys().filter(|id| previous.get(**id).is_none()).count();
        let dropped = previous
            .spots
            .keys()
            .filter(|id| !spots.contains_key(*id))
            .count();
        let summary = RefreshSummary {
            version: previous.version + 1,
            spots: spots.len(),
            lots: lot_records.len(),
            added,
            dropped,
        };
        self.current = Arc::new(CacheSnapshot {
            version: summary.version,
            spots,
            lots: lot_records,
        });
        debug!(
            version = summary.version,
            spots = summary.spots,
            lots = summary.lots,
            added,
            dropped,
            "spot cache refreshed"
        );
        summary
    }

    pub fn get(&self, spot_id: SpotId) -> Option<&SpotRecord> {
        self.current.get(spot_id)
    }

    pub fn lot_congestion(&self, lot_id: &str) -> Congestion {
        self.current.lot_congestion(lot_id)
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn version(&self) -> u64 {
        self.current.version
    }
}

impl Default for SpotCache {
    fn default() -> Self {
        Self::new()
    }
}
