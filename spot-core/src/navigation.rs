//! Navigation handoff: destination for a spot and the platform deep link that opens
//! turn-by-turn directions to it. Launching is the host's job.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::SpotRecord;
use crate::protocol::{Coordinate, SpotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    #[default]
    Web,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "web" => Ok(Platform::Web),
            other => Err(HandoffError::UnknownPlatform(other.to_string())),
        }
    }
}

/// What the launcher needs: where to go and how to open it.
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationRequest {
    pub spot_id: SpotId,
    pub destination: Coordinate,
    pub platform: Platform,
}

impl NavigationRequest {
    /// Destination is the centroid of the spot's polygon.
    pub fn for_spot(spot: &SpotRecord, platform: Platform) -> Result<Self, HandoffError> {
        let destination = spot.centroid().ok_or(HandoffError::NoGeometry(spot.id))?;
        Ok(Self {
            spot_id: spot.id,
            destination,
            platform,
        })
    }

    pub fn deep_link(&self) -> String {
        let Coordinate {
            latitude: lat,
            longitude: lng,
        } = self.destination;
        match self.platform {
            Platform::Ios => format!("maps://?daddr={lat},{lng}&dirflg=d"),
            Platform::Android => format!("google.navigation:q={lat},{lng}"),
            Platform::Web => format!(
                "https://www.google.com/maps/dir/?api=1&destination={lat},{lng}&travelmode=driving"
            ),
        }
    }
}

/// Navigation could not be started. Never fatal to a claim.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandoffError {
    #[error("spot {0} is not in the cache")]
    UnknownSpot(SpotId),
    #[error("spot {0} has no map geometry")]
    NoGeometry(SpotId),
    #[error("unknown platform {0:?}")]
    UnknownPlatform(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
}
