//! # Transit Coverage
//!
//! GPS transit route analysis against a road network and census geography.
//!
//! This library provides:
//! - Map matching of recorded tracks onto a road network, with surface and
//!   administration composition of the matched portion
//! - Territorial overlay: municipalities traversed and localities served
//! - Walking-distance service areas over census blocks, per route and per
//!   municipality
//! - A route registry with per-route analysis state and batch analysis
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel batch analysis with rayon (default)
//!
//! ## Quick Start
//!
//! ```rust
//! use geo::{Geometry, LineString};
//! use transit_coverage::{AnalysisEngine, LayerFeature, ReferenceLayers, RouteRecord, TrackPoint};
//!
//! let road: LineString<f64> = vec![(-103.40, 20.67), (-103.38, 20.67)].into();
//! let mut props = serde_json::Map::new();
//! props.insert("CONDICION".into(), "Pavimentada".into());
//!
//! // Boundaries and census blocks are required too; empty layers will do here
//! let layers = ReferenceLayers::new()
//!     .with_roads(vec![LayerFeature::new("r1", Geometry::LineString(road), props)])
//!     .with_municipalities(vec![])
//!     .with_census_blocks(vec![]);
//!
//! let engine = AnalysisEngine::new(layers);
//! engine.register_route(RouteRecord::new(
//!     "ruta-1",
//!     None,
//!     vec![
//!         TrackPoint::new(-103.399, 20.67),
//!         TrackPoint::new(-103.395, 20.67),
//!         TrackPoint::new(-103.390, 20.67),
//!     ],
//! ));
//!
//! let result = engine.analyze("ruta-1").unwrap();
//! assert_eq!(result.confianza_matching.percent(), Some(100.0));
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{AnalysisError, OptionExt, Result};

// Geographic utilities (distance, projection, segment geometry)
pub mod geo_utils;

// Feature parts and buffered corridors
pub mod geometry;
pub use geometry::{Corridor, FeaturePart};

// Attribute resolution across heterogeneous layer schemas
pub mod attributes;
pub use attributes::{AdminClass, Ambito, SemanticField, SurfaceClass};

// Spatially indexed reference layers
pub mod layers;
pub use layers::{
    CensusBlock, LayerFeature, LayerIndex, Locality, MunicipalBoundary, ReferenceLayers,
    RoadSegment,
};

// Recorded tracks and trip metrics
pub mod track;
pub use track::{Track, TrackMetrics, TrackPoint};

// Map matching onto the road network
pub mod matcher;
pub use matcher::{match_track, MatchConfidence, MatchedSegment, TrackMatch};

// Surface / administration / road-type composition
pub mod composition;
pub use composition::{AdminBreakdown, RoadComposition, SurfaceBreakdown};

// Municipalities and localities along a route
pub mod overlay;
pub use overlay::{LocalityRef, TerritorialOverlay, TraversedMunicipality};

// Census population within walking distance
pub mod service_area;
pub use service_area::{PopulationStats, ServiceArea, WALKING_DISTANCE_M};

// Public result shapes
pub mod result;
pub use result::{AnalysisResult, MunicipalityRollup};

// Stateful route registry and batch analysis
pub mod engine;
pub use engine::{
    analyze_route, AnalysisEngine, AnalysisState, BatchFailure, BatchReport, CancellationToken,
    RouteAnalysis, RouteRecord,
};

/// Smallest accepted buffer distance, in meters.
pub const MIN_BUFFER_DISTANCE_M: f64 = 10.0;

/// Largest accepted buffer distance, in meters.
pub const MAX_BUFFER_DISTANCE_M: f64 = 500.0;

/// Buffer distance used when none is configured, in meters.
pub const DEFAULT_BUFFER_DISTANCE_M: f64 = 50.0;

/// Configuration captured when an analysis starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Matching and territorial overlay buffer, in meters.
    /// Must lie in [10, 500]. Default: 50.0
    pub buffer_distance_m: f64,

    /// Compute the service area from the road-snapped line instead of the raw
    /// track. Falls back to the raw track when nothing matched.
    /// Default: true
    pub prefer_matched_geometry: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            buffer_distance_m: DEFAULT_BUFFER_DISTANCE_M,
            prefer_matched_geometry: true,
        }
    }
}

impl AnalysisConfig {
    /// Check every value is in range.
    pub fn validate(&self) -> Result<()> {
        let b = self.buffer_distance_m;
        if !b.is_finite() || !(MIN_BUFFER_DISTANCE_M..=MAX_BUFFER_DISTANCE_M).contains(&b) {
            return Err(AnalysisError::InvalidConfig {
                message: format!(
                    "buffer_distance_m must be between {} and {} (got {})",
                    MIN_BUFFER_DISTANCE_M, MAX_BUFFER_DISTANCE_M, b
                ),
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON config. Missing fields take their defaults.
    ///
    /// # Example
    /// ```
    /// use transit_coverage::AnalysisConfig;
    ///
    /// let config = AnalysisConfig::from_json(r#"{"buffer_distance_m": 80}"#).unwrap();
    /// assert_eq!(config.buffer_distance_m, 80.0);
    /// assert!(config.prefer_matched_geometry);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| AnalysisError::InvalidConfig {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }
}
