//! Unified error handling for route analysis.
//!
//! Every error surfaced to a caller carries the route id (where one applies)
//! and a stable reason code, so the API layer can report failures without
//! leaking internal details.

use std::fmt;

/// Unified error type for analysis operations.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// Track is unusable: too few points, bad coordinates or timestamps
    MalformedTrack { route_id: String, message: String },
    /// A required reference layer has not been loaded
    MissingReferenceLayer {
        route_id: Option<String>,
        layer: String,
    },
    /// No route registered under this id
    RouteNotFound { route_id: String },
    /// Configuration value out of range
    InvalidConfig { message: String },
    /// Reference layer input could not be parsed
    InvalidLayer { layer: String, message: String },
}

impl AnalysisError {
    /// Stable, machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AnalysisError::MalformedTrack { .. } => "malformed_track",
            AnalysisError::MissingReferenceLayer { .. } => "missing_reference_layer",
            AnalysisError::RouteNotFound { .. } => "route_not_found",
            AnalysisError::InvalidConfig { .. } => "invalid_config",
            AnalysisError::InvalidLayer { .. } => "invalid_layer",
        }
    }

    /// Route the error belongs to, if any.
    pub fn route_id(&self) -> Option<&str> {
        match self {
            AnalysisError::MalformedTrack { route_id, .. }
            | AnalysisError::RouteNotFound { route_id } => Some(route_id),
            AnalysisError::MissingReferenceLayer { route_id, .. } => route_id.as_deref(),
            AnalysisError::InvalidConfig { .. } | AnalysisError::InvalidLayer { .. } => None,
        }
    }

    /// Attach a route id to an error raised before the id was known.
    pub(crate) fn for_route(self, id: &str) -> Self {
        match self {
            AnalysisError::MalformedTrack { message, .. } => AnalysisError::MalformedTrack {
                route_id: id.to_string(),
                message,
            },
            AnalysisError::MissingReferenceLayer { layer, .. } => {
                AnalysisError::MissingReferenceLayer {
                    route_id: Some(id.to_string()),
                    layer,
                }
            }
            other => other,
        }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::MalformedTrack { route_id, message } => {
                write!(f, "Route '{}' has a malformed track: {}", route_id, message)
            }
            AnalysisError::MissingReferenceLayer {
                route_id: Some(route_id),
                layer,
            } => write!(
                f,
                "Route '{}' cannot be analyzed: reference layer '{}' is not loaded",
                route_id, layer
            ),
            AnalysisError::MissingReferenceLayer {
                route_id: None,
                layer,
            } => write!(f, "Reference layer '{}' is not loaded", layer),
            AnalysisError::RouteNotFound { route_id } => {
                write!(f, "Route '{}' not found", route_id)
            }
            AnalysisError::InvalidConfig { message } => {
                write!(f, "Configuration error: {}", message)
            }
            AnalysisError::InvalidLayer { layer, message } => {
                write!(f, "Invalid reference layer '{}': {}", layer, message)
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Result type alias for analysis operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Extension trait for converting Option to AnalysisError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a route-not-found error.
    fn ok_or_route_not_found(self, route_id: &str) -> Result<T>;

    /// Convert Option to Result with a missing-layer error.
    fn ok_or_missing_layer(self, layer: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_route_not_found(self, route_id: &str) -> Result<T> {
        self.ok_or_else(|| AnalysisError::RouteNotFound {
            route_id: route_id.to_string(),
        })
    }

    fn ok_or_missing_layer(self, layer: &str) -> Result<T> {
        self.ok_or_else(|| AnalysisError::MissingReferenceLayer {
            route_id: None,
            layer: layer.to_string(),
        })
    }
}
