//! Job descriptors for the georeferencing batch.
//!
//! This module defines the core catalog types:
//!
//! - `JobDescriptor`: one image to georeference, as selected from the catalog
//! - `GroundControlPoint`: a geographic corner coordinate in the target CRS
//! - `JobFilter`: pattern filters applied by the catalog query

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A geographic coordinate in the target coordinate reference system.
///
/// Depending on the EPSG code this is either an (easting, northing) pair in
/// meters or a (longitude, latitude) pair in degrees; the pipeline passes the
/// values through to the GDAL tools verbatim either way.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundControlPoint {
    /// Easting (or longitude) in the target CRS.
    pub easting: f64,
    /// Northing (or latitude) in the target CRS.
    pub northing: f64,
}

impl GroundControlPoint {
    /// Creates a new ground control point.
    pub fn new(easting: f64, northing: f64) -> Self {
        Self { easting, northing }
    }
}

/// One image to georeference, as read from the catalog.
///
/// Descriptors are populated by column name (never by column position) and
/// are immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// EPSG code of the target coordinate reference system.
    pub epsg: u32,
    /// Path to the raw capture file.
    pub source_path: PathBuf,
    /// Path the georeferenced tile is written to.
    pub target_path: PathBuf,
    /// North-east image corner in the target CRS.
    pub north_east: GroundControlPoint,
    /// North-west image corner in the target CRS.
    pub north_west: GroundControlPoint,
    /// South-east image corner in the target CRS.
    pub south_east: GroundControlPoint,
    /// South-west image corner in the target CRS.
    pub south_west: GroundControlPoint,
}

impl JobDescriptor {
    /// Returns the four corners in a fixed order (NE, NW, SE, SW).
    pub fn corners(&self) -> [GroundControlPoint; 4] {
        [
            self.north_east,
            self.north_west,
            self.south_east,
            self.south_west,
        ]
    }

    /// Returns true if all four corners are pairwise distinct.
    ///
    /// This is the only geometric validation performed; degenerate but
    /// distinct quadrilaterals surface as tool failures downstream.
    pub fn corners_distinct(&self) -> bool {
        let corners = self.corners();
        for i in 0..corners.len() {
            for j in (i + 1)..corners.len() {
                if corners[i] == corners[j] {
                    return false;
                }
            }
        }
        true
    }
}

/// Pattern filters applied by the catalog query.
///
/// Each field is a POSIX regular expression matched server-side; every
/// pattern defaults to matching everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFilter {
    /// Image data location (e.g. survey area) pattern.
    pub location: String,
    /// Session name pattern.
    pub session: String,
    /// Transect name pattern.
    pub transect: String,
    /// Camera name pattern.
    pub camera: String,
    /// Image identifier pattern.
    pub image: String,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            location: ".*".to_string(),
            session: ".*".to_string(),
            transect: ".*".to_string(),
            camera: ".*".to_string(),
            image: ".*".to_string(),
        }
    }
}

impl JobFilter {
    /// Creates a filter matching every catalog row.
    pub fn match_all() -> Self {
        Self::default()
    }

    /// Sets the location pattern.
    pub fn with_location(mut self, pattern: impl Into<String>) -> Self {
        self.location = pattern.into();
        self
    }

    /// Sets the session pattern.
    pub fn with_session(mut self, pattern: impl Into<String>) -> Self {
        self.session = pattern.into();
        self
    }

    /// Sets the transect pattern.
    pub fn with_transect(mut self, pattern: impl Into<String>) -> Self {
        self.transect = pattern.into();
        self
    }

    /// Sets the camera pattern.
    pub fn with_camera(mut self, pattern: impl Into<String>) -> Self {
        self.camera = pattern.into();
        self
    }

    /// Sets the image identifier pattern.
    pub fn with_image(mut self, pattern: impl Into<String>) -> Self {
        self.image = pattern.into();
        self
    }
}
