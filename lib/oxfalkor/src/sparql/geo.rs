//! Translation of the supported GeoSPARQL function family into
//! Cypher point/distance fragments.
//!
//! `POINT` geometries become `point({latitude: …, longitude: …})`
//! constructors; every other recognized geometry is reduced to its
//! bounding box and represented by the box center together with the
//! circumscribed-circle radius in meters. Coordinates are WGS-84 and
//! WKT ordering is `lon lat`.

use geo::{BoundingRect, Geometry};
use thiserror::Error;
use wkt::TryFromWkt;

/// List of the GeoSPARQL functions the translator pushes down.
pub mod geosparql_functions {
    use oxrdf::NamedNodeRef;

    pub const DISTANCE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.opengis.net/def/function/geosparql/distance");
    pub const SF_WITHIN: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.opengis.net/def/function/geosparql/sfWithin");
    pub const SF_CONTAINS: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.opengis.net/def/function/geosparql/sfContains");
    pub const SF_INTERSECTS: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.opengis.net/def/function/geosparql/sfIntersects");
}

/// An error raised when a geospatial input cannot be parsed as WKT.
#[derive(Debug, Clone, Error)]
#[error("invalid WKT geometry: {0}")]
pub struct InvalidWktError(String);

/// A geometry reduced to what the Cypher fragments need.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum GeoArg {
    Point {
        latitude: f64,
        longitude: f64,
    },
    BoundingBox {
        min_latitude: f64,
        min_longitude: f64,
        max_latitude: f64,
        max_longitude: f64,
        center_latitude: f64,
        center_longitude: f64,
    },
}

impl GeoArg {
    /// The representative point of the geometry.
    pub(crate) fn center(&self) -> (f64, f64) {
        match self {
            Self::Point {
                latitude,
                longitude,
            } => (*latitude, *longitude),
            Self::BoundingBox {
                center_latitude,
                center_longitude,
                ..
            } => (*center_latitude, *center_longitude),
        }
    }

    /// Radius in meters of the circle circumscribing the bounding
    /// box; zero for points.
    pub(crate) fn radius_meters(&self) -> f64 {
        match self {
            Self::Point { .. } => 0.0,
            Self::BoundingBox {
                max_latitude,
                max_longitude,
                center_latitude,
                center_longitude,
                ..
            } => haversine_meters(
                *center_latitude,
                *center_longitude,
                *max_latitude,
                *max_longitude,
            ),
        }
    }
}

/// Parses a WKT literal value, accepting the optional CRS84 reference
/// system prefix used by `geo:wktLiteral`.
pub(crate) fn parse_geometry(value: &str) -> Result<GeoArg, InvalidWktError> {
    let mut value = value.trim_start();
    if let Some(rest) = value.strip_prefix('<') {
        let (system, rest) = rest.split_once('>').unwrap_or((rest, ""));
        if system != "http://www.opengis.net/def/crs/OGC/1.3/CRS84" {
            return Err(InvalidWktError(format!(
                "unsupported coordinate reference system {system}"
            )));
        }
        value = rest.trim_start();
    }
    let geometry = Geometry::try_from_wkt_str(value)
        .map_err(|e| InvalidWktError(e.to_string()))?;
    if let Geometry::Point(point) = geometry {
        return Ok(GeoArg::Point {
            latitude: point.y(),
            longitude: point.x(),
        });
    }
    let rect = geometry
        .bounding_rect()
        .ok_or_else(|| InvalidWktError("empty geometry".into()))?;
    Ok(GeoArg::BoundingBox {
        min_latitude: rect.min().y,
        min_longitude: rect.min().x,
        max_latitude: rect.max().y,
        max_longitude: rect.max().x,
        center_latitude: (rect.min().y + rect.max().y) / 2.0,
        center_longitude: (rect.min().x + rect.max().x) / 2.0,
    })
}

const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance between two WGS-84 coordinates.
pub(crate) fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().atan2((1.0 - a).sqrt())
}
