//! Coordinate spaces and the pure conversions between them.
//!
//! Three spaces exist: the fixed 1260x700 `normalized` reference used by
//! vision models, the browser `viewport` (CSS pixels of the page content
//! area) and the physical `screen`. Backends only ever receive a
//! [`NativePoint`], which can only be obtained through
//! [`CoordinateTransformer::resolve`] and is therefore always converted and
//! bounds-checked.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const REFERENCE_WIDTH: u32 = 1260;
pub const REFERENCE_HEIGHT: u32 = 700;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    Normalized,
    Viewport,
    Screen,
}

impl CoordinateSpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinateSpace::Normalized => "normalized",
            CoordinateSpace::Viewport => "viewport",
            CoordinateSpace::Screen => "screen",
        }
    }
}

impl fmt::Display for CoordinateSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoordinateSpace {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "normalized" | "normalised" | "lux_sdk" | "lux" => Ok(CoordinateSpace::Normalized),
            "viewport" | "page" => Ok(CoordinateSpace::Viewport),
            "screen" | "desktop" => Ok(CoordinateSpace::Screen),
            other => Err(ValidationError::UnknownCoordinateSpace(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn reference() -> Self {
        Self::new(REFERENCE_WIDTH, REFERENCE_HEIGHT)
    }

    /// Half-open containment: `0 <= x < width` and `0 <= y < height`.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x < self.width as f64 && y < self.height as f64
    }

    pub fn center(&self) -> (f64, f64) {
        (self.width as f64 / 2.0, self.height as f64 / 2.0)
    }
}

impl FromStr for Dimensions {
    type Err = ValidationError;

    /// Parses `WIDTHxHEIGHT`, e.g. `1280x720`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidValue {
            field: "dimensions",
            reason: format!("expected WIDTHxHEIGHT, got '{}'", raw),
        };
        let (w, h) = raw.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = w.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = h.trim().parse::<u32>().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub space: CoordinateSpace,
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(space: CoordinateSpace, x: f64, y: f64) -> Self {
        Self { space, x, y }
    }

    pub fn rounded(&self) -> (i64, i64) {
        (self.x.round() as i64, self.y.round() as i64)
    }
}

/// Screen position of the viewport's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
}

/// What a session currently knows about its drawable areas.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Surface {
    pub viewport: Option<Dimensions>,
    pub screen: Option<Dimensions>,
    pub viewport_origin: Option<Offset>,
}

impl Surface {
    pub fn dimensions(&self, space: CoordinateSpace) -> Option<Dimensions> {
        match space {
            CoordinateSpace::Normalized => Some(Dimensions::reference()),
            CoordinateSpace::Viewport => self.viewport,
            CoordinateSpace::Screen => self.screen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaleFactors {
    pub x: f64,
    pub y: f64,
}

impl ScaleFactors {
    pub fn between(from: Dimensions, to: Dimensions) -> Self {
        Self {
            x: to.width as f64 / from.width as f64,
            y: to.height as f64 / from.height as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Conversion {
    pub point: Point,
    /// Present when the conversion involved a resolution change.
    pub scale: Option<ScaleFactors>,
}

/// A validated position in a backend's own coordinate space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativePoint {
    space: CoordinateSpace,
    x: f64,
    y: f64,
}

impl NativePoint {
    pub fn space(&self) -> CoordinateSpace {
        self.space
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn as_point(&self) -> Point {
        Point::new(self.space, self.x, self.y)
    }

    /// Integer pixel position for input APIs that take whole pixels.
    pub fn pixel(&self) -> (i32, i32) {
        (self.x.round() as i32, self.y.round() as i32)
    }

    #[cfg(test)]
    pub(crate) fn unchecked(space: CoordinateSpace, x: f64, y: f64) -> Self {
        Self { space, x, y }
    }
}

/// Outcome of resolving a requested point into a backend's native space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub requested: Point,
    pub native: NativePoint,
    pub scale: Option<ScaleFactors>,
}

pub struct CoordinateTransformer;

impl CoordinateTransformer {
    pub fn convert(
        point: Point,
        to: CoordinateSpace,
        surface: &Surface,
    ) -> Result<Conversion, ValidationError> {
        let from = point.space;
        if from == to {
            return Ok(Conversion { point, scale: None });
        }

        match (from, to) {
            (CoordinateSpace::Viewport, CoordinateSpace::Screen) => {
                let origin = Self::origin(surface, from, to)?;
                Ok(Conversion {
                    point: Point::new(to, point.x + origin.x, point.y + origin.y),
                    scale: None,
                })
            }
            (CoordinateSpace::Screen, CoordinateSpace::Viewport) => {
                let origin = Self::origin(surface, from, to)?;
                Ok(Conversion {
                    point: Point::new(to, point.x - origin.x, point.y - origin.y),
                    scale: None,
                })
            }
            _ => {
                let source = Self::dimensions(surface, from, to, from)?;
                let target = Self::dimensions(surface, from, to, to)?;
                let scale = ScaleFactors::between(source, target);
                Ok(Conversion {
                    point: Point::new(to, point.x * scale.x, point.y * scale.y),
                    scale: Some(scale),
                })
            }
        }
    }

    pub fn validate_bounds(point: &Point, surface: &Surface) -> Result<bool, ValidationError> {
        let bounds = surface.dimensions(point.space).ok_or_else(|| {
            ValidationError::InvalidValue {
                field: "coordinates",
                reason: format!("{} dimensions are unknown for this session", point.space),
            }
        })?;
        Ok(bounds.contains(point.x, point.y))
    }

    /// Converts into `native` space and rejects anything outside its bounds.
    pub fn resolve(
        requested: Point,
        native: CoordinateSpace,
        surface: &Surface,
    ) -> Result<Resolution, ValidationError> {
        let conversion = Self::convert(requested, native, surface)?;
        let resolved = conversion.point;
        let bounds = surface
            .dimensions(native)
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "coordinates",
                reason: format!("{} dimensions are unknown for this session", native),
            })?;
        if !bounds.contains(resolved.x, resolved.y) {
            return Err(ValidationError::OutOfBounds {
                requested,
                resolved,
                bounds,
            });
        }
        Ok(Resolution {
            requested,
            native: NativePoint {
                space: native,
                x: resolved.x,
                y: resolved.y,
            },
            scale: conversion.scale,
        })
    }

    fn origin(
        surface: &Surface,
        from: CoordinateSpace,
        to: CoordinateSpace,
    ) -> Result<Offset, ValidationError> {
        surface
            .viewport_origin
            .ok_or_else(|| ValidationError::UnsupportedConversion {
                from,
                to,
                reason: "the viewport's position on screen is unknown for this session".into(),
            })
    }

    fn dimensions(
        surface: &Surface,
        from: CoordinateSpace,
        to: CoordinateSpace,
        space: CoordinateSpace,
    ) -> Result<Dimensions, ValidationError> {
        surface
            .dimensions(space)
            .ok_or_else(|| ValidationError::UnsupportedConversion {
                from,
                to,
                reason: format!("{} dimensions are unknown for this session", space),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser_surface(width: u32, height: u32) -> Surface {
        Surface {
            viewport: Some(Dimensions::new(width, height)),
            screen: Some(Dimensions::new(1920, 1080)),
            viewport_origin: Some(Offset { x: 12.0, y: 87.0 }),
        }
    }

    #[test]
    fn normalized_scales_into_viewport() {
        let surface = browser_surface(1280, 720);
        let conv = CoordinateTransformer::convert(
            Point::new(CoordinateSpace::Normalized, 400.0, 200.0),
            CoordinateSpace::Viewport,
            &surface,
        )
        .unwrap();

        assert_eq!(conv.point.rounded(), (406, 206));
        let scale = conv.scale.unwrap();
        assert!((scale.x - 1.016).abs() < 0.001);
        assert!((scale.y - 1.029).abs() < 0.001);
    }

    #[test]
    fn same_space_is_identity() {
        let surface = browser_surface(1280, 720);
        let p = Point::new(CoordinateSpace::Viewport, 10.5, 20.25);
        let conv = CoordinateTransformer::convert(p, CoordinateSpace::Viewport, &surface).unwrap();
        assert_eq!(conv.point, p);
        assert!(conv.scale.is_none());
    }

    #[test]
    fn round_trips_within_a_pixel() {
        let spaces = [
            CoordinateSpace::Normalized,
            CoordinateSpace::Viewport,
            CoordinateSpace::Screen,
        ];
        let sizes = [(1260, 700), (1280, 720), (1920, 1080), (800, 600), (2560, 1440)];
        for (w, h) in sizes {
            let surface = browser_surface(w, h);
            for from in spaces {
                for to in spaces {
                    for (x, y) in [(0.0, 0.0), (123.0, 456.0), (799.0, 599.0), (37.5, 11.25)] {
                        let p = Point::new(from, x, y);
                        let there = CoordinateTransformer::convert(p, to, &surface).unwrap();
                        let back =
                            CoordinateTransformer::convert(there.point, from, &surface).unwrap();
                        assert!(
                            (back.point.x - x).abs() <= 1.0 && (back.point.y - y).abs() <= 1.0,
                            "{from} -> {to} -> {from} drifted for ({x}, {y}) at {w}x{h}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn viewport_to_screen_needs_origin() {
        let surface = Surface {
            viewport: Some(Dimensions::new(1280, 720)),
            screen: Some(Dimensions::new(1920, 1080)),
            viewport_origin: None,
        };
        let err = CoordinateTransformer::convert(
            Point::new(CoordinateSpace::Viewport, 5.0, 5.0),
            CoordinateSpace::Screen,
            &surface,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedConversion { .. }));
    }

    #[test]
    fn viewport_to_screen_adds_origin() {
        let surface = browser_surface(1280, 720);
        let conv = CoordinateTransformer::convert(
            Point::new(CoordinateSpace::Viewport, 100.0, 50.0),
            CoordinateSpace::Screen,
            &surface,
        )
        .unwrap();
        assert_eq!(conv.point, Point::new(CoordinateSpace::Screen, 112.0, 137.0));
    }

    #[test]
    fn resolve_rejects_out_of_bounds() {
        let surface = browser_surface(1280, 720);
        let err = CoordinateTransformer::resolve(
            Point::new(CoordinateSpace::Viewport, 1500.0, 200.0),
            CoordinateSpace::Viewport,
            &surface,
        )
        .unwrap_err();
        match err {
            ValidationError::OutOfBounds { bounds, requested, .. } => {
                assert_eq!(bounds, Dimensions::new(1280, 720));
                assert_eq!(requested.x, 1500.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bounds_are_half_open() {
        let dims = Dimensions::new(1280, 720);
        assert!(dims.contains(0.0, 0.0));
        assert!(dims.contains(1279.0, 719.0));
        assert!(!dims.contains(1280.0, 10.0));
        assert!(!dims.contains(10.0, 720.0));
        assert!(!dims.contains(-1.0, 10.0));
    }

    #[test]
    fn parses_space_synonyms() {
        assert_eq!("lux_sdk".parse::<CoordinateSpace>().unwrap(), CoordinateSpace::Normalized);
        assert_eq!("Viewport".parse::<CoordinateSpace>().unwrap(), CoordinateSpace::Viewport);
        assert!("pixels".parse::<CoordinateSpace>().is_err());
    }

    #[test]
    fn parses_dimensions() {
        assert_eq!("1280x720".parse::<Dimensions>().unwrap(), Dimensions::new(1280, 720));
        assert!("1280".parse::<Dimensions>().is_err());
        assert!("0x720".parse::<Dimensions>().is_err());
    }
}
