//! Map definition loading and the pre-rendered map payload
//!
//! The map message is identical for every connection, so it is serialized
//! once per match and byte-copied into each new connection's first buffer.

use std::path::Path;

use bytes::Bytes;
use tracing::info;

use crate::ws::protocol::{MapMsg, MapObject, MapPlace, MsgStream, ProtocolError, WORLD_EXTENT};

use super::physics::Vec2;

/// Upper bound of the rendered map payload in bytes
pub const MAP_CAPACITY: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("failed to read map file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid map definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("map does not fit the wire format: {0}")]
    Encode(#[from] ProtocolError),

    #[error("map of {width}x{height} exceeds the {max} unit wire extent")]
    TooLarge { width: u16, height: u16, max: f32 },

    #[error("{what} at ({x}, {y}) lies outside the map")]
    OutOfBounds { what: &'static str, x: f32, y: f32 },
}

/// Every coordinate of the map must survive position quantisation
fn check_bounds(map: &MapMsg) -> Result<(), MapError> {
    let fits = |side: u16| side > 0 && side as f32 <= WORLD_EXTENT;
    if !fits(map.width) || !fits(map.height) {
        return Err(MapError::TooLarge {
            width: map.width,
            height: map.height,
            max: WORLD_EXTENT,
        });
    }

    let (w, h) = (map.width as f32, map.height as f32);
    let inside = |p: Vec2| (0.0..=w).contains(&p.x) && (0.0..=h).contains(&p.y);
    let objects = map.objects.iter().map(|o| ("map object", o.pos));
    let places = map.places.iter().map(|p| ("place", p.pos));
    match objects.chain(places).find(|(_, pos)| !inside(*pos)) {
        Some((what, pos)) => Err(MapError::OutOfBounds { what, x: pos.x, y: pos.y }),
        None => Ok(()),
    }
}

/// Load a map definition produced by the external map generator
pub fn load_map(path: impl AsRef<Path>) -> Result<MapMsg, MapError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let map: MapMsg = serde_json::from_str(&raw)?;
    info!(
        map_name = %map.map_name,
        objects = map.objects.len(),
        places = map.places.len(),
        "Loaded map definition"
    );
    Ok(map)
}

/// Empty map used when no definition file is configured
pub fn default_map(width: u16, height: u16, seed: u32) -> MapMsg {
    MapMsg {
        map_name: "main".to_string(),
        seed,
        width,
        height,
        shore_inset: 48,
        grass_inset: 18,
        places: vec![MapPlace {
            name: "Center".to_string(),
            pos: Vec2::new(width as f32 / 2.0, height as f32 / 2.0),
        }],
        objects: Vec::<MapObject>::new(),
    }
}

/// Connection-independent map message, serialized once
#[derive(Debug, Clone)]
pub struct MapSnapshot {
    bytes: Bytes,
}

impl MapSnapshot {
    pub fn render(map: &MapMsg) -> Result<Self, MapError> {
        check_bounds(map)?;
        let mut stream = MsgStream::new(4096, MAP_CAPACITY);
        stream.serialize_msg(map)?;
        let bytes = stream.take();
        info!(map_name = %map.map_name, bytes = bytes.len(), "Rendered map payload");
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::bitstream::BitReader;
    use crate::ws::protocol::{read_msg_type, MsgType};

    #[test]
    fn rendered_map_starts_with_its_tag() {
        let snapshot = MapSnapshot::render(&default_map(512, 512, 3)).unwrap();
        let mut r = BitReader::new(snapshot.as_bytes());
        assert_eq!(read_msg_type(&mut r).unwrap(), MsgType::Map);
        let map = MapMsg::deserialize(&mut r).unwrap();
        assert_eq!(map.width, 512);
        assert_eq!(map.seed, 3);
    }

    #[test]
    fn map_definition_parses_from_json() {
        let json = r#"{
            "map_name": "desert",
            "seed": 11,
            "width": 720,
            "height": 720,
            "objects": [{ "pos": { "x": 10.0, "y": 20.0 }, "object_type": 3 }]
        }"#;
        let map: MapMsg = serde_json::from_str(json).unwrap();
        assert_eq!(map.objects[0].scale, 1.0);
        assert_eq!(map.objects[0].ori, 0);
        assert!(map.places.is_empty());
    }

    #[test]
    fn oversized_maps_are_refused() {
        let err = MapSnapshot::render(&default_map(2048, 2048, 1)).unwrap_err();
        assert!(matches!(err, MapError::TooLarge { width: 2048, .. }));

        let mut map = default_map(1024, 1024, 1);
        map.objects.push(MapObject {
            pos: Vec2::new(1500.0, 1800.0),
            scale: 1.0,
            ori: 0,
            object_type: 3,
        });
        let err = MapSnapshot::render(&map).unwrap_err();
        assert!(matches!(err, MapError::OutOfBounds { what: "map object", .. }));
    }

    #[test]
    fn missing_map_file_is_an_io_error() {
        let err = load_map("/nonexistent/map.json").unwrap_err();
        assert!(matches!(err, MapError::Io(_)));
    }
}
