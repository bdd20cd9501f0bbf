//! Quadtree addressing.
//!
//! Every tile is addressed by a [`TileKey`] `z/x/y` and, equivalently, by its [`Tix`]: the
//! position of the tile in a breadth-first enumeration of the full quadtree,
//! `(4^z - 1) / 3 + y * 2^z + x`.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use deeptable_error::{DeeptableError, DeeptableResult, deeptable_bail, deeptable_err};
use serde::{Deserialize, Serialize};

/// The deepest zoom level whose tix still fits in a `u64`.
pub const MAX_ZOOM: u32 = 31;

/// The breadth-first index of a tile in the quadtree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tix(pub u64);

impl Display for Tix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tix({})", self.0)
    }
}

/// The number of tiles in all zoom levels above `z`, i.e. the tix of `z/0/0`.
#[inline]
fn level_offset(z: u32) -> u64 {
    ((1u64 << (2 * z)) - 1) / 3
}

/// Callers guarantee `z <= MAX_ZOOM` and `x, y < 2^z`.
#[inline]
fn linearize(z: u32, x: u32, y: u32) -> Tix {
    Tix(level_offset(z) + (u64::from(y) << z) + u64::from(x))
}

/// Linearize a tile address, failing if it does not name a tile of the quadtree.
pub fn zxy_to_tix(z: u32, x: u32, y: u32) -> DeeptableResult<Tix> {
    Ok(TileKey::try_new(z, x, y)?.tix())
}

/// Invert [`zxy_to_tix`].
///
/// Indices past the last tile of [`MAX_ZOOM`] yield coordinates outside that level, which
/// [`TileKey::from_tix`] rejects.
pub fn tix_to_zxy(tix: Tix) -> (u32, u32, u32) {
    let mut z = 0;
    while z < MAX_ZOOM && level_offset(z + 1) <= tix.0 {
        z += 1;
    }
    let within = tix.0 - level_offset(z);
    let side_mask = (1u64 << z) - 1;
    // Both halves are below 2^z <= 2^31.
    let x = u32::try_from(within & side_mask).unwrap_or(u32::MAX);
    let y = u32::try_from(within >> z).unwrap_or(u32::MAX);
    (z, x, y)
}

/// The tix of the parent tile, or `None` for the root.
pub fn parent_tix(tix: Tix) -> Option<Tix> {
    let parent = TileKey::from_tix(tix).ok()?.parent()?;
    Some(parent.tix())
}

/// The address of a tile, rendered as `"z/x/y"`. Always lies within the quadtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileKey {
    z: u32,
    x: u32,
    y: u32,
}

impl TileKey {
    pub const ROOT: TileKey = TileKey { z: 0, x: 0, y: 0 };

    /// Create a key, validating that `x` and `y` lie within zoom level `z`.
    pub fn try_new(z: u32, x: u32, y: u32) -> DeeptableResult<Self> {
        if z > MAX_ZOOM {
            deeptable_bail!("zoom level {} exceeds the maximum of {}", z, MAX_ZOOM);
        }
        let side = 1u64 << z;
        if u64::from(x) >= side || u64::from(y) >= side {
            deeptable_bail!("tile {}/{}/{} lies outside zoom level {}", z, x, y, z);
        }
        Ok(Self { z, x, y })
    }

    pub fn from_tix(tix: Tix) -> DeeptableResult<Self> {
        let (z, x, y) = tix_to_zxy(tix);
        Self::try_new(z, x, y)
    }

    pub fn tix(&self) -> Tix {
        linearize(self.z, self.x, self.y)
    }

    #[inline]
    pub fn z(&self) -> u32 {
        self.z
    }

    #[inline]
    pub fn x(&self) -> u32 {
        self.x
    }

    #[inline]
    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn is_root(&self) -> bool {
        self.z == 0
    }

    pub fn parent(&self) -> Option<TileKey> {
        (self.z > 0).then(|| TileKey {
            z: self.z - 1,
            x: self.x / 2,
            y: self.y / 2,
        })
    }

    /// The four possible children, ordered `(2x, 2y), (2x+1, 2y), (2x, 2y+1), (2x+1, 2y+1)`.
    /// Empty at [`MAX_ZOOM`].
    pub fn children(&self) -> Vec<TileKey> {
        if self.z >= MAX_ZOOM {
            return Vec::new();
        }
        let (z, x, y) = (self.z + 1, self.x * 2, self.y * 2);
        vec![
            TileKey { z, x, y },
            TileKey { z, x: x + 1, y },
            TileKey { z, x, y: y + 1 },
            TileKey {
                z,
                x: x + 1,
                y: y + 1,
            },
        ]
    }

    /// Whether `self` is a direct child of `parent`.
    pub fn is_child_of(&self, parent: &TileKey) -> bool {
        self.parent().as_ref() == Some(parent)
    }

    /// Which quadrant of its parent this tile covers, as `(x_bit, y_bit)`.
    pub fn quadrant(&self) -> (bool, bool) {
        (self.x % 2 == 1, self.y % 2 == 1)
    }
}

impl Display for TileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

impl FromStr for TileKey {
    type Err = DeeptableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/').map(|part| {
            part.parse::<u32>()
                .map_err(|e| deeptable_err!("invalid tile key {}: {}", s, e))
        });
        let (Some(z), Some(x), Some(y), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            deeptable_bail!("tile key {} is not of the form z/x/y", s);
        };
        TileKey::try_new(z?, x?, y?)
    }
}

impl Serialize for TileKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TileKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 0, 0, 0)]
    #[case(1, 0, 0, 1)]
    #[case(1, 1, 0, 2)]
    #[case(1, 0, 1, 3)]
    #[case(1, 1, 1, 4)]
    #[case(2, 0, 0, 5)]
    #[case(2, 3, 3, 20)]
    fn known_tix(#[case] z: u32, #[case] x: u32, #[case] y: u32, #[case] tix: u64) {
        assert_eq!(zxy_to_tix(z, x, y).unwrap(), Tix(tix));
        assert_eq!(tix_to_zxy(Tix(tix)), (z, x, y));
    }

    #[test]
    fn tix_round_trips() {
        for z in 0..7 {
            for x in 0..(1 << z) {
                for y in 0..(1 << z) {
                    assert_eq!(tix_to_zxy(zxy_to_tix(z, x, y).unwrap()), (z, x, y));
                }
            }
        }
        let deep = (30, (1 << 30) - 1, 12345);
        assert_eq!(tix_to_zxy(zxy_to_tix(deep.0, deep.1, deep.2).unwrap()), deep);
    }

    #[test]
    fn children_point_back_to_parent() {
        for tix in 0..341 {
            let key = TileKey::from_tix(Tix(tix)).unwrap();
            for child in key.children() {
                assert_eq!(parent_tix(child.tix()), Some(key.tix()));
                assert!(child.is_child_of(&key));
            }
        }
        assert_eq!(parent_tix(Tix(0)), None);
    }

    #[rstest]
    #[case(MAX_ZOOM + 1, 0, 0)]
    #[case(32, 0, 0)]
    #[case(64, 0, 0)]
    #[case(2, 4, 0)]
    #[case(2, 0, 4)]
    #[case(MAX_ZOOM, 1 << MAX_ZOOM, 0)]
    fn addresses_outside_the_tree_are_rejected(#[case] z: u32, #[case] x: u32, #[case] y: u32) {
        assert!(zxy_to_tix(z, x, y).is_err());
        assert!(TileKey::try_new(z, x, y).is_err());
    }

    #[test]
    fn deepest_level_has_no_children() {
        let side = (1u32 << MAX_ZOOM) - 1;
        let deepest = TileKey::try_new(MAX_ZOOM, side, side).unwrap();
        assert!(deepest.children().is_empty());
        assert_eq!(TileKey::from_tix(deepest.tix()).unwrap(), deepest);
        assert_eq!(deepest.tix(), Tix(level_offset(MAX_ZOOM) + (1u64 << (2 * MAX_ZOOM)) - 1));

        let above = deepest.parent().unwrap();
        assert_eq!(above.children().len(), 4);
        assert!(above.children().contains(&deepest));
    }

    #[test]
    fn indices_past_the_deepest_level_are_rejected() {
        let side = (1u32 << MAX_ZOOM) - 1;
        let past = Tix(TileKey::try_new(MAX_ZOOM, side, side).unwrap().tix().0 + 1);
        assert!(TileKey::from_tix(past).is_err());
        assert_eq!(parent_tix(past), None);
        assert!(TileKey::from_tix(Tix(u64::MAX)).is_err());
    }

    #[rstest]
    #[case("0/0/0", Some(TileKey::ROOT))]
    #[case("3/7/2", Some(TileKey { z: 3, x: 7, y: 2 }))]
    #[case("1/2/0", None)]
    #[case("1/0", None)]
    #[case("1/0/0/0", None)]
    #[case("a/b/c", None)]
    fn parse_keys(#[case] input: &str, #[case] expected: Option<TileKey>) {
        assert_eq!(input.parse::<TileKey>().ok(), expected);
        if let Some(key) = expected {
            assert_eq!(key.to_string(), input);
        }
    }

    #[test]
    fn serde_as_string() {
        let key = TileKey { z: 2, x: 1, y: 3 };
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2/1/3\"");
        assert_eq!(serde_json::from_str::<TileKey>(&json).unwrap(), key);
    }
}
