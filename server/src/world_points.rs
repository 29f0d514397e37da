//! Spawn point sets extracted from the static scene description.
//!
//! The scene file is line-oriented: node headers carry the group name and
//! the following transform line carries a 12-float basis whose last three
//! components are the node origin. The scanner only cares about the four
//! point groups the population task draws from.

use log::info;
use rand::Rng;

use shared::math::Vector3;

#[derive(Debug, Default, Clone)]
pub struct WorldPoints {
    pub fish: Vec<Vector3>,
    pub trash: Vec<Vector3>,
    pub shoreline: Vec<Vector3>,
    pub hidden: Vec<Vector3>,
}

impl WorldPoints {
    pub fn from_scene_text(text: &str) -> Self {
        let mut points = Self::default();
        let mut current_group: Option<PointGroup> = None;

        for line in text.lines() {
            let line = line.trim();
            if let Some(name) = node_name(line) {
                current_group = PointGroup::classify(name);
                continue;
            }
            if let (Some(group), Some(origin)) = (current_group, transform_origin(line)) {
                match group {
                    PointGroup::Fish => points.fish.push(origin),
                    PointGroup::Trash => points.trash.push(origin),
                    PointGroup::Shoreline => points.shoreline.push(origin),
                    PointGroup::Hidden => points.hidden.push(origin),
                }
            }
        }

        info!(
            "scene points: {} fish, {} trash, {} shoreline, {} hidden",
            points.fish.len(),
            points.trash.len(),
            points.shoreline.len(),
            points.hidden.len()
        );
        points
    }

    pub fn is_empty(&self) -> bool {
        self.fish.is_empty()
            && self.trash.is_empty()
            && self.shoreline.is_empty()
            && self.hidden.is_empty()
    }

    pub fn fish_point(&self, rng: &mut impl Rng) -> Option<Vector3> {
        pick(&self.fish, rng)
    }

    pub fn hidden_point(&self, rng: &mut impl Rng) -> Option<Vector3> {
        pick(&self.hidden, rng)
    }

    /// Metal spots favor trash piles, with the occasional shoreline or
    /// hidden placement.
    pub fn metal_point(&self, rng: &mut impl Rng) -> Option<Vector3> {
        let roll: f64 = rng.gen();
        let preferred = if roll < 0.15 {
            &self.hidden
        } else if roll < 0.45 {
            &self.shoreline
        } else {
            &self.trash
        };
        pick(preferred, rng)
            .or_else(|| pick(&self.trash, rng))
            .or_else(|| pick(&self.shoreline, rng))
            .or_else(|| pick(&self.hidden, rng))
    }
}

#[derive(Debug, Clone, Copy)]
enum PointGroup {
    Fish,
    Trash,
    Shoreline,
    Hidden,
}

impl PointGroup {
    fn classify(node_name: &str) -> Option<Self> {
        if node_name.starts_with("fish_spawn") {
            Some(PointGroup::Fish)
        } else if node_name.starts_with("trash_point") {
            Some(PointGroup::Trash)
        } else if node_name.starts_with("shoreline_point") {
            Some(PointGroup::Shoreline)
        } else if node_name.starts_with("hidden_spot") {
            Some(PointGroup::Hidden)
        } else {
            None
        }
    }
}

fn pick(points: &[Vector3], rng: &mut impl Rng) -> Option<Vector3> {
    if points.is_empty() {
        return None;
    }
    Some(points[rng.gen_range(0..points.len())])
}

/// Pulls the name attribute out of a `[node name="..."` header line.
fn node_name(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("[node name=\"")?;
    rest.split('"').next()
}

/// Pulls the origin out of a `transform = Transform( ... )` line; the last
/// three floats of the 12-float basis are the translation.
fn transform_origin(line: &str) -> Option<Vector3> {
    let rest = line.strip_prefix("transform = Transform(")?;
    let inner = rest.strip_suffix(')')?;
    let floats: Vec<f32> = inner
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .ok()?;
    if floats.len() != 12 {
        return None;
    }
    Some(Vector3::new(floats[9], floats[10], floats[11]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const SCENE: &str = r#"
[gd_scene load_steps=2 format=2]

[node name="zones" type="Spatial"]

[node name="fish_spawn" type="Position3D" parent="zones"]
transform = Transform( 1, 0, 0, 0, 1, 0, 0, 0, 1, -23.5, 1.25, 98 )

[node name="fish_spawn2" type="Position3D" parent="zones"]
transform = Transform( 1, 0, 0, 0, 1, 0, 0, 0, 1, 4, 0.5, 12 )

[node name="trash_point" type="Position3D" parent="zones"]
transform = Transform( 1, 0, 0, 0, 1, 0, 0, 0, 1, 7, 0, -3 )

[node name="dock" type="Spatial" parent="zones"]
transform = Transform( 1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0 )

[node name="hidden_spot" type="Position3D" parent="zones"]
transform = Transform( 1, 0, 0, 0, 1, 0, 0, 0, 1, -50, 2, 40 )
"#;

    #[test]
    fn test_scanner_extracts_grouped_origins() {
        let points = WorldPoints::from_scene_text(SCENE);
        assert_eq!(points.fish.len(), 2);
        assert_eq!(points.trash.len(), 1);
        assert_eq!(points.shoreline.len(), 0);
        assert_eq!(points.hidden.len(), 1);
        assert_eq!(points.fish[0], Vector3::new(-23.5, 1.25, 98.0));
        assert_eq!(points.trash[0], Vector3::new(7.0, 0.0, -3.0));
    }

    #[test]
    fn test_unnamed_transforms_are_ignored() {
        let points = WorldPoints::from_scene_text(
            "transform = Transform( 1, 0, 0, 0, 1, 0, 0, 0, 1, 5, 5, 5 )\n",
        );
        assert!(points.is_empty());
    }

    #[test]
    fn test_point_draws() {
        let points = WorldPoints::from_scene_text(SCENE);
        let mut rng = StdRng::seed_from_u64(3);
        let fish = points.fish_point(&mut rng).expect("fish point");
        assert!(points.fish.contains(&fish));
        // metal falls back to whatever set has entries
        assert!(points.metal_point(&mut rng).is_some());
        assert!(WorldPoints::default().fish_point(&mut rng).is_none());
    }
}
