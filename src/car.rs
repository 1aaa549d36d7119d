use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use glam::{Mat4, Vec3};

/// Decoded equirectangular environment image.
///
/// One instance is shared (via `Arc`) between the scene background and every
/// mesh part; toggling the environment light swaps the reference, never the
/// pixel data.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentMap {
    pub width: u32,
    pub height: u32,
    /// Linear RGB texels, row major, three floats per pixel.
    pub pixels: Vec<f32>,
}

/// Semantic part category, decided once at load time and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartCategory {
    Paint,
    Caliper,
    Other,
}

impl PartCategory {
    /// Classifies a node, preferring an explicit `category` tag from the
    /// asset's extras. Substring matching on the node name is kept as a
    /// fallback for assets authored before the tags existed.
    pub fn classify(name: &str, tag: Option<&str>) -> Self {
        if let Some(tag) = tag {
            return match tag {
                "paint" => Self::Paint,
                "caliper" => Self::Caliper,
                _ => Self::Other,
            };
        }
        let name = name.to_ascii_lowercase();
        if name.contains("paint") {
            Self::Paint
        } else if name.contains("caliper") {
            Self::Caliper
        } else {
            Self::Other
        }
    }
}

/// Surface material, tagged by capability.
///
/// Clear coat parameters exist only on the `PhysicallyBased` variant; code
/// that applies settings pattern-matches on the variant instead of probing
/// for fields at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Material {
    Basic {
        color: Vec3,
    },
    Standard {
        color: Vec3,
        metalness: f32,
        roughness: f32,
    },
    PhysicallyBased {
        color: Vec3,
        metalness: f32,
        roughness: f32,
        clear_coat: f32,
        clear_coat_roughness: f32,
    },
}

impl Material {
    pub fn color(&self) -> Vec3 {
        match self {
            Self::Basic { color }
            | Self::Standard { color, .. }
            | Self::PhysicallyBased { color, .. } => *color,
        }
    }

    pub fn set_color(&mut self, value: Vec3) {
        match self {
            Self::Basic { color }
            | Self::Standard { color, .. }
            | Self::PhysicallyBased { color, .. } => *color = value,
        }
    }

    /// Scalar shading inputs as (metalness, roughness, clear coat, clear
    /// coat roughness). Unlit materials shade as fully rough dielectrics.
    pub fn shading(&self) -> (f32, f32, f32, f32) {
        match self {
            Self::Basic { .. } => (0.0, 1.0, 0.0, 0.0),
            Self::Standard {
                metalness,
                roughness,
                ..
            } => (*metalness, *roughness, 0.0, 0.0),
            Self::PhysicallyBased {
                metalness,
                roughness,
                clear_coat,
                clear_coat_roughness,
                ..
            } => (*metalness, *roughness, *clear_coat, *clear_coat_roughness),
        }
    }
}

/// Renderable element discovered by traversing the loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshPart {
    pub name: String,
    pub category: PartCategory,
    pub transform: Mat4,
    /// Interleaved `position.xyz` + `normal.xyz`.
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub material: Material,
    pub cast_shadow: bool,
    pub env_map: Option<Arc<EnvironmentMap>>,
    pub env_intensity: f32,
}

/// The loaded car model, flattened into a list of mesh parts.
#[derive(Debug, Clone, PartialEq)]
pub struct CarModel {
    pub parts: Vec<MeshPart>,
    /// World position of the model root, used to aim the spot light.
    pub root_position: Vec3,
}

impl CarModel {
    /// Builds the model from a decoded glTF document, visiting every node of
    /// the tree regardless of nesting depth.
    pub fn from_gltf(document: &gltf::Document, buffers: &[gltf::buffer::Data]) -> Result<Self> {
        let scene = document
            .default_scene()
            .or_else(|| document.scenes().next())
            .ok_or_else(|| anyhow!("model contains no scene"))?;

        let mut parts = Vec::new();
        let mut root_position = Vec3::ZERO;
        for (index, node) in scene.nodes().enumerate() {
            let transform = Mat4::from_cols_array_2d(&node.transform().matrix());
            if index == 0 {
                root_position = transform.w_axis.truncate();
            }
            collect_parts(&node, Mat4::IDENTITY, buffers, &mut parts)?;
        }

        if parts.is_empty() {
            return Err(anyhow!("model contains no mesh primitives"));
        }

        Ok(Self {
            parts,
            root_position,
        })
    }
}

fn collect_parts(
    node: &gltf::Node<'_>,
    parent: Mat4,
    buffers: &[gltf::buffer::Data],
    parts: &mut Vec<MeshPart>,
) -> Result<()> {
    let transform = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        let name = node.name().unwrap_or_default().to_string();
        let tag = extras_category(node);
        let category = PartCategory::classify(&name, tag.as_deref());

        for primitive in mesh.primitives() {
            let reader = primitive
                .reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));
            let positions: Vec<[f32; 3]> = reader
                .read_positions()
                .with_context(|| format!("primitive of {name:?} has no positions"))?
                .collect();
            let normals: Vec<[f32; 3]> = match reader.read_normals() {
                Some(normals) => normals.collect(),
                None => vec![[0.0, 1.0, 0.0]; positions.len()],
            };

            let mut vertices = Vec::with_capacity(positions.len() * 6);
            for (position, normal) in positions.iter().zip(&normals) {
                vertices.extend_from_slice(position);
                vertices.extend_from_slice(normal);
            }

            let indices: Vec<u32> = match reader.read_indices() {
                Some(indices) => {
                    use gltf::mesh::util::ReadIndices;
                    match indices {
                        ReadIndices::U8(iter) => iter.map(u32::from).collect(),
                        ReadIndices::U16(iter) => iter.map(u32::from).collect(),
                        ReadIndices::U32(iter) => iter.collect(),
                    }
                }
                None => (0..positions.len() as u32).collect(),
            };

            let material = convert_material(&primitive.material(), category);
            parts.push(MeshPart {
                name: name.clone(),
                category,
                transform,
                vertices,
                indices,
                material,
                cast_shadow: false,
                env_map: None,
                env_intensity: 0.0,
            });
        }
    }

    for child in node.children() {
        collect_parts(&child, transform, buffers, parts)?;
    }
    Ok(())
}

fn extras_category(node: &gltf::Node<'_>) -> Option<String> {
    let extras = node.extras().as_ref()?;
    let value: serde_json::Value = serde_json::from_str(extras.get()).ok()?;
    value
        .get("category")?
        .as_str()
        .map(|tag| tag.to_ascii_lowercase())
}

/// Maps a glTF material onto the tagged material model.
///
/// Unlit materials become `Basic`. Paint parts are authored with a coating
/// layer, so they load as `PhysicallyBased`; everything else stays
/// `Standard` unless the asset tags the material with `"clear_coat": true`.
fn convert_material(material: &gltf::Material<'_>, category: PartCategory) -> Material {
    let pbr = material.pbr_metallic_roughness();
    let base = pbr.base_color_factor();
    let color = Vec3::new(base[0], base[1], base[2]);

    if material.unlit() {
        return Material::Basic { color };
    }

    let clear_coat_capable = material_has_clear_coat_tag(material)
        .unwrap_or(category == PartCategory::Paint);
    if clear_coat_capable {
        Material::PhysicallyBased {
            color,
            metalness: pbr.metallic_factor(),
            roughness: pbr.roughness_factor(),
            clear_coat: 0.0,
            clear_coat_roughness: 0.0,
        }
    } else {
        Material::Standard {
            color,
            metalness: pbr.metallic_factor(),
            roughness: pbr.roughness_factor(),
        }
    }
}

fn material_has_clear_coat_tag(material: &gltf::Material<'_>) -> Option<bool> {
    let extras = material.extras().as_ref()?;
    let value: serde_json::Value = serde_json::from_str(extras.get()).ok()?;
    value.get("clear_coat")?.as_bool()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_tag_wins_over_name() {
        assert_eq!(
            PartCategory::classify("body_shell", Some("paint")),
            PartCategory::Paint
        );
        assert_eq!(
            PartCategory::classify("paint_front", Some("glass")),
            PartCategory::Other
        );
    }

    #[test]
    fn name_substring_fallback() {
        assert_eq!(
            PartCategory::classify("Car_Paint_01", None),
            PartCategory::Paint
        );
        assert_eq!(
            PartCategory::classify("brake_caliper_left", None),
            PartCategory::Caliper
        );
        assert_eq!(PartCategory::classify("windshield", None), PartCategory::Other);
    }

    #[test]
    fn basic_material_shades_as_rough_dielectric() {
        let material = Material::Basic { color: Vec3::ONE };
        assert_eq!(material.shading(), (0.0, 1.0, 0.0, 0.0));
    }

    #[test]
    fn set_color_reaches_every_variant() {
        let red = Vec3::new(1.0, 0.0, 0.0);
        let mut materials = [
            Material::Basic { color: Vec3::ONE },
            Material::Standard {
                color: Vec3::ONE,
                metalness: 0.0,
                roughness: 1.0,
            },
            Material::PhysicallyBased {
                color: Vec3::ONE,
                metalness: 0.0,
                roughness: 1.0,
                clear_coat: 0.0,
                clear_coat_roughness: 0.0,
            },
        ];
        for material in &mut materials {
            material.set_color(red);
            assert_eq!(material.color(), red);
        }
    }
}
