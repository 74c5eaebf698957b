// src/materials/material_system.rs
//
// Material descriptor registry.
//
// Maps every material variant to the static half of its GPU description:
//  1. Shader program (WGSL sources + entry points, hashed once at construction)
//  2. Bind group requirements (mesh uniforms, environment lighting)
//  3. Required vertex attributes (checked against the geometry before drawing)
//
// Render state lives on the material itself because it varies per instance;
// everything here is shared by every material of one kind.

use std::collections::HashMap;
use std::sync::Arc;

use xxhash_rust::xxh3::Xxh3;

use super::{Material, MaterialKind};
use crate::geometry::AttributeFlags;

// ═══════════════════════════════════════════════════════════════════════════════
// Section 1: Shader programs
// ═══════════════════════════════════════════════════════════════════════════════

/// A vertex + fragment pair. The content hash covers both sources and both
/// entry points and is computed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderProgram {
    label: String,
    vertex_source: Arc<str>,
    fragment_source: Arc<str>,
    vertex_entry: String,
    fragment_entry: String,
    vertex_hash: u64,
    fragment_hash: u64,
    hash: u64,
}

impl ShaderProgram {
    pub fn new(
        label: impl Into<String>,
        vertex_source: impl Into<Arc<str>>,
        vertex_entry: impl Into<String>,
        fragment_source: impl Into<Arc<str>>,
        fragment_entry: impl Into<String>,
    ) -> Self {
        let vertex_source = vertex_source.into();
        let fragment_source = fragment_source.into();
        let vertex_entry = vertex_entry.into();
        let fragment_entry = fragment_entry.into();

        let vertex_hash = xxhash_rust::xxh3::xxh3_64(vertex_source.as_bytes());
        let fragment_hash = xxhash_rust::xxh3::xxh3_64(fragment_source.as_bytes());
        let mut hasher = Xxh3::new();
        hasher.update(&vertex_hash.to_le_bytes());
        hasher.update(vertex_entry.as_bytes());
        hasher.update(&[0]);
        hasher.update(&fragment_hash.to_le_bytes());
        hasher.update(fragment_entry.as_bytes());

        Self {
            label: label.into(),
            vertex_source,
            fragment_source,
            vertex_entry,
            fragment_entry,
            vertex_hash,
            fragment_hash,
            hash: hasher.digest(),
        }
    }

    /// Both stages in one WGSL module (`vs_main` / `fs_main`).
    pub fn single_module(label: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        let source: Arc<str> = source.into();
        Self::new(label, source.clone(), "vs_main", source, "fs_main")
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vertex_source(&self) -> &str {
        &self.vertex_source
    }

    pub fn fragment_source(&self) -> &str {
        &self.fragment_source
    }

    pub fn vertex_entry(&self) -> &str {
        &self.vertex_entry
    }

    pub fn fragment_entry(&self) -> &str {
        &self.fragment_entry
    }

    /// Hash of the vertex source text alone (shader module cache key).
    #[inline]
    pub fn vertex_hash(&self) -> u64 {
        self.vertex_hash
    }

    #[inline]
    pub fn fragment_hash(&self) -> u64 {
        self.fragment_hash
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Section 2: Descriptors
// ═══════════════════════════════════════════════════════════════════════════════

/// Bind groups a program expects, in group-index order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingRequirement {
    /// Group 0: per-draw uniform slot (dynamic offset).
    MeshUniforms,
    /// Group 1: IBL cubemap + BRDF LUT.
    Environment,
}

#[derive(Debug, Clone)]
pub struct MaterialDescriptor {
    pub program: Arc<ShaderProgram>,
    pub bindings: Vec<BindingRequirement>,
    pub required_attributes: AttributeFlags,
}

impl MaterialDescriptor {
    pub fn new(program: ShaderProgram, required_attributes: AttributeFlags) -> Self {
        Self {
            program: Arc::new(program),
            bindings: vec![BindingRequirement::MeshUniforms],
            required_attributes: required_attributes | AttributeFlags::POSITION,
        }
    }

    pub fn with_environment(mut self) -> Self {
        if !self.bindings.contains(&BindingRequirement::Environment) {
            self.bindings.push(BindingRequirement::Environment);
        }
        self
    }

    #[inline]
    pub fn requires_environment(&self) -> bool {
        self.bindings.contains(&BindingRequirement::Environment)
    }

    /// Attributes in `required_attributes` that `available` lacks.
    #[inline]
    pub fn missing_attributes(&self, available: AttributeFlags) -> AttributeFlags {
        self.required_attributes.difference(available)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Section 3: Registry
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone)]
pub struct MaterialDescriptorRegistry {
    descriptors: HashMap<MaterialKind, MaterialDescriptor>,
}

impl MaterialDescriptorRegistry {
    /// Empty registry; every lookup misses until `register` is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in programs for every variant.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            MaterialKind::Basic,
            MaterialDescriptor::new(
                ShaderProgram::single_module("basic", builtin_source(BASIC_BODY)),
                AttributeFlags::POSITION,
            ),
        );
        registry.register(
            MaterialKind::Lambert,
            MaterialDescriptor::new(
                ShaderProgram::single_module("lambert", builtin_source(LAMBERT_BODY)),
                AttributeFlags::NORMAL,
            ),
        );
        registry.register(
            MaterialKind::Standard,
            MaterialDescriptor::new(
                ShaderProgram::single_module("standard", builtin_source(STANDARD_BODY)),
                AttributeFlags::NORMAL,
            )
            .with_environment(),
        );
        registry.register(
            MaterialKind::Line,
            MaterialDescriptor::new(
                ShaderProgram::single_module("line", builtin_source(BASIC_BODY)),
                AttributeFlags::POSITION,
            ),
        );
        registry
    }

    /// Replaces any previous descriptor for `kind`.
    pub fn register(&mut self, kind: MaterialKind, descriptor: MaterialDescriptor) -> Option<MaterialDescriptor> {
        self.descriptors.insert(kind, descriptor)
    }

    #[inline]
    pub fn get(&self, kind: MaterialKind) -> Option<&MaterialDescriptor> {
        self.descriptors.get(&kind)
    }

    #[inline]
    pub fn resolve(&self, material: &Material) -> Option<&MaterialDescriptor> {
        self.get(material.kind())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Section 4: Built-in WGSL
// ═══════════════════════════════════════════════════════════════════════════════

/// Matches `uniforms::MeshUniforms` byte for byte (256 bytes).
const MESH_UNIFORMS_WGSL: &str = r#"
struct MeshUniforms {
    model: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    normal_matrix: mat3x3<f32>,
    camera_position: vec4<f32>,
    material: array<vec4<f32>, 4>,
};

@group(0) @binding(0) var<uniform> mesh: MeshUniforms;
"#;

const BASIC_BODY: &str = r#"
struct VertexOut {
    @builtin(position) clip: vec4<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOut {
    var out: VertexOut;
    out.clip = mesh.view_proj * mesh.model * vec4<f32>(position, 1.0);
    return out;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    return mesh.material[0];
}
"#;

const LAMBERT_BODY: &str = r#"
struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) normal: vec3<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) normal: vec3<f32>) -> VertexOut {
    var out: VertexOut;
    out.clip = mesh.view_proj * mesh.model * vec4<f32>(position, 1.0);
    out.normal = mesh.normal_matrix * normal;
    return out;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    let light = normalize(vec3<f32>(0.3, 1.0, 0.5));
    let diffuse = max(dot(normalize(in.normal), light), 0.0);
    let base = mesh.material[0];
    return vec4<f32>(base.rgb * (0.2 + 0.8 * diffuse) + mesh.material[1].rgb, base.a);
}
"#;

const STANDARD_BODY: &str = r#"
@group(1) @binding(0) var env_map: texture_cube<f32>;
@group(1) @binding(1) var env_sampler: sampler;
@group(1) @binding(2) var brdf_lut: texture_2d<f32>;
@group(1) @binding(3) var brdf_sampler: sampler;

struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) normal: vec3<f32>,
    @location(1) world_position: vec3<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) normal: vec3<f32>) -> VertexOut {
    var out: VertexOut;
    let world = mesh.model * vec4<f32>(position, 1.0);
    out.clip = mesh.view_proj * world;
    out.normal = mesh.normal_matrix * normal;
    out.world_position = world.xyz;
    return out;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    let base = mesh.material[0];
    let metallic = mesh.material[2].x;
    let roughness = mesh.material[2].y;
    let intensity = mesh.material[2].z;
    let max_lod = max(mesh.material[3].w - 1.0, 0.0);

    let n = normalize(in.normal);
    let v = normalize(mesh.camera_position.xyz - in.world_position);
    let r = reflect(-v, n);
    let n_dot_v = clamp(dot(n, v), 0.0, 1.0);

    let specular_env = textureSampleLevel(env_map, env_sampler, r, roughness * max_lod).rgb;
    let diffuse_env = textureSampleLevel(env_map, env_sampler, n, max_lod).rgb;
    let brdf = textureSample(brdf_lut, brdf_sampler, vec2<f32>(n_dot_v, roughness)).rg;

    let f0 = mix(vec3<f32>(0.04), base.rgb, metallic);
    let specular = specular_env * (f0 * brdf.x + brdf.y);
    let diffuse = diffuse_env * base.rgb * (1.0 - metallic);
    return vec4<f32>((diffuse + specular) * intensity + mesh.material[1].rgb, base.a);
}
"#;

fn builtin_source(body: &str) -> String {
    let mut source = String::with_capacity(MESH_UNIFORMS_WGSL.len() + body.len());
    source.push_str(MESH_UNIFORMS_WGSL);
    source.push_str(body);
    source
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_hash_depends_on_sources_and_entries() {
        let a = ShaderProgram::single_module("a", "fn x() {}");
        let b = ShaderProgram::single_module("b", "fn x() {}");
        assert_eq!(a.hash(), b.hash(), "label is not part of the identity");

        let c = ShaderProgram::new("c", "fn x() {}", "vs_other", "fn x() {}", "fs_main");
        assert_ne!(a.hash(), c.hash());

        let d = ShaderProgram::single_module("d", "fn y() {}");
        assert_ne!(a.hash(), d.hash());
        assert_eq!(a.vertex_hash(), a.fragment_hash());
    }

    #[test]
    fn builtin_registry_covers_every_variant() {
        let registry = MaterialDescriptorRegistry::with_builtin();
        assert_eq!(registry.len(), 4);

        let standard = registry.resolve(&Material::standard([1.0; 4], 0.5, 0.5)).unwrap();
        assert!(standard.requires_environment());
        assert!(standard.required_attributes.contains(AttributeFlags::POSITION | AttributeFlags::NORMAL));

        let basic = registry.get(MaterialKind::Basic).unwrap();
        assert!(!basic.requires_environment());
        assert_eq!(basic.missing_attributes(AttributeFlags::POSITION), AttributeFlags::empty());

        let lambert = registry.get(MaterialKind::Lambert).unwrap();
        assert_eq!(lambert.missing_attributes(AttributeFlags::POSITION), AttributeFlags::NORMAL);
    }

    #[test]
    fn builtin_sources_declare_the_uniform_block() {
        let registry = MaterialDescriptorRegistry::with_builtin();
        for kind in [MaterialKind::Basic, MaterialKind::Lambert, MaterialKind::Standard, MaterialKind::Line] {
            let program = &registry.get(kind).unwrap().program;
            assert!(program.vertex_source().contains("struct MeshUniforms"));
            assert_eq!(program.vertex_entry(), "vs_main");
        }
    }

    #[test]
    fn empty_registry_misses() {
        let registry = MaterialDescriptorRegistry::new();
        assert!(registry.resolve(&Material::basic([1.0; 4])).is_none());
    }
}
