// src/shader/fragments.rs
//! WGSL source fragments for the ray-marching compute shader
//!
//! Binding layout (group 0):
//!
//! | binding | resource |
//! |---|---|
//! | 0 | `FrameUniforms` uniform buffer |
//! | 1 | `VolumeBlock` uniform buffer (per-volume transform and weight) |
//! | 2 | regular transfer-function table, `array<vec4<f32>>` |
//! | 3 | pre-integrated segment table, `array<vec4<f32>>` |
//! | 4 | output image, `texture_storage_2d<rgba32float, write>` |
//! | 5.. | one `texture_3d<f32>` per bound volume |

pub const HEADER: &str = r#"
struct FrameUniforms {
    inv_view_proj: mat4x4<f32>,
    background: vec4<f32>,
    iso_color: vec4<f32>,
    bounds_min: vec4<f32>,
    bounds_max: vec4<f32>,
    viewport: vec2<u32>,
    max_steps: u32,
    table_size: u32,
    step_size: f32,
    termination_threshold: f32,
    iso_value: f32,
    domain_min: f32,
    domain_max: f32,
    _pad0: f32,
    _pad1: f32,
    _pad2: f32,
};

struct VolumeSlot {
    world_to_voxel: mat4x4<f32>,
    params: vec4<f32>,
};

struct VolumeBlock {
    slots: array<VolumeSlot, 4>,
};

struct RayState {
    color: vec3<f32>,
    alpha: f32,
    done: bool,
};

@group(0) @binding(0) var<uniform> uniforms: FrameUniforms;
@group(0) @binding(1) var<uniform> volume_block: VolumeBlock;
@group(0) @binding(2) var<storage, read> tf_table: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read> tf_segment_table: array<vec4<f32>>;
@group(0) @binding(4) var out_image: texture_storage_2d<rgba32float, write>;
"#;

pub const VOLUME_SAMPLING: &str = r#"
fn load_voxel(tex: texture_3d<f32>, p: vec3<i32>, hi: vec3<i32>) -> f32 {
    return textureLoad(tex, clamp(p, vec3<i32>(0), hi), 0).x;
}

// Voxel-center trilinear filtering; R32Float is not filterable everywhere.
fn trilinear(tex: texture_3d<f32>, local: vec3<f32>) -> f32 {
    let dims = vec3<i32>(textureDimensions(tex));
    let hi = dims - vec3<i32>(1);
    let g = local * vec3<f32>(dims) - vec3<f32>(0.5);
    let base = floor(g);
    let f = g - base;
    let i = vec3<i32>(base);
    let c00 = mix(load_voxel(tex, i, hi), load_voxel(tex, i + vec3<i32>(1, 0, 0), hi), f.x);
    let c10 = mix(load_voxel(tex, i + vec3<i32>(0, 1, 0), hi), load_voxel(tex, i + vec3<i32>(1, 1, 0), hi), f.x);
    let c01 = mix(load_voxel(tex, i + vec3<i32>(0, 0, 1), hi), load_voxel(tex, i + vec3<i32>(1, 0, 1), hi), f.x);
    let c11 = mix(load_voxel(tex, i + vec3<i32>(0, 1, 1), hi), load_voxel(tex, i + vec3<i32>(1, 1, 1), hi), f.x);
    return mix(mix(c00, c10, f.y), mix(c01, c11, f.y), f.z);
}

fn to_voxel_space(slot: u32, p: vec3<f32>) -> vec3<f32> {
    let h = volume_block.slots[slot].world_to_voxel * vec4<f32>(p, 1.0);
    return h.xyz / h.w;
}

fn inside_unit_cube(local: vec3<f32>) -> bool {
    return all(local >= vec3<f32>(-1e-4)) && all(local <= vec3<f32>(1.0001));
}

// Entry/exit distances of a ray against the combined bounds; x > y is a miss.
fn intersect_bounds(origin: vec3<f32>, dir: vec3<f32>) -> vec2<f32> {
    let inv_dir = vec3<f32>(1.0) / dir;
    let t_min = (uniforms.bounds_min.xyz - origin) * inv_dir;
    let t_max = (uniforms.bounds_max.xyz - origin) * inv_dir;
    let t1 = min(t_min, t_max);
    let t2 = max(t_min, t_max);
    let t_near = max(max(t1.x, t1.y), t1.z);
    let t_far = min(min(t2.x, t2.y), t2.z);
    return vec2<f32>(max(t_near, 0.0), t_far);
}
"#;

pub const TRANSFER_FUNCTION: &str = r#"
fn tf_position(intensity: f32) -> f32 {
    let last = f32(uniforms.table_size - 1u);
    let span = uniforms.domain_max - uniforms.domain_min;
    return clamp((intensity - uniforms.domain_min) / span * last, 0.0, last);
}

fn tf_regular_at(x: f32) -> vec4<f32> {
    let k = min(u32(floor(x)), uniforms.table_size - 2u);
    let t = x - f32(k);
    return mix(tf_table[k], tf_table[k + 1u], vec4<f32>(t));
}
"#;

pub const SAMPLER_REGULAR: &str = r#"
fn sample_transfer(previous: f32, has_previous: bool, current: f32) -> vec4<f32> {
    return tf_regular_at(tf_position(current));
}
"#;

pub const SAMPLER_PREINTEGRATED: &str = r#"
fn tf_segment_at(x0: f32, x1: f32) -> vec4<f32> {
    let n = uniforms.table_size;
    let r = min(u32(floor(x0)), n - 2u);
    let c = min(u32(floor(x1)), n - 2u);
    let fr = x0 - f32(r);
    let fc = x1 - f32(c);
    let top = mix(tf_segment_table[r * n + c], tf_segment_table[r * n + c + 1u], vec4<f32>(fc));
    let bottom = mix(tf_segment_table[(r + 1u) * n + c], tf_segment_table[(r + 1u) * n + c + 1u], vec4<f32>(fc));
    return mix(top, bottom, vec4<f32>(fr));
}

fn sample_transfer(previous: f32, has_previous: bool, current: f32) -> vec4<f32> {
    let x1 = tf_position(current);
    if (!has_previous) {
        return tf_regular_at(x1);
    }
    let x0 = tf_position(previous);
    if (abs(x1 - x0) < 1e-4) {
        return tf_regular_at(x1);
    }
    return tf_segment_at(x0, x1);
}
"#;

pub const INTERPRETER_TRANSPARENT: &str = r#"
fn interpret_step(state: ptr<function, RayState>, origin: vec3<f32>, dir: vec3<f32>, t: f32, value: f32, prev_t: f32, prev_value: f32, has_previous: bool) {
    let c = sample_transfer(prev_value, has_previous, value);
    let a = clamp(c.a, 0.0, 1.0);
    let w = (1.0 - (*state).alpha) * a;
    (*state).color += c.rgb * w;
    (*state).alpha += w;
    if ((*state).alpha >= uniforms.termination_threshold) {
        (*state).done = true;
    }
}
"#;

pub const INTERPRETER_ISOSURFACE: &str = r#"
fn field_value_or(p: vec3<f32>, fallback: f32) -> f32 {
    let s = field_at(p);
    return select(fallback, s.x, s.y > 0.5);
}

fn field_gradient(p: vec3<f32>) -> vec3<f32> {
    let h = uniforms.step_size;
    let center = field_value_or(p, 0.0);
    let dx = vec3<f32>(h, 0.0, 0.0);
    let dy = vec3<f32>(0.0, h, 0.0);
    let dz = vec3<f32>(0.0, 0.0, h);
    return vec3<f32>(
        field_value_or(p + dx, center) - field_value_or(p - dx, center),
        field_value_or(p + dy, center) - field_value_or(p - dy, center),
        field_value_or(p + dz, center) - field_value_or(p - dz, center),
    ) / (2.0 * h);
}

fn interpret_step(state: ptr<function, RayState>, origin: vec3<f32>, dir: vec3<f32>, t: f32, value: f32, prev_t: f32, prev_value: f32, has_previous: bool) {
    let d1 = value - uniforms.iso_value;
    var t_hit = t;
    if (d1 != 0.0) {
        if (!has_previous) {
            return;
        }
        let d0 = prev_value - uniforms.iso_value;
        let crossed = (d0 < 0.0 && d1 > 0.0) || (d0 > 0.0 && d1 < 0.0);
        if (!crossed) {
            return;
        }
        t_hit = prev_t + d0 / (d0 - d1) * (t - prev_t);
    }

    let p = origin + dir * t_hit;
    let g = field_gradient(p);
    let len = length(g);
    var n = -dir;
    if (len > 1e-8) {
        n = g / len;
        if (dot(n, -dir) < 0.0) {
            n = -n;
        }
    }

    // Headlight: light and view both point back along the ray.
    let n_dot_l = max(dot(n, -dir), 0.0);
    let specular = 0.3 * pow(n_dot_l, 32.0);
    let lit = 0.2 + 0.7 * n_dot_l;
    (*state).color = clamp(uniforms.iso_color.rgb * lit + vec3<f32>(specular), vec3<f32>(0.0), vec3<f32>(1.0));
    (*state).alpha = 1.0;
    (*state).done = true;
}
"#;

pub const ENTRY_POINT: &str = r#"
@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= uniforms.viewport.x || id.y >= uniforms.viewport.y) {
        return;
    }

    let ndc = vec2<f32>(
        (f32(id.x) + 0.5) / f32(uniforms.viewport.x) * 2.0 - 1.0,
        1.0 - (f32(id.y) + 0.5) / f32(uniforms.viewport.y) * 2.0,
    );
    let near_h = uniforms.inv_view_proj * vec4<f32>(ndc, -1.0, 1.0);
    let far_h = uniforms.inv_view_proj * vec4<f32>(ndc, 1.0, 1.0);
    let origin = near_h.xyz / near_h.w;
    let dir = normalize(far_h.xyz / far_h.w - origin);

    var state = RayState(vec3<f32>(0.0), 0.0, false);
    let span = intersect_bounds(origin, dir);
    if (span.x <= span.y) {
        var has_previous = false;
        var prev_t = 0.0;
        var prev_value = 0.0;
        for (var i = 0u; i < uniforms.max_steps; i = i + 1u) {
            let t = span.x + f32(i) * uniforms.step_size;
            if (t > span.y) {
                break;
            }
            let s = field_at(origin + dir * t);
            if (s.y < 0.5) {
                has_previous = false;
                continue;
            }
            interpret_step(&state, origin, dir, t, s.x, prev_t, prev_value, has_previous);
            if (state.done) {
                break;
            }
            has_previous = true;
            prev_t = t;
            prev_value = s.x;
        }
    }

    let bg = uniforms.background;
    let remaining = 1.0 - state.alpha;
    let color = vec4<f32>(state.color + remaining * bg.rgb * bg.a, state.alpha + remaining * bg.a);
    textureStore(out_image, vec2<i32>(id.xy), clamp(color, vec4<f32>(0.0), vec4<f32>(1.0)));
}
"#;
